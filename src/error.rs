//! Error types for the RPC, fee and transaction layers

use ethers::types::H256;
use thiserror::Error;

/// Errors raised by the RPC client and its transport
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RpcError {
    #[error("Request too large: {size} bytes exceeds limit of {limit}")]
    RequestTooLarge { size: usize, limit: usize },

    #[error("Response too large: {size} bytes exceeds limit of {limit}")]
    ResponseTooLarge { size: usize, limit: usize },

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("HTTP error: status {status}")]
    HttpError { status: u16 },

    #[error("JSON decode error: {0}")]
    JsonDecodeError(String),

    #[error("No provider configured for {chain}/{network}")]
    NoProviderConfigured { chain: String, network: String },

    #[error("Node returned error {code}: {message}")]
    Node { code: i64, message: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RpcError {
    /// Check if error is a hard transport failure worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RpcError::Timeout { .. }
                | RpcError::ConnectionError(_)
                | RpcError::HttpError { .. }
                | RpcError::ResponseTooLarge { .. }
                | RpcError::JsonDecodeError(_)
        )
    }

    /// Short label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            RpcError::RequestTooLarge { .. } => "request_too_large",
            RpcError::ResponseTooLarge { .. } => "response_too_large",
            RpcError::Timeout { .. } => "timeout",
            RpcError::ConnectionError(_) => "connection",
            RpcError::HttpError { .. } => "http",
            RpcError::JsonDecodeError(_) => "json_decode",
            RpcError::NoProviderConfigured { .. } => "no_provider",
            RpcError::Node { .. } => "node",
            RpcError::Internal(_) => "internal",
        }
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(e: serde_json::Error) -> Self {
        RpcError::JsonDecodeError(e.to_string())
    }
}

/// Errors raised by the gas optimizer and the transaction lifecycle manager
#[derive(Error, Debug)]
pub enum TxError {
    #[error("Gas price {price} exceeds ceiling {ceiling}")]
    GasPriceTooHigh { price: String, ceiling: String },

    #[error("Maximum pending transactions reached ({max})")]
    MaxPendingExceeded { max: usize },

    #[error("Timeout waiting for confirmation of {tx_hash:?}")]
    ConfirmationTimeout { tx_hash: H256 },

    #[error("Nonce initialization failed: {0}")]
    NonceInitializationFailed(String),

    #[error("Broadcast failed: {message}")]
    BroadcastFailed {
        message: String,
        local_hash: Option<H256>,
    },

    #[error("Gas estimation error: {0}")]
    GasEstimation(String),

    #[error("Signing error: {0}")]
    Signing(String),

    #[error("Transaction {tx_hash:?} not found")]
    NotFound { tx_hash: H256 },

    #[error("Transaction {tx_hash:?} is no longer pending ({status})")]
    NotPending { tx_hash: H256, status: String },

    #[error(transparent)]
    Rpc(#[from] RpcError),
}

impl TxError {
    /// Check if the caller may reasonably retry the same operation
    pub fn is_retryable(&self) -> bool {
        match self {
            TxError::ConfirmationTimeout { .. } => true,
            TxError::Rpc(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Short label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            TxError::GasPriceTooHigh { .. } => "gas_price_too_high",
            TxError::MaxPendingExceeded { .. } => "max_pending_exceeded",
            TxError::ConfirmationTimeout { .. } => "confirmation_timeout",
            TxError::NonceInitializationFailed(_) => "nonce_initialization_failed",
            TxError::BroadcastFailed { .. } => "broadcast_failed",
            TxError::GasEstimation(_) => "gas_estimation",
            TxError::Signing(_) => "signing",
            TxError::NotFound { .. } => "not_found",
            TxError::NotPending { .. } => "not_pending",
            TxError::Rpc(_) => "rpc",
        }
    }
}

/// Result type for RPC operations
pub type RpcResult<T> = Result<T, RpcError>;

/// Result type for gas and transaction operations
pub type TxResult<T> = Result<T, TxError>;

//! Signing collaborator: turns a typed transaction into a broadcastable payload

use crate::error::{TxError, TxResult};

use async_trait::async_trait;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes};
use tracing::info;

/// Key custody boundary; the manager never sees a private key
#[async_trait]
pub trait TxSigner: Send + Sync {
    fn address(&self) -> Address;

    fn chain_id(&self) -> u64;

    /// RLP-encoded signed transaction
    async fn sign_transaction(&self, tx: &TypedTransaction) -> TxResult<Bytes>;
}

/// In-process wallet backed by a hex private key
pub struct LocalWalletSigner {
    wallet: LocalWallet,
}

impl LocalWalletSigner {
    pub fn new(wallet: LocalWallet, chain_id: u64) -> Self {
        Self {
            wallet: wallet.with_chain_id(chain_id),
        }
    }

    /// Load the key from an environment variable
    pub fn from_env(var: &str, chain_id: u64) -> TxResult<Self> {
        let key = std::env::var(var)
            .map_err(|_| TxError::Signing(format!("{} is not set", var)))?;
        let wallet = key
            .trim()
            .parse::<LocalWallet>()
            .map_err(|e| TxError::Signing(format!("Invalid private key in {}: {}", var, e)))?;

        let signer = Self::new(wallet, chain_id);
        info!(address = ?signer.address(), chain_id, "Loaded signing wallet");
        Ok(signer)
    }
}

#[async_trait]
impl TxSigner for LocalWalletSigner {
    fn address(&self) -> Address {
        self.wallet.address()
    }

    fn chain_id(&self) -> u64 {
        self.wallet.chain_id()
    }

    async fn sign_transaction(&self, tx: &TypedTransaction) -> TxResult<Bytes> {
        let signature = self
            .wallet
            .sign_transaction(tx)
            .await
            .map_err(|e| TxError::Signing(e.to_string()))?;
        Ok(tx.rlp_signed(&signature))
    }
}

//! JSON-RPC 2.0 envelopes and pool keys

use crate::error::{RpcError, RpcResult};

use ethers::types::{H256, U256, U64};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// A (chain, network) pair, e.g. `ethereum/mainnet`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChainTarget {
    pub chain: String,
    pub network: String,
}

impl ChainTarget {
    pub fn new(chain: impl Into<String>, network: impl Into<String>) -> Self {
        Self {
            chain: chain.into(),
            network: network.into(),
        }
    }
}

impl fmt::Display for ChainTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.chain, self.network)
    }
}

/// Outgoing request envelope
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest<'a> {
    pub jsonrpc: &'static str,
    pub method: &'a str,
    pub params: &'a Value,
    pub id: u64,
}

impl<'a> JsonRpcRequest<'a> {
    pub fn new(method: &'a str, params: &'a Value, id: u64) -> Self {
        Self {
            jsonrpc: "2.0",
            method,
            params,
            id,
        }
    }
}

/// Error object carried inside a response envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Decoded response envelope
///
/// A node-level error (`error` set) is a valid transport outcome, distinct
/// from an `RpcError`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcErrorObject>,
}

impl JsonRpcResponse {
    /// Build a successful response (used for cache hits)
    pub fn from_result(result: Value) -> Self {
        Self {
            id: None,
            result: Some(result),
            error: None,
        }
    }

    /// Decode a single envelope from raw JSON
    pub fn from_value(value: Value) -> RpcResult<Self> {
        if !value.is_object() {
            return Err(RpcError::JsonDecodeError(
                "expected a JSON-RPC response object".to_string(),
            ));
        }
        let response: JsonRpcResponse = serde_json::from_value(value)?;
        Ok(response)
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Numeric id assigned by us, when the provider echoed it back
    pub fn numeric_id(&self) -> Option<u64> {
        self.id.as_ref().and_then(|id| match id {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        })
    }

    /// Convert into the call result, surfacing a node error as `RpcError::Node`
    pub fn into_result(self) -> RpcResult<Value> {
        if let Some(err) = self.error {
            return Err(RpcError::Node {
                code: err.code,
                message: err.message,
            });
        }
        Ok(self.result.unwrap_or(Value::Null))
    }
}

/// Subset of `eth_getTransactionReceipt` the transaction manager consumes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub transaction_hash: H256,
    #[serde(default)]
    pub block_number: Option<U64>,
    #[serde(default)]
    pub block_hash: Option<H256>,
    #[serde(default)]
    pub gas_used: Option<U256>,
    #[serde(default)]
    pub effective_gas_price: Option<U256>,
    #[serde(default)]
    pub status: Option<U64>,
}

impl Receipt {
    /// Only an explicit `status: 0x1` counts as success
    pub fn succeeded(&self) -> bool {
        self.status == Some(U64::one())
    }
}

//! chainwire - reliable multi-endpoint JSON-RPC access, fee optimization and
//! transaction lifecycle management for EVM trading bots

pub mod api;
pub mod config;
pub mod error;
pub mod metrics;
pub mod rpc;
pub mod tx;

#[cfg(test)]
mod test_utils;

pub use config::Settings;
pub use error::{RpcError, RpcResult, TxError, TxResult};
pub use rpc::{ChainTarget, RpcClient};
pub use tx::{TransactionDraft, TransactionManager};

//! Result cache collaborator consulted by the RPC client

use super::types::ChainTarget;

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

/// Best-effort key/value store for memoized call results
///
/// Failures are never fatal: the client treats an error as a miss.
#[async_trait]
pub trait ResultCache: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Value>>;

    async fn set(&self, key: &str, value: Value, ttl: Duration) -> anyhow::Result<()>;
}

/// Cache key for `(method, params, chain, network)`
pub fn cache_key(method: &str, params: &Value, target: &ChainTarget) -> String {
    format!("rpc:{}:{}:{}:{}", target.chain, target.network, method, params)
}

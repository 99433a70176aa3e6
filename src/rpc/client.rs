//! RPC client: endpoint selection, retry with backoff, batching and caching

use super::cache::{cache_key, ResultCache};
use super::endpoint::{Endpoint, EndpointReport};
use super::pool::EndpointPool;
use super::retry::RetryPolicy;
use super::transport::Transport;
use super::types::{ChainTarget, JsonRpcRequest, JsonRpcResponse, Receipt};
use crate::config::RpcConfig;
use crate::error::{RpcError, RpcResult};

use ethers::types::{Address, Bytes, H256, U256, U64};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct CallCounters {
    calls: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    attempts: AtomicU64,
    retries: AtomicU64,
    cache_lookups: AtomicU64,
    cache_hits: AtomicU64,
}

/// Aggregate client statistics
#[derive(Debug, Clone, Serialize)]
pub struct RpcStats {
    pub total_calls: u64,
    pub success_rate: f64,
    pub error_rate: f64,
    /// Share of transport attempts that were retries
    pub retry_rate: f64,
    pub cache_hit_rate: f64,
    pub endpoints: Vec<EndpointReport>,
}

/// JSON-RPC client over a pool of competing endpoints
pub struct RpcClient {
    pool: Arc<EndpointPool>,
    transport: Arc<dyn Transport>,
    cache: Option<Arc<dyn ResultCache>>,
    retry: RetryPolicy,
    limiter: Semaphore,
    max_in_flight: usize,
    request_timeout: Duration,
    max_request_bytes: usize,
    cache_ttl: Duration,
    cacheable_methods: HashSet<String>,
    next_id: AtomicU64,
    counters: CallCounters,
}

impl RpcClient {
    pub fn new(pool: Arc<EndpointPool>, transport: Arc<dyn Transport>, config: &RpcConfig) -> Self {
        Self {
            pool,
            transport,
            cache: None,
            retry: RetryPolicy::from_config(config),
            limiter: Semaphore::new(config.max_concurrent_requests.max(1)),
            max_in_flight: config.max_concurrent_requests.max(1),
            request_timeout: Duration::from_millis(config.request_timeout_ms),
            max_request_bytes: config.max_request_bytes,
            cache_ttl: Duration::from_secs(config.cache_ttl_secs),
            cacheable_methods: config.cacheable_methods.iter().cloned().collect(),
            next_id: AtomicU64::new(1),
            counters: CallCounters::default(),
        }
    }

    /// Attach a result cache
    pub fn with_cache(mut self, cache: Arc<dyn ResultCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Replace the retry policy
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn pool(&self) -> &Arc<EndpointPool> {
        &self.pool
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Requests currently holding a concurrency permit
    pub fn in_flight(&self) -> usize {
        self.max_in_flight
            .saturating_sub(self.limiter.available_permits())
    }

    /// URL of the endpoint the selection algorithm would use right now
    pub fn best_endpoint(&self, target: &ChainTarget) -> Option<String> {
        self.pool.select(target).ok().map(|e| e.url().to_string())
    }

    /// Single JSON-RPC call against the best endpoint
    pub async fn call(
        &self,
        method: &str,
        params: Value,
        target: &ChainTarget,
    ) -> RpcResult<JsonRpcResponse> {
        self.call_with_endpoint(method, params, target, None).await
    }

    /// Single JSON-RPC call, optionally pinned to an endpoint (id or URL)
    ///
    /// A response whose envelope carries `error` is returned as `Ok`; only
    /// transport failures surviving all retries come back as `Err`.
    pub async fn call_with_endpoint(
        &self,
        method: &str,
        params: Value,
        target: &ChainTarget,
        endpoint_override: Option<&str>,
    ) -> RpcResult<JsonRpcResponse> {
        self.counters.calls.fetch_add(1, Ordering::Relaxed);

        let size = serde_json::to_vec(&params)?.len();
        if size > self.max_request_bytes {
            self.counters.failures.fetch_add(1, Ordering::Relaxed);
            return Err(RpcError::RequestTooLarge {
                size,
                limit: self.max_request_bytes,
            });
        }

        let key = match &self.cache {
            Some(_) if self.cacheable_methods.contains(method) => {
                Some(cache_key(method, &params, target))
            }
            _ => None,
        };

        if let Some(key) = &key {
            if let Some(value) = self.cache_lookup(key).await {
                self.counters.successes.fetch_add(1, Ordering::Relaxed);
                return Ok(JsonRpcResponse::from_result(value));
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = serde_json::to_value(JsonRpcRequest::new(method, &params, id))?;

        let outcome = self
            .execute(
                target,
                endpoint_override,
                &body,
                method,
                JsonRpcResponse::from_value,
                |resp: &JsonRpcResponse| resp.is_error(),
            )
            .await;

        match &outcome {
            Ok(response) => {
                self.counters.successes.fetch_add(1, Ordering::Relaxed);
                if let (Some(key), Some(result), false) =
                    (&key, &response.result, response.is_error())
                {
                    self.cache_store(key, result.clone()).await;
                }
            }
            Err(_) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
            }
        }

        outcome
    }

    /// Send several calls in one envelope to one endpoint
    ///
    /// Results come back in request order regardless of how the provider
    /// ordered its response array.
    pub async fn batch_call(
        &self,
        calls: &[(String, Value)],
        target: &ChainTarget,
    ) -> Vec<RpcResult<JsonRpcResponse>> {
        let n = calls.len();
        if n == 0 {
            return Vec::new();
        }
        self.counters.calls.fetch_add(n as u64, Ordering::Relaxed);

        let requests: Vec<JsonRpcRequest<'_>> = calls
            .iter()
            .enumerate()
            .map(|(i, (method, params))| JsonRpcRequest::new(method, params, i as u64))
            .collect();

        let body = match serde_json::to_value(&requests) {
            Ok(body) => body,
            Err(e) => {
                self.counters.failures.fetch_add(n as u64, Ordering::Relaxed);
                return vec![Err(RpcError::from(e)); n];
            }
        };

        let size = body.to_string().len();
        if size > self.max_request_bytes {
            self.counters.failures.fetch_add(n as u64, Ordering::Relaxed);
            let err = RpcError::RequestTooLarge {
                size,
                limit: self.max_request_bytes,
            };
            return vec![Err(err); n];
        }

        let outcome = self
            .execute(
                target,
                None,
                &body,
                "batch",
                |value| demultiplex(value, n),
                |slots: &Vec<RpcResult<JsonRpcResponse>>| {
                    slots
                        .iter()
                        .all(|slot| matches!(slot, Ok(resp) if resp.is_error()))
                },
            )
            .await;

        match outcome {
            Ok(slots) => {
                for slot in &slots {
                    let counter = if slot.is_ok() {
                        &self.counters.successes
                    } else {
                        &self.counters.failures
                    };
                    counter.fetch_add(1, Ordering::Relaxed);
                }
                slots
            }
            Err(e) => {
                self.counters.failures.fetch_add(n as u64, Ordering::Relaxed);
                vec![Err(e); n]
            }
        }
    }

    /// Call and decode the `result` field, surfacing node errors as `RpcError::Node`
    pub async fn request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
        target: &ChainTarget,
    ) -> RpcResult<T> {
        let result = self.call(method, params, target).await?.into_result()?;
        let decoded: T = serde_json::from_value(result)?;
        Ok(decoded)
    }

    pub async fn block_number(&self, target: &ChainTarget) -> RpcResult<u64> {
        let number: U64 = self.request("eth_blockNumber", json!([]), target).await?;
        Ok(number.as_u64())
    }

    pub async fn gas_price(&self, target: &ChainTarget) -> RpcResult<U256> {
        self.request("eth_gasPrice", json!([]), target).await
    }

    pub async fn transaction_count(
        &self,
        address: Address,
        block: &str,
        target: &ChainTarget,
    ) -> RpcResult<u64> {
        let count: U256 = self
            .request("eth_getTransactionCount", json!([address, block]), target)
            .await?;
        u64::try_from(count).map_err(|e| RpcError::JsonDecodeError(e.to_string()))
    }

    pub async fn estimate_gas(&self, tx: Value, target: &ChainTarget) -> RpcResult<U256> {
        self.request("eth_estimateGas", json!([tx]), target).await
    }

    pub async fn send_raw_transaction(&self, raw: &Bytes, target: &ChainTarget) -> RpcResult<H256> {
        self.request("eth_sendRawTransaction", json!([raw]), target)
            .await
    }

    pub async fn transaction_receipt(
        &self,
        tx_hash: H256,
        target: &ChainTarget,
    ) -> RpcResult<Option<Receipt>> {
        self.request("eth_getTransactionReceipt", json!([tx_hash]), target)
            .await
    }

    /// Raw block object; `tag` is `"latest"` or a hex block number
    pub async fn block_by_number(
        &self,
        tag: &str,
        full_transactions: bool,
        target: &ChainTarget,
    ) -> RpcResult<Option<Value>> {
        self.request(
            "eth_getBlockByNumber",
            json!([tag, full_transactions]),
            target,
        )
        .await
    }

    pub fn stats(&self) -> RpcStats {
        let calls = self.counters.calls.load(Ordering::Relaxed);
        let successes = self.counters.successes.load(Ordering::Relaxed);
        let failures = self.counters.failures.load(Ordering::Relaxed);
        let attempts = self.counters.attempts.load(Ordering::Relaxed);
        let retries = self.counters.retries.load(Ordering::Relaxed);
        let lookups = self.counters.cache_lookups.load(Ordering::Relaxed);
        let hits = self.counters.cache_hits.load(Ordering::Relaxed);

        RpcStats {
            total_calls: calls,
            success_rate: ratio(successes, calls),
            error_rate: ratio(failures, calls),
            retry_rate: ratio(retries, attempts),
            cache_hit_rate: ratio(hits, lookups),
            endpoints: self.pool.reports(),
        }
    }

    /// Run one logical request through the retry policy
    async fn execute<T, D, S>(
        &self,
        target: &ChainTarget,
        endpoint_override: Option<&str>,
        body: &Value,
        label: &str,
        decode: D,
        is_soft: S,
    ) -> RpcResult<T>
    where
        D: Fn(Value) -> RpcResult<T>,
        S: Fn(&T) -> bool,
    {
        let max_attempts = self.retry.max_attempts();
        let mut last_error = None;

        for attempt in 0..max_attempts {
            if attempt > 0 {
                self.counters.retries.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_rpc_retry();
                tokio::time::sleep(self.retry.delay_for(attempt - 1)).await;
            }

            let endpoint = self.resolve(target, endpoint_override)?;
            self.counters.attempts.fetch_add(1, Ordering::Relaxed);

            let started = Instant::now();
            let outcome = {
                let _permit = self
                    .limiter
                    .acquire()
                    .await
                    .map_err(|_| RpcError::Internal("request limiter closed".to_string()))?;

                match timeout(self.request_timeout, self.transport.send(endpoint.url(), body)).await {
                    Ok(reply) => reply.and_then(&decode),
                    Err(_) => Err(RpcError::Timeout {
                        timeout_ms: self.request_timeout.as_millis() as u64,
                    }),
                }
            };
            let elapsed = started.elapsed();

            match outcome {
                Ok(value) => {
                    if is_soft(&value) {
                        endpoint.record_soft(elapsed);
                        crate::metrics::record_rpc_request(endpoint.id(), "node_error", elapsed);
                    } else {
                        endpoint.record_success(elapsed);
                        crate::metrics::record_rpc_request(endpoint.id(), "success", elapsed);
                    }
                    debug!(
                        endpoint = %endpoint.id(),
                        method = label,
                        attempt = attempt + 1,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "RPC call completed"
                    );
                    return Ok(value);
                }
                Err(e) if e.is_retryable() => {
                    endpoint.record_failure(elapsed);
                    crate::metrics::record_rpc_request(endpoint.id(), e.kind(), elapsed);
                    warn!(
                        endpoint = %endpoint.id(),
                        method = label,
                        attempt = attempt + 1,
                        max_attempts,
                        error = %e,
                        "RPC attempt failed"
                    );
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| RpcError::Internal("no attempts made".to_string())))
    }

    fn resolve(
        &self,
        target: &ChainTarget,
        endpoint_override: Option<&str>,
    ) -> RpcResult<Arc<Endpoint>> {
        match endpoint_override {
            Some(id_or_url) => self.pool.find(target, id_or_url),
            None => self.pool.select(target),
        }
    }

    async fn cache_lookup(&self, key: &str) -> Option<Value> {
        let cache = self.cache.as_ref()?;
        self.counters.cache_lookups.fetch_add(1, Ordering::Relaxed);

        match cache.get(key).await {
            Ok(Some(value)) => {
                self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_cache_hit();
                Some(value)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "Result cache lookup failed, treating as miss");
                None
            }
        }
    }

    async fn cache_store(&self, key: &str, value: Value) {
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.set(key, value, self.cache_ttl).await {
                warn!(error = %e, "Result cache store failed");
            }
        }
    }
}

/// Map a batch reply back onto request slots `0..n`
fn demultiplex(value: Value, n: usize) -> RpcResult<Vec<RpcResult<JsonRpcResponse>>> {
    let items = match value {
        Value::Array(items) => items,
        other => {
            // Some providers reject a whole batch with a single error envelope
            let response = JsonRpcResponse::from_value(other)?;
            if response.is_error() {
                return Ok(vec![Ok(response); n]);
            }
            return Err(RpcError::JsonDecodeError(
                "expected a batch response array".to_string(),
            ));
        }
    };

    let mut slots: Vec<Option<JsonRpcResponse>> = vec![None; n];
    let mut unplaced = Vec::new();

    for (position, item) in items.into_iter().enumerate() {
        let response = JsonRpcResponse::from_value(item)?;
        match response.numeric_id().map(|id| id as usize) {
            Some(id) if id < n && slots[id].is_none() => slots[id] = Some(response),
            _ => unplaced.push((position, response)),
        }
    }

    for (position, response) in unplaced {
        if position < n && slots[position].is_none() {
            slots[position] = Some(response);
        }
    }

    Ok(slots
        .into_iter()
        .map(|slot| {
            slot.ok_or_else(|| RpcError::JsonDecodeError("missing response in batch".to_string()))
        })
        .collect())
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

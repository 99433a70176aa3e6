//! Cross-caller batching: independent calls share one batched request

use super::client::RpcClient;
use super::types::{ChainTarget, JsonRpcResponse};
use crate::config::RpcConfig;
use crate::error::{RpcError, RpcResult};

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

struct QueuedCall {
    method: String,
    params: Value,
    queued_at: Instant,
    reply: oneshot::Sender<RpcResult<JsonRpcResponse>>,
}

/// Buffers calls per (chain, network) and sends them as one batch once
/// `min_size` calls are waiting or the oldest has waited `max_age`
pub struct BatchQueue {
    client: Arc<RpcClient>,
    min_size: usize,
    max_age: Duration,
    queues: Mutex<HashMap<ChainTarget, Vec<QueuedCall>>>,
}

impl BatchQueue {
    pub fn new(client: Arc<RpcClient>, config: &RpcConfig) -> Self {
        Self::with_limits(
            client,
            config.batch_min_size,
            Duration::from_millis(config.batch_max_age_ms),
        )
    }

    pub fn with_limits(client: Arc<RpcClient>, min_size: usize, max_age: Duration) -> Self {
        Self {
            client,
            min_size: min_size.max(1),
            max_age,
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Queue a call and wait for its slot of the eventual batch
    pub async fn enqueue(
        &self,
        method: impl Into<String>,
        params: Value,
        target: &ChainTarget,
    ) -> RpcResult<JsonRpcResponse> {
        let (reply, receiver) = oneshot::channel();

        let ready = {
            let mut queues = self.queues.lock().await;
            let queue = queues.entry(target.clone()).or_default();
            queue.push(QueuedCall {
                method: method.into(),
                params,
                queued_at: Instant::now(),
                reply,
            });
            if queue.len() >= self.min_size {
                Some(std::mem::take(queue))
            } else {
                None
            }
        };

        if let Some(batch) = ready {
            self.dispatch(target, batch).await;
        }

        receiver
            .await
            .map_err(|_| RpcError::Internal("batch queue dropped the call".to_string()))?
    }

    /// Number of calls waiting for `target`
    pub async fn queued(&self, target: &ChainTarget) -> usize {
        self.queues
            .lock()
            .await
            .get(target)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    /// Flush every queue whose oldest call has reached `max_age`
    pub async fn flush_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<(ChainTarget, Vec<QueuedCall>)> = {
            let mut queues = self.queues.lock().await;
            queues
                .iter_mut()
                .filter(|(_, queue)| {
                    queue
                        .first()
                        .map(|oldest| now.saturating_duration_since(oldest.queued_at) >= self.max_age)
                        .unwrap_or(false)
                })
                .map(|(target, queue)| (target.clone(), std::mem::take(queue)))
                .collect()
        };

        let mut flushed = 0;
        for (target, batch) in expired {
            flushed += batch.len();
            self.dispatch(&target, batch).await;
        }
        flushed
    }

    /// Flush everything regardless of age
    pub async fn flush_all(&self) -> usize {
        let pending: Vec<(ChainTarget, Vec<QueuedCall>)> = {
            let mut queues = self.queues.lock().await;
            queues
                .iter_mut()
                .filter(|(_, queue)| !queue.is_empty())
                .map(|(target, queue)| (target.clone(), std::mem::take(queue)))
                .collect()
        };

        let mut flushed = 0;
        for (target, batch) in pending {
            flushed += batch.len();
            self.dispatch(&target, batch).await;
        }
        flushed
    }

    /// Periodically flush aged-out queues
    pub fn spawn_flusher(self: Arc<Self>) -> JoinHandle<()> {
        let period = (self.max_age / 2).max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                self.flush_expired().await;
            }
        })
    }

    async fn dispatch(&self, target: &ChainTarget, batch: Vec<QueuedCall>) {
        debug!(chain_target = %target, size = batch.len(), "Flushing batch queue");

        let calls: Vec<(String, Value)> = batch
            .iter()
            .map(|call| (call.method.clone(), call.params.clone()))
            .collect();
        let results = self.client.batch_call(&calls, target).await;

        for (call, result) in batch.into_iter().zip(results) {
            // Caller may have gone away
            let _ = call.reply.send(result);
        }
    }
}

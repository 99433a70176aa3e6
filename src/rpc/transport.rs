//! JSON-RPC transport: one request/response round trip to an endpoint URL

use crate::config::RpcConfig;
use crate::error::{RpcError, RpcResult};

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, info};

/// Request/response primitive the RPC client drives
///
/// Implementations return the decoded JSON body, or a transport-level
/// failure. JSON-RPC envelope inspection happens one layer up.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// POST a JSON body to `url` and decode the JSON reply
    async fn send(&self, url: &str, body: &Value) -> RpcResult<Value>;

    /// Current connection-pool size
    fn pool_size(&self) -> usize;

    /// Rebuild the connection pool with a new size
    fn resize_pool(&self, size: usize) -> RpcResult<()>;

    /// Drop and recreate the underlying session
    fn refresh(&self) -> RpcResult<()>;
}

/// HTTPS transport backed by a pooled reqwest client
pub struct HttpTransport {
    client: RwLock<Client>,
    pool_size: AtomicUsize,
    timeout: Duration,
    max_response_bytes: usize,
}

impl HttpTransport {
    pub fn new(config: &RpcConfig) -> RpcResult<Self> {
        let timeout = Duration::from_millis(config.request_timeout_ms);
        let client = build_client(config.connection_pool_size, timeout)?;

        info!(
            pool_size = config.connection_pool_size,
            timeout_ms = config.request_timeout_ms,
            "HTTP transport initialized"
        );

        Ok(Self {
            client: RwLock::new(client),
            pool_size: AtomicUsize::new(config.connection_pool_size),
            timeout,
            max_response_bytes: config.max_response_bytes,
        })
    }

    fn map_reqwest_error(&self, e: reqwest::Error) -> RpcError {
        // Never carry the endpoint URL into error text
        let e = e.without_url();
        if e.is_timeout() {
            RpcError::Timeout {
                timeout_ms: self.timeout.as_millis() as u64,
            }
        } else if e.is_decode() {
            RpcError::JsonDecodeError(e.to_string())
        } else {
            RpcError::ConnectionError(e.to_string())
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, url: &str, body: &Value) -> RpcResult<Value> {
        let client = self.client.read().clone();

        let mut response = client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| self.map_reqwest_error(e))?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(RpcError::HttpError {
                status: status.as_u16(),
            });
        }

        let limit = self.max_response_bytes;
        if let Some(len) = response.content_length() {
            if len as usize > limit {
                return Err(RpcError::ResponseTooLarge {
                    size: len as usize,
                    limit,
                });
            }
        }

        let mut bytes: Vec<u8> = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| self.map_reqwest_error(e))?
        {
            if bytes.len() + chunk.len() > limit {
                return Err(RpcError::ResponseTooLarge {
                    size: bytes.len() + chunk.len(),
                    limit,
                });
            }
            bytes.extend_from_slice(&chunk);
        }

        let value: Value = serde_json::from_slice(&bytes)?;
        Ok(value)
    }

    fn pool_size(&self) -> usize {
        self.pool_size.load(Ordering::Relaxed)
    }

    fn resize_pool(&self, size: usize) -> RpcResult<()> {
        let client = build_client(size, self.timeout)?;
        *self.client.write() = client;
        let previous = self.pool_size.swap(size, Ordering::Relaxed);
        info!(from = previous, to = size, "Connection pool resized");
        crate::metrics::record_pool_size(size);
        Ok(())
    }

    fn refresh(&self) -> RpcResult<()> {
        let client = build_client(self.pool_size(), self.timeout)?;
        *self.client.write() = client;
        debug!("HTTP session recycled");
        Ok(())
    }
}

fn build_client(pool_size: usize, timeout: Duration) -> RpcResult<Client> {
    Client::builder()
        .timeout(timeout)
        .pool_max_idle_per_host(pool_size)
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Duration::from_secs(60))
        .build()
        .map_err(|e| RpcError::Internal(format!("Failed to create HTTP client: {}", e)))
}

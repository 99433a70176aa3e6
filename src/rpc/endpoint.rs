//! Remote RPC endpoint with rolling health statistics

use super::types::ChainTarget;
use crate::config::TransportKind;

use parking_lot::Mutex;
use serde::Serialize;
use sha3::{Digest, Keccak256};
use std::time::Duration;
use tokio::time::Instant;

/// Health score bounds
pub const HEALTH_MIN: f64 = 0.1;
pub const HEALTH_MAX: f64 = 1.0;
/// Additive recovery per successful call
pub const HEALTH_RECOVERY: f64 = 0.05;
/// Subtractive penalty per failed call
pub const HEALTH_PENALTY: f64 = 0.2;
/// Seconds of idleness after which an endpoint gets full recency credit
pub const RECENCY_WINDOW_SECS: f64 = 5.0;
/// Added to the average response time (seconds) before inverting
pub const LATENCY_EPSILON: f64 = 0.001;
/// Smoothing factor of the response-time moving average
pub const LATENCY_EMA_ALPHA: f64 = 0.2;

/// Rolling statistics, mutated only by the RPC client after each attempt
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointStats {
    pub call_count: u64,
    pub error_count: u64,
    pub consecutive_errors: u32,
    /// Moving average of response time in seconds
    pub avg_response_time: f64,
    pub last_call: Option<Instant>,
    pub health: f64,
}

impl Default for EndpointStats {
    fn default() -> Self {
        Self {
            call_count: 0,
            error_count: 0,
            consecutive_errors: 0,
            avg_response_time: 0.0,
            last_call: None,
            health: HEALTH_MAX,
        }
    }
}

impl EndpointStats {
    pub fn record_success(&mut self, latency: Duration, now: Instant) {
        self.record_latency(latency, now);
        self.consecutive_errors = 0;
        self.health = (self.health + HEALTH_RECOVERY).min(HEALTH_MAX);
    }

    /// The endpoint answered, but with a node-level error envelope
    pub fn record_soft(&mut self, latency: Duration, now: Instant) {
        self.record_latency(latency, now);
        self.consecutive_errors = 0;
    }

    /// A hard failure; `elapsed` is how long the failed attempt took
    pub fn record_failure(&mut self, elapsed: Duration, now: Instant) {
        self.record_latency(elapsed, now);
        self.error_count += 1;
        self.consecutive_errors = self.consecutive_errors.saturating_add(1);
        self.health = (self.health - HEALTH_PENALTY).max(HEALTH_MIN);
    }

    fn record_latency(&mut self, latency: Duration, now: Instant) {
        let sample = latency.as_secs_f64();
        self.avg_response_time = if self.call_count == 0 {
            sample
        } else {
            LATENCY_EMA_ALPHA * sample + (1.0 - LATENCY_EMA_ALPHA) * self.avg_response_time
        };
        self.call_count += 1;
        self.last_call = Some(now);
    }

    /// `health × weight × 0.5^consecutiveErrors × recency × 1/(avgResponseTime + ε)`
    pub fn score(&self, weight: f64, now: Instant) -> f64 {
        let error_penalty = 0.5f64.powi(self.consecutive_errors.min(i32::MAX as u32) as i32);
        let recency = match self.last_call {
            Some(last) => {
                let idle = now.saturating_duration_since(last).as_secs_f64();
                (idle / RECENCY_WINDOW_SECS).min(1.0)
            }
            None => 1.0,
        };
        self.health * weight * error_penalty * recency / (self.avg_response_time + LATENCY_EPSILON)
    }
}

/// One remote RPC provider for one (chain, network) pair
#[derive(Debug)]
pub struct Endpoint {
    id: String,
    url: String,
    weight: f64,
    transport: TransportKind,
    target: ChainTarget,
    stats: Mutex<EndpointStats>,
}

impl Endpoint {
    pub fn new(target: ChainTarget, url: impl Into<String>, weight: f64, transport: TransportKind) -> Self {
        let url = url.into();
        Self {
            id: endpoint_id(&url),
            url,
            weight,
            transport,
            target,
            stats: Mutex::new(EndpointStats::default()),
        }
    }

    /// Stable identifier, safe to log
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    pub fn target(&self) -> &ChainTarget {
        &self.target
    }

    pub fn stats(&self) -> EndpointStats {
        self.stats.lock().clone()
    }

    pub fn health(&self) -> f64 {
        self.stats.lock().health
    }

    pub fn score(&self, now: Instant) -> f64 {
        self.stats.lock().score(self.weight, now)
    }

    pub fn record_success(&self, latency: Duration) {
        let health = {
            let mut stats = self.stats.lock();
            stats.record_success(latency, Instant::now());
            stats.health
        };
        crate::metrics::record_endpoint_health(&self.id, health);
    }

    pub fn record_soft(&self, latency: Duration) {
        self.stats.lock().record_soft(latency, Instant::now());
    }

    pub fn record_failure(&self, elapsed: Duration) {
        let health = {
            let mut stats = self.stats.lock();
            stats.record_failure(elapsed, Instant::now());
            stats.health
        };
        crate::metrics::record_endpoint_health(&self.id, health);
    }

    /// Overwrite the rolling statistics
    #[cfg(test)]
    pub(crate) fn set_stats(&self, stats: EndpointStats) {
        *self.stats.lock() = stats;
    }

    pub fn report(&self) -> EndpointReport {
        let stats = self.stats();
        EndpointReport {
            id: self.id.clone(),
            chain: self.target.chain.clone(),
            network: self.target.network.clone(),
            health: stats.health,
            calls: stats.call_count,
            errors: stats.error_count,
            consecutive_errors: stats.consecutive_errors,
            avg_response_ms: stats.avg_response_time * 1000.0,
        }
    }
}

/// Per-endpoint health snapshot exposed by `RpcClient::stats`
#[derive(Debug, Clone, Serialize)]
pub struct EndpointReport {
    pub id: String,
    pub chain: String,
    pub network: String,
    pub health: f64,
    pub calls: u64,
    pub errors: u64,
    pub consecutive_errors: u32,
    pub avg_response_ms: f64,
}

/// Derive a log-safe identifier from the endpoint URL
pub fn endpoint_id(url: &str) -> String {
    let digest = Keccak256::digest(url.as_bytes());
    format!("ep-{}", hex::encode(&digest[..8]))
}

//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Transaction lifecycle counters and the live pending gauge
//! - RPC requests, retries and latency per endpoint
//! - Endpoint health and connection-pool size

use crate::rpc::ChainTarget;

use anyhow::{Context, Result};
use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_gauge_vec,
    register_histogram_vec, Counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramVec,
    TextEncoder,
};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

lazy_static! {
    // Transaction metrics
    pub static ref TX_SENT: CounterVec = register_counter_vec!(
        "chainwire_transactions_sent_total",
        "Total transactions broadcast",
        &["chain", "network"]
    ).unwrap();

    pub static ref TX_CONFIRMED: CounterVec = register_counter_vec!(
        "chainwire_transactions_confirmed_total",
        "Total transactions confirmed with a successful receipt",
        &["chain", "network"]
    ).unwrap();

    pub static ref TX_FAILED: CounterVec = register_counter_vec!(
        "chainwire_transactions_failed_total",
        "Total transactions mined with a failed receipt",
        &["chain", "network"]
    ).unwrap();

    pub static ref TX_TIMEOUT: CounterVec = register_counter_vec!(
        "chainwire_transactions_timeout_total",
        "Total transactions that timed out",
        &["chain", "network"]
    ).unwrap();

    pub static ref TX_CANCELLED: CounterVec = register_counter_vec!(
        "chainwire_transactions_cancelled_total",
        "Total transactions cancelled",
        &["chain", "network"]
    ).unwrap();

    pub static ref TX_SPEEDUP: CounterVec = register_counter_vec!(
        "chainwire_transactions_speedup_total",
        "Total transactions sped up",
        &["chain", "network"]
    ).unwrap();

    pub static ref TX_ERRORS: CounterVec = register_counter_vec!(
        "chainwire_transaction_errors_total",
        "Total errors returned by the transaction manager",
        &["chain", "network", "kind"]
    ).unwrap();

    pub static ref PENDING_TRANSACTIONS: GaugeVec = register_gauge_vec!(
        "chainwire_pending_transactions",
        "Transactions currently in the live index",
        &["chain", "network"]
    ).unwrap();

    // RPC metrics
    pub static ref RPC_REQUESTS: CounterVec = register_counter_vec!(
        "chainwire_rpc_requests_total",
        "RPC attempts by endpoint and outcome",
        &["endpoint", "outcome"]
    ).unwrap();

    pub static ref RPC_RETRIES: Counter = register_counter!(
        "chainwire_rpc_retries_total",
        "Total RPC retry attempts"
    ).unwrap();

    pub static ref RPC_LATENCY: HistogramVec = register_histogram_vec!(
        "chainwire_rpc_latency_seconds",
        "RPC attempt latency",
        &["endpoint"],
        vec![0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    ).unwrap();

    pub static ref ENDPOINT_HEALTH: GaugeVec = register_gauge_vec!(
        "chainwire_endpoint_health",
        "Endpoint health score (0.1 to 1.0)",
        &["endpoint"]
    ).unwrap();

    pub static ref CONNECTION_POOL_SIZE: Gauge = register_gauge!(
        "chainwire_connection_pool_size",
        "Transport connection-pool size"
    ).unwrap();

    pub static ref CACHE_HITS: Counter = register_counter!(
        "chainwire_cache_hits_total",
        "RPC results served from the result cache"
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> Result<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind metrics server to {}", addr))?;
        axum::serve(listener, app)
            .await
            .context("Metrics server terminated")?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, (StatusCode, String)> {
    render().map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

/// Text exposition of every registered metric
pub fn render() -> Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

// Helper functions to record metrics

fn labels(target: &ChainTarget) -> [&str; 2] {
    [target.chain.as_str(), target.network.as_str()]
}

pub fn record_tx_sent(target: &ChainTarget) {
    TX_SENT.with_label_values(&labels(target)).inc();
}

pub fn record_tx_confirmed(target: &ChainTarget) {
    TX_CONFIRMED.with_label_values(&labels(target)).inc();
}

pub fn record_tx_failed(target: &ChainTarget) {
    TX_FAILED.with_label_values(&labels(target)).inc();
}

pub fn record_tx_timeout(target: &ChainTarget) {
    TX_TIMEOUT.with_label_values(&labels(target)).inc();
}

pub fn record_tx_cancelled(target: &ChainTarget) {
    TX_CANCELLED.with_label_values(&labels(target)).inc();
}

pub fn record_tx_speedup(target: &ChainTarget) {
    TX_SPEEDUP.with_label_values(&labels(target)).inc();
}

pub fn record_tx_error(target: &ChainTarget, kind: &str) {
    TX_ERRORS
        .with_label_values(&[target.chain.as_str(), target.network.as_str(), kind])
        .inc();
}

pub fn set_pending_transactions(target: &ChainTarget, count: usize) {
    PENDING_TRANSACTIONS
        .with_label_values(&labels(target))
        .set(count as f64);
}

pub fn record_rpc_request(endpoint_id: &str, outcome: &str, elapsed: Duration) {
    RPC_REQUESTS.with_label_values(&[endpoint_id, outcome]).inc();
    RPC_LATENCY
        .with_label_values(&[endpoint_id])
        .observe(elapsed.as_secs_f64());
}

pub fn record_rpc_retry() {
    RPC_RETRIES.inc();
}

pub fn record_cache_hit() {
    CACHE_HITS.inc();
}

pub fn record_endpoint_health(endpoint_id: &str, health: f64) {
    ENDPOINT_HEALTH.with_label_values(&[endpoint_id]).set(health);
}

pub fn record_pool_size(size: usize) {
    CONNECTION_POOL_SIZE.set(size as f64);
}

//! HTTP API for health checks, client statistics and transaction status

use crate::config::ApiConfig;
use crate::rpc::{ChainTarget, RpcClient, RpcStats};
use crate::tx::{TransactionManager, TxLookup};

use anyhow::Context;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use ethers::types::H256;
use serde::Serialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub client: Arc<RpcClient>,
    pub managers: Vec<Arc<TransactionManager>>,
}

/// Build the API router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/stats", get(get_stats))
        .route("/endpoints/:chain/:network/best", get(get_best_endpoint))
        .route("/tx/:hash", get(get_transaction))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, state: AppState) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind API server to {}", addr))?;
    axum::serve(listener, router(state))
        .await
        .context("API server terminated")?;

    Ok(())
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn get_stats(State(state): State<AppState>) -> Json<RpcStats> {
    Json(state.client.stats())
}

/// Endpoint the selector would pick right now, by id only
async fn get_best_endpoint(
    State(state): State<AppState>,
    Path((chain, network)): Path<(String, String)>,
) -> impl IntoResponse {
    let target = ChainTarget::new(chain, network);
    match state.client.pool().select(&target) {
        Ok(endpoint) => (
            StatusCode::OK,
            Json(BestEndpointResponse {
                chain: target.chain.clone(),
                network: target.network.clone(),
                endpoint: Some(endpoint.id().to_string()),
                health: Some(endpoint.health()),
            }),
        ),
        Err(_) => (
            StatusCode::NOT_FOUND,
            Json(BestEndpointResponse {
                chain: target.chain,
                network: target.network,
                endpoint: None,
                health: None,
            }),
        ),
    }
}

/// Look a transaction up across every signer's manager
async fn get_transaction(
    State(state): State<AppState>,
    Path(hash): Path<String>,
) -> impl IntoResponse {
    let hash: H256 = match hash.parse() {
        Ok(hash) => hash,
        Err(_) => return (StatusCode::BAD_REQUEST, Json(TxLookup::Unknown)),
    };

    state
        .managers
        .iter()
        .map(|manager| manager.status(&hash))
        .find(|lookup| !matches!(lookup, TxLookup::Unknown))
        .map(|lookup| (StatusCode::OK, Json(lookup)))
        .unwrap_or((StatusCode::NOT_FOUND, Json(TxLookup::Unknown)))
}

// Response types

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct BestEndpointResponse {
    chain: String,
    network: String,
    endpoint: Option<String>,
    health: Option<f64>,
}

//! chainwire - multi-endpoint RPC and transaction lifecycle service
//!
//! Wires the endpoint pool, RPC client, fee optimizer and one transaction
//! manager per configured signer, then serves status and metrics until
//! shutdown.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use chainwire::api::{self, AppState};
use chainwire::config::Settings;
use chainwire::metrics::{self, MetricsServer};
use chainwire::rpc::maintenance::{spawn_pool_resizer, spawn_session_refresher};
use chainwire::rpc::{EndpointPool, HttpTransport, InFlightMonitor, PoolLimits, RpcClient, Transport};
use chainwire::tx::{GasOptimizer, LocalWalletSigner, TransactionManager};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting chainwire v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        endpoints = settings.endpoints.len(),
        signers = settings.signers.len(),
        "Loaded configuration"
    );

    // RPC layer
    let transport: Arc<dyn Transport> =
        Arc::new(HttpTransport::new(&settings.rpc).context("Failed to build HTTP transport")?);
    metrics::record_pool_size(transport.pool_size());

    let pool = Arc::new(EndpointPool::from_config(&settings.endpoints));
    let client = Arc::new(RpcClient::new(pool, transport.clone(), &settings.rpc));

    let mut handles: Vec<JoinHandle<()>> = Vec::new();

    handles.push(spawn_pool_resizer(
        transport.clone(),
        Arc::new(InFlightMonitor::new(client.clone())),
        PoolLimits::from_config(&settings.rpc),
    ));
    handles.push(spawn_session_refresher(
        transport.clone(),
        Duration::from_secs(settings.rpc.session_refresh_interval_secs),
    ));

    // One transaction manager per signing identity
    let mut managers = Vec::new();
    for signer_config in &settings.signers {
        let target = signer_config.target();
        let signer = LocalWalletSigner::from_env(&signer_config.private_key_env, signer_config.chain_id)
            .with_context(|| format!("Failed to load signer for {}", target))?;

        let gas = Arc::new(GasOptimizer::new(client.clone(), target.clone(), &settings.gas));
        let manager = Arc::new(TransactionManager::new(
            client.clone(),
            gas,
            Arc::new(signer),
            target,
            settings.tx.clone(),
        ));
        managers.push(manager);
    }

    let initialized = futures::future::join_all(managers.iter().map(|m| m.initialize())).await;
    for (manager, result) in managers.iter().zip(initialized) {
        if let Err(e) = result {
            // Sequencer retries lazily on first submission
            warn!(chain_target = %manager.target(), error = %e, "Nonce initialization failed");
        }
    }
    for manager in &managers {
        handles.push(manager.clone().spawn_sweep());
    }
    info!(count = managers.len(), "Transaction managers initialized");

    // Start API server
    if settings.api.enabled {
        let state = AppState {
            client: client.clone(),
            managers: managers.clone(),
        };
        let config = settings.api.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = api::run_server(config, state).await {
                error!("API server error: {:#}", e);
            }
        }));
        info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    }

    // Start metrics server
    if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        handles.push(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {:#}", e);
            }
        }));
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    info!("chainwire is running");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Abort background tasks
    for handle in handles {
        handle.abort();
    }

    info!("chainwire stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,chainwire=debug,hyper=warn,reqwest=warn")
    });

    let json = std::env::var("CHAINWIRE_LOG_JSON").map(|v| v == "1").unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true).with_thread_ids(true))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

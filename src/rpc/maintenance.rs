//! Background upkeep of the transport: pool sizing and session recycling

use super::client::RpcClient;
use super::transport::Transport;
use crate::config::RpcConfig;

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// External view of system resource pressure
#[cfg_attr(test, mockall::automock)]
pub trait ResourceMonitor: Send + Sync {
    /// Connection-pool size the monitor recommends, `None` when it has no opinion
    fn recommended_pool_size(&self) -> Option<usize>;
}

/// Sizes the pool from the client's own load: two idle connections per
/// request in flight
pub struct InFlightMonitor {
    client: Arc<RpcClient>,
}

impl InFlightMonitor {
    pub fn new(client: Arc<RpcClient>) -> Self {
        Self { client }
    }
}

impl ResourceMonitor for InFlightMonitor {
    fn recommended_pool_size(&self) -> Option<usize> {
        Some(self.client.in_flight().saturating_mul(2))
    }
}

/// Bounds and cadence of the resize loop
#[derive(Debug, Clone, Copy)]
pub struct PoolLimits {
    pub min: usize,
    pub max: usize,
    pub interval: Duration,
}

impl PoolLimits {
    pub fn from_config(config: &RpcConfig) -> Self {
        Self {
            min: config.min_pool_size,
            max: config.max_pool_size,
            interval: Duration::from_secs(config.pool_resize_interval_secs),
        }
    }
}

/// One resize decision; returns the new size when the pool was rebuilt
pub fn adjust_pool_once(
    transport: &dyn Transport,
    monitor: &dyn ResourceMonitor,
    limits: PoolLimits,
) -> Option<usize> {
    let recommended = monitor.recommended_pool_size()?;
    let current = transport.pool_size();
    let next = recommended.clamp(limits.min, limits.max.max(limits.min));
    if next == current {
        return None;
    }

    info!(recommended, from = current, to = next, "Adjusting connection pool");
    match transport.resize_pool(next) {
        Ok(()) => Some(next),
        Err(e) => {
            warn!(error = %e, "Connection pool resize failed");
            None
        }
    }
}

pub fn spawn_pool_resizer(
    transport: Arc<dyn Transport>,
    monitor: Arc<dyn ResourceMonitor>,
    limits: PoolLimits,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(limits.interval);
        // First tick fires immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            adjust_pool_once(transport.as_ref(), monitor.as_ref(), limits);
        }
    })
}

pub fn spawn_session_refresher(transport: Arc<dyn Transport>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match transport.refresh() {
                Ok(()) => info!("Transport session refreshed"),
                Err(e) => warn!(error = %e, "Transport session refresh failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::transport::MockTransport;
    use mockall::predicate::eq;

    fn limits() -> PoolLimits {
        PoolLimits {
            min: 8,
            max: 128,
            interval: Duration::from_secs(60),
        }
    }

    #[test]
    fn test_adjust_applies_recommendation() {
        let mut monitor = MockResourceMonitor::new();
        monitor.expect_recommended_pool_size().return_const(Some(24usize));

        let mut transport = MockTransport::new();
        transport.expect_pool_size().return_const(32usize);
        transport
            .expect_resize_pool()
            .with(eq(24usize))
            .times(1)
            .returning(|_| Ok(()));

        assert_eq!(adjust_pool_once(&transport, &monitor, limits()), Some(24));
    }

    #[test]
    fn test_adjust_clamps_recommendation() {
        let mut monitor = MockResourceMonitor::new();
        monitor.expect_recommended_pool_size().return_const(Some(1000usize));

        let mut transport = MockTransport::new();
        transport.expect_pool_size().return_const(32usize);
        transport
            .expect_resize_pool()
            .with(eq(128usize))
            .times(1)
            .returning(|_| Ok(()));

        assert_eq!(adjust_pool_once(&transport, &monitor, limits()), Some(128));
    }

    #[test]
    fn test_adjust_skips_unchanged_or_missing() {
        let mut monitor = MockResourceMonitor::new();
        monitor.expect_recommended_pool_size().return_const(Some(32usize));
        let mut transport = MockTransport::new();
        transport.expect_pool_size().return_const(32usize);
        transport.expect_resize_pool().never();
        assert_eq!(adjust_pool_once(&transport, &monitor, limits()), None);

        let mut monitor = MockResourceMonitor::new();
        monitor.expect_recommended_pool_size().return_const(None);

        let mut transport = MockTransport::new();
        transport.expect_resize_pool().never();

        assert_eq!(adjust_pool_once(&transport, &monitor, limits()), None);
    }

    #[test]
    fn test_idle_client_recommends_minimum() {
        let client = Arc::new(RpcClient::new(
            Arc::new(crate::rpc::EndpointPool::new()),
            Arc::new(MockTransport::new()),
            &RpcConfig::default(),
        ));
        let monitor = InFlightMonitor::new(client);
        assert_eq!(monitor.recommended_pool_size(), Some(0));

        let mut transport = MockTransport::new();
        transport.expect_pool_size().return_const(32usize);
        transport
            .expect_resize_pool()
            .with(eq(8usize))
            .times(1)
            .returning(|_| Ok(()));
        assert_eq!(adjust_pool_once(&transport, &monitor, limits()), Some(8));
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_refresher_runs_on_interval() {
        let mut transport = MockTransport::new();
        transport.expect_refresh().times(2).returning(|| Ok(()));

        let handle = spawn_session_refresher(Arc::new(transport), Duration::from_secs(3600));
        tokio::time::sleep(Duration::from_secs(7201)).await;
        handle.abort();
    }
}

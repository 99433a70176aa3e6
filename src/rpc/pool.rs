//! Per-(chain, network) endpoint pool with health-weighted selection

use super::endpoint::{Endpoint, EndpointReport};
use super::types::ChainTarget;
use crate::config::EndpointConfig;
use crate::error::{RpcError, RpcResult};

use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::debug;

/// Endpoints grouped by (chain, network), in insertion order
///
/// Built once at startup; endpoints are never removed, only re-scored.
#[derive(Debug, Default)]
pub struct EndpointPool {
    endpoints: HashMap<ChainTarget, Vec<Arc<Endpoint>>>,
}

impl EndpointPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a pool from configured endpoints
    pub fn from_config(configs: &[EndpointConfig]) -> Self {
        let mut pool = Self::new();
        for config in configs {
            let target = ChainTarget::new(&config.chain, &config.network);
            pool.add(Endpoint::new(target, &config.url, config.weight, config.transport));
        }
        pool
    }

    pub fn add(&mut self, endpoint: Endpoint) -> Arc<Endpoint> {
        let endpoint = Arc::new(endpoint);
        debug!(
            endpoint = %endpoint.id(),
            chain_target = %endpoint.target(),
            weight = endpoint.weight(),
            "Registered RPC endpoint"
        );
        self.endpoints
            .entry(endpoint.target().clone())
            .or_default()
            .push(endpoint.clone());
        endpoint
    }

    pub fn endpoints(&self, target: &ChainTarget) -> &[Arc<Endpoint>] {
        self.endpoints
            .get(target)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn targets(&self) -> impl Iterator<Item = &ChainTarget> {
        self.endpoints.keys()
    }

    /// Pick the highest-scoring endpoint; ties go to the earliest inserted
    pub fn select(&self, target: &ChainTarget) -> RpcResult<Arc<Endpoint>> {
        self.select_at(target, Instant::now())
    }

    /// Selection against an explicit clock reading
    pub fn select_at(&self, target: &ChainTarget, now: Instant) -> RpcResult<Arc<Endpoint>> {
        let mut best: Option<(&Arc<Endpoint>, f64)> = None;

        for endpoint in self.endpoints(target) {
            let score = endpoint.score(now);
            match best {
                Some((_, best_score)) if score <= best_score => {}
                _ => best = Some((endpoint, score)),
            }
        }

        best.map(|(endpoint, _)| endpoint.clone())
            .ok_or_else(|| no_provider(target))
    }

    /// Find an endpoint of this target by id or URL
    pub fn find(&self, target: &ChainTarget, id_or_url: &str) -> RpcResult<Arc<Endpoint>> {
        self.endpoints(target)
            .iter()
            .find(|e| e.id() == id_or_url || e.url() == id_or_url)
            .cloned()
            .ok_or_else(|| no_provider(target))
    }

    pub fn reports(&self) -> Vec<EndpointReport> {
        let mut reports: Vec<EndpointReport> = self
            .endpoints
            .values()
            .flat_map(|endpoints| endpoints.iter().map(|e| e.report()))
            .collect();
        reports.sort_by(|a, b| (&a.chain, &a.network, &a.id).cmp(&(&b.chain, &b.network, &b.id)));
        reports
    }
}

fn no_provider(target: &ChainTarget) -> RpcError {
    RpcError::NoProviderConfigured {
        chain: target.chain.clone(),
        network: target.network.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportKind;
    use crate::rpc::endpoint::EndpointStats;
    use std::time::Duration;

    fn target() -> ChainTarget {
        ChainTarget::new("ethereum", "mainnet")
    }

    fn pool_with(urls: &[(&str, f64)]) -> EndpointPool {
        let mut pool = EndpointPool::new();
        for (url, weight) in urls {
            pool.add(Endpoint::new(target(), *url, *weight, TransportKind::Http));
        }
        pool
    }

    #[test]
    fn test_unknown_target_has_no_provider() {
        let pool = pool_with(&[("https://a.example.com", 1.0)]);
        let err = pool.select(&ChainTarget::new("polygon", "mainnet")).unwrap_err();
        assert!(matches!(err, RpcError::NoProviderConfigured { .. }));
    }

    #[test]
    fn test_ties_resolve_by_insertion_order() {
        let pool = pool_with(&[("https://a.example.com", 1.0), ("https://b.example.com", 1.0)]);
        let chosen = pool.select(&target()).unwrap();
        assert_eq!(chosen.url(), "https://a.example.com");
    }

    #[test]
    fn test_weight_breaks_equal_health() {
        let pool = pool_with(&[("https://a.example.com", 1.0), ("https://b.example.com", 3.0)]);
        let chosen = pool.select(&target()).unwrap();
        assert_eq!(chosen.url(), "https://b.example.com");
    }

    #[test]
    fn test_failing_endpoint_loses_selection() {
        let pool = pool_with(&[("https://x.example.com", 1.0), ("https://y.example.com", 1.0)]);
        let now = Instant::now();
        let x = pool.endpoints(&target())[0].clone();
        let y = pool.endpoints(&target())[1].clone();

        // X fails three times in a row: 1.0 -> 0.8 -> 0.6 -> 0.4, penalty 0.5^3
        let mut x_stats = EndpointStats::default();
        for _ in 0..3 {
            x_stats.record_failure(Duration::from_millis(50), now - Duration::from_secs(30));
        }
        x.set_stats(x_stats);

        // Y keeps succeeding
        let mut y_stats = EndpointStats::default();
        for _ in 0..3 {
            y_stats.record_success(Duration::from_millis(50), now - Duration::from_secs(30));
        }
        y.set_stats(y_stats);

        assert!((x.health() - 0.4).abs() < 1e-9);
        assert!((y.health() - 1.0).abs() < 1e-9);

        let chosen = pool.select_at(&target(), now).unwrap();
        assert_eq!(chosen.id(), y.id());
    }

    #[test]
    fn test_recently_used_endpoint_yields() {
        let pool = pool_with(&[("https://a.example.com", 1.0), ("https://b.example.com", 1.0)]);
        let now = Instant::now();
        let a = pool.endpoints(&target())[0].clone();

        let mut stats = EndpointStats::default();
        stats.record_success(Duration::from_millis(1), now - Duration::from_millis(500));
        a.set_stats(stats);

        // a: 1.0 / 0.002 * 0.1 = 50, b idle: 1000
        let chosen = pool.select_at(&target(), now).unwrap();
        assert_eq!(chosen.url(), "https://b.example.com");
    }

    #[test]
    fn test_find_by_id_or_url() {
        let pool = pool_with(&[("https://a.example.com", 1.0)]);
        let endpoint = pool.endpoints(&target())[0].clone();
        assert_eq!(pool.find(&target(), endpoint.id()).unwrap().url(), endpoint.url());
        assert_eq!(pool.find(&target(), "https://a.example.com").unwrap().id(), endpoint.id());
        assert!(pool.find(&target(), "https://nope.example.com").is_err());
    }
}

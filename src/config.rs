//! Configuration management for chainwire
//!
//! Loads configuration from TOML files with environment variable substitution.
//! Every threshold has an explicit default so the runtime never probes for
//! optional keys.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::path::PathBuf;

use crate::rpc::ChainTarget;
use crate::tx::GasStrategy;

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub rpc: RpcConfig,
    pub endpoints: Vec<EndpointConfig>,
    pub gas: GasConfig,
    pub tx: TxConfig,
    pub signers: Vec<SignerConfig>,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
}

/// RPC client, retry, transport and batching thresholds
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub request_timeout_ms: u64,
    pub max_retries: u32,
    pub base_retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    pub retry_jitter: bool,
    pub max_request_bytes: usize,
    pub max_response_bytes: usize,
    pub max_concurrent_requests: usize,
    pub connection_pool_size: usize,
    pub min_pool_size: usize,
    pub max_pool_size: usize,
    pub pool_resize_interval_secs: u64,
    pub session_refresh_interval_secs: u64,
    pub cache_ttl_secs: u64,
    pub cacheable_methods: Vec<String>,
    pub batch_min_size: usize,
    pub batch_max_age_ms: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 10_000,
            max_retries: 3,
            base_retry_delay_ms: 200,
            max_retry_delay_ms: 5_000,
            retry_jitter: true,
            max_request_bytes: 1_000_000,
            max_response_bytes: 10_000_000,
            max_concurrent_requests: 64,
            connection_pool_size: 32,
            min_pool_size: 8,
            max_pool_size: 128,
            pool_resize_interval_secs: 60,
            session_refresh_interval_secs: 3_600,
            cache_ttl_secs: 300,
            cacheable_methods: vec![
                "eth_chainId".to_string(),
                "net_version".to_string(),
                "eth_getCode".to_string(),
            ],
            batch_min_size: 10,
            batch_max_age_ms: 50,
        }
    }
}

/// One remote RPC provider for one (chain, network) pair
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    pub chain: String,
    pub network: String,
    pub url: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default)]
    pub transport: TransportKind,
}

fn default_weight() -> f64 {
    1.0
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Http,
}

/// Fee computation thresholds
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GasConfig {
    pub strategy: GasStrategy,
    pub use_eip1559: bool,
    pub min_gas_price_gwei: f64,
    pub max_gas_price_gwei: f64,
    pub cache_ttl_secs: u64,
    pub fee_history_blocks: u64,
    pub priority_fee_multiplier: f64,
    pub max_priority_fee_gwei: f64,
    pub default_priority_fee_gwei: f64,
    pub base_fee_multiplier: f64,
    pub optimal_wait_poll_secs: u64,
    pub optimal_wait_max_secs: u64,
}

impl Default for GasConfig {
    fn default() -> Self {
        Self {
            strategy: GasStrategy::Normal,
            use_eip1559: true,
            min_gas_price_gwei: 1.0,
            max_gas_price_gwei: 500.0,
            cache_ttl_secs: 30,
            fee_history_blocks: 5,
            priority_fee_multiplier: 1.0,
            max_priority_fee_gwei: 10.0,
            default_priority_fee_gwei: 1.5,
            base_fee_multiplier: 2.0,
            optimal_wait_poll_secs: 5,
            optimal_wait_max_secs: 120,
        }
    }
}

/// Transaction lifecycle thresholds
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TxConfig {
    pub max_pending_txs: usize,
    pub max_fee_ceiling_gwei: f64,
    pub confirmation_depth: u64,
    pub confirmation_timeout_secs: u64,
    pub receipt_poll_interval_ms: u64,
    pub sweep_interval_secs: u64,
    pub cancel_bump_percent: u64,
    pub speed_up_bump_percent: u64,
    pub gas_limit_buffer_percent: u64,
}

impl Default for TxConfig {
    fn default() -> Self {
        Self {
            max_pending_txs: 16,
            max_fee_ceiling_gwei: 500.0,
            confirmation_depth: 1,
            confirmation_timeout_secs: 300,
            receipt_poll_interval_ms: 1_000,
            sweep_interval_secs: 5,
            cancel_bump_percent: 110,
            speed_up_bump_percent: 120,
            gas_limit_buffer_percent: 20,
        }
    }
}

/// A signing identity bound to one (chain, network)
#[derive(Debug, Clone, Deserialize)]
pub struct SignerConfig {
    pub chain: String,
    pub network: String,
    pub chain_id: u64,
    pub private_key_env: String,
}

impl SignerConfig {
    pub fn target(&self) -> ChainTarget {
        ChainTarget::new(&self.chain, &self.network)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 9090,
        }
    }
}

impl Settings {
    /// Load settings from the file named by `CHAINWIRE_CONFIG`
    pub fn load() -> Result<Self> {
        let config_path = env::var("CHAINWIRE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from an explicit path
    pub fn load_from(config_path: &std::path::Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::parse(&config_str)
    }

    /// Parse settings from TOML text
    pub fn parse(config_str: &str) -> Result<Self> {
        // Substitute environment variables
        let config_str = substitute_env_vars(config_str)?;

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.endpoints.is_empty() {
            anyhow::bail!("At least one endpoint must be configured");
        }

        for endpoint in &self.endpoints {
            if endpoint.url.trim().is_empty() {
                anyhow::bail!(
                    "Endpoint for {}/{} has an empty URL",
                    endpoint.chain,
                    endpoint.network
                );
            }
            if !(endpoint.weight > 0.0) {
                anyhow::bail!(
                    "Endpoint for {}/{} must have a positive weight",
                    endpoint.chain,
                    endpoint.network
                );
            }
        }

        for signer in &self.signers {
            let target = signer.target();
            if self.endpoints_for(&target).next().is_none() {
                anyhow::bail!("Signer for {} has no endpoints configured", target);
            }
        }

        if self.gas.min_gas_price_gwei > self.gas.max_gas_price_gwei {
            anyhow::bail!("gas.min_gas_price_gwei exceeds gas.max_gas_price_gwei");
        }

        if self.rpc.min_pool_size > self.rpc.max_pool_size {
            anyhow::bail!("rpc.min_pool_size exceeds rpc.max_pool_size");
        }

        if self.rpc.max_concurrent_requests == 0 {
            anyhow::bail!("rpc.max_concurrent_requests must be at least 1");
        }

        Ok(())
    }

    /// Endpoints configured for a (chain, network)
    pub fn endpoints_for<'a>(
        &'a self,
        target: &'a ChainTarget,
    ) -> impl Iterator<Item = &'a EndpointConfig> + 'a {
        self.endpoints
            .iter()
            .filter(move |e| e.chain == target.chain && e.network == target.network)
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> Result<String> {
    let mut result = input.to_string();
    let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}")?;

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    Ok(result)
}

//! Gas price quoting, fee decoration and cost estimation

use super::types::TransactionDraft;
use crate::config::GasConfig;
use crate::error::{TxError, TxResult};
use crate::rpc::{ChainTarget, RpcClient};

use ethers::types::U256;
use ethers::utils::format_units;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const WEI_PER_GWEI: f64 = 1e9;
/// Costs below this many wei (0.001 native unit) are shown in gwei
const GWEI_DISPLAY_CUTOFF: u64 = 1_000_000_000_000_000;

/// How aggressively to price transactions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GasStrategy {
    Low,
    #[default]
    Normal,
    High,
}

impl GasStrategy {
    /// Legacy price multiplier in thousandths
    pub fn multiplier_permille(self) -> u64 {
        match self {
            GasStrategy::Low => 800,
            GasStrategy::Normal => 1000,
            GasStrategy::High => 1200,
        }
    }

    /// Price drop (in thousandths of the first reading) worth waiting for
    pub fn wait_threshold_permille(self) -> Option<u64> {
        match self {
            GasStrategy::Low => Some(800),
            GasStrategy::Normal => Some(900),
            GasStrategy::High => None,
        }
    }
}

/// Fee fields of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GasPrice {
    Legacy(U256),
    Eip1559 {
        max_fee_per_gas: U256,
        max_priority_fee_per_gas: U256,
    },
}

impl GasPrice {
    /// The most the sender may pay per unit of gas
    pub fn fee_per_gas(&self) -> U256 {
        match self {
            GasPrice::Legacy(price) => *price,
            GasPrice::Eip1559 { max_fee_per_gas, .. } => *max_fee_per_gas,
        }
    }

    /// Scale every fee field by `percent / 100`
    pub fn bumped(&self, percent: u64) -> Self {
        match self {
            GasPrice::Legacy(price) => GasPrice::Legacy(price.saturating_mul(percent.into()) / 100),
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => GasPrice::Eip1559 {
                max_fee_per_gas: max_fee_per_gas.saturating_mul(percent.into()) / 100,
                max_priority_fee_per_gas: max_priority_fee_per_gas.saturating_mul(percent.into()) / 100,
            },
        }
    }
}

/// EIP-1559 fee quote
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Eip1559Quote {
    pub base_fee: U256,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
}

impl From<Eip1559Quote> for GasPrice {
    fn from(quote: Eip1559Quote) -> Self {
        GasPrice::Eip1559 {
            max_fee_per_gas: quote.max_fee_per_gas,
            max_priority_fee_per_gas: quote.max_priority_fee_per_gas,
        }
    }
}

/// Worst-case cost of a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CostEstimate {
    pub wei: U256,
    pub formatted: String,
}

#[derive(Debug, Clone, Copy)]
struct Cached<T> {
    value: T,
    fetched_at: Instant,
}

impl<T: Copy> Cached<T> {
    fn fresh(&self, ttl: Duration) -> Option<T> {
        (self.fetched_at.elapsed() < ttl).then_some(self.value)
    }
}

/// Fee quoting for one (chain, network), cached for `cache_ttl`
pub struct GasOptimizer {
    client: Arc<RpcClient>,
    target: ChainTarget,
    strategy: GasStrategy,
    use_eip1559: bool,
    min_gas_price: U256,
    max_gas_price: U256,
    cache_ttl: Duration,
    fee_history_blocks: u64,
    priority_fee_multiplier_permille: u64,
    max_priority_fee: U256,
    default_priority_fee: U256,
    base_fee_multiplier_permille: u64,
    poll_interval: Duration,
    max_wait: Duration,
    legacy: RwLock<Option<Cached<U256>>>,
    eip1559: RwLock<Option<Cached<Eip1559Quote>>>,
}

impl GasOptimizer {
    pub fn new(client: Arc<RpcClient>, target: ChainTarget, config: &GasConfig) -> Self {
        info!(
            chain_target = %target,
            strategy = ?config.strategy,
            eip1559 = config.use_eip1559,
            "Gas optimizer initialized"
        );

        Self {
            client,
            target,
            strategy: config.strategy,
            use_eip1559: config.use_eip1559,
            min_gas_price: gwei_to_wei(config.min_gas_price_gwei),
            max_gas_price: gwei_to_wei(config.max_gas_price_gwei),
            cache_ttl: Duration::from_secs(config.cache_ttl_secs),
            fee_history_blocks: config.fee_history_blocks.max(1),
            priority_fee_multiplier_permille: to_permille(config.priority_fee_multiplier),
            max_priority_fee: gwei_to_wei(config.max_priority_fee_gwei),
            default_priority_fee: gwei_to_wei(config.default_priority_fee_gwei),
            base_fee_multiplier_permille: to_permille(config.base_fee_multiplier),
            poll_interval: Duration::from_secs(config.optimal_wait_poll_secs),
            max_wait: Duration::from_secs(config.optimal_wait_max_secs),
            legacy: RwLock::new(None),
            eip1559: RwLock::new(None),
        }
    }

    pub fn strategy(&self) -> GasStrategy {
        self.strategy
    }

    pub fn uses_eip1559(&self) -> bool {
        self.use_eip1559
    }

    /// Strategy-scaled, clamped legacy gas price
    pub async fn legacy_gas_quote(&self) -> TxResult<U256> {
        let cached = *self.legacy.read();
        if let Some(price) = cached.and_then(|c| c.fresh(self.cache_ttl)) {
            return Ok(price);
        }
        self.refresh_legacy_quote().await
    }

    /// Fetch a new legacy quote, bypassing and then updating the cache
    pub async fn refresh_legacy_quote(&self) -> TxResult<U256> {
        let network_price = self.client.gas_price(&self.target).await?;
        let scaled = network_price.saturating_mul(self.strategy.multiplier_permille().into()) / 1000;
        let price = clamp_price(scaled, self.min_gas_price, self.max_gas_price);

        *self.legacy.write() = Some(Cached {
            value: price,
            fetched_at: Instant::now(),
        });

        debug!(
            chain_target = %self.target,
            network = %format_gwei(network_price),
            quoted = %format_gwei(price),
            "Legacy gas quote refreshed"
        );
        Ok(price)
    }

    /// `(maxFeePerGas, maxPriorityFeePerGas)` from the latest base fee and
    /// recent priority fees
    pub async fn eip1559_quote(&self) -> TxResult<Eip1559Quote> {
        let cached = *self.eip1559.read();
        if let Some(quote) = cached.and_then(|c| c.fresh(self.cache_ttl)) {
            return Ok(quote);
        }

        let latest = self
            .client
            .block_by_number("latest", true, &self.target)
            .await?
            .ok_or_else(|| TxError::GasEstimation("latest block unavailable".to_string()))?;

        let base_fee: U256 = quantity(&latest, "baseFeePerGas").ok_or_else(|| {
            TxError::GasEstimation("latest block carries no baseFeePerGas".to_string())
        })?;
        let latest_number: u64 = quantity::<U256>(&latest, "number")
            .map(|n| n.low_u64())
            .unwrap_or_default();

        let mut samples = priority_fees(&latest);
        samples.extend(self.sample_previous_blocks(latest_number).await);

        let priority_fee = match median(&mut samples) {
            Some(median) => {
                let scaled = median.saturating_mul(self.priority_fee_multiplier_permille.into()) / 1000;
                scaled.min(self.max_priority_fee)
            }
            None => self.default_priority_fee,
        };

        let quote = Eip1559Quote {
            base_fee,
            max_fee_per_gas: compute_max_fee(base_fee, self.base_fee_multiplier_permille, priority_fee),
            max_priority_fee_per_gas: priority_fee,
        };

        *self.eip1559.write() = Some(Cached {
            value: quote,
            fetched_at: Instant::now(),
        });

        debug!(
            chain_target = %self.target,
            base_fee = %format_gwei(base_fee),
            priority_fee = %format_gwei(priority_fee),
            samples = samples.len(),
            "EIP-1559 quote refreshed"
        );
        Ok(quote)
    }

    /// Drop both cached quotes
    pub fn invalidate(&self) {
        *self.legacy.write() = None;
        *self.eip1559.write() = None;
    }

    /// The fee set the configured mode would attach right now
    pub async fn current_fee(&self) -> TxResult<GasPrice> {
        if self.use_eip1559 {
            Ok(self.eip1559_quote().await?.into())
        } else {
            Ok(GasPrice::Legacy(self.legacy_gas_quote().await?))
        }
    }

    /// Attach the fee set in use, stripping the other
    pub async fn decorate(&self, draft: &TransactionDraft) -> TxResult<TransactionDraft> {
        let fee = self.current_fee().await?;
        Ok(draft.clone().with_fee(fee))
    }

    /// `gas_limit × fee per gas` with a readable magnitude
    pub async fn estimate_cost(&self, gas_limit: U256) -> TxResult<CostEstimate> {
        let fee = self.current_fee().await?;
        let wei = gas_limit.saturating_mul(fee.fee_per_gas());
        Ok(CostEstimate {
            wei,
            formatted: format_cost(wei),
        })
    }

    /// Poll the legacy quote until it drops far enough below the first
    /// reading or the wait window closes; returns the last reading
    pub async fn wait_for_optimal_gas(&self) -> TxResult<U256> {
        let initial = self.refresh_legacy_quote().await?;
        let threshold = match self.strategy.wait_threshold_permille() {
            Some(threshold) => threshold,
            None => return Ok(initial),
        };

        let goal = initial.saturating_mul(threshold.into()) / 1000;
        let deadline = Instant::now() + self.max_wait;
        let mut current = initial;

        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;

            current = self.refresh_legacy_quote().await?;
            if current < goal {
                info!(
                    chain_target = %self.target,
                    initial = %format_gwei(initial),
                    current = %format_gwei(current),
                    "Gas price dropped below wait threshold"
                );
                break;
            }
        }

        Ok(current)
    }

    async fn sample_previous_blocks(&self, latest: u64) -> Vec<U256> {
        let calls: Vec<(String, Value)> = (1..self.fee_history_blocks)
            .filter_map(|back| latest.checked_sub(back))
            .map(|number| {
                (
                    "eth_getBlockByNumber".to_string(),
                    json!([format!("0x{:x}", number), true]),
                )
            })
            .collect();
        if calls.is_empty() {
            return Vec::new();
        }

        let mut samples = Vec::new();
        for result in self.client.batch_call(&calls, &self.target).await {
            match result.and_then(|response| response.into_result()) {
                Ok(block) => samples.extend(priority_fees(&block)),
                Err(e) => warn!(chain_target = %self.target, error = %e, "Skipping fee sample block"),
            }
        }
        samples
    }
}

/// `baseFee × multiplier + priorityFee`, multiplier in thousandths
pub fn compute_max_fee(base_fee: U256, base_fee_multiplier_permille: u64, priority_fee: U256) -> U256 {
    (base_fee.saturating_mul(base_fee_multiplier_permille.into()) / 1000).saturating_add(priority_fee)
}

pub fn clamp_price(price: U256, min: U256, max: U256) -> U256 {
    price.max(min).min(max)
}

pub fn gwei_to_wei(gwei: f64) -> U256 {
    if gwei <= 0.0 || !gwei.is_finite() {
        return U256::zero();
    }
    U256::from((gwei * WEI_PER_GWEI).round() as u128)
}

fn to_permille(multiplier: f64) -> u64 {
    if multiplier <= 0.0 || !multiplier.is_finite() {
        return 0;
    }
    (multiplier * 1000.0).round() as u64
}

/// Gwei for costs under 0.001 native unit, native units above
pub fn format_cost(wei: U256) -> String {
    if wei < U256::from(GWEI_DISPLAY_CUTOFF) {
        format_gwei(wei)
    } else {
        match format_units(wei, "ether") {
            Ok(ether) => format!("{} ETH", trim_decimals(&ether)),
            Err(_) => format!("{} wei", wei),
        }
    }
}

pub fn format_gwei(wei: U256) -> String {
    match format_units(wei, "gwei") {
        Ok(gwei) => format!("{} gwei", trim_decimals(&gwei)),
        Err(_) => format!("{} wei", wei),
    }
}

fn trim_decimals(value: &str) -> &str {
    if value.contains('.') {
        value.trim_end_matches('0').trim_end_matches('.')
    } else {
        value
    }
}

fn quantity<T: DeserializeOwned>(object: &Value, field: &str) -> Option<T> {
    object
        .get(field)
        .filter(|v| !v.is_null())
        .and_then(|v| serde_json::from_value(v.clone()).ok())
}

/// `maxPriorityFeePerGas` of every full transaction object in a block
fn priority_fees(block: &Value) -> Vec<U256> {
    block
        .get("transactions")
        .and_then(Value::as_array)
        .map(|txs| {
            txs.iter()
                .filter_map(|tx| quantity::<U256>(tx, "maxPriorityFeePerGas"))
                .collect()
        })
        .unwrap_or_default()
}

fn median(samples: &mut [U256]) -> Option<U256> {
    if samples.is_empty() {
        return None;
    }
    samples.sort();
    let mid = samples.len() / 2;
    if samples.len() % 2 == 0 {
        Some(samples[mid - 1] + (samples[mid] - samples[mid - 1]) / 2)
    } else {
        Some(samples[mid])
    }
}

//! Retry policy applied by the RPC client around each transport attempt

use crate::config::RpcConfig;

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

/// Delay schedule between attempts
#[derive(Clone)]
pub enum Backoff {
    /// `min(base × 2^attempt, max)`
    Exponential { base: Duration, max: Duration },
    /// Same delay every time
    Fixed(Duration),
    /// Caller-supplied schedule, indexed by zero-based retry number
    Custom(Arc<dyn Fn(u32) -> Duration + Send + Sync>),
}

impl Backoff {
    pub fn delay(&self, retry: u32) -> Duration {
        match self {
            Backoff::Exponential { base, max } => {
                let factor = 2u32.checked_pow(retry).unwrap_or(u32::MAX);
                base.checked_mul(factor).unwrap_or(*max).min(*max)
            }
            Backoff::Fixed(delay) => *delay,
            Backoff::Custom(f) => f(retry),
        }
    }
}

impl std::fmt::Debug for Backoff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backoff::Exponential { base, max } => f
                .debug_struct("Exponential")
                .field("base", base)
                .field("max", max)
                .finish(),
            Backoff::Fixed(d) => f.debug_tuple("Fixed").field(d).finish(),
            Backoff::Custom(_) => f.write_str("Custom"),
        }
    }
}

/// How many extra attempts to make and how long to wait between them
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Backoff,
    /// Randomize each delay into `[delay/2, delay]`
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: Backoff) -> Self {
        Self {
            max_retries,
            backoff,
            jitter: false,
        }
    }

    pub fn from_config(config: &RpcConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff: Backoff::Exponential {
                base: Duration::from_millis(config.base_retry_delay_ms),
                max: Duration::from_millis(config.max_retry_delay_ms),
            },
            jitter: config.retry_jitter,
        }
    }

    /// Policy that never retries
    pub fn none() -> Self {
        Self::new(0, Backoff::Fixed(Duration::ZERO))
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Total attempts including the first
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before retry number `retry` (zero-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let delay = self.backoff.delay(retry);
        if self.jitter && !delay.is_zero() {
            let fraction = rand::thread_rng().gen_range(0.5..=1.0);
            delay.mul_f64(fraction)
        } else {
            delay
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RpcConfig::default())
    }
}

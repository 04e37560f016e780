//! Capped exponential reconnect delays.

use std::time::Duration;

use market_core::config::BackoffConfig;

/// Largest exponent applied to the base delay.
///
/// The retry counter itself grows without bound; clamping the exponent keeps
/// the shift and multiplication from overflowing on long-lived channels.
const MAX_EXPONENT: u32 = 16;

/// Reconnect delay schedule: `min(base * 2^retry, max)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base_ms: u64,
    max_ms: u64,
}

impl Backoff {
    /// Create a schedule from explicit bounds in milliseconds.
    pub fn new(base_ms: u64, max_ms: u64) -> Self {
        Self { base_ms, max_ms }
    }

    /// Delay before the reconnect that follows `retry_count` prior attempts.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let factor = 1u64 << retry_count.min(MAX_EXPONENT);
        Duration::from_millis(self.base_ms.saturating_mul(factor).min(self.max_ms))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        BackoffConfig::default().into()
    }
}

impl From<BackoffConfig> for Backoff {
    fn from(config: BackoffConfig) -> Self {
        Self::new(config.base_delay_ms, config.max_delay_ms)
    }
}

//! Retry timing.

use std::time::Duration;

use rand::Rng;

use crate::config::DeliveryConfig;

/// Exponential backoff with bounded jitter.
///
/// The delay before retry `n` (1-based) is `base * 2^(n-1) + jitter`, with the
/// jitter kept below `base` so successive delays strictly increase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_jitter: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &DeliveryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_backoff_ms),
            max_jitter: Duration::from_millis(config.max_jitter_ms),
        }
    }

    /// Backoff before retry `retry` without jitter.
    pub fn backoff(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << exp)
    }

    /// Backoff before retry `retry` with jitter applied.
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.backoff(retry) + self.jitter()
    }

    fn jitter(&self) -> Duration {
        let cap = self
            .max_jitter
            .min(self.base_delay.saturating_sub(Duration::from_nanos(1)));
        let cap_nanos = cap.as_nanos() as u64;
        if cap_nanos == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(rand::rng().random_range(0..cap_nanos))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&DeliveryConfig::default())
    }
}

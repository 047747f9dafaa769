//! Exponential retry backoff.

use std::time::Duration;

use crate::error::DeliveryError;

/// Retry schedule for queued writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay after the first failure.
    pub initial: Duration,
    /// Upper bound on any delay.
    pub max: Duration,
    /// Attempts allowed before giving up.
    pub max_attempts: u32,
    /// Minimum delay after the store reports its quota exhausted.
    pub quota_floor: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(2),
            max: Duration::from_secs(120),
            max_attempts: 5,
            quota_floor: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retrying after failure number `n` (0-indexed):
    /// `min(initial * 2^n, max)`.
    #[must_use]
    pub fn delay_for(&self, n: u32) -> Duration {
        2u32.checked_pow(n)
            .and_then(|factor| self.initial.checked_mul(factor))
            .map_or(self.max, |d| d.min(self.max))
    }

    /// Delay after failure number `n` caused by `error`.
    #[must_use]
    pub fn delay_after(&self, n: u32, error: &DeliveryError) -> Duration {
        let delay = self.delay_for(n);
        if matches!(error, DeliveryError::QuotaExceeded) {
            delay.max(self.quota_floor)
        } else {
            delay
        }
    }

    /// Whether `attempts` failures use up the budget.
    #[must_use]
    pub const fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

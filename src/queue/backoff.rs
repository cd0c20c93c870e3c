//! Per-key retry backoff
//!
//! Delay is a pure function of the failure count: `base * 2^(attempt - 1)`,
//! capped at `max`. No jitter is applied, so delays for consecutive failures
//! never decrease.

use std::time::Duration;

/// Default delay after the first failure
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);

/// Default upper bound for any single delay
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

/// Exponential backoff policy for failed reconciles
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay after the first failure
    pub base: Duration,
    /// Upper bound for any delay
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_BASE_DELAY,
            max: DEFAULT_MAX_DELAY,
        }
    }
}

impl BackoffPolicy {
    /// Create a policy; `max` is raised to `base` if smaller
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
        }
    }

    /// Delay before the next attempt after `attempt` consecutive failures
    ///
    /// `attempt` 0 means no failure yet and yields no delay.
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        2u32.checked_pow(attempt - 1)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |d| d.min(self.max))
    }
}

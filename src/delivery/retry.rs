//! Exponential backoff policy shared by the batch and stream workers.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry budget and backoff curve
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Delay before the second attempt
    #[serde(with = "crate::config::duration")]
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    #[serde(with = "crate::config::duration")]
    pub max_delay: Duration,
    /// Total attempts including the first one
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Short delays for tests
    pub fn test() -> Self {
        RetryPolicy {
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            max_attempts: 3,
        }
    }

    /// Delay to wait after `failed_attempts` consecutive failures.
    ///
    /// One failure waits `initial_delay`; each further failure doubles it,
    /// capped at `max_delay`.
    pub fn delay_for(&self, failed_attempts: u32) -> Duration {
        if failed_attempts == 0 {
            return Duration::ZERO;
        }
        let shift = failed_attempts.saturating_sub(1).min(20);
        let factor = 1u32 << shift;
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Whether another attempt is allowed after `attempts` tries
    pub fn allows_another(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

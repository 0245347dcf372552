/// Retry policy for failed jobs
///
/// backoff(n) = min(initial_backoff * multiplier^(n-1), max_backoff), never zero.

use crate::config::RetryConfig;
use chrono::Duration;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Failures tolerated before a job becomes dead
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub multiplier: f64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff_ms: 1_000,
            multiplier: 2.0,
            max_backoff_ms: 300_000,
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_backoff_ms: config.initial_backoff_ms,
            multiplier: config.multiplier,
            max_backoff_ms: config.max_backoff_ms,
        }
    }
}

impl RetryPolicy {
    /// Delay before the given retry attempt (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base = self.initial_backoff_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        let capped = if base.is_finite() {
            base.min(self.max_backoff_ms as f64) as u64
        } else {
            self.max_backoff_ms
        };
        Duration::milliseconds(capped.max(1) as i64)
    }

    /// Whether a job with this many failures must be given up
    pub fn exhausted(&self, retry_count: u32) -> bool {
        retry_count > self.max_retries
    }
}

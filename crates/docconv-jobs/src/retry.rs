//! Exponential retry backoff.

use std::time::Duration;

use docconv_core::defaults;

/// Backoff policy applied when a conversion attempt fails with a retryable error.
///
/// The failure of attempt `n` delays the next eligibility by
/// `base * 2^(n-1)`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(defaults::JOB_BACKOFF_BASE_MS),
            max: Duration::from_millis(defaults::JOB_BACKOFF_MAX_MS),
        }
    }
}

impl RetryPolicy {
    /// Create policy from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `JOB_BACKOFF_BASE_MS` | `2000` | Delay after the first failed attempt |
    /// | `JOB_BACKOFF_MAX_MS` | `3600000` | Ceiling on any single delay |
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let base = std::env::var("JOB_BACKOFF_BASE_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.base);
        let max = std::env::var("JOB_BACKOFF_MAX_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.max);
        Self { base, max }
    }

    pub fn with_base(mut self, base: Duration) -> Self {
        self.base = base;
        self
    }

    pub fn with_max(mut self, max: Duration) -> Self {
        self.max = max;
        self
    }

    /// Delay after the `attempt`-th attempt (1-based) has failed.
    pub fn delay_for(&self, attempt: i32) -> Duration {
        let exponent = attempt.saturating_sub(1).clamp(0, 31) as u32;
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

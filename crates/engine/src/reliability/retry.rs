//! Retry policy for retryable step failures

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::time::duration_millis;

/// Backoff applied when a step fails with a retryable error
///
/// The strand is suspended for the computed delay and the same label runs
/// again. Supports exponential backoff with jitter to avoid thundering herd.
///
/// # Example
///
/// ```
/// use strand_engine::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential()
///     .with_max_attempts(5)
///     .with_initial_interval(Duration::from_secs(1))
///     .with_max_interval(Duration::from_secs(60));
///
/// // First retry after ~1 second
/// // Second retry after ~2 seconds
/// // Third retry after ~4 seconds
/// // etc.
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of runs of one label (including the first)
    ///
    /// `0` means retry forever.
    pub max_attempts: u32,

    /// Initial delay before first retry
    #[serde(with = "duration_millis")]
    pub initial_interval: Duration,

    /// Maximum delay between retries
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Backoff multiplier (e.g., 2.0 for exponential)
    pub backoff_coefficient: f64,

    /// Jitter factor (0.0-1.0) to add randomness
    ///
    /// A value of 0.1 means ±10% randomness.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    /// Create an exponential backoff retry policy with sensible defaults
    ///
    /// - 10 max attempts
    /// - 1 second initial interval
    /// - 5 minute max interval
    /// - 2x backoff coefficient
    /// - 10% jitter
    pub fn exponential() -> Self {
        Self {
            max_attempts: 10,
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(300),
            backoff_coefficient: 2.0,
            jitter: 0.1,
        }
    }

    /// Create a policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_interval: Duration::ZERO,
            max_interval: Duration::ZERO,
            backoff_coefficient: 1.0,
            jitter: 0.0,
        }
    }

    /// Create a policy with fixed intervals (no backoff)
    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_interval: interval,
            max_interval: interval,
            backoff_coefficient: 1.0,
            jitter: 0.0,
        }
    }

    /// Set the maximum number of attempts (0 = unlimited)
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Retry forever
    pub fn unlimited(self) -> Self {
        self.with_max_attempts(0)
    }

    /// Set the initial retry interval
    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    /// Set the maximum retry interval
    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Set the backoff coefficient
    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient;
        self
    }

    /// Set the jitter factor (0.0-1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Calculate delay for a given attempt number (1-based)
    ///
    /// Returns the duration to wait before the retry.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }

        let retry_num = attempt - 1; // First retry is after attempt 1
        let exponent = (retry_num - 1).min(i32::MAX as u32) as i32;
        let base = self.initial_interval.as_secs_f64() * self.backoff_coefficient.powi(exponent);
        let capped = base.min(self.max_interval.as_secs_f64());

        // Apply jitter
        let jittered = if self.jitter > 0.0 && capped > 0.0 {
            let mut rng = rand::thread_rng();
            let jitter_range = capped * self.jitter;
            let jitter_offset = rng.gen_range(-jitter_range..jitter_range);
            (capped + jitter_offset).max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(jittered)
    }

    /// Check if there are remaining attempts
    pub fn has_attempts_remaining(&self, current_attempt: u32) -> bool {
        self.max_attempts == 0 || current_attempt < self.max_attempts
    }

    /// Delay before the next run after `failures` consecutive retryable failures
    ///
    /// Returns `None` when the policy is exhausted.
    pub fn next_delay(&self, failures: u32) -> Option<Duration> {
        self.has_attempts_remaining(failures)
            .then(|| self.delay_for_attempt(failures.saturating_add(1)))
    }
}

//! Retry policy with exponential backoff and jitter.
//!
//! The delay after failed attempt `n` (1-based) is
//! `min(base * 2^(n-1), max_delay) + uniform(0..=max_jitter)`.

use crate::config::NetworkConfig;
use rand::Rng;
use std::time::Duration;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first one).
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub base_delay: Duration,
    /// Maximum delay cap (before jitter).
    pub max_delay: Duration,
    /// Upper bound of the uniform jitter added to each delay.
    pub max_jitter: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: NetworkConfig::MAX_ATTEMPTS,
            base_delay: NetworkConfig::BASE_BACKOFF,
            max_delay: NetworkConfig::MAX_BACKOFF,
            max_jitter: NetworkConfig::MAX_JITTER,
        }
    }
}

impl RetryConfig {
    /// Create a new retry config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of attempts.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set the base delay.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set the maximum delay cap.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the jitter upper bound. `Duration::ZERO` disables jitter.
    pub fn with_max_jitter(mut self, jitter: Duration) -> Self {
        self.max_jitter = jitter;
        self
    }

    /// Backoff before the next attempt, excluding jitter.
    pub fn base_backoff(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1).min(31) as i32;
        let secs = self.base_delay.as_secs_f64() * 2f64.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }

    /// Calculate the delay after the given failed attempt (1-based).
    pub fn calculate_delay(&self, failed_attempt: u32) -> Duration {
        let backoff = self.base_backoff(failed_attempt);
        if self.max_jitter.is_zero() {
            return backoff;
        }
        let jitter_ms = rand::rng().random_range(0..=self.max_jitter.as_millis() as u64);
        backoff + Duration::from_millis(jitter_ms)
    }

    /// Start tracking a new logical call.
    pub fn first_attempt(&self) -> RetryAttempt {
        RetryAttempt {
            attempt_number: 1,
            max_attempts: self.max_attempts.max(1),
        }
    }
}

/// Position within one logical call's retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryAttempt {
    /// 1-based attempt number.
    pub attempt_number: u32,
    pub max_attempts: u32,
}

impl RetryAttempt {
    /// Whether no further attempts remain after this one.
    pub fn is_last(&self) -> bool {
        self.attempt_number >= self.max_attempts
    }

    /// The following attempt.
    pub fn next(self) -> Self {
        Self {
            attempt_number: self.attempt_number + 1,
            ..self
        }
    }
}

/// Statistics about a retried call.
#[derive(Debug, Clone, Default)]
pub struct RetryStats {
    /// Number of attempts made.
    pub attempts: u32,
    /// Total backoff delay slept.
    pub total_delay: Duration,
    /// Whether the call ultimately succeeded.
    pub success: bool,
    /// Last error message if failed.
    pub last_error: Option<String>,
}

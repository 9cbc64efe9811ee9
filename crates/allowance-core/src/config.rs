//! Centralized configuration for the Allowance client layer.
//!
//! Default values live as associated constants; [`ClientConfig`] is the
//! runtime surface callers override per client instance.

use crate::error::{AllowanceError, Result};
use crate::network::{CircuitBreakerConfig, RetryConfig};
use std::time::Duration;
use url::Url;

/// Network-related defaults.
pub struct NetworkConfig;

impl NetworkConfig {
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
    pub const MAX_ATTEMPTS: u32 = 3;
    pub const BASE_BACKOFF: Duration = Duration::from_secs(1);
    pub const MAX_BACKOFF: Duration = Duration::from_secs(30);
    pub const MAX_JITTER: Duration = Duration::from_millis(250);
    pub const CIRCUIT_BREAKER_THRESHOLD: u32 = 3;
    pub const CIRCUIT_BREAKER_COOLDOWN: Duration = Duration::from_secs(30);
    pub const TOKEN_TTL: Duration = Duration::from_secs(600);
    pub const TOKEN_REFRESH_RATIO: f64 = 0.9;
    pub const RESPONSE_CACHE_TTL: Duration = Duration::from_secs(60);
    pub const RESPONSE_CACHE_CAPACITY: u64 = 256;
    pub const TOKEN_PATH: &'static str = "/api/csrf-token";
    pub const STATUS_PATH: &'static str = "/api/transactions/status";
    pub const CSRF_HEADER: &'static str = "X-CSRF-Token";
    pub const CSRF_FIELD: &'static str = "csrf_token";
    pub const REQUEST_ID_HEADER: &'static str = "X-Request-Id";
    pub const USER_AGENT: &'static str = "Allowance-Client/0.3";
}

/// Transaction tracking defaults.
pub struct TrackerConfig;

impl TrackerConfig {
    pub const COUNTDOWN: Duration = Duration::from_secs(120);
    pub const POLL_INTERVAL: Duration = Duration::from_secs(5);
    /// Elapsed time after which progress reads "verifying".
    pub const VERIFYING_AFTER: Duration = Duration::from_secs(30);
    /// Elapsed time after which progress reads "finalizing".
    pub const FINALIZING_AFTER: Duration = Duration::from_secs(90);
    pub const PUSH_FEED_CAPACITY: usize = 50;
    pub const PUSH_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    pub const PUSH_RECONNECT_DELAY: Duration = Duration::from_secs(3);
}

/// Runtime configuration for one API client instance.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL every request path is joined onto.
    pub base_url: String,
    /// Path of the token issuance endpoint.
    pub token_path: String,
    /// Path of the transaction status endpoint.
    pub status_path: String,
    /// Maximum attempts per logical call (including the first).
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles afterwards.
    pub base_delay: Duration,
    /// Upper bound for a single backoff delay.
    pub max_delay: Duration,
    /// Upper bound of the uniform jitter added to each delay.
    pub max_jitter: Duration,
    /// Hard timeout for each individual attempt.
    pub attempt_timeout: Duration,
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before a trial call.
    pub cooldown: Duration,
    /// Lifetime assumed for a token when the server does not state one.
    pub token_ttl: Duration,
    /// Fraction of the token lifetime after which a background refresh fires.
    pub refresh_ratio: f64,
    /// Lifetime of cached read-only responses.
    pub cache_ttl: Duration,
    /// Maximum number of cached read-only responses.
    pub cache_capacity: u64,
    /// User agent sent with every request.
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000".to_string(),
            token_path: NetworkConfig::TOKEN_PATH.to_string(),
            status_path: NetworkConfig::STATUS_PATH.to_string(),
            max_attempts: NetworkConfig::MAX_ATTEMPTS,
            base_delay: NetworkConfig::BASE_BACKOFF,
            max_delay: NetworkConfig::MAX_BACKOFF,
            max_jitter: NetworkConfig::MAX_JITTER,
            attempt_timeout: NetworkConfig::REQUEST_TIMEOUT,
            failure_threshold: NetworkConfig::CIRCUIT_BREAKER_THRESHOLD,
            cooldown: NetworkConfig::CIRCUIT_BREAKER_COOLDOWN,
            token_ttl: NetworkConfig::TOKEN_TTL,
            refresh_ratio: NetworkConfig::TOKEN_REFRESH_RATIO,
            cache_ttl: NetworkConfig::RESPONSE_CACHE_TTL,
            cache_capacity: NetworkConfig::RESPONSE_CACHE_CAPACITY,
            user_agent: NetworkConfig::USER_AGENT.to_string(),
        }
    }
}

impl ClientConfig {
    /// Create a config for the given base URL with default values.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    /// Set the token issuance path.
    pub fn with_token_path(mut self, path: impl Into<String>) -> Self {
        self.token_path = path.into();
        self
    }

    /// Set the transaction status path.
    pub fn with_status_path(mut self, path: impl Into<String>) -> Self {
        self.status_path = path.into();
        self
    }

    /// Set the maximum number of attempts.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set the base backoff delay.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set the jitter upper bound (zero disables jitter).
    pub fn with_max_jitter(mut self, jitter: Duration) -> Self {
        self.max_jitter = jitter;
        self
    }

    /// Set the per-attempt timeout.
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// Set the circuit breaker threshold and cool-down.
    pub fn with_circuit_breaker(mut self, threshold: u32, cooldown: Duration) -> Self {
        self.failure_threshold = threshold;
        self.cooldown = cooldown;
        self
    }

    /// Set the default token lifetime.
    pub fn with_token_ttl(mut self, ttl: Duration) -> Self {
        self.token_ttl = ttl;
        self
    }

    /// Set the proactive refresh point as a fraction of the token lifetime.
    pub fn with_refresh_ratio(mut self, ratio: f64) -> Self {
        self.refresh_ratio = ratio;
        self
    }

    /// Set the response cache lifetime.
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Reject configurations that would make the client misbehave.
    pub fn validate(&self) -> Result<()> {
        Url::parse(&self.base_url).map_err(|e| AllowanceError::Config {
            message: format!("invalid base_url {:?}: {}", self.base_url, e),
        })?;
        if self.max_attempts == 0 {
            return Err(config_error("max_attempts must be at least 1"));
        }
        if self.attempt_timeout.is_zero() {
            return Err(config_error("attempt_timeout must be non-zero"));
        }
        if self.failure_threshold == 0 {
            return Err(config_error("failure_threshold must be at least 1"));
        }
        if self.token_ttl.is_zero() {
            return Err(config_error("token_ttl must be non-zero"));
        }
        if !(self.refresh_ratio > 0.0 && self.refresh_ratio < 1.0) {
            return Err(config_error("refresh_ratio must be between 0 and 1"));
        }
        Ok(())
    }

    /// Circuit breaker settings derived from this config.
    pub fn circuit_breaker(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            cooldown: self.cooldown,
            half_open_max_calls: 1,
        }
    }

    /// Retry settings derived from this config.
    pub fn retry(&self) -> RetryConfig {
        RetryConfig::new()
            .with_max_attempts(self.max_attempts)
            .with_base_delay(self.base_delay)
            .with_max_delay(self.max_delay)
            .with_max_jitter(self.max_jitter)
    }

    /// Domain of the base URL, used to label the circuit breaker.
    pub fn domain(&self) -> String {
        Url::parse(&self.base_url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| "unknown".to_string())
    }
}

fn config_error(message: &str) -> AllowanceError {
    AllowanceError::Config {
        message: message.to_string(),
    }
}

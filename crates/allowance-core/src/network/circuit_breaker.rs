//! Circuit breaker pattern for network resilience.
//!
//! Implements the circuit breaker pattern to prevent cascading failures:
//! - CLOSED: Normal operation, requests flow through
//! - OPEN: Failing, requests are rejected immediately
//! - HALF_OPEN: Cool-down elapsed, a single trial request is allowed
//!
//! Time is read from `tokio::time::Instant` so paused-clock tests can drive
//! the cool-down deterministically.

use crate::config::NetworkConfig;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation - requests flow through.
    Closed,
    /// Failing - requests are rejected immediately.
    Open,
    /// Testing recovery - one trial request allowed.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit.
    pub failure_threshold: u32,
    /// Time the circuit stays open before a trial request is allowed.
    pub cooldown: Duration,
    /// Maximum number of trial requests in half-open state.
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: NetworkConfig::CIRCUIT_BREAKER_THRESHOLD,
            cooldown: NetworkConfig::CIRCUIT_BREAKER_COOLDOWN,
            half_open_max_calls: 1,
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    /// Consecutive failure count (reset on success).
    failure_count: u32,
    total_failures: u64,
    total_successes: u64,
    /// When the circuit was (last) opened.
    opened_at: Option<Instant>,
    /// Trial calls handed out since entering half-open.
    half_open_calls: u32,
    /// When the most recent trial permit was handed out.
    trial_issued_at: Option<Instant>,
}

/// Circuit breaker guarding one upstream service.
///
/// All state lives behind a single mutex so a transition and its counters
/// are always observed together.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
    /// Domain this circuit breaker protects.
    domain: String,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with default configuration.
    pub fn new(domain: impl Into<String>) -> Self {
        Self::with_config(domain, CircuitBreakerConfig::default())
    }

    /// Create a new circuit breaker with custom configuration.
    pub fn with_config(domain: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                total_failures: 0,
                total_successes: 0,
                opened_at: None,
                half_open_calls: 0,
                trial_issued_at: None,
            }),
            domain: domain.into(),
        }
    }

    /// Domain label used in logs and errors.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Get the current state of the circuit.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.maybe_transition_to_half_open(&mut inner);
        inner.state
    }

    /// Check if a request should be allowed through.
    ///
    /// In half-open state this hands out at most `half_open_max_calls`
    /// trial permits until a result is recorded. A trial permit that has
    /// been out for a whole cool-down without a result is reclaimed.
    pub fn allow_request(&self) -> bool {
        self.acquire().is_some()
    }

    /// Like [`allow_request`](Self::allow_request), but returns a permit that
    /// gives an unresolved trial slot back when dropped.
    pub fn try_acquire(&self) -> Option<BreakerPermit<'_>> {
        self.acquire().map(|trial| BreakerPermit {
            breaker: self,
            trial,
            resolved: false,
        })
    }

    /// `Some(is_trial)` when a call may proceed.
    fn acquire(&self) -> Option<bool> {
        let mut inner = self.lock();
        self.maybe_transition_to_half_open(&mut inner);

        match inner.state {
            CircuitState::Closed => Some(false),
            CircuitState::Open => None,
            CircuitState::HalfOpen => {
                if inner.half_open_calls >= self.config.half_open_max_calls {
                    let stale = inner
                        .trial_issued_at
                        .is_some_and(|issued| issued.elapsed() >= self.config.cooldown);
                    if !stale {
                        return None;
                    }
                    warn!(
                        "Circuit breaker for {}: trial call never reported back; reclaiming",
                        self.domain
                    );
                    inner.half_open_calls = 0;
                }
                inner.half_open_calls += 1;
                inner.trial_issued_at = Some(Instant::now());
                Some(true)
            }
        }
    }

    /// Give back a trial slot whose call ended without a verdict.
    fn release_trial(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen && inner.half_open_calls > 0 {
            inner.half_open_calls -= 1;
            if inner.half_open_calls == 0 {
                inner.trial_issued_at = None;
            }
            debug!("Circuit breaker for {}: trial slot released", self.domain);
        }
    }

    /// Record a successful request.
    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.total_successes += 1;
        inner.failure_count = 0;

        if inner.state != CircuitState::Closed {
            // Trial succeeded
            self.transition_to_closed(&mut inner);
        }
    }

    /// Record a failed request and return the resulting state.
    pub fn record_failure(&self) -> CircuitState {
        let mut inner = self.lock();
        inner.total_failures += 1;
        inner.failure_count += 1;

        match inner.state {
            CircuitState::Closed => {
                if inner.failure_count >= self.config.failure_threshold {
                    self.transition_to_open(&mut inner);
                }
            }
            CircuitState::HalfOpen => {
                // Trial failed - restart the cool-down
                self.transition_to_open(&mut inner);
            }
            CircuitState::Open => {}
        }
        inner.state
    }

    /// Get statistics about this circuit breaker.
    pub fn stats(&self) -> CircuitBreakerStats {
        let mut inner = self.lock();
        self.maybe_transition_to_half_open(&mut inner);
        CircuitBreakerStats {
            domain: self.domain.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            total_failures: inner.total_failures,
            total_successes: inner.total_successes,
            time_in_state: match inner.state {
                CircuitState::Closed => Duration::ZERO,
                CircuitState::Open | CircuitState::HalfOpen => inner
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::ZERO),
            },
        }
    }

    /// Reset the circuit breaker to closed state.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.failure_count = 0;
        inner.half_open_calls = 0;
        inner.opened_at = None;
        inner.trial_issued_at = None;
        inner.state = CircuitState::Closed;
        info!("Circuit breaker for {} reset to CLOSED", self.domain);
    }

    // Internal state transitions

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition_to_open(&self, inner: &mut BreakerState) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.half_open_calls = 0;
        inner.trial_issued_at = None;
        warn!(
            "Circuit breaker for {} opened after {} consecutive failures",
            self.domain, inner.failure_count
        );
    }

    fn transition_to_closed(&self, inner: &mut BreakerState) {
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.half_open_calls = 0;
        inner.trial_issued_at = None;
        inner.opened_at = None;
        info!("Circuit breaker for {} recovered to CLOSED", self.domain);
    }

    fn maybe_transition_to_half_open(&self, inner: &mut BreakerState) {
        if inner.state != CircuitState::Open {
            return;
        }
        if let Some(opened) = inner.opened_at {
            if opened.elapsed() >= self.config.cooldown {
                inner.state = CircuitState::HalfOpen;
                inner.half_open_calls = 0;
                inner.trial_issued_at = None;
                debug!("Circuit breaker for {} entering HALF_OPEN", self.domain);
            }
        }
    }
}

/// Permission for one call, from [`CircuitBreaker::try_acquire`].
///
/// Dropping it without recording a result (the call was cancelled, or ended
/// in an error that says nothing about the service) frees a half-open trial
/// slot for the next caller.
#[must_use = "record the call's result or drop the permit"]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    resolved: bool,
}

impl BreakerPermit<'_> {
    /// Whether this permit is the half-open trial call.
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn record_success(mut self) {
        self.resolved = true;
        self.breaker.record_success();
    }

    pub fn record_failure(mut self) -> CircuitState {
        self.resolved = true;
        self.breaker.record_failure()
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if self.trial && !self.resolved {
            self.breaker.release_trial();
        }
    }
}

/// Statistics about a circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    pub domain: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub total_failures: u64,
    pub total_successes: u64,
    pub time_in_state: Duration,
}

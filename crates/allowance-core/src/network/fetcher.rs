//! Retrying fetcher: one logical call with timeouts, backoff and circuit breaking.
//!
//! Every attempt:
//! 1. asks the circuit breaker for permission (fails fast when open),
//! 2. runs under a hard per-attempt timeout,
//! 3. has its response normalized into [`AllowanceError`] categories.
//!
//! Retryable failures (timeouts, 5xx, dropped connections) are retried with
//! exponential backoff until the budget runs out or the breaker opens.
//! Definitive answers (validation, rejection, token refusal) return at once.

use crate::error::{AllowanceError, ErrorKind, Result};
use crate::network::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::network::retry::{RetryConfig, RetryStats};
use crate::network::transport::{ApiResponse, DynTransport, RequestSpec};
use crate::session::SessionToken;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Error codes upstream services use to flag a refused anti-forgery token.
const TOKEN_REJECTION_CODES: &[&str] = &[
    "csrf_failed",
    "csrf_token_mismatch",
    "invalid_token",
    "invalid_csrf_token",
    "token_expired",
];

/// Executes requests with retry, timeout and circuit breaker policy.
pub struct RetryingFetcher {
    transport: DynTransport,
    breaker: Arc<CircuitBreaker>,
    retry: RetryConfig,
    attempt_timeout: Duration,
}

impl RetryingFetcher {
    /// Create a fetcher over a transport and a breaker owned by the same client.
    pub fn new(
        transport: DynTransport,
        breaker: Arc<CircuitBreaker>,
        retry: RetryConfig,
        attempt_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            breaker,
            retry,
            attempt_timeout,
        }
    }

    /// The circuit breaker guarding this fetcher.
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// The retry policy in use.
    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    /// Execute a request, attaching `token` when given.
    pub async fn execute(
        &self,
        spec: &RequestSpec,
        token: Option<&SessionToken>,
    ) -> Result<ApiResponse> {
        self.execute_with_stats(spec, token).await.0
    }

    /// Execute a request and report how many attempts it took.
    pub async fn execute_with_stats(
        &self,
        spec: &RequestSpec,
        token: Option<&SessionToken>,
    ) -> (Result<ApiResponse>, RetryStats) {
        let mut stats = RetryStats::default();
        let retry = match spec.max_attempts {
            Some(max) => self.retry.clone().with_max_attempts(max),
            None => self.retry.clone(),
        };
        let mut attempt = retry.first_attempt();

        loop {
            // Never send a token known to be expired.
            if let Some(token) = token {
                if !token.is_valid() {
                    let err = AllowanceError::AuthRejected {
                        message: "session token expired before the request was sent".to_string(),
                    };
                    stats.last_error = Some(err.to_string());
                    return (Err(err), stats);
                }
            }

            let Some(permit) = self.breaker.try_acquire() else {
                let err = AllowanceError::ServiceUnavailable {
                    domain: self.breaker.domain().to_string(),
                };
                debug!("{} {} short-circuited: {}", spec.method, spec.path, err);
                stats.last_error = Some(err.to_string());
                return (Err(err), stats);
            };

            // Dropping `permit` unresolved (cancelled attempt, or an error that
            // says nothing about the service) frees a half-open trial slot.
            stats.attempts = attempt.attempt_number;
            match self.attempt(spec, token).await {
                Ok(response) => {
                    permit.record_success();
                    stats.success = true;
                    if attempt.attempt_number > 1 {
                        debug!(
                            "{} {} succeeded after {} attempts",
                            spec.method, spec.path, attempt.attempt_number
                        );
                    }
                    return (Ok(response), stats);
                }
                Err(err) if !err.is_retryable() => {
                    // The service answered; it is healthy even if it said no.
                    if matches!(
                        err.kind(),
                        ErrorKind::Validation | ErrorKind::Rejected | ErrorKind::AuthRejected
                    ) {
                        permit.record_success();
                    } else {
                        drop(permit);
                    }
                    debug!("{} {} not retryable: {}", spec.method, spec.path, err);
                    stats.last_error = Some(err.to_string());
                    return (Err(err), stats);
                }
                Err(err) => {
                    stats.last_error = Some(err.to_string());
                    let state = permit.record_failure();

                    if attempt.is_last() {
                        warn!(
                            "All {} attempts for {} {} exhausted. Last error: {}",
                            attempt.max_attempts, spec.method, spec.path, err
                        );
                        return (Err(err), stats);
                    }
                    if state == CircuitState::Open {
                        warn!(
                            "Circuit opened during {} {}; giving up after attempt {}: {}",
                            spec.method, spec.path, attempt.attempt_number, err
                        );
                        return (Err(err), stats);
                    }

                    let delay = retry.calculate_delay(attempt.attempt_number);
                    stats.total_delay += delay;
                    warn!(
                        "Attempt {}/{} for {} {} failed: {}. Retrying in {:?}",
                        attempt.attempt_number,
                        attempt.max_attempts,
                        spec.method,
                        spec.path,
                        err,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt = attempt.next();
                }
            }
        }
    }

    async fn attempt(
        &self,
        spec: &RequestSpec,
        token: Option<&SessionToken>,
    ) -> Result<ApiResponse> {
        let request = spec.to_request(token.map(SessionToken::value), self.attempt_timeout);
        debug!("[{}] {} {}", request.request_id, request.method, request.path);
        let response = tokio::time::timeout(self.attempt_timeout, self.transport.send(&request))
            .await
            .map_err(|_| AllowanceError::Timeout(self.attempt_timeout))??;
        classify_response(response)
    }
}

/// Map a raw response onto the error taxonomy.
pub fn classify_response(response: ApiResponse) -> Result<ApiResponse> {
    let status = response.status;
    if response.is_success() {
        return Ok(response);
    }

    let message = response
        .error_message()
        .unwrap_or_else(|| format!("HTTP {}", status));

    match status {
        408 | 425 | 429 | 500..=599 => Err(AllowanceError::Transient {
            message,
            status: Some(status),
        }),
        419 => Err(AllowanceError::AuthRejected { message }),
        401 | 403 if is_token_rejection(&response) => Err(AllowanceError::AuthRejected { message }),
        400 | 422 => Err(AllowanceError::Validation {
            field: response
                .body
                .get("field")
                .and_then(Value::as_str)
                .unwrap_or("request")
                .to_string(),
            message,
        }),
        _ => Err(AllowanceError::Rejected { status, message }),
    }
}

/// Whether an error response says the anti-forgery token was refused.
///
/// A bare 403 is an ordinary authorization failure; only a body marker turns
/// it into a token rejection.
pub fn is_token_rejection(response: &ApiResponse) -> bool {
    if let Some(code) = response.error_code() {
        let code = code.to_ascii_lowercase();
        if TOKEN_REJECTION_CODES.contains(&code.as_str()) {
            return true;
        }
    }
    match response.error_message() {
        Some(message) => {
            let message = message.to_ascii_lowercase();
            message.contains("csrf")
                || (message.contains("token")
                    && ["invalid", "expired", "missing", "mismatch"]
                        .iter()
                        .any(|word| message.contains(word)))
        }
        None => false,
    }
}

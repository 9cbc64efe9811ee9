//! Error types for the Allowance client layer.
//!
//! Upstream failures arrive in many shapes (HTTP status codes, ad hoc JSON
//! error bodies, socket errors). They are normalized into [`AllowanceError`]
//! at the fetcher boundary so callers only ever match on this taxonomy.

use std::time::Duration;
use thiserror::Error;

/// Coarse classification of an [`AllowanceError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Timeout, 5xx, dropped connection. Retryable.
    Transient,
    /// The anti-forgery token was refused by the server.
    AuthRejected,
    /// The circuit breaker is open; no I/O was attempted.
    ServiceUnavailable,
    /// Malformed input or response. Never retried.
    Validation,
    /// A deadline was exceeded.
    Timeout,
    /// The server definitively refused the request (401/403/404/409...).
    Rejected,
    /// Token issuance is unavailable or the token was refused twice.
    Authentication,
    /// Local misconfiguration, cancellation and everything else.
    Internal,
}

/// Main error type for the Allowance client layer.
///
/// The enum is `Clone` so that a single coalesced token fetch can hand the
/// same failure to every waiting caller.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AllowanceError {
    // Network errors
    #[error("Transient failure: {message}")]
    Transient {
        message: String,
        /// HTTP status when the failure came from a response.
        status: Option<u16>,
    },

    #[error("Request timeout after {0:?}")]
    Timeout(Duration),

    #[error("Service unavailable: circuit breaker open for {domain}")]
    ServiceUnavailable { domain: String },

    // Authentication errors
    #[error("Session token rejected: {message}")]
    AuthRejected { message: String },

    #[error("Authentication unavailable: {message}")]
    AuthenticationUnavailable {
        message: String,
        /// The token endpoint was unreachable rather than refusing us.
        retryable: bool,
    },

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    // Request errors
    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Request rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json { message: String },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Operation cancelled")]
    Cancelled,
}

/// Result type alias for Allowance operations.
pub type Result<T> = std::result::Result<T, AllowanceError>;

impl From<serde_json::Error> for AllowanceError {
    fn from(err: serde_json::Error) -> Self {
        AllowanceError::Json {
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for AllowanceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AllowanceError::Timeout(Duration::ZERO)
        } else if err.is_decode() {
            AllowanceError::Validation {
                field: "body".to_string(),
                message: err.to_string(),
            }
        } else {
            AllowanceError::Transient {
                message: err.to_string(),
                status: err.status().map(|s| s.as_u16()),
            }
        }
    }
}

impl AllowanceError {
    /// Shorthand for a validation error.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        AllowanceError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Shorthand for a transient error without a status code.
    pub fn transient(message: impl Into<String>) -> Self {
        AllowanceError::Transient {
            message: message.into(),
            status: None,
        }
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AllowanceError::Transient { .. } => ErrorKind::Transient,
            AllowanceError::Timeout(_) => ErrorKind::Timeout,
            AllowanceError::ServiceUnavailable { .. } => ErrorKind::ServiceUnavailable,
            AllowanceError::AuthRejected { .. } => ErrorKind::AuthRejected,
            AllowanceError::AuthenticationUnavailable { .. }
            | AllowanceError::AuthenticationFailed { .. } => ErrorKind::Authentication,
            AllowanceError::Validation { .. } | AllowanceError::Json { .. } => {
                ErrorKind::Validation
            }
            AllowanceError::Rejected { .. } => ErrorKind::Rejected,
            AllowanceError::Config { .. } | AllowanceError::Cancelled => ErrorKind::Internal,
        }
    }

    /// Check if this error should trigger another attempt of the same call.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AllowanceError::Transient { .. } | AllowanceError::Timeout(_)
        )
    }

    /// Check if the server gave a definitive answer that retrying cannot change.
    ///
    /// Used by the transaction tracker to stop polling immediately.
    pub fn is_definitive_rejection(&self) -> bool {
        if let AllowanceError::AuthenticationUnavailable { retryable, .. } = self {
            return !retryable;
        }
        matches!(
            self.kind(),
            ErrorKind::AuthRejected
                | ErrorKind::Authentication
                | ErrorKind::Rejected
                | ErrorKind::Validation
        )
    }

    /// Whether the user can reasonably try the whole operation again later.
    ///
    /// Timeouts and outages are worth retrying; a refused or malformed
    /// operation is not.
    pub fn is_retry_advisable(&self) -> bool {
        if let AllowanceError::AuthenticationUnavailable { retryable, .. } = self {
            return *retryable;
        }
        matches!(
            self.kind(),
            ErrorKind::Transient | ErrorKind::Timeout | ErrorKind::ServiceUnavailable
        )
    }

    /// Human-readable reason suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            AllowanceError::Transient { .. } => {
                "The service did not respond correctly. Please try again in a moment.".to_string()
            }
            AllowanceError::Timeout(_) => {
                "The request took too long to complete. You can try again.".to_string()
            }
            AllowanceError::ServiceUnavailable { .. } => {
                "The service is temporarily unavailable after repeated failures. Please wait before retrying."
                    .to_string()
            }
            AllowanceError::AuthRejected { .. } | AllowanceError::AuthenticationFailed { .. } => {
                "Your session could not be verified. Please sign in again.".to_string()
            }
            AllowanceError::AuthenticationUnavailable {
                retryable: true,
                ..
            } => {
                "A secure session could not be started because the service is not responding. Please try again in a moment."
                    .to_string()
            }
            AllowanceError::AuthenticationUnavailable { .. } => {
                "A secure session could not be established. Check your connection and sign in again."
                    .to_string()
            }
            AllowanceError::Validation { field, message } => {
                format!("Invalid {}: {}", field, message)
            }
            AllowanceError::Rejected { status: 401, .. } => {
                "You are not signed in or your session has ended.".to_string()
            }
            AllowanceError::Rejected { status: 403, .. } => {
                "You are not allowed to perform this operation.".to_string()
            }
            AllowanceError::Rejected { status: 404, .. } => {
                "The requested record could not be found.".to_string()
            }
            AllowanceError::Rejected { message, .. } => {
                format!("The request was refused: {}", message)
            }
            AllowanceError::Json { .. } => {
                "The server sent a response that could not be understood.".to_string()
            }
            AllowanceError::Config { message } => format!("Client misconfigured: {}", message),
            AllowanceError::Cancelled => "The operation was cancelled.".to_string(),
        }
    }
}

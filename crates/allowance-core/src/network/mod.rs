//! Network utilities for HTTP operations, retries, and resilience.
//!
//! This module provides:
//! - Request/response types and the pluggable transport seam
//! - A reqwest-backed HTTP transport
//! - Retry policy with exponential backoff and jitter
//! - Circuit breaker pattern for network resilience
//! - The retrying fetcher that combines all of the above

mod circuit_breaker;
mod client;
mod fetcher;
mod retry;
mod transport;

pub use circuit_breaker::{
    BreakerPermit, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState,
};
pub use client::{decode_body, HttpTransport};
pub use fetcher::{classify_response, is_token_rejection, RetryingFetcher};
pub use retry::{RetryAttempt, RetryConfig, RetryStats};
pub use transport::{ApiRequest, ApiResponse, DynTransport, Method, RequestSpec, Transport};

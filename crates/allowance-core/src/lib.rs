//! Allowance Core - resilient API client and payment tracking for the
//! allowance platform.
//!
//! Every request the client library makes goes through one path: obtain an
//! anti-forgery session token, attach it, run the call under a per-attempt
//! timeout with bounded exponential backoff, and stop early when the
//! circuit breaker for the service is open. Payment flows then hand a
//! transaction id to a [`TransactionStatusTracker`], which polls until the
//! payment settles or a countdown runs out.
//!
//! # Example
//!
//! ```rust,ignore
//! use allowance_core::{ApiStatusSource, ClientConfig, ResilientApiClient, RequestSpec};
//! use allowance_core::{Transaction, TransactionStatusTracker};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> allowance_core::Result<()> {
//!     let client = Arc::new(ResilientApiClient::new(ClientConfig::new("https://api.example.com"))?);
//!
//!     let ads = client.call(&RequestSpec::get("/api/ads")).await?;
//!     println!("ads: {}", ads.body);
//!
//!     let source = Arc::new(ApiStatusSource::new(client.clone()));
//!     let tracker = TransactionStatusTracker::start(
//!         Transaction::new("tx-1", 2_500, "Kofi"),
//!         source,
//!         |ok| println!("payment finished: {}", ok),
//!     );
//!     println!("{:?}", tracker.wait().await);
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod cache;
pub mod cancel;
pub mod config;
pub mod error;
pub mod network;
pub mod session;
pub mod transaction;

// Re-export commonly used types
pub use api::{speculate, ResilientApiClient, SpeculativeUpdate, Speculation};
pub use cache::{CacheEntry, TtlCache};
pub use cancel::{CancellationToken, CancelledError};
pub use config::{ClientConfig, NetworkConfig, TrackerConfig};
pub use error::{AllowanceError, ErrorKind, Result};
pub use network::{
    ApiResponse, CircuitBreaker, CircuitState, HttpTransport, Method, RequestSpec, RetryConfig,
    RetryingFetcher, Transport,
};
pub use session::{SessionToken, SessionTokenManager, TokenCache};
pub use transaction::{
    ApiStatusSource, PollReport, ProgressStep, PushEvent, PushFeed, PushListener, StatusSource,
    TrackerOutcome, TrackerProgress, TrackerSettings, TrackerState, Transaction,
    TransactionStatus, TransactionStatusTracker,
};

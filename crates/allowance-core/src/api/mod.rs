//! Resilient API client: the facade UI flows call.
//!
//! Every call obtains a session token, attaches it, and runs through the
//! retrying fetcher. A token rejection is recovered exactly once: the cached
//! token is dropped, a fresh one is forced, and the original request is
//! replayed. A second rejection is fatal.

mod speculative;

pub use speculative::{speculate, SpeculativeUpdate, Speculation};

use crate::cache::TtlCache;
use crate::config::ClientConfig;
use crate::error::{AllowanceError, Result};
use crate::network::{
    ApiResponse, CircuitBreaker, DynTransport, HttpTransport, Method, RequestSpec,
    RetryingFetcher,
};
use crate::session::{SessionSettings, SessionTokenManager};
use serde::de::DeserializeOwned;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Facade combining token management, retries and circuit breaking.
///
/// Each instance owns its own token cache and circuit breaker, so separate
/// clients (e.g. admin and parent sessions) never share state.
pub struct ResilientApiClient {
    config: ClientConfig,
    fetcher: Arc<RetryingFetcher>,
    session: SessionTokenManager,
    responses: TtlCache<ApiResponse>,
    /// Bumped whenever a write clears `responses`.
    write_generation: AtomicU64,
}

impl ResilientApiClient {
    /// Create a client talking HTTP to `config.base_url`.
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let transport: DynTransport = Arc::new(HttpTransport::new(&config)?);
        Self::with_transport(config, transport)
    }

    /// Create a client over a custom transport.
    pub fn with_transport(config: ClientConfig, transport: DynTransport) -> Result<Self> {
        config.validate()?;

        let breaker = Arc::new(CircuitBreaker::with_config(
            config.domain(),
            config.circuit_breaker(),
        ));
        let fetcher = Arc::new(RetryingFetcher::new(
            transport,
            breaker,
            config.retry(),
            config.attempt_timeout,
        ));
        let session = SessionTokenManager::new(fetcher.clone(), SessionSettings::from_config(&config));
        let responses = TtlCache::new(config.cache_ttl, config.cache_capacity);

        info!("API client ready for {}", config.base_url);
        Ok(Self {
            config,
            fetcher,
            session,
            responses,
            write_generation: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Token manager of this client.
    pub fn session(&self) -> &SessionTokenManager {
        &self.session
    }

    /// Circuit breaker of this client.
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        self.fetcher.breaker()
    }

    /// Issue a business request.
    pub async fn call(&self, spec: &RequestSpec) -> Result<ApiResponse> {
        let token = self.session.get_token(false).await?;

        let response = match self.fetcher.execute(spec, Some(&token)).await {
            Err(AllowanceError::AuthRejected { message }) => {
                warn!(
                    "{} {}: session token rejected ({}); refreshing once",
                    spec.method, spec.path, message
                );
                self.session.invalidate();
                let fresh = self.session.get_token(true).await?;

                match self.fetcher.execute(spec, Some(&fresh)).await {
                    Err(AllowanceError::AuthRejected { message }) => {
                        self.session.invalidate();
                        warn!(
                            "{} {}: fresh session token rejected again",
                            spec.method, spec.path
                        );
                        Err(AllowanceError::AuthenticationFailed { message })
                    }
                    other => other,
                }
            }
            other => other,
        }?;

        if spec.method != Method::Get {
            // Reads cached before this write may be stale now.
            self.invalidate_reads();
        }
        Ok(response)
    }

    /// Issue a request and deserialize its body.
    pub async fn call_json<T: DeserializeOwned>(&self, spec: &RequestSpec) -> Result<T> {
        self.call(spec).await?.json()
    }

    /// Issue a read-only request, serving it from the response cache when fresh.
    pub async fn get_cached(&self, spec: &RequestSpec) -> Result<ApiResponse> {
        let key = spec.cache_key();
        if let Some(response) = self.responses.get(&key) {
            debug!("Cache hit for {}", key);
            return Ok(response);
        }
        let generation = self.write_generation.load(Ordering::SeqCst);
        let response = self.call(spec).await?;
        // A write that finished meanwhile may have made this read stale.
        if self.write_generation.load(Ordering::SeqCst) == generation {
            self.responses.insert(key, response.clone());
        } else {
            debug!("Not caching {}: a write completed during the read", key);
        }
        Ok(response)
    }

    fn invalidate_reads(&self) {
        self.write_generation.fetch_add(1, Ordering::SeqCst);
        self.responses.clear();
    }

    /// Drop the cached response for a request.
    pub fn invalidate_cached(&self, spec: &RequestSpec) {
        self.responses.invalidate(&spec.cache_key());
    }

    /// Apply a local update, issue the call, and roll the update back on failure.
    pub async fn call_speculative<U: SpeculativeUpdate>(
        &self,
        spec: &RequestSpec,
        update: &mut U,
    ) -> Result<ApiResponse> {
        update.apply();
        match self.call(spec).await {
            Ok(response) => {
                update.commit(&response);
                Ok(response)
            }
            Err(err) => {
                debug!(
                    "{} {} failed; rolling back local update: {}",
                    spec.method, spec.path, err
                );
                update.rollback(&err);
                Err(err)
            }
        }
    }

    /// Tear down: clear the token, stop background refresh, drop cached responses.
    pub fn shutdown(&self) {
        self.session.shutdown();
        self.invalidate_reads();
        info!("API client for {} shut down", self.config.base_url);
    }
}

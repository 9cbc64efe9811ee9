//! Session token acquisition with request coalescing and proactive refresh.
//!
//! - A valid cached token is returned without I/O.
//! - Concurrent callers share one in-flight fetch and observe the same
//!   token or the same failure.
//! - After each successful fetch a background timer refreshes the token at
//!   `refresh_ratio * ttl`, strictly before it expires.

use crate::cancel::CancellationToken;
use crate::config::ClientConfig;
use crate::error::{AllowanceError, Result};
use crate::network::{ApiResponse, RequestSpec, RetryingFetcher};
use crate::session::token::{SessionToken, TokenCache};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

type SharedFetch = Shared<BoxFuture<'static, Result<SessionToken>>>;

/// Field names upstream services use for the token value.
const TOKEN_FIELDS: &[&str] = &["csrf_token", "csrfToken", "token"];

/// Settings for token acquisition.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Token issuance request.
    pub token_request: RequestSpec,
    /// Lifetime used when the issuer does not state one.
    pub default_ttl: Duration,
    /// Fraction of the lifetime after which the background refresh fires.
    pub refresh_ratio: f64,
}

impl SessionSettings {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            token_request: RequestSpec::get(config.token_path.clone()),
            default_ttl: config.token_ttl,
            refresh_ratio: config.refresh_ratio,
        }
    }
}

struct ManagerInner {
    fetcher: Arc<RetryingFetcher>,
    cache: TokenCache,
    settings: SessionSettings,
    in_flight: Mutex<Option<SharedFetch>>,
    /// Bumped on every schedule/invalidate; stale refresh timers exit.
    refresh_generation: AtomicU64,
    fetch_count: AtomicU64,
    shutdown: CancellationToken,
}

/// Obtains and keeps fresh the anti-forgery token of one client.
pub struct SessionTokenManager {
    inner: Arc<ManagerInner>,
}

impl SessionTokenManager {
    pub fn new(fetcher: Arc<RetryingFetcher>, settings: SessionSettings) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                fetcher,
                cache: TokenCache::new(),
                settings,
                in_flight: Mutex::new(None),
                refresh_generation: AtomicU64::new(0),
                fetch_count: AtomicU64::new(0),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Get a valid token, fetching one if needed.
    ///
    /// With `force`, the cached token is dropped first, so a failed fetch
    /// leaves the cache empty. A fetch already in flight is joined rather
    /// than duplicated in either case.
    pub async fn get_token(&self, force: bool) -> Result<SessionToken> {
        if self.inner.shutdown.is_cancelled() {
            return Err(AllowanceError::Cancelled);
        }
        if force {
            self.inner.cache.invalidate();
        } else if let Some(token) = self.inner.cache.valid() {
            return Ok(token);
        }
        coalesced_fetch(&self.inner).await
    }

    /// The cached token if valid. Never performs I/O.
    pub fn cached(&self) -> Option<SessionToken> {
        self.inner.cache.valid()
    }

    /// Drop the cached token, e.g. after the server refused it.
    pub fn invalidate(&self) {
        debug!("Invalidating cached session token");
        self.inner.refresh_generation.fetch_add(1, Ordering::SeqCst);
        self.inner.cache.invalidate();
    }

    /// Number of token fetches started so far.
    pub fn fetch_count(&self) -> u64 {
        self.inner.fetch_count.load(Ordering::SeqCst)
    }

    /// Clear the token and stop background refresh. The manager is unusable afterwards.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.invalidate();
    }
}

impl Drop for SessionTokenManager {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

fn lock_in_flight(inner: &ManagerInner) -> MutexGuard<'_, Option<SharedFetch>> {
    inner.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn coalesced_fetch(inner: &Arc<ManagerInner>) -> Result<SessionToken> {
    let fetch = {
        let mut slot = lock_in_flight(inner);
        match slot.as_ref() {
            Some(pending) => {
                debug!("Joining in-flight session token fetch");
                pending.clone()
            }
            None => {
                let fetch = fetch_token(inner.clone()).boxed().shared();
                *slot = Some(fetch.clone());
                fetch
            }
        }
    };
    fetch.await
}

async fn fetch_token(inner: Arc<ManagerInner>) -> Result<SessionToken> {
    inner.fetch_count.fetch_add(1, Ordering::SeqCst);
    debug!("Fetching session token");

    let result = inner
        .fetcher
        .execute(&inner.settings.token_request, None)
        .await
        .and_then(|response| parse_token(&response, inner.settings.default_ttl));

    let outcome = match result {
        Ok(token) => {
            inner.cache.set(token.clone());
            schedule_refresh(&inner, &token);
            info!("Session token acquired (ttl {:?})", token.ttl());
            Ok(token)
        }
        Err(err) => {
            // A failed proactive refresh keeps a token that is still valid.
            inner.cache.clear_expired();
            warn!("Session token fetch failed: {}", err);
            Err(AllowanceError::AuthenticationUnavailable {
                message: err.to_string(),
                retryable: err.is_retry_advisable(),
            })
        }
    };

    lock_in_flight(&inner).take();
    outcome
}

fn schedule_refresh(inner: &Arc<ManagerInner>, token: &SessionToken) {
    let generation = inner.refresh_generation.fetch_add(1, Ordering::SeqCst) + 1;
    let delay = token.ttl().mul_f64(inner.settings.refresh_ratio);
    let weak: Weak<ManagerInner> = Arc::downgrade(inner);
    let shutdown = inner.shutdown.clone();

    debug!("Scheduling session token refresh in {:?}", delay);
    tokio::spawn(async move {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        let Some(inner) = weak.upgrade() else {
            return;
        };
        if inner.refresh_generation.load(Ordering::SeqCst) != generation {
            return;
        }
        debug!("Proactively refreshing session token");
        if let Err(err) = coalesced_fetch(&inner).await {
            warn!("Proactive session token refresh failed: {}", err);
        }
    });
}

/// Extract a token from the issuer's response.
///
/// Accepts `csrf_token`, `csrfToken` or `token`, and an optional lifetime in
/// `expires_in` (seconds) or `ttl_ms`.
pub fn parse_token(response: &ApiResponse, default_ttl: Duration) -> Result<SessionToken> {
    let value = TOKEN_FIELDS
        .iter()
        .find_map(|field| response.body.get(*field).and_then(Value::as_str))
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            AllowanceError::validation("csrf_token", "token response did not contain a token")
        })?;

    let ttl = response
        .body
        .get("ttl_ms")
        .and_then(Value::as_u64)
        .map(Duration::from_millis)
        .or_else(|| {
            response
                .body
                .get("expires_in")
                .and_then(Value::as_u64)
                .map(Duration::from_secs)
        })
        .filter(|ttl| !ttl.is_zero())
        .unwrap_or(default_ttl);

    Ok(SessionToken::new(value, ttl))
}

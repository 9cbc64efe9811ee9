//! Anti-forgery session token and its cache.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// A short-lived anti-forgery token.
///
/// Valid only while `now - issued_at < ttl`.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionToken {
    value: String,
    issued_at: Instant,
    ttl: Duration,
}

impl SessionToken {
    /// Create a token issued now.
    pub fn new(value: impl Into<String>, ttl: Duration) -> Self {
        Self::issued_at(value, Instant::now(), ttl)
    }

    /// Create a token with an explicit issue time.
    pub fn issued_at(value: impl Into<String>, issued_at: Instant, ttl: Duration) -> Self {
        Self {
            value: value.into(),
            issued_at,
            ttl,
        }
    }

    /// The opaque token string.
    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn issued(&self) -> Instant {
        self.issued_at
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Instant at which the token stops being valid.
    pub fn expires_at(&self) -> Instant {
        self.issued_at + self.ttl
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Instant::now())
    }

    pub fn is_valid_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.issued_at) < self.ttl && now >= self.issued_at
    }

    /// Time left before expiry (zero once expired).
    pub fn remaining(&self) -> Duration {
        self.expires_at().saturating_duration_since(Instant::now())
    }
}

// The value is a credential and must never reach the logs.
impl std::fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionToken")
            .field("value", &"<redacted>")
            .field("ttl", &self.ttl)
            .field("remaining", &self.remaining())
            .finish()
    }
}

/// Holds the current token of one client instance.
///
/// Writes replace the whole token; readers never see a partial update.
#[derive(Debug, Default)]
pub struct TokenCache {
    slot: Mutex<Option<SessionToken>>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached token, valid or not.
    pub fn get(&self) -> Option<SessionToken> {
        self.lock().clone()
    }

    /// The cached token if it is still valid.
    pub fn valid(&self) -> Option<SessionToken> {
        self.lock().as_ref().filter(|t| t.is_valid()).cloned()
    }

    pub fn is_valid(&self) -> bool {
        self.lock().as_ref().is_some_and(SessionToken::is_valid)
    }

    pub fn set(&self, token: SessionToken) {
        *self.lock() = Some(token);
    }

    /// Drop the cached token. Idempotent.
    pub fn invalidate(&self) {
        *self.lock() = None;
    }

    /// Drop the cached token only if it has expired.
    pub fn clear_expired(&self) {
        let mut slot = self.lock();
        if slot.as_ref().is_some_and(|t| !t.is_valid()) {
            *slot = None;
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<SessionToken>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

//! Timestamped cache entries and a keyed TTL cache.

use mini_moka::sync::Cache;
use std::time::Duration;
use tokio::time::Instant;

/// A cached value with the time it was stored.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<T> {
    pub data: T,
    pub timestamp: Instant,
}

impl<T> CacheEntry<T> {
    pub fn new(data: T) -> Self {
        Self {
            data,
            timestamp: Instant::now(),
        }
    }

    pub fn age(&self) -> Duration {
        Instant::now().saturating_duration_since(self.timestamp)
    }

    pub fn is_valid(&self, ttl: Duration) -> bool {
        self.age() < ttl
    }
}

/// Keyed cache of [`CacheEntry`] values sharing one TTL.
///
/// Every write replaces the whole entry for its key.
pub struct TtlCache<V: Clone + Send + Sync + 'static> {
    entries: Cache<String, CacheEntry<V>>,
    ttl: Duration,
}

impl<V: Clone + Send + Sync + 'static> TtlCache<V> {
    pub fn new(ttl: Duration, capacity: u64) -> Self {
        Self {
            entries: Cache::builder()
                .time_to_live(ttl.max(Duration::from_millis(1)))
                .max_capacity(capacity)
                .build(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Fresh value for `key`, dropping it if it has gone stale.
    pub fn get(&self, key: &str) -> Option<V> {
        let key = key.to_string();
        let entry = self.entries.get(&key)?;
        if entry.is_valid(self.ttl) {
            Some(entry.data)
        } else {
            self.entries.invalidate(&key);
            None
        }
    }

    pub fn insert(&self, key: impl Into<String>, value: V) {
        self.entries.insert(key.into(), CacheEntry::new(value));
    }

    pub fn invalidate(&self, key: &str) {
        self.entries.invalidate(&key.to_string());
    }

    pub fn clear(&self) {
        self.entries.invalidate_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_entry_validity_window() {
        let entry = CacheEntry::new(5u32);
        assert!(entry.is_valid(Duration::from_secs(60)));

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(entry.is_valid(Duration::from_secs(60)));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(!entry.is_valid(Duration::from_secs(60)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_get_insert_expire() {
        let cache: TtlCache<String> = TtlCache::new(Duration::from_secs(60), 16);
        assert!(cache.get("ads").is_none());

        cache.insert("ads", "v1".to_string());
        assert_eq!(cache.get("ads").as_deref(), Some("v1"));

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(cache.get("ads").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_supersedes_previous_entry() {
        let cache: TtlCache<u32> = TtlCache::new(Duration::from_secs(60), 16);
        cache.insert("balance", 1);
        tokio::time::advance(Duration::from_secs(50)).await;
        cache.insert("balance", 2);
        tokio::time::advance(Duration::from_secs(30)).await;

        assert_eq!(cache.get("balance"), Some(2));
    }

    #[test]
    fn test_invalidate_and_clear() {
        let cache: TtlCache<u32> = TtlCache::new(Duration::from_secs(60), 16);
        cache.insert("a", 1);
        cache.insert("b", 2);

        cache.invalidate("a");
        assert!(cache.get("a").is_none());
        assert_eq!(cache.get("b"), Some(2));

        cache.clear();
        assert!(cache.get("b").is_none());
    }
}

//! In-memory TTL cache shared by every facade call of one client.
//!
//! Entries expire lazily: an expired entry is dropped by the `get` that
//! observes it, there is no background sweep. TTL is store-wide.
//!
//! Every invalidation advances an epoch. A reader that started before an
//! invalidation stores its result with [`CacheStore::set_if_unchanged`], so
//! a fetch that was in flight when a mutation committed cannot put
//! pre-mutation data back.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::trace;

/// Default time-to-live for cached reads.
pub const DEFAULT_TTL: Duration = Duration::from_secs(30);

/// A cached value and when it was stored.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub stored_at: Instant,
}

impl<V> CacheEntry<V> {
    fn is_fresh(&self, ttl: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.stored_at) < ttl
    }
}

/// Key -> (value, timestamp) map with TTL expiry and prefix invalidation.
#[derive(Debug)]
pub struct CacheStore<V = serde_json::Value> {
    entries: DashMap<String, CacheEntry<V>>,
    ttl: Duration,
    epoch: AtomicU64,
}

impl<V: Clone> CacheStore<V> {
    /// Create an empty store with the given TTL.
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            epoch: AtomicU64::new(0),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Get a fresh value, or `None` if absent or expired.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        // Read and expiry check under one shard lock.
        let removed = self
            .entries
            .remove_if(key, |_, entry| !entry.is_fresh(self.ttl, now));
        if removed.is_some() {
            trace!(key, "cache entry expired");
            return None;
        }
        self.entries.get(key).map(|entry| entry.value.clone())
    }

    /// Store a value, overwriting any previous entry and resetting its age.
    pub fn set(&self, key: impl Into<String>, value: V) {
        self.entries.insert(
            key.into(),
            CacheEntry {
                value,
                stored_at: Instant::now(),
            },
        );
    }

    /// Store a value only if nothing was invalidated since `epoch` was read.
    ///
    /// Returns whether the value was kept.
    pub fn set_if_unchanged(&self, key: impl Into<String>, value: V, epoch: u64) -> bool {
        if self.epoch() != epoch {
            return false;
        }
        let key = key.into();
        self.set(key.clone(), value);
        // An invalidation that bumped the epoch between the check and the
        // insert may already have swept this shard.
        if self.epoch() != epoch {
            self.entries.remove(&key);
            return false;
        }
        true
    }

    /// Current invalidation epoch.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Remove every key starting with `prefix`. An exact key is its own
    /// prefix, so this also covers single-key invalidation.
    ///
    /// Returns the number of entries removed.
    pub fn invalidate(&self, prefix: &str) -> usize {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let before = self.entries.len();
        self.entries.retain(|key, _| !key.starts_with(prefix));
        let removed = before.saturating_sub(self.entries.len());
        trace!(prefix, removed, "cache invalidated");
        removed
    }

    /// Remove exactly one key.
    pub fn remove(&self, key: &str) -> Option<V> {
        self.entries.remove(key).map(|(_, entry)| entry.value)
    }

    /// Drop everything.
    pub fn clear(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.entries.clear();
    }

    /// Number of stored entries, including expired ones not yet observed.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether a key is present without touching expiry.
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }
}

impl<V: Clone> Default for CacheStore<V> {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_get_within_ttl() {
        let cache = CacheStore::new(Duration::from_secs(10));
        cache.set("players_a:all", 1);

        tokio::time::advance(Duration::from_secs(9)).await;
        assert_eq!(cache.get("players_a:all"), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_is_evicted_on_read() {
        let cache = CacheStore::new(Duration::from_secs(10));
        cache.set("players_a:all", 1);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(cache.contains_key("players_a:all"));
        assert_eq!(cache.get("players_a:all"), None);
        assert!(!cache.contains_key("players_a:all"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_resets_timestamp() {
        let cache = CacheStore::new(Duration::from_secs(10));
        cache.set("k", 1);
        tokio::time::advance(Duration::from_secs(8)).await;
        cache.set("k", 2);
        tokio::time::advance(Duration::from_secs(8)).await;
        assert_eq!(cache.get("k"), Some(2));
    }

    #[test]
    fn test_get_missing() {
        let cache: CacheStore<i32> = CacheStore::default();
        assert_eq!(cache.get("nope"), None);
    }

    #[test]
    fn test_prefix_invalidation() {
        let cache = CacheStore::default();
        cache.set("players_teamA", "a");
        cache.set("players_teamB", "b");
        cache.set("teams_x", "x");

        assert_eq!(cache.invalidate("players"), 2);

        assert_eq!(cache.get("players_teamA"), None);
        assert_eq!(cache.get("players_teamB"), None);
        assert_eq!(cache.get("teams_x"), Some("x"));
    }

    #[test]
    fn test_invalidate_is_idempotent() {
        let cache = CacheStore::default();
        cache.set("players_a", 1);
        assert_eq!(cache.invalidate("players"), 1);
        assert_eq!(cache.invalidate("players"), 0);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_set_after_invalidation_is_dropped() {
        let cache = CacheStore::default();
        let epoch = cache.epoch();

        cache.invalidate("players_");
        assert!(!cache.set_if_unchanged("players_a:all", 1, epoch));
        assert!(!cache.contains_key("players_a:all"));

        assert!(cache.set_if_unchanged("players_a:all", 2, cache.epoch()));
        assert_eq!(cache.get("players_a:all"), Some(2));

        let epoch = cache.epoch();
        cache.clear();
        assert!(!cache.set_if_unchanged("teams_a:all", 3, epoch));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_clear() {
        let cache = CacheStore::default();
        cache.set("a", 1);
        cache.set("b", 2);
        cache.clear();
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_concurrent_sets() {
        use std::sync::Arc;
        use std::thread;

        let cache = Arc::new(CacheStore::default());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    for j in 0..50 {
                        cache.set(format!("players_{}_{}", i, j), j);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cache.len(), 400);
        assert_eq!(cache.invalidate("players_3_"), 50);
    }
}

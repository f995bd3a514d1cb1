//! In-memory TTL cache.
//!
//! Backs the provider clients' response caches and the dispatcher's
//! pending-add and recent-download markers. A read after an entry's
//! expiry behaves exactly like a miss. Expired entries are also swept every
//! [`SWEEP_INTERVAL`] inserts, so keys that are never read again do not
//! accumulate.

use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;

/// Number of inserts between two sweeps of expired entries.
pub const SWEEP_INTERVAL: usize = 256;

/// Entry in the cache.
struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

impl<V> CacheEntry<V> {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Thread-safe key/value cache with per-entry expiration.
pub struct TtlCache<K, V> {
    entries: DashMap<K, CacheEntry<V>>,
    default_ttl: Duration,
    inserts: AtomicUsize,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Create a cache whose plain inserts live for `default_ttl`.
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            default_ttl,
            inserts: AtomicUsize::new(0),
        }
    }

    /// Get a live value.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if entry.is_live(now) {
                return Some(entry.value.clone());
            }
        }
        // Stale or absent; make sure a stale entry does not linger.
        self.entries.remove_if(key, |_, e| !e.is_live(now));
        None
    }

    pub fn contains(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Insert with the default TTL, replacing any previous value.
    pub fn insert(&self, key: K, value: V) {
        self.insert_with_ttl(key, value, self.default_ttl);
    }

    /// Insert with an explicit TTL, replacing any previous value.
    pub fn insert_with_ttl(&self, key: K, value: V, ttl: Duration) {
        self.entries.insert(
            key,
            CacheEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        self.note_insert();
    }

    /// Insert only if no live entry exists. Returns `true` when inserted.
    ///
    /// The check and the insert happen under the same shard lock, so two
    /// concurrent callers can never both win.
    pub fn insert_if_absent(&self, key: K, value: V, ttl: Duration) -> bool {
        let now = Instant::now();
        let fresh = CacheEntry {
            value,
            expires_at: now + ttl,
        };
        let inserted = match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live(now) {
                    false
                } else {
                    occupied.insert(fresh);
                    true
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(fresh);
                true
            }
        };
        // The shard lock is released here; sweeping needs every shard.
        if inserted {
            self.note_insert();
        }
        inserted
    }

    /// Remove an entry, returning its value if it was still live.
    pub fn remove(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        self.entries
            .remove(key)
            .filter(|(_, e)| e.is_live(now))
            .map(|(_, e)| e.value)
    }

    /// Return the cached value or compute, store and return it.
    ///
    /// Errors are not cached. If the returned future is dropped before
    /// `fetch` completes nothing is stored.
    pub async fn get_or_try_insert_with<F, Fut, E>(&self, key: K, fetch: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.get(&key) {
            return Ok(value);
        }
        let value = fetch().await?;
        self.insert(key, value.clone());
        Ok(value)
    }

    /// Number of stored entries, including ones that have expired but were
    /// not yet cleaned up.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove expired entries.
    pub fn cleanup_expired(&self) {
        let now = Instant::now();
        self.entries.retain(|_, entry| entry.is_live(now));
    }

    fn note_insert(&self) {
        let count = self.inserts.fetch_add(1, Ordering::Relaxed) + 1;
        if count % SWEEP_INTERVAL == 0 {
            self.cleanup_expired();
        }
    }

    /// Clear all entries.
    pub fn clear(&self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn read_after_expiry_is_a_miss() {
        let cache = TtlCache::new(Duration::from_secs(5));
        cache.insert("a", 1);
        assert_eq!(cache.get(&"a"), Some(1));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(cache.get(&"a"), None);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn per_entry_ttl_overrides_default() {
        let cache = TtlCache::new(Duration::from_secs(60));
        cache.insert_with_ttl("short", 1, Duration::from_secs(1));
        cache.insert("long", 2);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.get(&"short"), None);
        assert_eq!(cache.get(&"long"), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn insert_if_absent_respects_live_entries() {
        let cache = TtlCache::new(Duration::from_secs(60));
        assert!(cache.insert_if_absent("k", 1, Duration::from_secs(10)));
        assert!(!cache.insert_if_absent("k", 2, Duration::from_secs(10)));
        assert_eq!(cache.get(&"k"), Some(1));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(cache.insert_if_absent("k", 3, Duration::from_secs(10)));
        assert_eq!(cache.get(&"k"), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn remove_returns_only_live_values() {
        let cache = TtlCache::new(Duration::from_secs(1));
        cache.insert("live", 1);
        assert_eq!(cache.remove(&"live"), Some(1));

        cache.insert("stale", 2);
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.remove(&"stale"), None);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn get_or_try_insert_with_caches_successes_only() {
        let cache: TtlCache<&str, u32> = TtlCache::new(Duration::from_secs(60));

        let err: Result<u32, &str> = cache.get_or_try_insert_with("k", || async { Err("boom") }).await;
        assert!(err.is_err());
        assert!(cache.is_empty());

        let v: Result<u32, &str> = cache.get_or_try_insert_with("k", || async { Ok(7) }).await;
        assert_eq!(v, Ok(7));

        // Second call must not run the fetch.
        let v: Result<u32, &str> = cache
            .get_or_try_insert_with("k", || async { Err("fetch should not run") })
            .await;
        assert_eq!(v, Ok(7));
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_expired_drops_stale_entries() {
        let cache = TtlCache::new(Duration::from_secs(1));
        cache.insert(1, "a");
        cache.insert_with_ttl(2, "b", Duration::from_secs(10));
        tokio::time::advance(Duration::from_secs(2)).await;

        cache.cleanup_expired();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&2), Some("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn inserts_sweep_expired_entries() {
        let cache = TtlCache::new(Duration::from_secs(1));
        for i in 0..1000 {
            cache.insert(i, ());
        }
        tokio::time::advance(Duration::from_secs(60)).await;

        for i in 1000..2000 {
            cache.insert(i, ());
        }
        // The sweep at insert 1024 dropped the whole first generation.
        assert_eq!(cache.len(), 1000);
        assert!(cache.get(&0).is_none());
        assert!(cache.get(&1999).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn insert_if_absent_also_sweeps() {
        let cache: TtlCache<usize, ()> = TtlCache::new(Duration::from_secs(1));
        for i in 0..SWEEP_INTERVAL - 1 {
            cache.insert(i, ());
        }
        tokio::time::advance(Duration::from_secs(2)).await;

        assert!(cache.insert_if_absent(usize::MAX, (), Duration::from_secs(60)));
        assert_eq!(cache.len(), 1);
    }
}

use crate::config::CacheConfig;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::mem;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Expiry used when `now + ttl` does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// A cached value with its expiry and access bookkeeping.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    /// The cached value
    pub value: V,
    /// When the entry stops being served
    pub expires_at: Instant,
    /// Hits served from this entry
    pub access_count: u64,
    /// Last hit, or insertion time before the first hit
    pub last_accessed_at: Instant,
    /// Tiebreak for entries touched at the same instant
    sequence: u64,
    size: usize,
}

impl<V> CacheEntry<V> {
    /// True once `now` reaches `expires_at`.
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Counters exposed by [`CacheStore::stats`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheStats {
    /// Lookups answered from the cache
    pub hits: u64,
    /// Lookups that found nothing or an expired entry
    pub misses: u64,
    /// Entries currently held, expired ones not yet purged included
    pub entries: usize,
    /// Approximate bytes held by keys and values
    pub memory_usage: usize,
    /// `hits / (hits + misses)`, 0 before the first lookup
    pub hit_rate: f64,
    /// Entries dropped to make room
    pub evictions: u64,
}

struct Inner<V> {
    entries: HashMap<String, CacheEntry<V>>,
    hits: u64,
    misses: u64,
    evictions: u64,
    sequence: u64,
}

impl<V> Inner<V> {
    fn next_sequence(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }

    fn evict_least_recently_used(&mut self) -> Option<String> {
        let key = self
            .entries
            .iter()
            .min_by_key(|(_, e)| (e.last_accessed_at, e.sequence))
            .map(|(k, _)| k.clone())?;
        self.entries.remove(&key);
        self.evictions += 1;
        Some(key)
    }
}

/// Bounded TTL cache with least-recently-used eviction.
///
/// Expired entries are dropped lazily on access and by [`purge_expired`],
/// which the sweeper runs periodically. Capacity is enforced before insert.
///
/// [`purge_expired`]: CacheStore::purge_expired
pub struct CacheStore<V> {
    config: CacheConfig,
    weigher: fn(&V) -> usize,
    inner: Mutex<Inner<V>>,
}

impl<V: Clone> CacheStore<V> {
    /// Creates an empty store. Values are weighed by `size_of::<V>()` until
    /// [`with_weigher`](CacheStore::with_weigher) replaces the estimate.
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            weigher: |_| mem::size_of::<V>(),
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                hits: 0,
                misses: 0,
                evictions: 0,
                sequence: 0,
            }),
        }
    }

    /// Sets the per-value size estimate used for `memory_usage`.
    pub fn with_weigher(mut self, weigher: fn(&V) -> usize) -> Self {
        self.weigher = weigher;
        self
    }

    /// Configuration the store was built with.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Returns the value if present and not expired.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let expired = match inner.entries.get(key) {
            None => {
                inner.misses += 1;
                return None;
            }
            Some(entry) => entry.is_expired(now),
        };
        if expired {
            inner.entries.remove(key);
            inner.misses += 1;
            return None;
        }

        let sequence = inner.next_sequence();
        inner.hits += 1;
        let entry = inner.entries.get_mut(key)?;
        entry.access_count += 1;
        entry.last_accessed_at = now;
        entry.sequence = sequence;
        Some(entry.value.clone())
    }

    /// Stores `value`; `ttl` defaults to the configured TTL.
    ///
    /// A TTL too large to represent keeps the entry for decades instead.
    pub fn set(&self, key: impl Into<String>, value: V, ttl: Option<Duration>) {
        let key = key.into();
        let now = Instant::now();
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        let size = key.len() + (self.weigher)(&value) + mem::size_of::<CacheEntry<V>>();

        let mut inner = self.inner.lock();
        if !inner.entries.contains_key(&key) {
            while inner.entries.len() >= self.config.max_size.max(1) {
                match inner.evict_least_recently_used() {
                    Some(evicted) => tracing::debug!(key = %evicted, "Evicted cache entry"),
                    None => break,
                }
            }
        }

        let sequence = inner.next_sequence();
        inner.entries.insert(
            key,
            CacheEntry {
                value,
                expires_at: expiry(now, ttl),
                access_count: 0,
                last_accessed_at: now,
                sequence,
                size,
            },
        );
    }

    /// True if `key` is present and not expired. Does not touch the hit/miss counters.
    pub fn has(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        match inner.entries.get(key).map(|e| e.is_expired(now)) {
            Some(false) => true,
            Some(true) => {
                inner.entries.remove(key);
                false
            }
            None => false,
        }
    }

    /// Removes `key`. Returns whether it was present.
    pub fn delete(&self, key: &str) -> bool {
        self.inner.lock().entries.remove(key).is_some()
    }

    /// Drops all entries and resets the counters.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.hits = 0;
        inner.misses = 0;
        inner.evictions = 0;
    }

    /// Removes every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        inner.entries.retain(|_, e| !e.is_expired(now));
        let removed = before - inner.entries.len();
        drop(inner);
        if removed > 0 {
            tracing::debug!(removed = removed, "Purged expired cache entries");
        }
        removed
    }

    /// Returns the cached value or computes, stores and returns a new one.
    ///
    /// The lock is not held while `compute` runs; concurrent misses may
    /// compute the same key more than once.
    pub async fn get_or_try_insert_with<F, Fut, E>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        compute: F,
    ) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.get(key) {
            return Ok(value);
        }
        let value = compute().await?;
        self.set(key, value.clone(), ttl);
        Ok(value)
    }

    /// Number of entries held, expired ones not yet purged included.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// True when the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of one entry's bookkeeping.
    pub fn entry(&self, key: &str) -> Option<CacheEntry<V>> {
        self.inner.lock().entries.get(key).cloned()
    }

    /// Current counters and hit rate.
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        let lookups = inner.hits + inner.misses;
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            entries: inner.entries.len(),
            memory_usage: inner.entries.values().map(|e| e.size).sum(),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                inner.hits as f64 / lookups as f64
            },
            evictions: inner.evictions,
        }
    }
}

fn expiry(now: Instant, ttl: Duration) -> Instant {
    now.checked_add(ttl)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

impl<V: Clone + Send + 'static> CacheStore<V> {
    /// Spawns the periodic expiry sweep.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let store = Arc::clone(self);
        let period = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                interval.tick().await;
                store.purge_expired();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn store(max_size: usize) -> CacheStore<String> {
        CacheStore::new(CacheConfig {
            max_size,
            default_ttl: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(300),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_then_get() {
        let cache = store(10);
        cache.set("k", "v".to_string(), None);

        assert_eq!(cache.get("k").as_deref(), Some("v"));
        let entry = cache.entry("k").unwrap();
        assert_eq!(entry.access_count, 1);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.entries, 1);
        assert!(stats.memory_usage > 0);
        assert_eq!(stats.hit_rate, 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_is_a_miss() {
        let cache = store(10);
        cache.set("k", "v".to_string(), Some(Duration::from_secs(1)));

        tokio::time::sleep(Duration::from_millis(1_100)).await;

        assert_eq!(cache.get("k"), None);
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_has_does_not_count() {
        let cache = store(10);
        cache.set("k", "v".to_string(), Some(Duration::from_secs(1)));
        assert!(cache.has("k"));
        assert!(!cache.has("other"));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!cache.has("k"));

        let stats = cache.stats();
        assert_eq!(stats.hits + stats.misses, 0);
        assert_eq!(stats.hit_rate, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evicts_least_recently_accessed() {
        let cache = store(2);
        cache.set("a", "1".to_string(), None);
        tokio::time::advance(Duration::from_millis(10)).await;
        cache.set("b", "2".to_string(), None);
        tokio::time::advance(Duration::from_millis(10)).await;
        cache.get("a");

        cache.set("c", "3".to_string(), None);

        assert_eq!(cache.len(), 2);
        assert!(cache.has("a"));
        assert!(!cache.has("b"));
        assert!(cache.has("c"));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overwrite_at_capacity_does_not_evict() {
        let cache = store(2);
        cache.set("a", "1".to_string(), None);
        cache.set("b", "2".to_string(), None);
        cache.set("a", "updated".to_string(), None);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a").as_deref(), Some("updated"));
        assert!(cache.has("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let cache = store(10);
        cache.set("short", "1".to_string(), Some(Duration::from_secs(1)));
        cache.set("long", "2".to_string(), Some(Duration::from_secs(100)));

        tokio::time::advance(Duration::from_secs(5)).await;

        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.delete("long"));
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_purges_in_background() {
        let cache = Arc::new(CacheStore::new(CacheConfig {
            max_size: 10,
            default_ttl: Duration::from_secs(1),
            sweep_interval: Duration::from_secs(30),
        }));
        cache.set("k", 1u32, None);

        let handle = cache.spawn_sweeper();
        tokio::time::sleep(Duration::from_secs(31)).await;

        assert_eq!(cache.len(), 0);
        handle.abort();
    }

    #[tokio::test]
    async fn test_get_or_try_insert_with() {
        let cache = store(10);
        let first: Result<String, String> = cache
            .get_or_try_insert_with("k", None, || async { Ok("computed".to_string()) })
            .await;
        assert_eq!(first.unwrap(), "computed");

        let second: Result<String, String> = cache
            .get_or_try_insert_with("k", None, || async { Err("should not run".to_string()) })
            .await;
        assert_eq!(second.unwrap(), "computed");

        let failed: Result<String, String> = cache
            .get_or_try_insert_with("other", None, || async { Err("boom".to_string()) })
            .await;
        assert!(failed.is_err());
        assert!(!cache.has("other"));
    }

    #[test]
    fn test_clear_resets_counters() {
        let cache = store(10);
        cache.set("k", "v".to_string(), None);
        cache.get("k");
        cache.get("missing");
        cache.clear();

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.entries), (0, 0, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrepresentable_ttl_does_not_expire() {
        let cache = store(10);
        cache.set("forever", "v".to_string(), Some(Duration::MAX));

        tokio::time::advance(Duration::from_secs(86_400 * 365)).await;

        assert_eq!(cache.get("forever").as_deref(), Some("v"));
        let entry = cache.entry("forever").unwrap();
        assert!(entry.expires_at > Instant::now());
    }

    #[test]
    fn test_weigher_feeds_memory_usage() {
        let cache = store(10).with_weigher(|v: &String| v.len());
        cache.set("k", "x".repeat(1_000), None);
        assert!(cache.stats().memory_usage >= 1_000);
    }
}

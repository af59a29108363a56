//! Bounded in-memory cache with LRU eviction and per-entry TTL.
//!
//! One canonical cache abstraction for analyzer responses and any future
//! memoization. The store is sharded: each shard guards its own map with a
//! `parking_lot::Mutex`, so a lookup never serializes behind an unrelated
//! write on another shard. Metrics counters are atomics and may be read
//! concurrently without taking any shard lock.
//!
//! Freshness contract: a hit younger than the TTL is indistinguishable from
//! a recomputed value; a stale entry is treated as a miss and evicted lazily.

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

/// 128-bit content-derived cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(u128);

impl CacheKey {
    /// Key for analyzer content plus optional context.
    ///
    /// Content is normalized (whitespace runs collapsed, ends trimmed)
    /// before hashing so semantically identical inputs share an entry.
    pub fn for_content(content: &str, context: Option<&str>) -> Self {
        let mut hasher = Sha256::new();
        hash_normalized(&mut hasher, content);
        if let Some(context) = context {
            hasher.update([0u8]);
            hash_normalized(&mut hasher, context);
        }
        let digest = hasher.finalize();
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest[..16]);
        Self(u128::from_be_bytes(bytes))
    }

    pub fn from_raw(raw: u128) -> Self {
        Self(raw)
    }
}

fn hash_normalized(hasher: &mut Sha256, text: &str) {
    let mut pending_space = false;
    for word in text.split_whitespace() {
        if pending_space {
            hasher.update(b" ");
        }
        hasher.update(word.as_bytes());
        pending_space = true;
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of entries across all shards
    pub max_size: usize,
    /// Per-entry time to live
    pub ttl: Duration,
    /// Shard count; rounded up to at least 1
    pub shards: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            ttl: Duration::from_secs(3600),
            shards: 16,
        }
    }
}

/// Point-in-time counter snapshot for the metrics surface.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheMetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expired: u64,
    pub size: usize,
    pub hit_rate: f64,
}

struct Entry<V> {
    value: V,
    created_at: Instant,
    /// Recency tick; higher means more recently used
    tick: u64,
}

struct Shard<V> {
    map: HashMap<u128, Entry<V>>,
    /// Recency index: tick -> key, lowest tick is the LRU entry
    order: BTreeMap<u64, u128>,
}

impl<V> Shard<V> {
    fn new() -> Self {
        Self {
            map: HashMap::new(),
            order: BTreeMap::new(),
        }
    }

    fn remove(&mut self, key: u128) -> Option<Entry<V>> {
        let entry = self.map.remove(&key)?;
        self.order.remove(&entry.tick);
        Some(entry)
    }

    fn touch(&mut self, key: u128, new_tick: u64) {
        if let Some(entry) = self.map.get_mut(&key) {
            self.order.remove(&entry.tick);
            entry.tick = new_tick;
            self.order.insert(new_tick, key);
        }
    }

    fn pop_lru(&mut self) -> Option<u128> {
        let (&tick, &key) = self.order.iter().next()?;
        self.order.remove(&tick);
        self.map.remove(&key);
        Some(key)
    }
}

/// Sharded LRU + TTL cache.
pub struct LruTtlCache<V> {
    shards: Vec<Mutex<Shard<V>>>,
    shard_capacity: usize,
    ttl: Duration,
    clock: AtomicU64,
    size: AtomicUsize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expired: AtomicU64,
}

impl<V: Clone> LruTtlCache<V> {
    pub fn new(config: CacheConfig) -> Self {
        let shard_count = config.shards.max(1);
        let shard_capacity = config.max_size.div_ceil(shard_count).max(1);
        Self {
            shards: (0..shard_count).map(|_| Mutex::new(Shard::new())).collect(),
            shard_capacity,
            ttl: config.ttl,
            clock: AtomicU64::new(0),
            size: AtomicUsize::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expired: AtomicU64::new(0),
        }
    }

    fn shard_for(&self, key: CacheKey) -> &Mutex<Shard<V>> {
        let index = (key.0 % self.shards.len() as u128) as usize;
        &self.shards[index]
    }

    fn next_tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Look up a fresh entry. A TTL-stale entry counts as a miss and is
    /// evicted in place.
    pub fn get(&self, key: CacheKey) -> Option<V> {
        let mut shard = self.shard_for(key).lock();

        let fresh = match shard.map.get(&key.0) {
            Some(entry) => entry.created_at.elapsed() < self.ttl,
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        if !fresh {
            shard.remove(key.0);
            drop(shard);
            self.size.fetch_sub(1, Ordering::Relaxed);
            self.expired.fetch_add(1, Ordering::Relaxed);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let tick = self.next_tick();
        shard.touch(key.0, tick);
        let value = shard.map.get(&key.0).map(|entry| entry.value.clone());
        self.hits.fetch_add(1, Ordering::Relaxed);
        value
    }

    /// Insert or replace. Evicts the shard's LRU entry on overflow.
    pub fn put(&self, key: CacheKey, value: V) {
        let tick = self.next_tick();
        let mut shard = self.shard_for(key).lock();

        if shard.remove(key.0).is_some() {
            self.size.fetch_sub(1, Ordering::Relaxed);
        }

        shard.map.insert(
            key.0,
            Entry {
                value,
                created_at: Instant::now(),
                tick,
            },
        );
        shard.order.insert(tick, key.0);
        self.size.fetch_add(1, Ordering::Relaxed);

        if shard.map.len() > self.shard_capacity {
            if shard.pop_lru().is_some() {
                self.size.fetch_sub(1, Ordering::Relaxed);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                debug!("cache shard full, evicted LRU entry");
            }
        }
    }

    pub fn invalidate(&self, key: CacheKey) {
        let mut shard = self.shard_for(key).lock();
        if shard.remove(key.0).is_some() {
            self.size.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Bulk insert for startup warming.
    pub fn warm<I: IntoIterator<Item = (CacheKey, V)>>(&self, entries: I) {
        for (key, value) in entries {
            self.put(key, value);
        }
    }

    pub fn len(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn metrics(&self) -> CacheMetricsSnapshot {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheMetricsSnapshot {
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            size: self.len(),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(max_size: usize, ttl_ms: u64) -> LruTtlCache<String> {
        LruTtlCache::new(CacheConfig {
            max_size,
            ttl: Duration::from_millis(ttl_ms),
            // Single shard so capacity behavior is exact in tests
            shards: 1,
        })
    }

    #[test]
    fn test_get_put_roundtrip() {
        let cache = cache(10, 60_000);
        let key = CacheKey::for_content("fn main() {}", None);

        assert!(cache.get(key).is_none());
        cache.put(key, "analysis".to_string());
        assert_eq!(cache.get(key).as_deref(), Some("analysis"));
    }

    #[test]
    fn test_key_normalization_collapses_whitespace() {
        let a = CacheKey::for_content("fn  main()   {}", None);
        let b = CacheKey::for_content("  fn main() {} ", None);
        let c = CacheKey::for_content("fn main() {}", Some("ctx"));

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_context_separator_is_unambiguous() {
        let joined = CacheKey::for_content("alpha beta", None);
        let split = CacheKey::for_content("alpha", Some("beta"));
        assert_ne!(joined, split);
    }

    #[test]
    fn test_ttl_expiry_is_a_miss() {
        let cache = cache(10, 20);
        let key = CacheKey::for_content("short lived", None);

        cache.put(key, "value".to_string());
        assert!(cache.get(key).is_some());

        std::thread::sleep(Duration::from_millis(40));
        assert!(cache.get(key).is_none());

        let metrics = cache.metrics();
        assert_eq!(metrics.expired, 1);
        assert_eq!(metrics.size, 0);
    }

    #[test]
    fn test_lru_eviction_order() {
        let cache = cache(3, 60_000);
        let keys: Vec<CacheKey> = (0..4)
            .map(|i| CacheKey::for_content(&format!("content {i}"), None))
            .collect();

        for key in &keys[..3] {
            cache.put(*key, "v".to_string());
        }
        // Touch key 0 so key 1 becomes the LRU entry
        assert!(cache.get(keys[0]).is_some());

        cache.put(keys[3], "v".to_string());

        assert!(cache.get(keys[0]).is_some());
        assert!(cache.get(keys[1]).is_none());
        assert!(cache.get(keys[2]).is_some());
        assert!(cache.get(keys[3]).is_some());
        assert_eq!(cache.metrics().evictions, 1);
    }

    #[test]
    fn test_replace_does_not_grow_size() {
        let cache = cache(10, 60_000);
        let key = CacheKey::for_content("same", None);

        cache.put(key, "one".to_string());
        cache.put(key, "two".to_string());

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(key).as_deref(), Some("two"));
    }

    #[test]
    fn test_invalidate_removes_entry() {
        let cache = cache(10, 60_000);
        let key = CacheKey::for_content("gone soon", None);

        cache.put(key, "v".to_string());
        cache.invalidate(key);

        assert!(cache.get(key).is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_metrics_hit_rate() {
        let cache = cache(10, 60_000);
        let key = CacheKey::for_content("metered", None);

        cache.put(key, "v".to_string());
        assert!(cache.get(key).is_some());
        assert!(cache
            .get(CacheKey::for_content("absent", None))
            .is_none());

        let metrics = cache.metrics();
        assert_eq!(metrics.hits, 1);
        assert_eq!(metrics.misses, 1);
        assert!((metrics.hit_rate - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_warm_populates() {
        let cache = cache(10, 60_000);
        let entries: Vec<(CacheKey, String)> = (0..5)
            .map(|i| {
                (
                    CacheKey::for_content(&format!("warm {i}"), None),
                    format!("v{i}"),
                )
            })
            .collect();

        cache.warm(entries.clone());
        assert_eq!(cache.len(), 5);
        for (key, value) in entries {
            assert_eq!(cache.get(key), Some(value));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_readers_and_writers() {
        let cache = std::sync::Arc::new(LruTtlCache::new(CacheConfig {
            max_size: 256,
            ttl: Duration::from_secs(60),
            shards: 16,
        }));

        let mut tasks = Vec::new();
        for worker in 0..8 {
            let cache = cache.clone();
            tasks.push(tokio::spawn(async move {
                for i in 0..200 {
                    let key = CacheKey::for_content(&format!("k{}", i % 64), None);
                    if worker % 2 == 0 {
                        cache.put(key, format!("w{worker}-{i}"));
                    } else {
                        let _ = cache.get(key);
                    }
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert!(cache.len() <= 256);
    }
}

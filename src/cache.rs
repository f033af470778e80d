//! Bounded TTL + LRU cache with single-flight coalescing.
//!
//! Keys are opaque fingerprints; values are opaque to the cache. The store
//! is sharded so concurrent lookups on different keys never contend on one
//! lock, and concurrent misses on the same key share a single computation.
//!
//! TTL is checked lazily on read. Eviction is LRU by last hit time: when a
//! shard is full, a batch of its least-recently-hit entries is dropped
//! before the insert, which keeps memory hard-capped at the configured
//! capacity.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::broadcast;

const SHARD_COUNT: usize = 16;
/// One fifth of a full shard is evicted per batch.
const EVICTION_DIVISOR: usize = 5;

/// Error shared among all waiters of a failed computation.
#[derive(Debug, Clone)]
pub struct ComputeError(Arc<anyhow::Error>);

impl ComputeError {
    fn new(err: anyhow::Error) -> Self {
        Self(Arc::new(err))
    }

    fn cancelled() -> Self {
        Self(Arc::new(anyhow::anyhow!("in-flight computation was dropped")))
    }
}

impl fmt::Display for ComputeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#}", self.0)
    }
}

impl std::error::Error for ComputeError {}

/// How a `get_or_compute` call was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    /// Served from a live entry.
    Hit,
    /// Waited on another caller's in-flight computation.
    Coalesced,
    /// Ran the computation itself.
    Computed,
}

/// Failure-caching policy for `get_or_compute_with`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComputeOptions {
    /// Store failed computations so repeat misses fail fast.
    pub cache_errors: bool,
    /// TTL for stored failures.
    pub error_ttl: Duration,
}

impl Default for ComputeOptions {
    fn default() -> Self {
        Self {
            cache_errors: false,
            error_ttl: Duration::from_secs(2),
        }
    }
}

#[derive(Clone)]
enum Stored<V> {
    Value(V),
    Error(ComputeError),
}

struct CacheEntry<V> {
    value: Stored<V>,
    expires_at: Instant,
    last_hit_at: Instant,
}

struct Shard<V: Clone> {
    entries: HashMap<String, CacheEntry<V>>,
    in_flight: HashMap<String, broadcast::Sender<Result<V, ComputeError>>>,
}

impl<V: Clone> Shard<V> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            in_flight: HashMap::new(),
        }
    }
}

/// Aggregate counters for observability.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub computed: u64,
    pub coalesced: u64,
    pub hit_rate: f64,
}

/// Sharded TTL + LRU cache with single-flight coalescing.
pub struct VerificationCache<V: Clone + Send + 'static> {
    shards: Vec<Mutex<Shard<V>>>,
    shard_capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    computed: AtomicU64,
    coalesced: AtomicU64,
}

impl<V: Clone + Send + 'static> VerificationCache<V> {
    pub fn new(capacity: usize) -> Self {
        Self::with_shards(capacity, SHARD_COUNT)
    }

    /// Construct with an explicit shard count; tests use a single shard to
    /// make eviction order observable.
    pub fn with_shards(capacity: usize, shards: usize) -> Self {
        let shards = shards.clamp(1, capacity.max(1));
        let shard_capacity = (capacity / shards).max(1);
        Self {
            shards: (0..shards).map(|_| Mutex::new(Shard::new())).collect(),
            shard_capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            computed: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
        }
    }

    fn shard_index(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.shards.len()
    }

    /// Look up a live entry, refreshing its recency.
    pub fn get(&self, key: &str) -> Option<V> {
        self.get_at(key, Instant::now())
    }

    /// Look up with an explicit "now" for deterministic tests.
    pub fn get_at(&self, key: &str, now: Instant) -> Option<V> {
        let mut shard = self.shards[self.shard_index(key)].lock();
        match shard.entries.get_mut(key) {
            Some(entry) if now < entry.expires_at => {
                entry.last_hit_at = now;
                match &entry.value {
                    Stored::Value(v) => {
                        self.hits.fetch_add(1, Ordering::Relaxed);
                        Some(v.clone())
                    }
                    // Cached failures suppress recompute but are not
                    // surfaced as values.
                    Stored::Error(_) => {
                        self.misses.fetch_add(1, Ordering::Relaxed);
                        None
                    }
                }
            }
            Some(_) => {
                shard.entries.remove(key);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert or replace, evicting least-recently-hit entries if the shard
    /// is full.
    pub fn put(&self, key: &str, value: V, ttl: Duration) {
        self.put_at(key, value, ttl, Instant::now());
    }

    /// Insert with an explicit "now" for deterministic tests.
    pub fn put_at(&self, key: &str, value: V, ttl: Duration, now: Instant) {
        let mut shard = self.shards[self.shard_index(key)].lock();
        self.insert_locked(&mut shard, key, Stored::Value(value), ttl, now);
    }

    fn insert_locked(
        &self,
        shard: &mut Shard<V>,
        key: &str,
        value: Stored<V>,
        ttl: Duration,
        now: Instant,
    ) {
        shard.entries.retain(|_, e| now < e.expires_at);

        if !shard.entries.contains_key(key) && shard.entries.len() >= self.shard_capacity {
            let batch = self.shard_capacity.div_ceil(EVICTION_DIVISOR);
            let mut by_recency: Vec<(String, Instant)> = shard
                .entries
                .iter()
                .map(|(k, e)| (k.clone(), e.last_hit_at))
                .collect();
            by_recency.sort_by_key(|(_, hit)| *hit);
            for (stale_key, _) in by_recency.into_iter().take(batch) {
                shard.entries.remove(&stale_key);
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }

        shard.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: now + ttl,
                last_hit_at: now,
            },
        );
    }

    /// Return a live value, or run `compute` exactly once across all
    /// concurrent callers for this key.
    ///
    /// Failures are shared with every waiter and are not cached.
    pub async fn get_or_compute<F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        compute: F,
    ) -> (Result<V, ComputeError>, CacheOutcome)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<V>>,
    {
        self.get_or_compute_with(key, ttl, ComputeOptions::default(), compute)
            .await
    }

    /// `get_or_compute` with an explicit failure-caching policy.
    pub async fn get_or_compute_with<F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        opts: ComputeOptions,
        compute: F,
    ) -> (Result<V, ComputeError>, CacheOutcome)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<V>>,
    {
        let shard_index = self.shard_index(key);

        let waiter = {
            let mut shard = self.shards[shard_index].lock();
            let now = Instant::now();

            if let Some(entry) = shard.entries.get_mut(key) {
                if now < entry.expires_at {
                    entry.last_hit_at = now;
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    let result = match &entry.value {
                        Stored::Value(v) => Ok(v.clone()),
                        Stored::Error(e) => Err(e.clone()),
                    };
                    return (result, CacheOutcome::Hit);
                }
                shard.entries.remove(key);
            }
            self.misses.fetch_add(1, Ordering::Relaxed);

            match shard.in_flight.get(key) {
                Some(tx) => Some(tx.subscribe()),
                None => {
                    let (tx, _) = broadcast::channel(1);
                    shard.in_flight.insert(key.to_string(), tx);
                    None
                }
            }
        };

        if let Some(mut rx) = waiter {
            self.coalesced.fetch_add(1, Ordering::Relaxed);
            let result = match rx.recv().await {
                Ok(result) => result,
                Err(_) => Err(ComputeError::cancelled()),
            };
            return (result, CacheOutcome::Coalesced);
        }

        // This caller owns the computation. The guard unregisters the
        // in-flight sender if the future is dropped mid-compute, which
        // wakes every waiter with a cancellation error instead of hanging
        // them.
        let mut guard = InFlightGuard {
            cache: self,
            shard_index,
            key: key.to_string(),
            armed: true,
        };

        let result = compute().await.map_err(ComputeError::new);

        {
            let mut shard = self.shards[shard_index].lock();
            let tx = shard.in_flight.remove(key);
            guard.armed = false;
            let now = Instant::now();
            match &result {
                Ok(value) => {
                    self.insert_locked(&mut shard, key, Stored::Value(value.clone()), ttl, now)
                }
                Err(err) if opts.cache_errors => {
                    self.insert_locked(&mut shard, key, Stored::Error(err.clone()), opts.error_ttl, now)
                }
                Err(_) => {}
            }
            if let Some(tx) = tx {
                let _ = tx.send(result.clone());
            }
        }

        self.computed.fetch_add(1, Ordering::Relaxed);
        (result, CacheOutcome::Computed)
    }

    pub fn invalidate(&self, key: &str) {
        let mut shard = self.shards[self.shard_index(key)].lock();
        shard.entries.remove(key);
    }

    pub fn flush(&self) {
        for shard in &self.shards {
            shard.lock().entries.clear();
        }
    }

    pub fn stats(&self) -> CacheStats {
        let size = self.shards.iter().map(|s| s.lock().entries.len()).sum();
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStats {
            size,
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            computed: self.computed.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            hit_rate: if lookups > 0 {
                hits as f64 / lookups as f64
            } else {
                0.0
            },
        }
    }
}

struct InFlightGuard<'a, V: Clone + Send + 'static> {
    cache: &'a VerificationCache<V>,
    shard_index: usize,
    key: String,
    armed: bool,
}

impl<V: Clone + Send + 'static> Drop for InFlightGuard<'_, V> {
    fn drop(&mut self) {
        if self.armed {
            let mut shard = self.cache.shards[self.shard_index].lock();
            shard.in_flight.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_put_get_roundtrip_within_ttl() {
        let cache: VerificationCache<String> = VerificationCache::new(16);
        let t0 = Instant::now();
        cache.put_at("k", "v".to_string(), Duration::from_secs(1), t0);

        assert_eq!(
            cache.get_at("k", t0 + Duration::from_millis(500)),
            Some("v".to_string())
        );
        assert_eq!(cache.get_at("k", t0 + Duration::from_millis(1_001)), None);
        // Expired entry was dropped, not just hidden.
        assert_eq!(cache.stats().size, 0);
    }

    #[test]
    fn test_lru_eviction_batch() {
        let cache: VerificationCache<u32> = VerificationCache::with_shards(5, 1);
        let t0 = Instant::now();
        for i in 0..5u32 {
            cache.put_at(&format!("k{i}"), i, Duration::from_secs(60), t0);
        }
        // Touch everything except k0 so k0 is least recently hit.
        for i in 1..5u32 {
            cache.get_at(&format!("k{i}"), t0 + Duration::from_millis(i as u64));
        }

        cache.put_at("k5", 5, Duration::from_secs(60), t0 + Duration::from_millis(10));

        let stats = cache.stats();
        assert!(stats.size <= 5);
        assert_eq!(stats.evictions, 1);
        assert_eq!(cache.get_at("k0", t0 + Duration::from_millis(20)), None);
        assert_eq!(cache.get_at("k5", t0 + Duration::from_millis(20)), Some(5));
    }

    #[test]
    fn test_invalidate_and_flush() {
        let cache: VerificationCache<u32> = VerificationCache::new(16);
        cache.put("a", 1, Duration::from_secs(60));
        cache.put("b", 2, Duration::from_secs(60));

        cache.invalidate("a");
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("b"), Some(2));

        cache.flush();
        assert_eq!(cache.stats().size, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_single_flight_runs_compute_once() {
        let cache: Arc<VerificationCache<u32>> = Arc::new(VerificationCache::new(64));
        let runs = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..100 {
            let cache = cache.clone();
            let runs = runs.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute("shared", Duration::from_secs(60), || async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(42u32)
                    })
                    .await
            }));
        }

        let mut computed = 0;
        for handle in handles {
            let (result, outcome) = handle.await.unwrap();
            assert_eq!(result.unwrap(), 42);
            if outcome == CacheOutcome::Computed {
                computed += 1;
            }
        }

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(computed, 1);
    }

    #[tokio::test]
    async fn test_compute_failure_not_cached_by_default() {
        let cache: VerificationCache<u32> = VerificationCache::new(16);
        let runs = AtomicU32::new(0);

        for _ in 0..2 {
            let (result, _) = cache
                .get_or_compute("k", Duration::from_secs(60), || async {
                    runs.fetch_add(1, Ordering::SeqCst);
                    anyhow::bail!("upstream unavailable")
                })
                .await;
            assert!(result.is_err());
        }
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_negative_caching_when_requested() {
        let cache: VerificationCache<u32> = VerificationCache::new(16);
        let opts = ComputeOptions {
            cache_errors: true,
            error_ttl: Duration::from_secs(2),
        };
        let runs = AtomicU32::new(0);

        for _ in 0..3 {
            let (result, _) = cache
                .get_or_compute_with("k", Duration::from_secs(60), opts, || async {
                    runs.fetch_add(1, Ordering::SeqCst);
                    anyhow::bail!("upstream unavailable")
                })
                .await;
            assert!(result.is_err());
        }
        // Later calls hit the cached failure.
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_second_call_hits_after_compute() {
        let cache: VerificationCache<u32> = VerificationCache::new(16);

        let (first, outcome) = cache
            .get_or_compute("k", Duration::from_secs(60), || async { Ok(7u32) })
            .await;
        assert_eq!(first.unwrap(), 7);
        assert_eq!(outcome, CacheOutcome::Computed);

        let (second, outcome) = cache
            .get_or_compute("k", Duration::from_secs(60), || async {
                anyhow::bail!("must not run")
            })
            .await;
        assert_eq!(second.unwrap(), 7);
        assert_eq!(outcome, CacheOutcome::Hit);
    }
}

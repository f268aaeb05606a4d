//! # Metacache — bounded metadata-index cache
//!
//! Caches a `(file, device, measurement)` key's full chunk-metadata list
//! (the leaf-measurement entry's chunk run, in full — a series can span more
//! than one chunk within a file) so repeated queries against a hot series
//! don't re-read and re-parse the index tree from disk every time.
//!
//! Modeled on a TTL-first, LRU-fallback document cache, but simplified: chunk
//! metadata has no TTL (a sealed file's metadata never changes, and an
//! unsealed file's is never cached — see [`MetadataCache::get_or_insert_with`]),
//! so eviction is driven purely by a byte budget. Entry count under that
//! budget is re-derived from a running average entry size, resampled
//! periodically rather than on every insert (recomputing an LRU's capacity is
//! not free, and an average of the last ten samples is already stable enough
//! for a capacity knob).
//!
//! A shared bloom filter over cached keys lets a lookup that is almost
//! certainly a miss skip the lock entirely; this path is bypassed when the
//! cache is configured with `bloom_enabled: false`.

use bloom::BloomFilter;
use lru::LruCache;
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

/// How many of the most recent entry sizes are averaged to estimate capacity.
const SIZE_SAMPLE_WINDOW: usize = 10;

/// How many inserts elapse between capacity resamples.
const RESAMPLE_INTERVAL: u64 = 100_000;

/// Identifies one cached chunk-metadata entry: a file, a device, and a
/// measurement within it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub file_path: PathBuf,
    pub device: String,
    pub measurement: String,
}

impl CacheKey {
    pub fn new(file_path: impl Into<PathBuf>, device: impl Into<String>, measurement: impl Into<String>) -> Self {
        Self {
            file_path: file_path.into(),
            device: device.into(),
            measurement: measurement.into(),
        }
    }

    fn bloom_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(
            self.file_path.as_os_str().len() + self.device.len() + self.measurement.len() + 2,
        );
        buf.extend_from_slice(self.file_path.as_os_str().as_encoded_bytes());
        buf.push(0);
        buf.extend_from_slice(self.device.as_bytes());
        buf.push(b'.');
        buf.extend_from_slice(self.measurement.as_bytes());
        buf
    }
}

/// One chunk's index entry, as stored in a file's metadata-index tree leaf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkMetadata {
    pub offset: u64,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub start_time: i64,
    pub end_time: i64,
    pub point_count: u64,
    pub data_type: u8,
}

/// Approximate in-memory footprint of a cached chunk-metadata list, used for
/// the running average entry size that drives byte-budget eviction.
fn approx_size(metas: &[ChunkMetadata]) -> usize {
    metas.len() * std::mem::size_of::<ChunkMetadata>()
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Total byte budget for cached entries. Entry capacity is
    /// `budget_bytes / average_entry_size`.
    pub budget_bytes: usize,
    /// Whether a bloom filter short-circuits definite-miss lookups.
    pub bloom_enabled: bool,
    /// Expected distinct keys, used to size the bloom filter.
    pub expected_keys: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            budget_bytes: 32 * 1024 * 1024,
            bloom_enabled: true,
            expected_keys: 1_000_000,
        }
    }
}

#[derive(Debug, Default)]
pub struct CacheMetrics {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub inserts: AtomicU64,
    pub evictions: AtomicU64,
    pub resamples: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CacheMetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub evictions: u64,
    pub resamples: u64,
}

impl CacheMetrics {
    fn snapshot(&self) -> CacheMetricsSnapshot {
        CacheMetricsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            resamples: self.resamples.load(Ordering::Relaxed),
        }
    }
}

/// A bounded cache of chunk-metadata entries shared across every open sealed
/// file in a storage group.
pub struct MetadataCache {
    store: RwLock<LruCache<CacheKey, Vec<ChunkMetadata>>>,
    bloom: Option<RwLock<BloomFilter>>,
    config: RwLock<CacheConfig>,
    metrics: CacheMetrics,
    recent_sizes: RwLock<VecDeque<usize>>,
    insert_count: AtomicU64,
    enabled: AtomicBool,
}

impl MetadataCache {
    /// Creates a cache with the given byte budget and default bloom sizing.
    pub fn new(budget_bytes: usize) -> Self {
        Self::with_config(CacheConfig {
            budget_bytes,
            ..Default::default()
        })
    }

    pub fn with_config(config: CacheConfig) -> Self {
        let initial_capacity = NonZeroUsize::new(1024).unwrap();
        let bloom = config
            .bloom_enabled
            .then(|| RwLock::new(BloomFilter::new(config.expected_keys.max(1), 0.01)));

        Self {
            store: RwLock::new(LruCache::new(initial_capacity)),
            bloom,
            config: RwLock::new(config),
            metrics: CacheMetrics::default(),
            recent_sizes: RwLock::new(VecDeque::with_capacity(SIZE_SAMPLE_WINDOW)),
            insert_count: AtomicU64::new(0),
            enabled: AtomicBool::new(true),
        }
    }

    /// Disables caching entirely: lookups always miss and inserts are no-ops.
    /// Used when a storage group is configured with `metadata_cache_size = 0`.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
        if !enabled {
            self.store.write().clear();
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Returns a cached chunk-metadata list, if present, without fetching.
    pub fn get(&self, key: &CacheKey) -> Option<Vec<ChunkMetadata>> {
        if !self.is_enabled() {
            return None;
        }
        if let Some(bloom) = &self.bloom {
            if !bloom.read().may_contain(&key.bloom_bytes()) {
                self.metrics.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        }

        let mut store = self.store.write();
        match store.get(key) {
            Some(v) => {
                self.metrics.hits.fetch_add(1, Ordering::Relaxed);
                Some(v.clone())
            }
            None => {
                self.metrics.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Returns the cached chunk-metadata list for `key`, or calls `fetch` to
    /// produce one and caches the result.
    ///
    /// `fetch` runs without holding the cache lock (it typically reads and
    /// parses a metadata-index leaf from disk), then the entry is inserted
    /// under a fresh lock acquisition with a second presence check — if
    /// another thread raced this one and already inserted the same key, that
    /// thread's value wins and `fetch`'s result is discarded.
    pub fn get_or_insert_with<E>(
        &self,
        key: CacheKey,
        fetch: impl FnOnce() -> Result<Vec<ChunkMetadata>, E>,
    ) -> Result<Vec<ChunkMetadata>, E> {
        if let Some(hit) = self.get(&key) {
            return Ok(hit);
        }

        let fetched = fetch()?;

        if self.is_enabled() {
            let mut store = self.store.write();
            match store.get(&key) {
                Some(existing) => return Ok(existing.clone()),
                None => {
                    drop(store);
                    self.insert(key, fetched.clone());
                }
            }
        }

        Ok(fetched)
    }

    /// Inserts or replaces a cached chunk-metadata list, enforcing the byte
    /// budget.
    pub fn insert(&self, key: CacheKey, value: Vec<ChunkMetadata>) {
        if !self.is_enabled() {
            return;
        }

        self.record_sample(approx_size(&value));
        self.maybe_resample_capacity();

        if let Some(bloom) = &self.bloom {
            bloom.write().insert(&key.bloom_bytes());
        }

        let mut store = self.store.write();
        let evicted = store.put(key, value);
        if evicted.is_some() {
            self.metrics.evictions.fetch_add(1, Ordering::Relaxed);
        }
        self.metrics.inserts.fetch_add(1, Ordering::Relaxed);
    }

    fn record_sample(&self, size: usize) {
        let mut samples = self.recent_sizes.write();
        if samples.len() == SIZE_SAMPLE_WINDOW {
            samples.pop_front();
        }
        samples.push_back(size);
    }

    fn average_entry_size(&self) -> usize {
        let samples = self.recent_sizes.read();
        if samples.is_empty() {
            return std::mem::size_of::<ChunkMetadata>();
        }
        samples.iter().sum::<usize>() / samples.len()
    }

    /// Double-checked capacity resample: a fast read-lock check for "is a
    /// resample due" followed by a write-lock re-check before doing the
    /// (more expensive) `LruCache::resize`, so concurrent inserts past the
    /// threshold don't all race to resize.
    fn maybe_resample_capacity(&self) {
        let count = self.insert_count.fetch_add(1, Ordering::Relaxed) + 1;
        if count % RESAMPLE_INTERVAL != 0 {
            return;
        }

        let budget = self.config.read().budget_bytes;
        let avg = self.average_entry_size().max(1);
        let target = NonZeroUsize::new((budget / avg).max(1)).unwrap();

        let mut store = self.store.write();
        if store.cap() != target {
            store.resize(target);
            self.metrics.resamples.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Removes every cached entry belonging to `file_path` (e.g. when that
    /// file is deleted or consumed by a merge). A linear scan over cached
    /// keys: eviction by file is rare compared to per-series lookups, so a
    /// secondary by-file index is not worth the bookkeeping.
    pub fn remove_for_file(&self, file_path: &Path) {
        let mut store = self.store.write();
        let stale: Vec<CacheKey> = store
            .iter()
            .filter(|(k, _)| k.file_path == file_path)
            .map(|(k, _)| k.clone())
            .collect();
        for key in stale {
            store.pop(&key);
        }
    }

    /// Clears the cache entirely (used on storage-group close).
    pub fn clear(&self) {
        self.store.write().clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.store.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn metrics_snapshot(&self) -> CacheMetricsSnapshot {
        self.metrics.snapshot()
    }
}

#[cfg(test)]
mod tests;

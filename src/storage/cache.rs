//! Bounded LRU cache over parsed extents.
//!
//! Extents are immutable once sealed, so eviction is a plain drop: no
//! write-back, no I/O. Hit and miss counters feed the engine stats.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use lru::LruCache;
use parking_lot::Mutex;

use crate::extent::ParsedExtent;

pub const DEFAULT_EXTENT_CACHE_CAPACITY: usize = 64;

#[derive(Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
}

pub struct ExtentCache {
    store: Mutex<LruCache<String, Arc<ParsedExtent>>>,
    counters: CacheCounters,
}

impl Default for ExtentCache {
    fn default() -> Self {
        Self::new(DEFAULT_EXTENT_CACHE_CAPACITY)
    }
}

impl ExtentCache {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self { store: Mutex::new(LruCache::new(cap)), counters: CacheCounters::default() }
    }

    #[must_use]
    pub fn get(&self, extent_id: &str) -> Option<Arc<ParsedExtent>> {
        let found = self.store.lock().get(extent_id).cloned();
        match &found {
            Some(_) => self.counters.hits.fetch_add(1, Ordering::Relaxed),
            None => self.counters.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    /// Lookup without touching the hit/miss counters; used by paths that
    /// probe the cache before deciding whether to fetch.
    #[must_use]
    pub fn peek(&self, extent_id: &str) -> Option<Arc<ParsedExtent>> {
        self.store.lock().peek(extent_id).cloned()
    }

    pub fn insert(&self, extent_id: String, extent: Arc<ParsedExtent>) {
        self.store.lock().put(extent_id, extent);
    }

    pub fn remove(&self, extent_id: &str) {
        self.store.lock().pop(extent_id);
    }

    pub fn clear(&self) {
        self.store.lock().clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.store.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.store.lock().is_empty()
    }

    #[must_use]
    pub fn snapshot(&self) -> ExtentCacheSnapshot {
        let hits = self.counters.hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        ExtentCacheSnapshot { entries: self.len(), hits, misses }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ExtentCacheSnapshot {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

impl ExtentCacheSnapshot {
    /// Hit fraction in `[0, 1]`; zero lookups count as a zero rate.
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 { 0.0 } else { self.hits as f64 / total as f64 }
    }
}

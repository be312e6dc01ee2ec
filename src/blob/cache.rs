//! Ephemeral TTL blob backend with LRU fallback eviction.
//!
//! Entries expire `default_ttl` after insertion (clamped to `max_ttl`)
//! and are evicted lazily on access; a full store evicts least-recently
//! used entries. Listing is not part of this backend's contract.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use lru::LruCache;
use parking_lot::Mutex;
use tokio::io::AsyncRead;

use crate::blob::{
    BlobMeta, BlobObject, BlobReader, BlobStorage, ListOptions, ListResult, PutOptions, PutResult,
    check_put, slice_range,
};
use crate::errors::{FsxError, Result};

const DEFAULT_CAPACITY: usize = 1024;

/// Custom metadata key that overrides the TTL for one entry, in seconds.
pub const TTL_META_KEY: &str = "fsx-ttl-secs";

struct CacheEntry {
    data: Bytes,
    meta: BlobMeta,
    expires_at: Instant,
}

#[derive(Default)]
pub struct CacheBackendMetrics {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub inserts: AtomicU64,
    pub ttl_evictions: AtomicU64,
}

pub struct CacheBackend {
    name: String,
    store: Mutex<LruCache<String, CacheEntry>>,
    default_ttl: Duration,
    max_ttl: Duration,
    metrics: CacheBackendMetrics,
}

impl CacheBackend {
    #[must_use]
    pub fn new(name: &str, default_ttl: Duration, max_ttl: Duration) -> Self {
        Self::with_capacity(name, default_ttl, max_ttl, DEFAULT_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(
        name: &str,
        default_ttl: Duration,
        max_ttl: Duration,
        capacity: usize,
    ) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            name: name.to_string(),
            store: Mutex::new(LruCache::new(cap)),
            default_ttl,
            max_ttl,
            metrics: CacheBackendMetrics::default(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn metrics(&self) -> &CacheBackendMetrics {
        &self.metrics
    }

    fn ttl_for(&self, opts: &PutOptions) -> Duration {
        let requested = opts
            .custom
            .get(TTL_META_KEY)
            .and_then(|v| v.parse::<u64>().ok())
            .map_or(self.default_ttl, Duration::from_secs);
        requested.min(self.max_ttl)
    }

    /// Fetch a live entry, lazily evicting it when expired.
    fn live_entry(&self, key: &str) -> Option<(Bytes, BlobMeta)> {
        let mut guard = self.store.lock();
        match guard.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => {
                self.metrics.hits.fetch_add(1, Ordering::Relaxed);
                Some((entry.data.clone(), entry.meta.clone()))
            }
            Some(_) => {
                guard.pop(key);
                self.metrics.ttl_evictions.fetch_add(1, Ordering::Relaxed);
                self.metrics.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.metrics.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }
}

#[async_trait]
impl BlobStorage for CacheBackend {
    async fn put(&self, key: &str, data: Bytes, opts: PutOptions) -> Result<PutResult> {
        let etag = check_put(key, &data, &opts)?;
        let size = data.len() as u64;
        let expires_at = Instant::now() + self.ttl_for(&opts);
        let meta = BlobMeta {
            key: key.to_string(),
            size,
            etag: etag.clone(),
            content_type: opts.content_type,
            custom: opts.custom,
            last_modified: Utc::now(),
        };
        self.store.lock().put(key.to_string(), CacheEntry { data, meta, expires_at });
        self.metrics.inserts.fetch_add(1, Ordering::Relaxed);
        Ok(PutResult { etag, size })
    }

    async fn get(&self, key: &str) -> Result<Option<BlobObject>> {
        Ok(self.live_entry(key).map(|(bytes, meta)| BlobObject { bytes, meta }))
    }

    async fn get_stream(&self, key: &str) -> Result<Option<(BlobReader, BlobMeta)>> {
        Ok(self.live_entry(key).map(|(bytes, meta)| {
            let reader: BlobReader = Box::new(cursor(bytes));
            (reader, meta)
        }))
    }

    async fn get_range(&self, key: &str, start: u64, end: Option<u64>) -> Result<Option<BlobObject>> {
        crate::blob::check_range(start, end)?;
        let Some((bytes, meta)) = self.live_entry(key) else { return Ok(None) };
        slice_range(&bytes, &meta, start, end).map(Some)
    }

    async fn head(&self, key: &str) -> Result<Option<BlobMeta>> {
        Ok(self.live_entry(key).map(|(_, meta)| meta))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.store.lock().pop(key);
        Ok(())
    }

    async fn list(&self, _opts: ListOptions) -> Result<ListResult> {
        Err(FsxError::Invalid(format!("cache backend {:?} does not support list", self.name)))
    }

    async fn copy(&self, src: &str, dst: &str) -> Result<PutResult> {
        let Some((bytes, meta)) = self.live_entry(src) else {
            return Err(FsxError::NotFound(format!("copy source {src}")));
        };
        let opts = PutOptions {
            content_type: meta.content_type.clone(),
            custom: meta.custom.clone(),
            md5: None,
        };
        self.put(dst, bytes, opts).await
    }
}

fn cursor(data: Bytes) -> impl AsyncRead + Send + Unpin {
    std::io::Cursor::new(data.to_vec())
}

//! Object store fronted by a read-through TTL cache.
//!
//! Reads probe the cache first and populate it with the whole object on a
//! miss. Range reads therefore cost one full-object fetch the first time
//! and are sliced locally afterwards; `meta.size` stays the full blob
//! size either way. Writes always land in the store and optionally warm
//! the cache. Listing bypasses the cache entirely.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::blob::{
    BlobMeta, BlobObject, BlobReader, BlobStorage, CacheBackend, ListOptions, ListResult,
    PutOptions, PutResult, slice_range,
};
use crate::errors::Result;

pub struct ReadThroughBackend {
    store: Arc<dyn BlobStorage>,
    cache: CacheBackend,
    warm_on_write: bool,
}

impl ReadThroughBackend {
    #[must_use]
    pub fn new(store: Arc<dyn BlobStorage>, cache: CacheBackend, warm_on_write: bool) -> Self {
        Self { store, cache, warm_on_write }
    }

    #[must_use]
    pub const fn cache(&self) -> &CacheBackend {
        &self.cache
    }

    /// Cache hit, or a full-object fetch that populates the cache.
    async fn read_through(&self, key: &str) -> Result<Option<BlobObject>> {
        if let Some(hit) = self.cache.get(key).await? {
            return Ok(Some(hit));
        }
        let Some(obj) = self.store.get(key).await? else { return Ok(None) };
        self.warm(key, &obj).await;
        Ok(Some(obj))
    }

    /// Cache population is best-effort; a failed warm never fails a read.
    async fn warm(&self, key: &str, obj: &BlobObject) {
        let opts = PutOptions {
            content_type: obj.meta.content_type.clone(),
            custom: obj.meta.custom.clone(),
            md5: None,
        };
        if let Err(e) = self.cache.put(key, obj.bytes.clone(), opts).await {
            log::warn!("cache warm for {key} failed: {e}");
        }
    }
}

#[async_trait]
impl BlobStorage for ReadThroughBackend {
    async fn put(&self, key: &str, data: Bytes, opts: PutOptions) -> Result<PutResult> {
        let result = self.store.put(key, data.clone(), opts.clone()).await?;
        if self.warm_on_write {
            let obj = BlobObject {
                bytes: data,
                meta: BlobMeta {
                    key: key.to_string(),
                    size: result.size,
                    etag: result.etag.clone(),
                    content_type: opts.content_type,
                    custom: opts.custom,
                    last_modified: chrono::Utc::now(),
                },
            };
            self.warm(key, &obj).await;
        } else {
            self.cache.delete(key).await?;
        }
        Ok(result)
    }

    async fn get(&self, key: &str) -> Result<Option<BlobObject>> {
        self.read_through(key).await
    }

    async fn get_stream(&self, key: &str) -> Result<Option<(BlobReader, BlobMeta)>> {
        if let Some(hit) = self.cache.get_stream(key).await? {
            return Ok(Some(hit));
        }
        self.store.get_stream(key).await
    }

    async fn get_range(&self, key: &str, start: u64, end: Option<u64>) -> Result<Option<BlobObject>> {
        crate::blob::check_range(start, end)?;
        let Some(full) = self.read_through(key).await? else { return Ok(None) };
        slice_range(&full.bytes, &full.meta, start, end).map(Some)
    }

    async fn head(&self, key: &str) -> Result<Option<BlobMeta>> {
        if let Some(meta) = self.cache.head(key).await? {
            return Ok(Some(meta));
        }
        self.store.head(key).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.cache.delete(key).await?;
        self.store.delete(key).await
    }

    async fn delete_many(&self, keys: &[String]) -> Result<()> {
        for key in keys {
            self.cache.delete(key).await?;
        }
        self.store.delete_many(keys).await
    }

    async fn list(&self, opts: ListOptions) -> Result<ListResult> {
        self.store.list(opts).await
    }

    async fn copy(&self, src: &str, dst: &str) -> Result<PutResult> {
        self.cache.delete(dst).await?;
        self.store.copy(src, dst).await
    }
}

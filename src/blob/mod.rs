//! Blob storage port: an opaque key -> bytes store with metadata, range
//! reads, listing, and streaming. Backends are selected at construction
//! from [`BackendConfig`] and shared behind `Arc<dyn BlobStorage>`.

pub mod cache;
pub mod memory;
pub mod object_store;
pub mod read_through;
pub mod retry;

pub use cache::CacheBackend;
pub use memory::MemoryBackend;
pub use object_store::ObjectStoreBackend;
pub use read_through::ReadThroughBackend;
pub use retry::{RetryConfig, RetryingBackend};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::errors::{FsxError, Result};

/// Longest accepted key, in UTF-8 bytes.
pub const MAX_KEY_LEN: usize = 1024;

/// Metadata attached to a stored blob. `size` is always the full object
/// size, even on range reads.
#[derive(Debug, Clone)]
pub struct BlobMeta {
    pub key: String,
    pub size: u64,
    pub etag: String,
    pub content_type: Option<String>,
    pub custom: HashMap<String, String>,
    pub last_modified: DateTime<Utc>,
}

/// Options accepted by `put`.
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    pub content_type: Option<String>,
    pub custom: HashMap<String, String>,
    /// Expected hex MD5 of the payload; mismatch fails with `Invalid`.
    pub md5: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PutResult {
    pub etag: String,
    pub size: u64,
}

/// A blob payload together with its metadata.
#[derive(Debug, Clone)]
pub struct BlobObject {
    pub bytes: Bytes,
    pub meta: BlobMeta,
}

#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub prefix: Option<String>,
    pub limit: Option<usize>,
    /// Resume strictly after this key (the last key of the prior page).
    pub cursor: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ListResult {
    pub objects: Vec<BlobMeta>,
    pub cursor: Option<String>,
    pub truncated: bool,
}

/// Byte source returned by `get_stream`.
pub type BlobReader = Box<dyn AsyncRead + Send + Unpin>;

/// The storage capability the extent engine consumes.
///
/// Guarantees relied upon: `put` atomically replaces the prior value, and
/// a `get` after a successful `put` on the same instance observes it.
/// Errors keep their taxonomy when crossing this port.
#[async_trait]
pub trait BlobStorage: Send + Sync {
    async fn put(&self, key: &str, data: Bytes, opts: PutOptions) -> Result<PutResult>;

    async fn get(&self, key: &str) -> Result<Option<BlobObject>>;

    /// Streaming variant of `get` for large blobs.
    async fn get_stream(&self, key: &str) -> Result<Option<(BlobReader, BlobMeta)>>;

    /// Inclusive byte range. `end = None` means to the end of the blob.
    /// A start past the end of the blob yields an empty payload; the
    /// returned `meta.size` is always the full blob size.
    async fn get_range(&self, key: &str, start: u64, end: Option<u64>) -> Result<Option<BlobObject>>;

    async fn head(&self, key: &str) -> Result<Option<BlobMeta>>;

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.head(key).await?.is_some())
    }

    /// Idempotent: deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> Result<()>;

    async fn delete_many(&self, keys: &[String]) -> Result<()> {
        for key in keys {
            self.delete(key).await?;
        }
        Ok(())
    }

    /// Lex-ordered listing. The cursor names the last returned key.
    async fn list(&self, opts: ListOptions) -> Result<ListResult>;

    /// Server-side copy. `NotFound` when the source is missing.
    async fn copy(&self, src: &str, dst: &str) -> Result<PutResult>;

    /// Consume a stream fully, then store it as one object.
    async fn put_stream(
        &self,
        key: &str,
        mut reader: BlobReader,
        opts: PutOptions,
    ) -> Result<PutResult> {
        let mut buf = Vec::new();
        reader
            .read_to_end(&mut buf)
            .await
            .map_err(|e| FsxError::Io(format!("reading put stream: {e}")))?;
        self.put(key, Bytes::from(buf), opts).await
    }
}

/// Enumerated backend configurations.
#[derive(Debug, Clone)]
pub enum BackendConfig {
    /// In-memory store; the reference backend for tests.
    Memory,
    /// Authoritative store rooted at a bucket directory.
    ObjectStore { bucket: PathBuf, prefix: Option<String>, retry: Option<retry::RetryConfig> },
    /// Ephemeral TTL store. Does not support `list`.
    Cache { name: String, default_ttl: Duration, max_ttl: Duration },
    /// Object store fronted by a read-through TTL cache. Range reads pull
    /// the full object into the cache once, then slice locally.
    ObjectStoreWithReadThroughCache {
        bucket: PathBuf,
        cache_name: String,
        default_ttl: Duration,
        max_ttl: Duration,
        warm_on_write: bool,
        prefix: Option<String>,
    },
}

/// Construct the backend described by `config`.
///
/// # Errors
/// `Io` when an object-store bucket directory cannot be created.
pub fn open_backend(config: &BackendConfig) -> Result<Arc<dyn BlobStorage>> {
    match config {
        BackendConfig::Memory => Ok(Arc::new(MemoryBackend::new())),
        BackendConfig::ObjectStore { bucket, prefix, retry } => {
            let store: Arc<dyn BlobStorage> =
                Arc::new(ObjectStoreBackend::new(bucket, prefix.as_deref())?);
            Ok(match retry {
                Some(policy) => Arc::new(RetryingBackend::new(store, *policy)),
                None => store,
            })
        }
        BackendConfig::Cache { name, default_ttl, max_ttl } => {
            Ok(Arc::new(CacheBackend::new(name, *default_ttl, *max_ttl)))
        }
        BackendConfig::ObjectStoreWithReadThroughCache {
            bucket,
            cache_name,
            default_ttl,
            max_ttl,
            warm_on_write,
            prefix,
        } => {
            let store = ObjectStoreBackend::new(bucket, prefix.as_deref())?;
            let cache = CacheBackend::new(cache_name, *default_ttl, *max_ttl);
            Ok(Arc::new(ReadThroughBackend::new(Arc::new(store), cache, *warm_on_write)))
        }
    }
}

/// Shared `put` precondition checks: key length and the optional MD5.
pub(crate) fn check_put(key: &str, data: &[u8], opts: &PutOptions) -> Result<String> {
    if key.is_empty() || key.len() > MAX_KEY_LEN {
        return Err(FsxError::Invalid(format!(
            "key length {} outside 1..={MAX_KEY_LEN}",
            key.len()
        )));
    }
    let etag = format!("{:x}", md5::compute(data));
    if let Some(expected) = &opts.md5
        && !expected.eq_ignore_ascii_case(&etag)
    {
        return Err(FsxError::Invalid(format!("md5 mismatch: expected {expected}, got {etag}")));
    }
    Ok(etag)
}

/// Reject inverted inclusive ranges up front.
pub(crate) fn check_range(start: u64, end: Option<u64>) -> Result<()> {
    if let Some(end) = end
        && start > end
    {
        return Err(FsxError::Invalid(format!("range start {start} past end {end}")));
    }
    Ok(())
}

/// Slice `data` by an inclusive range, keeping full-object metadata.
/// A start at or past the end yields an empty payload.
pub(crate) fn slice_range(
    data: &Bytes,
    meta: &BlobMeta,
    start: u64,
    end: Option<u64>,
) -> Result<BlobObject> {
    check_range(start, end)?;
    let len = data.len() as u64;
    let bytes = if start >= len {
        Bytes::new()
    } else {
        let stop = end.map_or(len, |e| (e + 1).min(len));
        data.slice(start as usize..stop as usize)
    };
    Ok(BlobObject { bytes, meta: clone_with_size(meta, len) })
}

fn clone_with_size(meta: &BlobMeta, size: u64) -> BlobMeta {
    let mut meta = meta.clone();
    meta.size = size;
    meta
}

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use fsx::blob::{
    BlobObject, BlobReader, BlobStorage, CacheBackend, ListOptions, MemoryBackend,
    ObjectStoreBackend, PutOptions, PutResult, ReadThroughBackend, RetryConfig, RetryingBackend,
};
use fsx::errors::FsxError;
use tempfile::tempdir;

fn put_opts() -> PutOptions {
    PutOptions::default()
}

#[tokio::test]
async fn memory_put_get_roundtrip() {
    let store = MemoryBackend::new();
    let result = store.put("a/key", Bytes::from_static(b"hello"), put_opts()).await.unwrap();
    assert_eq!(result.size, 5);

    let obj = store.get("a/key").await.unwrap().unwrap();
    assert_eq!(&obj.bytes[..], b"hello");
    assert_eq!(obj.meta.size, 5);
    assert_eq!(obj.meta.etag, result.etag);
    assert!(store.exists("a/key").await.unwrap());
    assert!(store.get("missing").await.unwrap().is_none());
}

#[tokio::test]
async fn memory_put_replaces_atomically() {
    let store = MemoryBackend::new();
    store.put("k", Bytes::from_static(b"old"), put_opts()).await.unwrap();
    store.put("k", Bytes::from_static(b"newer"), put_opts()).await.unwrap();
    let obj = store.get("k").await.unwrap().unwrap();
    assert_eq!(&obj.bytes[..], b"newer");
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn memory_range_semantics() {
    let store = MemoryBackend::new();
    store.put("k", Bytes::from_static(b"0123456789"), put_opts()).await.unwrap();

    let obj = store.get_range("k", 2, Some(5)).await.unwrap().unwrap();
    assert_eq!(&obj.bytes[..], b"2345");
    assert_eq!(obj.meta.size, 10);

    // Open-ended reads to the end of the blob.
    let obj = store.get_range("k", 7, None).await.unwrap().unwrap();
    assert_eq!(&obj.bytes[..], b"789");

    // Start past the blob: empty payload, true size.
    let obj = store.get_range("k", 50, Some(60)).await.unwrap().unwrap();
    assert!(obj.bytes.is_empty());
    assert_eq!(obj.meta.size, 10);

    // Inverted range is an input error.
    assert!(matches!(store.get_range("k", 5, Some(2)).await, Err(FsxError::Invalid(_))));
}

#[tokio::test]
async fn memory_rejects_oversized_key_and_md5_mismatch() {
    let store = MemoryBackend::new();
    let long_key = "k".repeat(1025);
    assert!(matches!(
        store.put(&long_key, Bytes::from_static(b"x"), put_opts()).await,
        Err(FsxError::Invalid(_))
    ));

    let bad = PutOptions { md5: Some("00000000000000000000000000000000".into()), ..put_opts() };
    assert!(matches!(
        store.put("k", Bytes::from_static(b"payload"), bad).await,
        Err(FsxError::Invalid(_))
    ));

    let good = PutOptions { md5: Some(format!("{:x}", md5::compute(b"payload"))), ..put_opts() };
    store.put("k", Bytes::from_static(b"payload"), good).await.unwrap();
}

#[tokio::test]
async fn memory_list_is_lex_ordered_and_paginated() {
    let store = MemoryBackend::new();
    for key in ["b/2", "a/1", "b/1", "c/1", "b/3"] {
        store.put(key, Bytes::from_static(b"x"), put_opts()).await.unwrap();
    }

    let all = store.list(ListOptions::default()).await.unwrap();
    let keys: Vec<&str> = all.objects.iter().map(|m| m.key.as_str()).collect();
    assert_eq!(keys, ["a/1", "b/1", "b/2", "b/3", "c/1"]);
    assert!(!all.truncated);

    let page = store
        .list(ListOptions { prefix: Some("b/".into()), limit: Some(2), cursor: None })
        .await
        .unwrap();
    let keys: Vec<&str> = page.objects.iter().map(|m| m.key.as_str()).collect();
    assert_eq!(keys, ["b/1", "b/2"]);
    assert!(page.truncated);
    assert_eq!(page.cursor.as_deref(), Some("b/2"));

    let rest = store
        .list(ListOptions { prefix: Some("b/".into()), limit: Some(2), cursor: page.cursor })
        .await
        .unwrap();
    let keys: Vec<&str> = rest.objects.iter().map(|m| m.key.as_str()).collect();
    assert_eq!(keys, ["b/3"]);
    assert!(!rest.truncated);
}

#[tokio::test]
async fn memory_copy_and_delete() {
    let store = MemoryBackend::new();
    store.put("src", Bytes::from_static(b"data"), put_opts()).await.unwrap();
    store.copy("src", "dst").await.unwrap();
    assert_eq!(&store.get("dst").await.unwrap().unwrap().bytes[..], b"data");

    assert!(matches!(store.copy("nope", "x").await, Err(FsxError::NotFound(_))));

    store.delete("src").await.unwrap();
    store.delete("src").await.unwrap(); // idempotent
    assert!(!store.exists("src").await.unwrap());

    store.delete_many(&["dst".to_string(), "ghost".to_string()]).await.unwrap();
    assert!(store.is_empty());
}

#[tokio::test]
async fn object_store_roundtrip_and_persistence() {
    let dir = tempdir().unwrap();
    let store = ObjectStoreBackend::new(dir.path(), Some("tier0")).unwrap();

    let mut custom = HashMap::new();
    custom.insert("origin".to_string(), "unit-test".to_string());
    let opts = PutOptions {
        content_type: Some("application/octet-stream".into()),
        custom,
        md5: None,
    };
    store.put("extent/aa/bb", Bytes::from_static(b"0123456789"), opts).await.unwrap();

    let obj = store.get("extent/aa/bb").await.unwrap().unwrap();
    assert_eq!(&obj.bytes[..], b"0123456789");
    assert_eq!(obj.meta.content_type.as_deref(), Some("application/octet-stream"));
    assert_eq!(obj.meta.custom.get("origin").map(String::as_str), Some("unit-test"));

    let ranged = store.get_range("extent/aa/bb", 4, Some(6)).await.unwrap().unwrap();
    assert_eq!(&ranged.bytes[..], b"456");
    assert_eq!(ranged.meta.size, 10);

    // A second handle over the same directory sees the object.
    let reopened = ObjectStoreBackend::new(dir.path(), Some("tier0")).unwrap();
    assert!(reopened.exists("extent/aa/bb").await.unwrap());
    let listing = reopened.list(ListOptions::default()).await.unwrap();
    assert_eq!(listing.objects.len(), 1);
    assert_eq!(listing.objects[0].key, "extent/aa/bb");

    reopened.delete("extent/aa/bb").await.unwrap();
    assert!(store.get("extent/aa/bb").await.unwrap().is_none());
}

#[tokio::test]
async fn object_store_rejects_traversal_keys() {
    let dir = tempdir().unwrap();
    let store = ObjectStoreBackend::new(dir.path(), None).unwrap();
    assert!(matches!(
        store.put("../escape", Bytes::from_static(b"x"), put_opts()).await,
        Err(FsxError::Invalid(_))
    ));
}

#[tokio::test]
async fn cache_backend_expires_entries() {
    let cache = CacheBackend::new("test", Duration::from_millis(40), Duration::from_secs(60));
    cache.put("k", Bytes::from_static(b"v"), put_opts()).await.unwrap();
    assert!(cache.get("k").await.unwrap().is_some());

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(cache.get("k").await.unwrap().is_none());
    assert!(cache.metrics().ttl_evictions.load(Ordering::Relaxed) >= 1);
}

#[tokio::test]
async fn cache_backend_has_no_listing() {
    let cache = CacheBackend::new("test", Duration::from_secs(5), Duration::from_secs(60));
    assert!(matches!(cache.list(ListOptions::default()).await, Err(FsxError::Invalid(_))));
}

/// Wraps a backend and counts full-object fetches.
struct CountingBackend {
    inner: MemoryBackend,
    gets: AtomicUsize,
}

impl CountingBackend {
    fn new() -> Self {
        Self { inner: MemoryBackend::new(), gets: AtomicUsize::new(0) }
    }
}

#[async_trait]
impl BlobStorage for CountingBackend {
    async fn put(&self, key: &str, data: Bytes, opts: PutOptions) -> fsx::Result<PutResult> {
        self.inner.put(key, data, opts).await
    }
    async fn get(&self, key: &str) -> fsx::Result<Option<BlobObject>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.inner.get(key).await
    }
    async fn get_stream(
        &self,
        key: &str,
    ) -> fsx::Result<Option<(BlobReader, fsx::blob::BlobMeta)>> {
        self.inner.get_stream(key).await
    }
    async fn get_range(
        &self,
        key: &str,
        start: u64,
        end: Option<u64>,
    ) -> fsx::Result<Option<BlobObject>> {
        self.inner.get_range(key, start, end).await
    }
    async fn head(&self, key: &str) -> fsx::Result<Option<fsx::blob::BlobMeta>> {
        self.inner.head(key).await
    }
    async fn delete(&self, key: &str) -> fsx::Result<()> {
        self.inner.delete(key).await
    }
    async fn list(&self, opts: ListOptions) -> fsx::Result<fsx::blob::ListResult> {
        self.inner.list(opts).await
    }
    async fn copy(&self, src: &str, dst: &str) -> fsx::Result<PutResult> {
        self.inner.copy(src, dst).await
    }
}

/// Fails every operation with a retryable error until `failures_left`
/// reaches zero, then behaves like the wrapped store.
struct FlakyBackend {
    inner: MemoryBackend,
    failures_left: AtomicUsize,
    attempts: AtomicUsize,
}

impl FlakyBackend {
    fn new(failures: usize) -> Self {
        Self {
            inner: MemoryBackend::new(),
            failures_left: AtomicUsize::new(failures),
            attempts: AtomicUsize::new(0),
        }
    }

    fn trip(&self) -> fsx::Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(FsxError::Io("transient backend failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStorage for FlakyBackend {
    async fn put(&self, key: &str, data: Bytes, opts: PutOptions) -> fsx::Result<PutResult> {
        self.trip()?;
        self.inner.put(key, data, opts).await
    }
    async fn get(&self, key: &str) -> fsx::Result<Option<BlobObject>> {
        self.trip()?;
        self.inner.get(key).await
    }
    async fn get_stream(
        &self,
        key: &str,
    ) -> fsx::Result<Option<(BlobReader, fsx::blob::BlobMeta)>> {
        self.inner.get_stream(key).await
    }
    async fn get_range(
        &self,
        key: &str,
        start: u64,
        end: Option<u64>,
    ) -> fsx::Result<Option<BlobObject>> {
        self.trip()?;
        self.inner.get_range(key, start, end).await
    }
    async fn head(&self, key: &str) -> fsx::Result<Option<fsx::blob::BlobMeta>> {
        self.trip()?;
        self.inner.head(key).await
    }
    async fn delete(&self, key: &str) -> fsx::Result<()> {
        self.trip()?;
        self.inner.delete(key).await
    }
    async fn list(&self, opts: ListOptions) -> fsx::Result<fsx::blob::ListResult> {
        self.trip()?;
        self.inner.list(opts).await
    }
    async fn copy(&self, src: &str, dst: &str) -> fsx::Result<PutResult> {
        self.trip()?;
        self.inner.copy(src, dst).await
    }
}

#[tokio::test]
async fn retrying_backend_rides_out_transient_failures() {
    let base = Arc::new(FlakyBackend::new(2));
    let config = RetryConfig { max_attempts: 3, initial_backoff: Duration::from_millis(1) };
    let store = RetryingBackend::new(base.clone(), config);

    store.put("k", Bytes::from_static(b"v"), put_opts()).await.unwrap();
    assert_eq!(base.attempts.load(Ordering::SeqCst), 3);
    assert_eq!(&store.get("k").await.unwrap().unwrap().bytes[..], b"v");
}

#[tokio::test]
async fn retrying_backend_gives_up_after_max_attempts() {
    let base = Arc::new(FlakyBackend::new(10));
    let config = RetryConfig { max_attempts: 2, initial_backoff: Duration::from_millis(1) };
    let store = RetryingBackend::new(base.clone(), config);

    assert!(matches!(
        store.put("k", Bytes::from_static(b"v"), put_opts()).await,
        Err(FsxError::Io(_))
    ));
    assert_eq!(base.attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn retrying_backend_passes_terminal_errors_through() {
    let base = Arc::new(FlakyBackend::new(0));
    let store = RetryingBackend::new(base.clone(), RetryConfig::default());
    assert!(matches!(store.copy("missing", "dst").await, Err(FsxError::NotFound(_))));
    // One attempt: NotFound is not retryable.
    assert_eq!(base.attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn read_through_range_reads_fetch_once_then_slice() {
    let base = Arc::new(CountingBackend::new());
    let cache = CacheBackend::new("edge", Duration::from_secs(60), Duration::from_secs(120));
    let store = ReadThroughBackend::new(base.clone(), cache, false);

    store.put("k", Bytes::from_static(b"0123456789ABCDEFGHIJ"), put_opts()).await.unwrap();

    let first = store.get_range("k", 5, Some(9)).await.unwrap().unwrap();
    assert_eq!(&first.bytes[..], b"56789");
    assert_eq!(first.meta.size, 20);
    assert_eq!(base.gets.load(Ordering::SeqCst), 1);

    // Second range over the same object is sliced from cache.
    let second = store.get_range("k", 10, Some(14)).await.unwrap().unwrap();
    assert_eq!(&second.bytes[..], b"ABCDE");
    assert_eq!(second.meta.size, 20);
    assert_eq!(base.gets.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn read_through_warm_on_write_skips_first_fetch() {
    let base = Arc::new(CountingBackend::new());
    let cache = CacheBackend::new("edge", Duration::from_secs(60), Duration::from_secs(120));
    let store = ReadThroughBackend::new(base.clone(), cache, true);

    store.put("k", Bytes::from_static(b"payload"), put_opts()).await.unwrap();
    let obj = store.get("k").await.unwrap().unwrap();
    assert_eq!(&obj.bytes[..], b"payload");
    assert_eq!(base.gets.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn read_through_delete_invalidates_cache() {
    let base = Arc::new(CountingBackend::new());
    let cache = CacheBackend::new("edge", Duration::from_secs(60), Duration::from_secs(120));
    let store = ReadThroughBackend::new(base.clone(), cache, true);

    store.put("k", Bytes::from_static(b"payload"), put_opts()).await.unwrap();
    store.delete("k").await.unwrap();
    assert!(store.get("k").await.unwrap().is_none());
}

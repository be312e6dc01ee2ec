//! Retry decorator for backends with transient failures.
//!
//! Wraps any backend and re-issues operations that fail with a retryable
//! error (I/O, timeout), backing off exponentially between attempts. A
//! timeout that carries a retry hint is honored over the computed
//! backoff. Non-retryable errors and successes pass straight through.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::blob::{
    BlobMeta, BlobObject, BlobReader, BlobStorage, ListOptions, ListResult, PutOptions, PutResult,
};
use crate::errors::{FsxError, Result};

#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_attempts: 3, initial_backoff: Duration::from_millis(100) }
    }
}

pub struct RetryingBackend {
    inner: Arc<dyn BlobStorage>,
    config: RetryConfig,
}

impl RetryingBackend {
    #[must_use]
    pub fn new(inner: Arc<dyn BlobStorage>, config: RetryConfig) -> Self {
        Self { inner, config }
    }

    async fn run<T, Fut>(&self, what: &str, op: impl Fn() -> Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>> + Send,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut backoff = self.config.initial_backoff;
        let mut attempt = 1u32;
        loop {
            match op().await {
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let delay = match &e {
                        FsxError::TimedOut { retry_after_secs: Some(secs), .. } => {
                            Duration::from_secs(*secs)
                        }
                        _ => backoff,
                    };
                    log::warn!("{what} attempt {attempt}/{max_attempts} failed: {e}");
                    tokio::time::sleep(delay).await;
                    backoff = backoff.saturating_mul(2);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

#[async_trait]
impl BlobStorage for RetryingBackend {
    async fn put(&self, key: &str, data: Bytes, opts: PutOptions) -> Result<PutResult> {
        self.run("put", || self.inner.put(key, data.clone(), opts.clone())).await
    }

    async fn get(&self, key: &str) -> Result<Option<BlobObject>> {
        self.run("get", || self.inner.get(key)).await
    }

    // Streams are handed out as-is: a broken stream cannot be replayed
    // from here, only reopened by the caller.
    async fn get_stream(&self, key: &str) -> Result<Option<(BlobReader, BlobMeta)>> {
        self.inner.get_stream(key).await
    }

    async fn get_range(&self, key: &str, start: u64, end: Option<u64>) -> Result<Option<BlobObject>> {
        self.run("get_range", || self.inner.get_range(key, start, end)).await
    }

    async fn head(&self, key: &str) -> Result<Option<BlobMeta>> {
        self.run("head", || self.inner.head(key)).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.run("delete", || self.inner.delete(key)).await
    }

    async fn delete_many(&self, keys: &[String]) -> Result<()> {
        self.run("delete_many", || self.inner.delete_many(keys)).await
    }

    async fn list(&self, opts: ListOptions) -> Result<ListResult> {
        self.run("list", || self.inner.list(opts.clone())).await
    }

    async fn copy(&self, src: &str, dst: &str) -> Result<PutResult> {
        self.run("copy", || self.inner.copy(src, dst)).await
    }
}

//! In-memory blob backend; the reference implementation of the port.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::RwLock;
use tokio::io::AsyncRead;

use crate::blob::{
    BlobMeta, BlobObject, BlobReader, BlobStorage, ListOptions, ListResult, PutOptions, PutResult,
    check_put, slice_range,
};
use crate::errors::{FsxError, Result};

#[derive(Clone)]
struct StoredObject {
    data: Bytes,
    meta: BlobMeta,
}

/// Keys are kept in a `BTreeMap` so listings come out lex-ordered.
#[derive(Default)]
pub struct MemoryBackend {
    objects: RwLock<BTreeMap<String, StoredObject>>,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

#[async_trait]
impl BlobStorage for MemoryBackend {
    async fn put(&self, key: &str, data: Bytes, opts: PutOptions) -> Result<PutResult> {
        let etag = check_put(key, &data, &opts)?;
        let size = data.len() as u64;
        let meta = BlobMeta {
            key: key.to_string(),
            size,
            etag: etag.clone(),
            content_type: opts.content_type,
            custom: opts.custom,
            last_modified: Utc::now(),
        };
        self.objects.write().insert(key.to_string(), StoredObject { data, meta });
        Ok(PutResult { etag, size })
    }

    async fn get(&self, key: &str) -> Result<Option<BlobObject>> {
        Ok(self
            .objects
            .read()
            .get(key)
            .map(|o| BlobObject { bytes: o.data.clone(), meta: o.meta.clone() }))
    }

    async fn get_stream(&self, key: &str) -> Result<Option<(BlobReader, BlobMeta)>> {
        Ok(self.objects.read().get(key).map(|o| {
            let reader: BlobReader = Box::new(cursor(o.data.clone()));
            (reader, o.meta.clone())
        }))
    }

    async fn get_range(&self, key: &str, start: u64, end: Option<u64>) -> Result<Option<BlobObject>> {
        crate::blob::check_range(start, end)?;
        let guard = self.objects.read();
        let Some(obj) = guard.get(key) else { return Ok(None) };
        slice_range(&obj.data, &obj.meta, start, end).map(Some)
    }

    async fn head(&self, key: &str) -> Result<Option<BlobMeta>> {
        Ok(self.objects.read().get(key).map(|o| o.meta.clone()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.objects.write().remove(key);
        Ok(())
    }

    async fn delete_many(&self, keys: &[String]) -> Result<()> {
        let mut guard = self.objects.write();
        for key in keys {
            guard.remove(key);
        }
        Ok(())
    }

    async fn list(&self, opts: ListOptions) -> Result<ListResult> {
        let guard = self.objects.read();
        let prefix = opts.prefix.as_deref().unwrap_or("");
        let mut objects = Vec::new();
        let mut truncated = false;
        for (key, obj) in guard.range(opts.cursor.clone().unwrap_or_default()..) {
            if opts.cursor.as_deref() == Some(key.as_str()) {
                continue;
            }
            if !key.starts_with(prefix) {
                if key.as_str() > prefix && !objects.is_empty() {
                    break;
                }
                continue;
            }
            if opts.limit.is_some_and(|l| objects.len() >= l) {
                truncated = true;
                break;
            }
            objects.push(obj.meta.clone());
        }
        let cursor = if truncated { objects.last().map(|m| m.key.clone()) } else { None };
        Ok(ListResult { objects, cursor, truncated })
    }

    async fn copy(&self, src: &str, dst: &str) -> Result<PutResult> {
        let source = self
            .objects
            .read()
            .get(src)
            .cloned()
            .ok_or_else(|| FsxError::NotFound(format!("copy source {src}")))?;
        let mut meta = source.meta.clone();
        meta.key = dst.to_string();
        meta.last_modified = Utc::now();
        let result = PutResult { etag: meta.etag.clone(), size: meta.size };
        self.objects.write().insert(dst.to_string(), StoredObject { data: source.data, meta });
        Ok(result)
    }
}

fn cursor(data: Bytes) -> impl AsyncRead + Send + Unpin {
    std::io::Cursor::new(data.to_vec())
}

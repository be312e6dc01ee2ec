//! Directory-rooted object store backend.
//!
//! Each object lives at `<bucket>/<prefix>/<key>` with a JSON sidecar at
//! `<key>.meta` next to it. Writes go through a temp file and rename so a
//! concurrent reader never observes a torn object.

use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::blob::{
    BlobMeta, BlobObject, BlobReader, BlobStorage, ListOptions, ListResult, PutOptions, PutResult,
    check_put,
};
use crate::errors::{FsxError, Result};

const META_SUFFIX: &str = ".meta";

#[derive(Debug, Serialize, Deserialize)]
struct Sidecar {
    etag: String,
    content_type: Option<String>,
    custom: std::collections::HashMap<String, String>,
    last_modified: DateTime<Utc>,
}

pub struct ObjectStoreBackend {
    root: PathBuf,
}

impl ObjectStoreBackend {
    /// Open (creating if needed) a bucket directory, optionally nested
    /// under `prefix`.
    ///
    /// # Errors
    /// `Io` when the root directory cannot be created.
    pub fn new(bucket: &Path, prefix: Option<&str>) -> Result<Self> {
        let root = match prefix {
            Some(p) if !p.is_empty() => bucket.join(p),
            _ => bucket.to_path_buf(),
        };
        std::fs::create_dir_all(&root)
            .map_err(|e| FsxError::Io(format!("creating bucket {}: {e}", root.display())))?;
        Ok(Self { root })
    }

    fn object_path(&self, key: &str) -> Result<PathBuf> {
        let rel = Path::new(key);
        for component in rel.components() {
            match component {
                Component::Normal(_) => {}
                _ => return Err(FsxError::Invalid(format!("unusable key {key:?}"))),
            }
        }
        Ok(self.root.join(rel))
    }

    fn meta_path(&self, key: &str) -> Result<PathBuf> {
        let mut path = self.object_path(key)?.into_os_string();
        path.push(META_SUFFIX);
        Ok(PathBuf::from(path))
    }

    async fn read_meta(&self, key: &str) -> Result<Option<BlobMeta>> {
        let data_path = self.object_path(key)?;
        let file_meta = match fs::metadata(&data_path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let sidecar: Sidecar = match fs::read(self.meta_path(key)?).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Sidecar {
                etag: String::new(),
                content_type: None,
                custom: std::collections::HashMap::new(),
                last_modified: Utc::now(),
            },
            Err(e) => return Err(e.into()),
        };
        Ok(Some(BlobMeta {
            key: key.to_string(),
            size: file_meta.len(),
            etag: sidecar.etag,
            content_type: sidecar.content_type,
            custom: sidecar.custom,
            last_modified: sidecar.last_modified,
        }))
    }

    async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut tmp = path.to_path_buf().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Every key under the root, lex-ordered.
    async fn walk_keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(e) => e,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    stack.push(path);
                    continue;
                }
                let Ok(rel) = path.strip_prefix(&self.root) else { continue };
                let key = rel
                    .components()
                    .filter_map(|c| c.as_os_str().to_str())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.ends_with(META_SUFFIX) || key.ends_with(".tmp") {
                    continue;
                }
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[async_trait]
impl BlobStorage for ObjectStoreBackend {
    async fn put(&self, key: &str, data: Bytes, opts: PutOptions) -> Result<PutResult> {
        let etag = check_put(key, &data, &opts)?;
        let size = data.len() as u64;
        let sidecar = Sidecar {
            etag: etag.clone(),
            content_type: opts.content_type,
            custom: opts.custom,
            last_modified: Utc::now(),
        };
        Self::write_atomic(&self.object_path(key)?, &data).await?;
        Self::write_atomic(&self.meta_path(key)?, &serde_json::to_vec(&sidecar)?).await?;
        log::debug!("object-store put {key} ({size} bytes)");
        Ok(PutResult { etag, size })
    }

    async fn get(&self, key: &str) -> Result<Option<BlobObject>> {
        let Some(meta) = self.read_meta(key).await? else { return Ok(None) };
        let data = fs::read(self.object_path(key)?).await?;
        Ok(Some(BlobObject { bytes: Bytes::from(data), meta }))
    }

    async fn get_stream(&self, key: &str) -> Result<Option<(BlobReader, BlobMeta)>> {
        let Some(meta) = self.read_meta(key).await? else { return Ok(None) };
        let file = fs::File::open(self.object_path(key)?).await?;
        Ok(Some((Box::new(file) as BlobReader, meta)))
    }

    async fn get_range(&self, key: &str, start: u64, end: Option<u64>) -> Result<Option<BlobObject>> {
        if let Some(end) = end
            && start > end
        {
            return Err(FsxError::Invalid(format!("range start {start} past end {end}")));
        }
        let Some(meta) = self.read_meta(key).await? else { return Ok(None) };
        if start >= meta.size {
            return Ok(Some(BlobObject { bytes: Bytes::new(), meta }));
        }
        let stop = end.map_or(meta.size, |e| (e + 1).min(meta.size));
        let mut file = fs::File::open(self.object_path(key)?).await?;
        file.seek(SeekFrom::Start(start)).await?;
        let mut buf = vec![0u8; (stop - start) as usize];
        file.read_exact(&mut buf).await?;
        Ok(Some(BlobObject { bytes: Bytes::from(buf), meta }))
    }

    async fn head(&self, key: &str) -> Result<Option<BlobMeta>> {
        self.read_meta(key).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        for path in [self.object_path(key)?, self.meta_path(key)?] {
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn list(&self, opts: ListOptions) -> Result<ListResult> {
        let prefix = opts.prefix.as_deref().unwrap_or("");
        let mut objects = Vec::new();
        let mut truncated = false;
        for key in self.walk_keys().await? {
            if !key.starts_with(prefix) {
                continue;
            }
            if let Some(cursor) = &opts.cursor
                && key.as_str() <= cursor.as_str()
            {
                continue;
            }
            if opts.limit.is_some_and(|l| objects.len() >= l) {
                truncated = true;
                break;
            }
            if let Some(meta) = self.read_meta(&key).await? {
                objects.push(meta);
            }
        }
        let cursor = if truncated { objects.last().map(|m| m.key.clone()) } else { None };
        Ok(ListResult { objects, cursor, truncated })
    }

    async fn copy(&self, src: &str, dst: &str) -> Result<PutResult> {
        let Some(source) = self.get(src).await? else {
            return Err(FsxError::NotFound(format!("copy source {src}")));
        };
        let opts = PutOptions {
            content_type: source.meta.content_type.clone(),
            custom: source.meta.custom.clone(),
            md5: None,
        };
        self.put(dst, source.bytes, opts).await
    }
}

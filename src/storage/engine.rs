//! The extent storage engine.
//!
//! Writes land in a dirty-page buffer (in memory, mirrored to the
//! `dirty_pages` table so they survive restarts) and are packed into
//! immutable extents on flush. Reads resolve dirty buffer first, then the
//! parsed-extent cache, then the blob store. Flush orders its effects as
//! blob put, extent-row upsert, dirty-row delete, which keeps the catalog
//! consistent under cancellation: content-addressed ids make a re-flush
//! of surviving dirty rows land on the same blob.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};

use crate::blob::{BlobStorage, PutOptions};
use crate::errors::{FsxError, Result};
use crate::extent::{BuildOptions, ParsedExtent, codec};
use crate::sql::{SqlExecutor, SqlValue};
use crate::storage::cache::ExtentCache;
use crate::storage::config::{Compression, StorageConfig};

const CREATE_TABLES: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS files (
        file_id TEXT PRIMARY KEY,
        page_size INTEGER NOT NULL,
        file_size INTEGER NOT NULL,
        extent_count INTEGER NOT NULL,
        created_at TEXT NOT NULL,
        modified_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS extents (
        extent_id TEXT PRIMARY KEY,
        file_id TEXT NOT NULL,
        extent_index INTEGER NOT NULL,
        start_page INTEGER NOT NULL,
        page_count INTEGER NOT NULL,
        compressed INTEGER NOT NULL,
        original_size INTEGER NOT NULL,
        stored_size INTEGER NOT NULL,
        checksum TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_extents_file ON extents (file_id, extent_index)",
    "CREATE TABLE IF NOT EXISTS dirty_pages (
        file_id TEXT NOT NULL,
        page_num INTEGER NOT NULL,
        data BLOB NOT NULL,
        modified_at TEXT NOT NULL,
        PRIMARY KEY (file_id, page_num)
    )",
];

/// Engine-level counters reported by `get_stats`.
#[derive(Debug, Clone, Copy)]
pub struct StorageStats {
    pub files: u64,
    pub extents: u64,
    pub dirty_pages: u64,
    pub stored_bytes: u64,
    pub cache_size: usize,
    pub cache_hit_rate: f64,
}

pub struct ExtentStorage {
    config: StorageConfig,
    pages_per_extent: u64,
    backend: Arc<dyn BlobStorage>,
    sql: Arc<dyn SqlExecutor>,
    cache: ExtentCache,
    /// Authoritative dirty buffer: file id -> page number -> payload.
    dirty: RwLock<HashMap<String, BTreeMap<u64, Bytes>>>,
    /// Sync writes whose catalog mirror is still outstanding.
    pending: Mutex<Vec<(String, u64)>>,
    /// `(file, extent_index) -> extent_id`, maintained by flush and the
    /// async read path so the sync read path can reach the cache.
    extent_ids: RwLock<HashMap<(String, u64), String>>,
    /// File sizes observed by async operations; gates the sync read path.
    file_sizes: RwLock<HashMap<String, u64>>,
    initialized: AtomicBool,
}

impl ExtentStorage {
    /// # Errors
    /// `Invalid` when the configuration is unusable.
    pub fn new(
        config: StorageConfig,
        backend: Arc<dyn BlobStorage>,
        sql: Arc<dyn SqlExecutor>,
    ) -> Result<Self> {
        config.validate()?;
        let pages_per_extent = config.pages_per_extent();
        Ok(Self {
            config,
            pages_per_extent,
            backend,
            sql,
            cache: ExtentCache::default(),
            dirty: RwLock::new(HashMap::new()),
            pending: Mutex::new(Vec::new()),
            extent_ids: RwLock::new(HashMap::new()),
            file_sizes: RwLock::new(HashMap::new()),
            initialized: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub const fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Create the catalog tables and reload dirty rows that survived a
    /// restart. Idempotent; every other operation fails with
    /// `NotInitialized` until this has run.
    ///
    /// # Errors
    /// `Sql` when the catalog rejects the schema statements.
    pub async fn init(&self) -> Result<()> {
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }
        for stmt in CREATE_TABLES {
            self.sql.exec(stmt, &[]).await?;
        }

        let recovered = self
            .sql
            .exec("SELECT file_id, page_num, data FROM dirty_pages ORDER BY file_id ASC", &[])
            .await?;
        let mut reloaded = 0usize;
        {
            let mut dirty = self.dirty.write();
            for row in &recovered.rows {
                let file_id = row.get_str(0)?;
                if !self.owns_file(file_id) {
                    continue;
                }
                let page_num = row.get_u64(1)?;
                let data = Bytes::copy_from_slice(row.get_blob(2)?);
                dirty.entry(file_id.to_string()).or_default().insert(page_num, data);
                reloaded += 1;
            }
        }
        if reloaded > 0 {
            log::info!("recovered {reloaded} dirty pages from the catalog");
        }
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    fn ensure_init(&self) -> Result<()> {
        if self.initialized.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(FsxError::NotInitialized)
        }
    }

    fn owns_file(&self, file_id: &str) -> bool {
        self.config.file_prefix.as_deref().is_none_or(|p| file_id.starts_with(p))
    }

    fn blob_key(&self, extent_id: &str) -> String {
        format!("{}{extent_id}", self.config.extent_prefix)
    }

    /// Content-derived extent id, domain-separated by file and index so
    /// identical content in different slots never collides in the
    /// catalog. Re-flushing the same dirty rows reproduces the same id.
    fn extent_id(file_id: &str, extent_index: u64, bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(file_id.as_bytes());
        hasher.update(extent_index.to_le_bytes());
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    fn check_payload(&self, payload: &[u8]) -> Result<()> {
        if payload.len() != self.config.page_size as usize {
            return Err(FsxError::Invalid(format!(
                "payload is {} bytes, page size is {}",
                payload.len(),
                self.config.page_size
            )));
        }
        Ok(())
    }

    /// Buffer one page write. Creates the file on first write and grows
    /// its recorded size. May trigger an automatic flush of the file.
    ///
    /// # Errors
    /// `Invalid` on a payload that is not exactly one page.
    pub async fn write_page(&self, file_id: &str, page_num: u64, payload: &[u8]) -> Result<()> {
        self.ensure_init()?;
        self.check_payload(payload)?;
        self.drain_pending().await?;

        let dirty_count = {
            let mut dirty = self.dirty.write();
            let pages = dirty.entry(file_id.to_string()).or_default();
            pages.insert(page_num, Bytes::copy_from_slice(payload));
            pages.len() as u64
        };

        let min_size = (page_num + 1) * u64::from(self.config.page_size);
        self.ensure_file_row(file_id, min_size).await?;
        self.sql
            .exec(
                "INSERT OR REPLACE INTO dirty_pages (file_id, page_num, data, modified_at)
                 VALUES (?, ?, ?, ?)",
                &[
                    file_id.into(),
                    page_num.into(),
                    payload.into(),
                    Utc::now().to_rfc3339().into(),
                ],
            )
            .await?;

        if self.config.auto_flush && dirty_count >= self.config.effective_flush_threshold() {
            self.flush_file(file_id).await?;
        }
        Ok(())
    }

    /// Non-suspending variant of [`Self::write_page`]. The write is
    /// visible immediately; its catalog mirror is deferred to the next
    /// awaited operation on this engine.
    ///
    /// # Errors
    /// `Invalid` on a payload that is not exactly one page.
    pub fn write_page_sync(&self, file_id: &str, page_num: u64, payload: &[u8]) -> Result<()> {
        self.ensure_init()?;
        self.check_payload(payload)?;
        self.dirty
            .write()
            .entry(file_id.to_string())
            .or_default()
            .insert(page_num, Bytes::copy_from_slice(payload));
        self.pending.lock().push((file_id.to_string(), page_num));
        Ok(())
    }

    /// Mirror sync writes into the catalog. Called on entry by every
    /// awaited operation so program order is preserved.
    async fn drain_pending(&self) -> Result<()> {
        let pending = std::mem::take(&mut *self.pending.lock());
        if pending.is_empty() {
            return Ok(());
        }
        let mut by_file: HashMap<String, Vec<u64>> = HashMap::new();
        for (file_id, page_num) in pending {
            by_file.entry(file_id).or_default().push(page_num);
        }
        for (file_id, mut page_nums) in by_file {
            page_nums.sort_unstable();
            let max_page = *page_nums.last().expect("non-empty pending group");
            self.ensure_file_row(&file_id, (max_page + 1) * u64::from(self.config.page_size))
                .await?;
            for page_num in page_nums {
                // The page may have been flushed or truncated since.
                let Some(payload) =
                    self.dirty.read().get(&file_id).and_then(|m| m.get(&page_num).cloned())
                else {
                    continue;
                };
                self.sql
                    .exec(
                        "INSERT OR REPLACE INTO dirty_pages (file_id, page_num, data, modified_at)
                         VALUES (?, ?, ?, ?)",
                        &[
                            file_id.as_str().into(),
                            page_num.into(),
                            payload.as_ref().into(),
                            Utc::now().to_rfc3339().into(),
                        ],
                    )
                    .await?;
            }
        }
        Ok(())
    }

    async fn ensure_file_row(&self, file_id: &str, min_size: u64) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let existing = self
            .sql
            .exec("SELECT file_size FROM files WHERE file_id = ?", &[file_id.into()])
            .await?;
        let recorded = match existing.rows.first() {
            None => {
                self.sql
                    .exec(
                        "INSERT INTO files
                         (file_id, page_size, file_size, extent_count, created_at, modified_at)
                         VALUES (?, ?, ?, 0, ?, ?)",
                        &[
                            file_id.into(),
                            u64::from(self.config.page_size).into(),
                            min_size.into(),
                            now.as_str().into(),
                            now.as_str().into(),
                        ],
                    )
                    .await?;
                min_size
            }
            Some(row) => {
                let current = row.get_u64(0)?;
                if min_size > current {
                    self.sql
                        .exec(
                            "UPDATE files SET file_size = ?, modified_at = ? WHERE file_id = ?",
                            &[min_size.into(), now.as_str().into(), file_id.into()],
                        )
                        .await?;
                    min_size
                } else {
                    current
                }
            }
        };
        self.file_sizes.write().insert(file_id.to_string(), recorded);
        Ok(())
    }

    /// Resolve one page: dirty buffer, then cached or fetched extent.
    ///
    /// # Errors
    /// `ChecksumMismatch` when the stored extent fails validation.
    pub async fn read_page(&self, file_id: &str, page_num: u64) -> Result<Option<Bytes>> {
        self.ensure_init()?;
        self.drain_pending().await?;

        if let Some(payload) = self.dirty.read().get(file_id).and_then(|m| m.get(&page_num)) {
            return Ok(Some(payload.clone()));
        }

        let file = self
            .sql
            .exec("SELECT file_size FROM files WHERE file_id = ?", &[file_id.into()])
            .await?;
        let Some(row) = file.rows.first() else { return Ok(None) };
        let file_size = row.get_u64(0)?;
        self.file_sizes.write().insert(file_id.to_string(), file_size);
        if page_num >= file_size.div_ceil(u64::from(self.config.page_size)) {
            return Ok(None);
        }

        let extent_index = page_num / self.pages_per_extent;
        let located = self
            .sql
            .exec(
                "SELECT extent_id FROM extents WHERE file_id = ? AND extent_index = ?",
                &[file_id.into(), extent_index.into()],
            )
            .await?;
        let Some(row) = located.rows.first() else { return Ok(None) };
        let extent_id = row.get_str(0)?.to_string();

        let Some(parsed) = self.load_extent(&extent_id).await? else { return Ok(None) };
        self.extent_ids.write().insert((file_id.to_string(), extent_index), extent_id);

        let inner = u32::try_from(page_num % self.pages_per_extent).expect("fits pages_per_extent");
        Ok(parsed.page(inner).map(Bytes::copy_from_slice))
    }

    /// Non-suspending read: dirty buffer and cache only. Pages that would
    /// need catalog or blob I/O come back as `None`.
    pub fn read_page_sync(&self, file_id: &str, page_num: u64) -> Result<Option<Bytes>> {
        self.ensure_init()?;
        if let Some(payload) = self.dirty.read().get(file_id).and_then(|m| m.get(&page_num)) {
            return Ok(Some(payload.clone()));
        }
        let Some(&file_size) = self.file_sizes.read().get(file_id) else { return Ok(None) };
        if page_num >= file_size.div_ceil(u64::from(self.config.page_size)) {
            return Ok(None);
        }
        let extent_index = page_num / self.pages_per_extent;
        let Some(extent_id) =
            self.extent_ids.read().get(&(file_id.to_string(), extent_index)).cloned()
        else {
            return Ok(None);
        };
        let Some(parsed) = self.cache.peek(&extent_id) else { return Ok(None) };
        let inner = u32::try_from(page_num % self.pages_per_extent).expect("fits pages_per_extent");
        Ok(parsed.page(inner).map(Bytes::copy_from_slice))
    }

    async fn load_extent(&self, extent_id: &str) -> Result<Option<Arc<ParsedExtent>>> {
        if let Some(hit) = self.cache.get(extent_id) {
            return Ok(Some(hit));
        }
        let key = self.blob_key(extent_id);
        let Some(obj) = self.backend.get(&key).await? else { return Ok(None) };
        if !codec::validate(&obj.bytes) {
            return Err(FsxError::ChecksumMismatch(key));
        }
        let parsed = Arc::new(codec::parse(&obj.bytes)?);
        self.cache.insert(extent_id.to_string(), parsed.clone());
        Ok(Some(parsed))
    }

    /// Flush every file with buffered writes.
    pub async fn flush(&self) -> Result<()> {
        self.ensure_init()?;
        self.drain_pending().await?;
        let files: Vec<String> = self.dirty.read().keys().cloned().collect();
        for file_id in files {
            self.flush_file(&file_id).await?;
        }
        Ok(())
    }

    /// Seal one file's dirty pages into extents.
    ///
    /// Pages are grouped by extent index; a group that rewrites an
    /// existing extent first absorbs that extent's surviving pages so
    /// nothing present is lost.
    pub async fn flush_file(&self, file_id: &str) -> Result<()> {
        self.ensure_init()?;
        self.drain_pending().await?;

        let Some(snapshot) = self.dirty.read().get(file_id).cloned() else { return Ok(()) };
        if snapshot.is_empty() {
            return Ok(());
        }

        let mut partitions: BTreeMap<u64, BTreeMap<u32, Vec<u8>>> = BTreeMap::new();
        for (&page_num, payload) in &snapshot {
            let extent_index = page_num / self.pages_per_extent;
            let inner =
                u32::try_from(page_num % self.pages_per_extent).expect("fits pages_per_extent");
            partitions.entry(extent_index).or_default().insert(inner, payload.to_vec());
        }
        let partition_count = partitions.len();

        for (extent_index, mut pages) in partitions {
            let existing = self
                .sql
                .exec(
                    "SELECT extent_id FROM extents WHERE file_id = ? AND extent_index = ?",
                    &[file_id.into(), extent_index.into()],
                )
                .await?;
            let replaced_id = match existing.rows.first() {
                Some(row) => Some(row.get_str(0)?.to_string()),
                None => None,
            };

            // Carry over pages that were present before but not dirtied.
            if let Some(old_id) = &replaced_id
                && let Some(old) = self.load_extent(old_id).await?
            {
                for (index, payload) in old.pages() {
                    pages.entry(index).or_insert_with(|| payload.to_vec());
                }
            }

            let compress = self.config.compression == Compression::Gzip;
            let bytes = codec::build(&pages, self.config.page_size, BuildOptions { compress })?;
            let header = codec::parse_header(&bytes)?;
            let extent_id = Self::extent_id(file_id, extent_index, &bytes);

            self.backend
                .put(
                    &self.blob_key(&extent_id),
                    Bytes::from(bytes.clone()),
                    PutOptions {
                        content_type: Some("application/octet-stream".to_string()),
                        ..PutOptions::default()
                    },
                )
                .await?;

            self.sql
                .exec(
                    "DELETE FROM extents WHERE file_id = ? AND extent_index = ?",
                    &[file_id.into(), extent_index.into()],
                )
                .await?;
            self.sql
                .exec(
                    "INSERT INTO extents
                     (extent_id, file_id, extent_index, start_page, page_count,
                      compressed, original_size, stored_size, checksum)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
                    &[
                        extent_id.as_str().into(),
                        file_id.into(),
                        extent_index.into(),
                        (extent_index * self.pages_per_extent).into(),
                        u64::from(header.page_count).into(),
                        header.is_compressed().into(),
                        u64::from(header.extent_size).into(),
                        (bytes.len() as u64).into(),
                        format!("{:016x}", header.checksum).into(),
                    ],
                )
                .await?;

            // The replaced blob is unreferenced garbage now; an external
            // sweep may reclaim it.
            if let Some(old_id) = replaced_id {
                self.cache.remove(&old_id);
            }
            self.cache.insert(extent_id.clone(), Arc::new(codec::parse(&bytes)?));
            self.extent_ids.write().insert((file_id.to_string(), extent_index), extent_id);
        }

        self.sql
            .exec("DELETE FROM dirty_pages WHERE file_id = ?", &[file_id.into()])
            .await?;

        let counted = self
            .sql
            .exec("SELECT COUNT(*) FROM extents WHERE file_id = ?", &[file_id.into()])
            .await?;
        let extent_count = counted.rows.first().map_or(0, |r| r.get_i64(0).unwrap_or(0));
        self.sql
            .exec(
                "UPDATE files SET extent_count = ?, modified_at = ? WHERE file_id = ?",
                &[extent_count.into(), Utc::now().to_rfc3339().into(), file_id.into()],
            )
            .await?;

        // Drop flushed pages, keeping any page overwritten mid-flush.
        {
            let mut dirty = self.dirty.write();
            if let Some(pages) = dirty.get_mut(file_id) {
                for (page_num, payload) in &snapshot {
                    if pages.get(page_num) == Some(payload) {
                        pages.remove(page_num);
                    }
                }
                if pages.is_empty() {
                    dirty.remove(file_id);
                }
            }
        }

        log::debug!(
            "flushed {file_id}: {} pages into {partition_count} extents",
            snapshot.len()
        );
        Ok(())
    }

    /// Recorded size of a file; zero when unknown.
    pub async fn get_file_size(&self, file_id: &str) -> Result<u64> {
        self.ensure_init()?;
        self.drain_pending().await?;
        let result = self
            .sql
            .exec("SELECT file_size FROM files WHERE file_id = ?", &[file_id.into()])
            .await?;
        result.rows.first().map_or(Ok(0), |row| row.get_u64(0))
    }

    /// All known file ids, lex-ordered.
    pub async fn list_files(&self) -> Result<Vec<String>> {
        self.ensure_init()?;
        self.drain_pending().await?;
        let result = self.sql.exec("SELECT file_id FROM files ORDER BY file_id ASC", &[]).await?;
        let mut files = Vec::with_capacity(result.rows.len());
        for row in &result.rows {
            let file_id = row.get_str(0)?;
            if self.owns_file(file_id) {
                files.push(file_id.to_string());
            }
        }
        Ok(files)
    }

    /// Remove a file: dirty pages, extents (blobs deleted in one batch),
    /// and catalog rows. Idempotent.
    pub async fn delete_file(&self, file_id: &str) -> Result<()> {
        self.ensure_init()?;
        self.drain_pending().await?;

        self.dirty.write().remove(file_id);
        self.pending.lock().retain(|(f, _)| f != file_id);
        self.file_sizes.write().remove(file_id);
        self.sql
            .exec("DELETE FROM dirty_pages WHERE file_id = ?", &[file_id.into()])
            .await?;

        let extents = self
            .sql
            .exec("SELECT extent_id FROM extents WHERE file_id = ?", &[file_id.into()])
            .await?;
        let mut keys = Vec::with_capacity(extents.rows.len());
        for row in &extents.rows {
            let extent_id = row.get_str(0)?;
            self.cache.remove(extent_id);
            keys.push(self.blob_key(extent_id));
        }
        if !keys.is_empty() {
            self.backend.delete_many(&keys).await?;
        }
        self.extent_ids.write().retain(|(f, _), _| f != file_id);

        self.sql.exec("DELETE FROM extents WHERE file_id = ?", &[file_id.into()]).await?;
        self.sql.exec("DELETE FROM files WHERE file_id = ?", &[file_id.into()]).await?;
        log::debug!("deleted {file_id} and {} extents", keys.len());
        Ok(())
    }

    /// Shrink or grow a file's recorded size.
    ///
    /// Shrinking drops dirty pages at or past the new boundary and
    /// whole extents entirely past it. Extents straddling the boundary
    /// stay; the recorded size gates reads past the boundary.
    pub async fn truncate(&self, file_id: &str, new_size: u64) -> Result<()> {
        self.ensure_init()?;
        self.drain_pending().await?;

        let existing = self
            .sql
            .exec("SELECT file_size FROM files WHERE file_id = ?", &[file_id.into()])
            .await?;
        let Some(row) = existing.rows.first() else {
            // Unknown file: record the requested size.
            return self.ensure_file_row(file_id, new_size).await;
        };
        let file_size = row.get_u64(0)?;
        let now = Utc::now().to_rfc3339();

        if new_size >= file_size {
            self.sql
                .exec(
                    "UPDATE files SET file_size = ?, modified_at = ? WHERE file_id = ?",
                    &[new_size.into(), now.as_str().into(), file_id.into()],
                )
                .await?;
            self.file_sizes.write().insert(file_id.to_string(), new_size);
            return Ok(());
        }

        let boundary_page = new_size.div_ceil(u64::from(self.config.page_size));

        if let Some(pages) = self.dirty.write().get_mut(file_id) {
            pages.retain(|&n, _| n < boundary_page);
        }
        self.pending.lock().retain(|(f, n)| f != file_id || *n < boundary_page);
        self.sql
            .exec(
                "DELETE FROM dirty_pages WHERE file_id = ? AND page_num >= ?",
                &[file_id.into(), boundary_page.into()],
            )
            .await?;

        let extents = self
            .sql
            .exec(
                "SELECT extent_id, start_page, extent_index FROM extents WHERE file_id = ?",
                &[file_id.into()],
            )
            .await?;
        let mut keys = Vec::new();
        for row in &extents.rows {
            let start_page = row.get_u64(1)?;
            if start_page < boundary_page {
                continue;
            }
            let extent_id = row.get_str(0)?;
            let extent_index = row.get_u64(2)?;
            self.cache.remove(extent_id);
            self.extent_ids.write().remove(&(file_id.to_string(), extent_index));
            keys.push(self.blob_key(extent_id));
            self.sql
                .exec("DELETE FROM extents WHERE extent_id = ?", &[extent_id.into()])
                .await?;
        }
        if !keys.is_empty() {
            self.backend.delete_many(&keys).await?;
        }

        let counted = self
            .sql
            .exec("SELECT COUNT(*) FROM extents WHERE file_id = ?", &[file_id.into()])
            .await?;
        let extent_count = counted.rows.first().map_or(0, |r| r.get_i64(0).unwrap_or(0));
        self.sql
            .exec(
                "UPDATE files SET file_size = ?, extent_count = ?, modified_at = ?
                 WHERE file_id = ?",
                &[new_size.into(), extent_count.into(), now.as_str().into(), file_id.into()],
            )
            .await?;
        self.file_sizes.write().insert(file_id.to_string(), new_size);
        log::debug!("truncated {file_id} to {new_size} bytes, dropped {} extents", keys.len());
        Ok(())
    }

    /// Warm the cache with every extent of a file.
    pub async fn preload_extents(&self, file_id: &str) -> Result<()> {
        self.ensure_init()?;
        self.drain_pending().await?;
        let extents = self
            .sql
            .exec(
                "SELECT extent_id, extent_index FROM extents WHERE file_id = ?",
                &[file_id.into()],
            )
            .await?;
        let file = self
            .sql
            .exec("SELECT file_size FROM files WHERE file_id = ?", &[file_id.into()])
            .await?;
        if let Some(row) = file.rows.first() {
            self.file_sizes.write().insert(file_id.to_string(), row.get_u64(0)?);
        }
        for row in &extents.rows {
            let extent_id = row.get_str(0)?;
            let extent_index = row.get_u64(1)?;
            if self.load_extent(extent_id).await?.is_some() {
                self.extent_ids
                    .write()
                    .insert((file_id.to_string(), extent_index), extent_id.to_string());
            }
        }
        Ok(())
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Engine counters. Dirty pages are counted from the authoritative
    /// in-memory buffer.
    pub async fn get_stats(&self) -> Result<StorageStats> {
        self.ensure_init()?;
        self.drain_pending().await?;

        let (files, extents, stored_bytes) = if self.config.file_prefix.is_some() {
            let files = self.list_files().await?.len() as u64;
            let rows = self
                .sql
                .exec("SELECT file_id, stored_size FROM extents ORDER BY file_id ASC", &[])
                .await?;
            let mut extents = 0u64;
            let mut stored = 0u64;
            for row in &rows.rows {
                if self.owns_file(row.get_str(0)?) {
                    extents += 1;
                    stored += row.get_u64(1)?;
                }
            }
            (files, extents, stored)
        } else {
            let files = self.sql.exec("SELECT COUNT(*) FROM files", &[]).await?;
            let extents = self.sql.exec("SELECT COUNT(*) FROM extents", &[]).await?;
            let stored = self.sql.exec("SELECT SUM(stored_size) FROM extents", &[]).await?;
            let stored_bytes = match stored.rows.first() {
                Some(row) if row.0.first() != Some(&SqlValue::Null) => row.get_u64(0)?,
                _ => 0,
            };
            (
                files.rows.first().map_or(0, |r| r.get_u64(0).unwrap_or(0)),
                extents.rows.first().map_or(0, |r| r.get_u64(0).unwrap_or(0)),
                stored_bytes,
            )
        };

        let dirty_pages = self.dirty.read().values().map(|m| m.len() as u64).sum();
        let cache = self.cache.snapshot();
        Ok(StorageStats {
            files,
            extents,
            dirty_pages,
            stored_bytes,
            cache_size: cache.entries,
            cache_hit_rate: cache.hit_rate(),
        })
    }
}

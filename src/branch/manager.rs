//! The branch manager: branch rows, commit rows, presence markers, and a
//! per-branch extent engine keyed under `<root-prefix><branch-id>/`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use chrono::Utc;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::blob::{BlobStorage, ListOptions};
use crate::branch::types::{Branch, Commit, CommitSnapshot, SnapshotFile};
use crate::errors::{FsxError, Result};
use crate::sql::SqlExecutor;
use crate::storage::{ExtentStorage, StorageConfig};

pub const MAIN_BRANCH: &str = "main";

const CREATE_TABLES: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS branches (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        parent_branch_id TEXT,
        base_commit_id TEXT,
        head_commit_id TEXT,
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS commits (
        id TEXT PRIMARY KEY,
        branch_id TEXT NOT NULL,
        message TEXT NOT NULL,
        timestamp TEXT NOT NULL,
        parent_commit_id TEXT,
        snapshot_json TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_commits_branch ON commits (branch_id, timestamp)",
    "CREATE TABLE IF NOT EXISTS branch_files (
        branch_id TEXT NOT NULL,
        file_id TEXT NOT NULL,
        size INTEGER NOT NULL,
        deleted INTEGER NOT NULL,
        modified_at TEXT NOT NULL,
        PRIMARY KEY (branch_id, file_id)
    )",
    "CREATE TABLE IF NOT EXISTS branch_pages (
        branch_id TEXT NOT NULL,
        file_id TEXT NOT NULL,
        page_num INTEGER NOT NULL,
        PRIMARY KEY (branch_id, file_id, page_num)
    )",
];

const BRANCH_COLUMNS: &str =
    "id, name, parent_branch_id, base_commit_id, head_commit_id, created_at";

pub struct BranchManager {
    /// Template for per-branch engines; its `extent_prefix` is the root
    /// under which every branch namespace lives.
    template: StorageConfig,
    backend: Arc<dyn BlobStorage>,
    sql: Arc<dyn SqlExecutor>,
    storages: RwLock<HashMap<String, Arc<ExtentStorage>>>,
    current: RwLock<Option<Branch>>,
    initialized: AtomicBool,
}

/// `<branch-id>:<file-id>`; the per-branch engine sees distinct file ids.
fn scope(branch_id: &str, file_id: &str) -> String {
    format!("{branch_id}:{file_id}")
}

impl BranchManager {
    /// # Errors
    /// `Invalid` when the storage template is unusable.
    pub fn new(
        template: StorageConfig,
        backend: Arc<dyn BlobStorage>,
        sql: Arc<dyn SqlExecutor>,
    ) -> Result<Self> {
        template.validate()?;
        Ok(Self {
            template,
            backend,
            sql,
            storages: RwLock::new(HashMap::new()),
            current: RwLock::new(None),
            initialized: AtomicBool::new(false),
        })
    }

    /// Create the branch tables and the `main` branch, and make it
    /// current. Idempotent.
    ///
    /// # Errors
    /// `Sql` when the catalog rejects the schema statements.
    pub async fn init(&self) -> Result<()> {
        for stmt in CREATE_TABLES {
            self.sql.exec(stmt, &[]).await?;
        }
        let main = match self.branch_by_name(MAIN_BRANCH).await? {
            Some(branch) => branch,
            None => self.insert_branch(MAIN_BRANCH, None, None).await?,
        };
        *self.current.write() = Some(main);
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

    /// The branch all reads start from and all writes land in.
    ///
    /// # Errors
    /// `NotInitialized` before `init`.
    pub fn current_branch(&self) -> Result<Branch> {
        self.ensure_init()?;
        self.current.read().clone().ok_or(FsxError::NotInitialized)
    }

    async fn branch_by_name(&self, name: &str) -> Result<Option<Branch>> {
        let result = self
            .sql
            .exec(
                &format!("SELECT {BRANCH_COLUMNS} FROM branches WHERE name = ?"),
                &[name.into()],
            )
            .await?;
        result.rows.first().map(Branch::from_row).transpose()
    }

    async fn branch_by_id(&self, id: &str) -> Result<Option<Branch>> {
        let result = self
            .sql
            .exec(&format!("SELECT {BRANCH_COLUMNS} FROM branches WHERE id = ?"), &[id.into()])
            .await?;
        result.rows.first().map(Branch::from_row).transpose()
    }

    async fn insert_branch(
        &self,
        name: &str,
        parent: Option<&Branch>,
        base_commit: Option<String>,
    ) -> Result<Branch> {
        let branch = Branch {
            id: Uuid::new_v4().simple().to_string(),
            name: name.to_string(),
            parent_id: parent.map(|p| p.id.clone()),
            base_commit,
            head_commit: None,
            created_at: Utc::now(),
        };
        self.sql
            .exec(
                "INSERT INTO branches
                 (id, name, parent_branch_id, base_commit_id, head_commit_id, created_at)
                 VALUES (?, ?, ?, ?, ?, ?)",
                &[
                    branch.id.as_str().into(),
                    branch.name.as_str().into(),
                    branch.parent_id.as_deref().map_or(crate::sql::SqlValue::Null, Into::into),
                    branch.base_commit.as_deref().map_or(crate::sql::SqlValue::Null, Into::into),
                    crate::sql::SqlValue::Null,
                    branch.created_at.to_rfc3339().into(),
                ],
            )
            .await?;
        Ok(branch)
    }

    /// The per-branch engine, created and initialized on first use.
    async fn storage_for(&self, branch: &Branch) -> Result<Arc<ExtentStorage>> {
        if let Some(existing) = self.storages.read().get(&branch.id).cloned() {
            return Ok(existing);
        }
        let mut config = self.template.clone();
        config.extent_prefix = format!("{}{}/", self.template.extent_prefix, branch.id);
        config.file_prefix = Some(format!("{}:", branch.id));
        let storage = Arc::new(ExtentStorage::new(config, self.backend.clone(), self.sql.clone())?);
        storage.init().await?;
        let mut map = self.storages.write();
        Ok(map.entry(branch.id.clone()).or_insert(storage).clone())
    }

    /// O(1): one row insert. The new branch's parent is the current
    /// branch and its base commit is the parent's head.
    ///
    /// # Errors
    /// `AlreadyExists` on a name collision.
    pub async fn create_branch(&self, name: &str) -> Result<Branch> {
        self.ensure_init()?;
        if name.is_empty() {
            return Err(FsxError::Invalid("branch name must not be empty".into()));
        }
        if self.branch_by_name(name).await?.is_some() {
            return Err(FsxError::AlreadyExists(format!("branch {name}")));
        }
        let parent = self.current_branch()?;
        let branch = self.insert_branch(name, Some(&parent), parent.head_commit.clone()).await?;
        log::info!("created branch {name} from {}", parent.name);
        Ok(branch)
    }

    /// Flush the outgoing branch, then repoint `current`.
    ///
    /// # Errors
    /// `NotFound` when no branch has that name.
    pub async fn switch(&self, name: &str) -> Result<Branch> {
        self.ensure_init()?;
        let target = self
            .branch_by_name(name)
            .await?
            .ok_or_else(|| FsxError::NotFound(format!("branch {name}")))?;
        self.flush().await?;
        *self.current.write() = Some(target.clone());
        log::debug!("switched to branch {name}");
        Ok(target)
    }

    /// `ref` may be a branch name or a commit id. A commit id flushes and
    /// points `current` at the commit's branch; extent state is not
    /// rewound.
    ///
    /// # Errors
    /// `NotFound` when the ref matches neither.
    pub async fn checkout(&self, reference: &str) -> Result<Branch> {
        self.ensure_init()?;
        if self.branch_by_name(reference).await?.is_some() {
            return self.switch(reference).await;
        }
        let commit = self
            .sql
            .exec("SELECT branch_id FROM commits WHERE id = ?", &[reference.into()])
            .await?;
        let Some(row) = commit.rows.first() else {
            return Err(FsxError::NotFound(format!("branch or commit {reference}")));
        };
        let branch_id = row.get_str(0)?.to_string();
        let branch = self
            .branch_by_id(&branch_id)
            .await?
            .ok_or_else(|| FsxError::NotFound(format!("branch {branch_id}")))?;
        self.flush().await?;
        *self.current.write() = Some(branch.clone());
        Ok(branch)
    }

    /// Remove a branch, its catalog rows, and (best effort) its blobs.
    /// The current branch, `main`, and branches with children are
    /// refused.
    pub async fn delete_branch(&self, name: &str) -> Result<()> {
        self.ensure_init()?;
        if name == MAIN_BRANCH {
            return Err(FsxError::Invalid("the main branch cannot be deleted".into()));
        }
        let branch = self
            .branch_by_name(name)
            .await?
            .ok_or_else(|| FsxError::NotFound(format!("branch {name}")))?;
        if self.current_branch()?.id == branch.id {
            return Err(FsxError::Invalid(format!("branch {name} is current")));
        }
        let children = self
            .sql
            .exec("SELECT id FROM branches WHERE parent_branch_id = ?", &[branch.id.as_str().into()])
            .await?;
        if !children.rows.is_empty() {
            return Err(FsxError::Invalid(format!("branch {name} has child branches")));
        }

        // Drop the branch's own files through its engine first; that
        // removes their extents and catalog rows.
        let storage = self.storage_for(&branch).await?;
        let files = self
            .sql
            .exec(
                "SELECT file_id FROM branch_files WHERE branch_id = ?",
                &[branch.id.as_str().into()],
            )
            .await?;
        for row in &files.rows {
            storage.delete_file(&scope(&branch.id, row.get_str(0)?)).await?;
        }

        // Anything left under the branch prefix is stray; sweep it.
        let prefix = format!("{}{}/", self.template.extent_prefix, branch.id);
        match self.backend.list(ListOptions { prefix: Some(prefix), ..ListOptions::default() }).await
        {
            Ok(listing) => {
                let keys: Vec<String> = listing.objects.into_iter().map(|m| m.key).collect();
                if !keys.is_empty()
                    && let Err(e) = self.backend.delete_many(&keys).await
                {
                    log::warn!("sweeping branch {name} blobs failed: {e}");
                }
            }
            Err(e) => log::warn!("listing branch {name} blobs failed: {e}"),
        }

        for table in ["branch_pages", "branch_files", "commits"] {
            self.sql
                .exec(
                    &format!("DELETE FROM {table} WHERE branch_id = ?"),
                    &[branch.id.as_str().into()],
                )
                .await?;
        }
        self.sql.exec("DELETE FROM branches WHERE id = ?", &[branch.id.as_str().into()]).await?;
        self.storages.write().remove(&branch.id);
        log::info!("deleted branch {name}");
        Ok(())
    }

    /// All branches, ordered by name.
    pub async fn list_branches(&self) -> Result<Vec<Branch>> {
        self.ensure_init()?;
        let result = self
            .sql
            .exec(&format!("SELECT {BRANCH_COLUMNS} FROM branches ORDER BY name ASC"), &[])
            .await?;
        result.rows.iter().map(Branch::from_row).collect()
    }

    /// Copy-on-write page write into the current branch.
    pub async fn write_page(&self, file_id: &str, page_num: u64, payload: &[u8]) -> Result<()> {
        let branch = self.current_branch()?;
        let storage = self.storage_for(&branch).await?;
        storage.write_page(&scope(&branch.id, file_id), page_num, payload).await?;

        self.sql
            .exec(
                "INSERT OR REPLACE INTO branch_pages (branch_id, file_id, page_num)
                 VALUES (?, ?, ?)",
                &[branch.id.as_str().into(), file_id.into(), page_num.into()],
            )
            .await?;

        let page_size = u64::from(storage.config().page_size);
        let min_size = (page_num + 1) * page_size;
        let existing = self
            .sql
            .exec(
                "SELECT size FROM branch_files WHERE branch_id = ? AND file_id = ?",
                &[branch.id.as_str().into(), file_id.into()],
            )
            .await?;
        let size = existing.rows.first().map_or(Ok(0), |r| r.get_u64(0))?.max(min_size);
        self.sql
            .exec(
                "INSERT OR REPLACE INTO branch_files
                 (branch_id, file_id, size, deleted, modified_at)
                 VALUES (?, ?, ?, 0, ?)",
                &[
                    branch.id.as_str().into(),
                    file_id.into(),
                    size.into(),
                    Utc::now().to_rfc3339().into(),
                ],
            )
            .await?;
        Ok(())
    }

    /// Resolve a page by walking the parent chain: a tombstone hides the
    /// file, a presence marker pins the owning branch, and an exhausted
    /// chain reads as absent.
    pub async fn read_page(&self, file_id: &str, page_num: u64) -> Result<Option<Bytes>> {
        let mut branch = Some(self.current_branch()?);
        while let Some(b) = branch {
            let file_row = self
                .sql
                .exec(
                    "SELECT deleted FROM branch_files WHERE branch_id = ? AND file_id = ?",
                    &[b.id.as_str().into(), file_id.into()],
                )
                .await?;
            if let Some(row) = file_row.rows.first()
                && row.get_bool(0)?
            {
                return Ok(None);
            }

            let marker = self
                .sql
                .exec(
                    "SELECT page_num FROM branch_pages
                     WHERE branch_id = ? AND file_id = ? AND page_num = ?",
                    &[b.id.as_str().into(), file_id.into(), page_num.into()],
                )
                .await?;
            if !marker.rows.is_empty() {
                let storage = self.storage_for(&b).await?;
                return storage.read_page(&scope(&b.id, file_id), page_num).await;
            }

            branch = match &b.parent_id {
                Some(parent_id) => self.branch_by_id(parent_id).await?,
                None => None,
            };
        }
        Ok(None)
    }

    /// First branch up the chain with a `branch_files` row wins; a
    /// tombstone reads as size zero.
    pub async fn get_file_size(&self, file_id: &str) -> Result<u64> {
        let mut branch = Some(self.current_branch()?);
        while let Some(b) = branch {
            let row = self
                .sql
                .exec(
                    "SELECT size, deleted FROM branch_files WHERE branch_id = ? AND file_id = ?",
                    &[b.id.as_str().into(), file_id.into()],
                )
                .await?;
            if let Some(row) = row.rows.first() {
                return if row.get_bool(1)? { Ok(0) } else { row.get_u64(0) };
            }
            branch = match &b.parent_id {
                Some(parent_id) => self.branch_by_id(parent_id).await?,
                None => None,
            };
        }
        Ok(0)
    }

    /// Union of the files visible from the current branch; a child's
    /// view of a file (including its tombstone) shadows the parent's.
    pub async fn list_files(&self) -> Result<Vec<String>> {
        let mut visibility: BTreeMap<String, bool> = BTreeMap::new();
        let mut branch = Some(self.current_branch()?);
        while let Some(b) = branch {
            let rows = self
                .sql
                .exec(
                    "SELECT file_id, deleted FROM branch_files WHERE branch_id = ?",
                    &[b.id.as_str().into()],
                )
                .await?;
            for row in &rows.rows {
                let file_id = row.get_str(0)?.to_string();
                let deleted = row.get_bool(1)?;
                visibility.entry(file_id).or_insert(!deleted);
            }
            branch = match &b.parent_id {
                Some(parent_id) => self.branch_by_id(parent_id).await?,
                None => None,
            };
        }
        Ok(visibility.into_iter().filter_map(|(f, live)| live.then_some(f)).collect())
    }

    /// Tombstone a file in the current branch and drop the branch's own
    /// copy. Parent branches keep theirs.
    pub async fn delete_file(&self, file_id: &str) -> Result<()> {
        let branch = self.current_branch()?;
        let storage = self.storage_for(&branch).await?;
        storage.delete_file(&scope(&branch.id, file_id)).await?;
        self.sql
            .exec(
                "DELETE FROM branch_pages WHERE branch_id = ? AND file_id = ?",
                &[branch.id.as_str().into(), file_id.into()],
            )
            .await?;
        self.sql
            .exec(
                "INSERT OR REPLACE INTO branch_files
                 (branch_id, file_id, size, deleted, modified_at)
                 VALUES (?, ?, 0, 1, ?)",
                &[branch.id.as_str().into(), file_id.into(), Utc::now().to_rfc3339().into()],
            )
            .await?;
        Ok(())
    }

    /// Flush the current branch's engine.
    pub async fn flush(&self) -> Result<()> {
        let branch = self.current_branch()?;
        if let Some(storage) = self.storages.read().get(&branch.id).cloned() {
            storage.flush().await?;
        }
        Ok(())
    }

    /// Flush, snapshot the branch's live files, and record a commit.
    pub async fn commit(&self, message: &str) -> Result<Commit> {
        let branch = self.current_branch()?;
        self.flush().await?;

        let mut snapshot = CommitSnapshot::default();
        let files = self
            .sql
            .exec(
                "SELECT file_id, size FROM branch_files WHERE branch_id = ? AND deleted = ?",
                &[branch.id.as_str().into(), 0i64.into()],
            )
            .await?;
        for row in &files.rows {
            let file_id = row.get_str(0)?.to_string();
            let size = row.get_u64(1)?;
            let extents = self
                .sql
                .exec(
                    "SELECT extent_id FROM extents WHERE file_id = ? ORDER BY extent_index ASC",
                    &[scope(&branch.id, &file_id).into()],
                )
                .await?;
            let extent_ids = extents
                .rows
                .iter()
                .map(|r| r.get_str(0).map(str::to_string))
                .collect::<Result<Vec<_>>>()?;
            snapshot.files.insert(file_id, SnapshotFile { size, extents: extent_ids });
        }

        let timestamp = Utc::now();
        let nonce = Uuid::new_v4().simple().to_string();
        let mut hasher = Sha256::new();
        hasher.update(message.as_bytes());
        hasher.update(timestamp.to_rfc3339().as_bytes());
        hasher.update(branch.id.as_bytes());
        hasher.update(nonce.as_bytes());
        let commit = Commit {
            id: hex::encode(hasher.finalize()),
            branch_id: branch.id.clone(),
            message: message.to_string(),
            timestamp,
            parent_commit: branch.head_commit.clone(),
            snapshot,
        };

        self.sql
            .exec(
                "INSERT INTO commits
                 (id, branch_id, message, timestamp, parent_commit_id, snapshot_json)
                 VALUES (?, ?, ?, ?, ?, ?)",
                &[
                    commit.id.as_str().into(),
                    commit.branch_id.as_str().into(),
                    commit.message.as_str().into(),
                    // Fixed-width fractional seconds keep the lexicographic
                    // ORDER BY chronological.
                    commit.timestamp.to_rfc3339_opts(chrono::SecondsFormat::Micros, true).into(),
                    commit
                        .parent_commit
                        .as_deref()
                        .map_or(crate::sql::SqlValue::Null, Into::into),
                    serde_json::to_string(&commit.snapshot)?.into(),
                ],
            )
            .await?;
        self.sql
            .exec(
                "UPDATE branches SET head_commit_id = ? WHERE id = ?",
                &[commit.id.as_str().into(), branch.id.as_str().into()],
            )
            .await?;

        let mut current = self.current.write();
        if let Some(cur) = current.as_mut()
            && cur.id == branch.id
        {
            cur.head_commit = Some(commit.id.clone());
        }
        drop(current);
        log::info!("commit {} on {}: {message}", &commit.id[..12], branch.name);
        Ok(commit)
    }

    /// Commits of a branch (default: current), newest first.
    pub async fn get_commit_history(&self, branch_name: Option<&str>) -> Result<Vec<Commit>> {
        let branch = match branch_name {
            Some(name) => self
                .branch_by_name(name)
                .await?
                .ok_or_else(|| FsxError::NotFound(format!("branch {name}")))?,
            None => self.current_branch()?,
        };
        let result = self
            .sql
            .exec(
                "SELECT id, branch_id, message, timestamp, parent_commit_id, snapshot_json
                 FROM commits WHERE branch_id = ? ORDER BY timestamp DESC",
                &[branch.id.as_str().into()],
            )
            .await?;
        result.rows.iter().map(Commit::from_row).collect()
    }
}

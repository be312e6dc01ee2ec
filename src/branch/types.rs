use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{FsxError, Result};
use crate::sql::SqlRow;

/// One node of the branch forest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Branch {
    pub id: String,
    pub name: String,
    pub parent_id: Option<String>,
    pub base_commit: Option<String>,
    pub head_commit: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Branch {
    /// Decode from `SELECT id, name, parent_branch_id, base_commit_id,
    /// head_commit_id, created_at`.
    pub(crate) fn from_row(row: &SqlRow) -> Result<Self> {
        Ok(Self {
            id: row.get_str(0)?.to_string(),
            name: row.get_str(1)?.to_string(),
            parent_id: row.get_opt_str(2)?.map(str::to_string),
            base_commit: row.get_opt_str(3)?.map(str::to_string),
            head_commit: row.get_opt_str(4)?.map(str::to_string),
            created_at: parse_timestamp(row.get_str(5)?)?,
        })
    }
}

/// An immutable point-in-time record on a branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Commit {
    pub id: String,
    pub branch_id: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub parent_commit: Option<String>,
    pub snapshot: CommitSnapshot,
}

impl Commit {
    /// Decode from `SELECT id, branch_id, message, timestamp,
    /// parent_commit_id, snapshot_json`.
    pub(crate) fn from_row(row: &SqlRow) -> Result<Self> {
        Ok(Self {
            id: row.get_str(0)?.to_string(),
            branch_id: row.get_str(1)?.to_string(),
            message: row.get_str(2)?.to_string(),
            timestamp: parse_timestamp(row.get_str(3)?)?,
            parent_commit: row.get_opt_str(4)?.map(str::to_string),
            snapshot: serde_json::from_str(row.get_str(5)?)?,
        })
    }
}

/// Advisory enumeration of the live files on a branch at commit time.
/// Decoupled from the extent layout on purpose: the engine may evolve
/// how extents are keyed without invalidating history.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommitSnapshot {
    pub files: BTreeMap<String, SnapshotFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotFile {
    pub size: u64,
    pub extents: Vec<String>,
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| FsxError::Sql(format!("bad timestamp {raw:?}: {e}")))
}

//! SQL port: the metadata catalog is reached through one primitive,
//! `exec(sql, params) -> rows`. The engine only issues a small SQL subset
//! (create-table/index if-not-exists, insert / insert-or-replace, select
//! with equality and range predicates, order-by, limit, count, sum,
//! distinct, update, delete), so any catalog that can execute that subset
//! can back it.

pub mod sqlite;

pub use sqlite::SqliteExecutor;

use async_trait::async_trait;

use crate::errors::{FsxError, Result};

/// A parameter or result cell. The port deals only in these four shapes.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Int(i64),
    Text(String),
    Blob(Vec<u8>),
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u64> for SqlValue {
    fn from(v: u64) -> Self {
        Self::Int(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<&[u8]> for SqlValue {
    fn from(v: &[u8]) -> Self {
        Self::Blob(v.to_vec())
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(v: Vec<u8>) -> Self {
        Self::Blob(v)
    }
}

/// One result row, cells in select order.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlRow(pub Vec<SqlValue>);

impl SqlRow {
    fn cell(&self, idx: usize) -> Result<&SqlValue> {
        self.0.get(idx).ok_or_else(|| FsxError::Sql(format!("row has no column {idx}")))
    }

    pub fn get_i64(&self, idx: usize) -> Result<i64> {
        match self.cell(idx)? {
            SqlValue::Int(v) => Ok(*v),
            other => Err(FsxError::Sql(format!("column {idx} is {other:?}, wanted int"))),
        }
    }

    pub fn get_u64(&self, idx: usize) -> Result<u64> {
        u64::try_from(self.get_i64(idx)?)
            .map_err(|_| FsxError::Sql(format!("column {idx} is negative, wanted u64")))
    }

    pub fn get_bool(&self, idx: usize) -> Result<bool> {
        Ok(self.get_i64(idx)? != 0)
    }

    pub fn get_str(&self, idx: usize) -> Result<&str> {
        match self.cell(idx)? {
            SqlValue::Text(v) => Ok(v),
            other => Err(FsxError::Sql(format!("column {idx} is {other:?}, wanted text"))),
        }
    }

    pub fn get_opt_str(&self, idx: usize) -> Result<Option<&str>> {
        match self.cell(idx)? {
            SqlValue::Null => Ok(None),
            SqlValue::Text(v) => Ok(Some(v)),
            other => Err(FsxError::Sql(format!("column {idx} is {other:?}, wanted text or null"))),
        }
    }

    pub fn get_blob(&self, idx: usize) -> Result<&[u8]> {
        match self.cell(idx)? {
            SqlValue::Blob(v) => Ok(v),
            other => Err(FsxError::Sql(format!("column {idx} is {other:?}, wanted blob"))),
        }
    }
}

/// Result of one `exec` call.
#[derive(Debug, Clone, Default)]
pub struct SqlResult {
    pub rows: Vec<SqlRow>,
    pub rows_affected: u64,
    pub last_insert_id: Option<i64>,
}

/// The single-primitive catalog capability.
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    async fn exec(&self, sql: &str, params: &[SqlValue]) -> Result<SqlResult>;
}

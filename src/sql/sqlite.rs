//! SQLite-backed reference implementation of the SQL port.

use std::path::Path;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::Connection;
use rusqlite::types::{Value, ValueRef};

use crate::errors::{FsxError, Result};
use crate::sql::{SqlExecutor, SqlResult, SqlRow, SqlValue};

/// A `rusqlite` connection behind a mutex. Statements execute without
/// suspension, so the lock is never held across an await.
pub struct SqliteExecutor {
    conn: Mutex<Connection>,
}

impl SqliteExecutor {
    /// Private in-memory catalog; state lives and dies with the handle.
    ///
    /// # Errors
    /// `Sql` when the connection cannot be opened.
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self { conn: Mutex::new(Connection::open_in_memory()?) })
    }

    /// File-backed catalog.
    ///
    /// # Errors
    /// `Sql` when the database cannot be opened or created.
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self { conn: Mutex::new(Connection::open(path)?) })
    }
}

fn to_sqlite(value: &SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Int(v) => Value::Integer(*v),
        SqlValue::Text(v) => Value::Text(v.clone()),
        SqlValue::Blob(v) => Value::Blob(v.clone()),
    }
}

fn from_sqlite(value: ValueRef<'_>) -> Result<SqlValue> {
    Ok(match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(v) => SqlValue::Int(v),
        ValueRef::Real(v) => {
            return Err(FsxError::Sql(format!("unexpected real column value {v}")));
        }
        ValueRef::Text(v) => SqlValue::Text(
            std::str::from_utf8(v)
                .map_err(|e| FsxError::Sql(format!("non-utf8 text column: {e}")))?
                .to_string(),
        ),
        ValueRef::Blob(v) => SqlValue::Blob(v.to_vec()),
    })
}

#[async_trait]
impl SqlExecutor for SqliteExecutor {
    async fn exec(&self, sql: &str, params: &[SqlValue]) -> Result<SqlResult> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let args = rusqlite::params_from_iter(params.iter().map(to_sqlite));

        if stmt.column_count() > 0 {
            let mut rows = Vec::new();
            let mut raw = stmt.query(args)?;
            while let Some(row) = raw.next()? {
                let mut cells = Vec::with_capacity(row.as_ref().column_count());
                for idx in 0..row.as_ref().column_count() {
                    cells.push(from_sqlite(row.get_ref(idx)?)?);
                }
                rows.push(SqlRow(cells));
            }
            Ok(SqlResult { rows, rows_affected: 0, last_insert_id: None })
        } else {
            let affected = stmt.execute(args)?;
            Ok(SqlResult {
                rows: Vec::new(),
                rows_affected: affected as u64,
                last_insert_id: Some(conn.last_insert_rowid()),
            })
        }
    }
}

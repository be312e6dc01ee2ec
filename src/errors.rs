use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, FsxError>;

#[derive(Debug, Error)]
pub enum FsxError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid argument: {0}")]
    Invalid(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("timed out: {reason}")]
    TimedOut { reason: String, retry_after_secs: Option<u64> },

    #[error("I/O error: {0}")]
    Io(String),

    #[error("checksum mismatch: {0}")]
    ChecksumMismatch(String),

    #[error("storage not initialized")]
    NotInitialized,

    #[error("catalog error: {0}")]
    Sql(String),
}

impl FsxError {
    /// True for the errors a caller may retry after backing off.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::TimedOut { .. } | Self::Io(_))
    }
}

impl From<std::io::Error> for FsxError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(e.to_string()),
            std::io::ErrorKind::AlreadyExists => Self::AlreadyExists(e.to_string()),
            std::io::ErrorKind::PermissionDenied => Self::AccessDenied(e.to_string()),
            std::io::ErrorKind::TimedOut => {
                Self::TimedOut { reason: e.to_string(), retry_after_secs: None }
            }
            _ => Self::Io(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for FsxError {
    fn from(e: serde_json::Error) -> Self {
        Self::Invalid(format!("JSON: {e}"))
    }
}

impl From<rusqlite::Error> for FsxError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Sql(e.to_string())
    }
}

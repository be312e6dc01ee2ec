#![forbid(unsafe_code)]

//! fsx: an extent-based virtual filesystem core.
//!
//! Small fixed-size database pages are buffered, packed into a handful
//! of large immutable extents in a pluggable blob store, and tracked in
//! a SQL-addressable catalog. Copy-on-write branches share unmodified
//! pages with their parents and resolve reads by walking the branch
//! chain.
//!
//! The crate is a library; hosts install their own logger and supply the
//! blob backend and SQL catalog at construction.

pub mod blob;
pub mod branch;
pub mod errors;
pub mod extent;
pub mod sql;
pub mod storage;

pub use blob::{BackendConfig, BlobStorage, open_backend};
pub use branch::{Branch, BranchManager, Commit};
pub use errors::{FsxError, Result};
pub use sql::{SqlExecutor, SqliteExecutor};
pub use storage::{Compression, ExtentStorage, StorageConfig, StorageStats};

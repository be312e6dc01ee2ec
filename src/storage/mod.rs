//! ExtentStorage: buffers page writes, packs them into immutable extents
//! on flush, and resolves reads across the dirty buffer, the parsed
//! extent cache, and the blob store.

pub mod cache;
pub mod config;
pub mod engine;

pub use cache::{ExtentCache, ExtentCacheSnapshot};
pub use config::{Compression, StorageConfig};
pub use engine::{ExtentStorage, StorageStats};

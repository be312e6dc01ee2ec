use crate::errors::{FsxError, Result};

pub const DEFAULT_PAGE_SIZE: u32 = 4096;
pub const DEFAULT_EXTENT_SIZE: u32 = 2 * 1024 * 1024;
pub const DEFAULT_EXTENT_PREFIX: &str = "extent/";

/// Compression applied to the packed page-data area of new extents.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
}

/// Configuration for one [`crate::storage::ExtentStorage`] instance.
#[derive(Clone, Debug)]
pub struct StorageConfig {
    /// 4096 or 8192; uniform across all files of the instance.
    pub page_size: u32,
    /// Capacity of one extent's page-data area, in bytes.
    pub extent_size: u32,
    pub compression: Compression,
    /// Blob-key prefix for this instance's extents.
    pub extent_prefix: String,
    /// Flush a file automatically once its dirty count reaches the
    /// threshold.
    pub auto_flush: bool,
    /// Defaults to `pages_per_extent` when unset.
    pub flush_threshold: Option<u32>,
    /// Restricts the instance to file ids with this prefix. Set by
    /// branch managers that share one catalog between instances.
    pub file_prefix: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            extent_size: DEFAULT_EXTENT_SIZE,
            compression: Compression::None,
            extent_prefix: DEFAULT_EXTENT_PREFIX.to_string(),
            auto_flush: true,
            flush_threshold: None,
            file_prefix: None,
        }
    }
}

impl StorageConfig {
    /// # Errors
    /// `Invalid` when the page or extent size is unusable.
    pub fn validate(&self) -> Result<()> {
        if !matches!(self.page_size, 4096 | 8192) {
            return Err(FsxError::Invalid(format!(
                "page size {} not supported (4096 or 8192)",
                self.page_size
            )));
        }
        if self.extent_size < self.page_size {
            return Err(FsxError::Invalid(format!(
                "extent size {} smaller than one page ({})",
                self.extent_size, self.page_size
            )));
        }
        Ok(())
    }

    #[must_use]
    pub const fn pages_per_extent(&self) -> u64 {
        (self.extent_size / self.page_size) as u64
    }

    #[must_use]
    pub fn effective_flush_threshold(&self) -> u64 {
        self.flush_threshold.map_or_else(|| self.pages_per_extent(), u64::from)
    }
}

//! File metadata for table files.

use crate::sstable::TableInfo;

/// Metadata about one table file.
///
/// Created when a builder closes successfully and never mutated; versions
/// share it by value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileMeta {
    /// Unique file number within the store.
    pub file_number: u64,
    /// Smallest key in the file.
    pub min_key: u32,
    /// Largest key in the file.
    pub max_key: u32,
    /// File size in bytes.
    pub file_size: u32,
}

impl FileMeta {
    /// Create new file metadata.
    pub fn new(file_number: u64, min_key: u32, max_key: u32, file_size: u32) -> Self {
        Self {
            file_number,
            min_key,
            max_key,
            file_size,
        }
    }

    /// Check if `key` falls in the file's key range.
    pub fn contains(&self, key: u32) -> bool {
        self.min_key <= key && key <= self.max_key
    }

    /// Check if this file overlaps `[min, max]`.
    pub fn overlaps(&self, min: u32, max: u32) -> bool {
        self.min_key <= max && min <= self.max_key
    }
}

impl From<TableInfo> for FileMeta {
    fn from(info: TableInfo) -> Self {
        Self::new(info.file_number, info.min_key, info.max_key, info.file_size)
    }
}

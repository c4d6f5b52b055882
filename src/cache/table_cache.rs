//! Table cache for open table readers.
//!
//! Keeps one shared reader per `(family, file number)` so snapshots and
//! compactions never map the same file twice.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::sstable::Reader;
use crate::util::filename::table_file_path;
use crate::Result;

type CacheKey = (String, u64);

/// Hit/miss counters of a [`TableCache`].
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheStats {
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

/// Cache for open table readers.
pub struct TableCache {
    readers: Mutex<HashMap<CacheKey, Arc<Reader>>>,
    /// Store path; tables live under `<store>/<family>/`.
    store_path: PathBuf,
    stats: CacheStats,
}

impl TableCache {
    /// Create a new table cache.
    ///
    /// # Arguments
    ///
    /// * `store_path` - Path to the store directory
    /// * `capacity` - Initial capacity of the reader map
    pub fn new(store_path: impl AsRef<Path>, capacity: usize) -> Self {
        Self {
            readers: Mutex::new(HashMap::with_capacity(capacity)),
            store_path: store_path.as_ref().to_path_buf(),
            stats: CacheStats::default(),
        }
    }

    /// Get or open the reader of a family's table.
    pub fn get_reader(&self, family: &str, file_number: u64) -> Result<Arc<Reader>> {
        let mut readers = self.readers.lock();
        let key = (family.to_string(), file_number);
        if let Some(reader) = readers.get(&key) {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(reader.clone());
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        let path = table_file_path(&self.store_path.join(family), file_number);
        let reader = Arc::new(Reader::open(&path, file_number)?);
        readers.insert(key, reader.clone());
        Ok(reader)
    }

    /// Drop a table's reader from the cache.
    ///
    /// The mapping is released once every holder drops its handle.
    pub fn evict(&self, family: &str, file_number: u64) {
        self.readers.lock().remove(&(family.to_string(), file_number));
    }

    /// Drop every reader of a family.
    pub fn evict_family(&self, family: &str) {
        self.readers.lock().retain(|(name, _), _| name != family);
    }

    /// Get the number of cached readers.
    pub fn len(&self) -> usize {
        self.readers.lock().len()
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.readers.lock().is_empty()
    }

    /// Get cache statistics.
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Drop all cached readers.
    pub fn close(&self) {
        self.readers.lock().clear();
    }
}

//! Snapshot - a consistent read view of one family.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::cache::TableCache;
use crate::sstable::Reader;
use crate::Result;

use super::{FamilyVersion, Version};

/// A retained version plus the readers opened through it.
///
/// The version stays in its family's active set, and its files stay on
/// disk, until the snapshot is closed or dropped.
pub struct Snapshot {
    family_version: Arc<FamilyVersion>,
    version: Arc<Version>,
    cache: Arc<TableCache>,
    readers: Mutex<HashMap<u64, Arc<Reader>>>,
    closed: AtomicBool,
}

impl Snapshot {
    pub(crate) fn new(
        family_version: Arc<FamilyVersion>,
        version: Arc<Version>,
        cache: Arc<TableCache>,
    ) -> Self {
        Self {
            family_version,
            version,
            cache,
            readers: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// The retained version.
    pub fn version(&self) -> &Arc<Version> {
        &self.version
    }

    /// Name of the family this snapshot reads.
    pub fn family_name(&self) -> &str {
        self.family_version.name()
    }

    /// Get the reader of a file in this snapshot.
    pub fn get_reader(&self, file_number: u64) -> Result<Arc<Reader>> {
        let mut readers = self.readers.lock();
        if let Some(reader) = readers.get(&file_number) {
            return Ok(reader.clone());
        }
        let reader = self
            .cache
            .get_reader(self.family_version.name(), file_number)?;
        readers.insert(file_number, reader.clone());
        Ok(reader)
    }

    /// Readers of every file whose key range contains `key`.
    pub fn find_readers(&self, key: u32) -> Result<Vec<Arc<Reader>>> {
        self.version
            .find_files(key)
            .iter()
            .map(|file| self.get_reader(file.file_number))
            .collect()
    }

    /// Values stored for `key`, one per file holding it.
    pub fn get(&self, key: u32) -> Result<Vec<Bytes>> {
        let mut values = Vec::new();
        for reader in self.find_readers(key)? {
            if let Some(value) = reader.get(key)? {
                values.push(Bytes::copy_from_slice(value));
            }
        }
        Ok(values)
    }

    /// Release the retained version. Safe to call more than once.
    pub fn close(&self) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.readers.lock().clear();
            self.family_version.release(&self.version);
        }
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        self.close();
    }
}

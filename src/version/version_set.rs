//! StoreVersionSet - manifest, counters and family registry of a store.
//!
//! Every metadata change of every family funnels through
//! [`StoreVersionSet::commit_family_edit_log`], which journals it and
//! installs the new version under one lock.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::cache::TableCache;
use crate::util::filename::{
    current_file_path, delete_file, get_current_manifest_number, manifest_file_path,
    set_current_file,
};
use crate::{Error, Result};

use super::{EditLog, FamilyVersion, Log, Manifest};

struct VersionSetInner {
    manifest: Option<Manifest>,
    manifest_file_number: u64,
    family_versions: HashMap<String, Arc<FamilyVersion>>,
    family_ids: HashMap<i32, String>,
}

/// Manages the manifest journal, the store-wide file number counter and
/// the version history of every family.
pub struct StoreVersionSet {
    store_path: PathBuf,
    num_levels: usize,
    cache: Arc<TableCache>,
    /// Next file number to allocate.
    next_file_number: AtomicU64,
    version_ids: Arc<AtomicU64>,
    inner: RwLock<VersionSetInner>,
}

impl StoreVersionSet {
    /// Create a version set for the store at `store_path`.
    pub fn new(store_path: &Path, cache: Arc<TableCache>, num_levels: usize) -> Self {
        Self {
            store_path: store_path.to_path_buf(),
            num_levels,
            cache,
            next_file_number: AtomicU64::new(2), // 1 is reserved for the first manifest
            version_ids: Arc::new(AtomicU64::new(1)),
            inner: RwLock::new(VersionSetInner {
                manifest: None,
                manifest_file_number: 1,
                family_versions: HashMap::new(),
                family_ids: HashMap::new(),
            }),
        }
    }

    /// Get the store path.
    pub fn store_path(&self) -> &Path {
        &self.store_path
    }

    pub fn num_levels(&self) -> usize {
        self.num_levels
    }

    /// Get next file number and increment.
    pub fn new_file_number(&self) -> u64 {
        self.next_file_number.fetch_add(1, Ordering::SeqCst)
    }

    /// Get current next file number without incrementing.
    pub fn next_file_number(&self) -> u64 {
        self.next_file_number.load(Ordering::SeqCst)
    }

    /// Make sure `num` is never handed out again.
    pub fn mark_file_number_used(&self, num: u64) {
        self.next_file_number.fetch_max(num + 1, Ordering::SeqCst);
    }

    /// Number of the manifest currently being written.
    pub fn manifest_file_number(&self) -> u64 {
        self.inner.read().manifest_file_number
    }

    /// Register a family, or return the existing one with that name.
    pub fn create_family_version(&self, name: &str, id: i32) -> Result<Arc<FamilyVersion>> {
        let mut inner = self.inner.write();
        if let Some(family_version) = inner.family_versions.get(name) {
            if family_version.id() != id {
                return Err(Error::InvalidConfiguration(format!(
                    "family {} already registered with id {}",
                    name,
                    family_version.id()
                )));
            }
            return Ok(family_version.clone());
        }
        if let Some(other) = inner.family_ids.get(&id) {
            return Err(Error::InvalidConfiguration(format!(
                "family id {} already used by {}",
                id, other
            )));
        }

        let family_version = Arc::new(FamilyVersion::new(
            id,
            name,
            self.num_levels,
            self.version_ids.clone(),
            self.cache.clone(),
        ));
        inner
            .family_versions
            .insert(name.to_string(), family_version.clone());
        inner.family_ids.insert(id, name.to_string());
        Ok(family_version)
    }

    /// Get a family's version history by name.
    pub fn get_family_version(&self, name: &str) -> Option<Arc<FamilyVersion>> {
        self.inner.read().family_versions.get(name).cloned()
    }

    /// Get a family's version history by id.
    pub fn get_family_version_by_id(&self, id: i32) -> Option<Arc<FamilyVersion>> {
        let inner = self.inner.read();
        let name = inner.family_ids.get(&id)?;
        inner.family_versions.get(name).cloned()
    }

    /// Journal `edit_log` and install it as the family's new current version.
    ///
    /// A `NextFileNumber` entry carrying the current counter is appended
    /// first. Nothing is installed unless the record reached the manifest.
    pub fn commit_family_edit_log(&self, family: &str, mut edit_log: EditLog) -> Result<()> {
        let mut inner = self.inner.write();

        let family_version = inner
            .family_versions
            .get(family)
            .cloned()
            .ok_or_else(|| Error::FamilyNotFound(family.to_string()))?;
        if edit_log.family_id() != family_version.id() {
            return Err(Error::internal(format!(
                "edit log for family id {} committed to family {} (id {})",
                edit_log.family_id(),
                family,
                family_version.id()
            )));
        }

        edit_log.add(Log::NextFileNumber {
            file_number: self.next_file_number(),
        });

        let mut version = family_version.clone_current();
        edit_log.apply(&mut version)?;

        let manifest = inner
            .manifest
            .as_mut()
            .ok_or_else(|| Error::Closed("manifest".into()))?;
        if let Err(e) = manifest.log_edit(&edit_log) {
            self.abandon_manifest(&mut inner);
            return Err(e);
        }

        debug!(
            family,
            version = version.id(),
            logs = edit_log.logs().len(),
            "committed edit log"
        );
        family_version.append_version(version);
        Ok(())
    }

    /// Recover the store's metadata.
    ///
    /// Without a `CURRENT` file a fresh manifest is written. Otherwise the
    /// manifest it names is replayed into the registered families. Either
    /// way the store continues on a new manifest holding one snapshot edit
    /// log per family, and `CURRENT` is switched to it.
    ///
    /// Returns true if existing metadata was replayed.
    pub fn recover(&self) -> Result<bool> {
        let mut inner = self.inner.write();

        let previous = if current_file_path(&self.store_path).exists() {
            let manifest_number = get_current_manifest_number(&self.store_path)?;
            self.replay(&inner, manifest_number)?;
            self.mark_file_number_used(manifest_number);
            Some(manifest_number)
        } else {
            None
        };

        let manifest_number = self.install_manifest(&mut inner)?;

        match previous {
            Some(old_number) => {
                if let Err(e) = delete_file(&manifest_file_path(&self.store_path, old_number)) {
                    warn!(manifest = old_number, error = %e, "failed to remove old manifest");
                }
                info!(
                    store = %self.store_path.display(),
                    families = inner.family_versions.len(),
                    next_file_number = self.next_file_number(),
                    manifest = manifest_number,
                    "recovered store metadata"
                );
            }
            None => {
                info!(
                    store = %self.store_path.display(),
                    manifest = manifest_number,
                    "created new manifest"
                );
            }
        }

        Ok(previous.is_some())
    }

    /// Start a new manifest holding the current state of every family and
    /// point `CURRENT` at it.
    fn install_manifest(&self, inner: &mut VersionSetInner) -> Result<u64> {
        let manifest_number = self.new_file_number();
        let mut manifest = Manifest::create(&self.store_path, manifest_number)?;
        manifest.log_edits(&self.snapshot_edit_logs(inner))?;
        set_current_file(&self.store_path, manifest_number)?;

        if let Some(old) = inner.manifest.replace(manifest) {
            old.close()?;
        }
        inner.manifest_file_number = manifest_number;
        Ok(manifest_number)
    }

    /// Stop writing a manifest whose last append failed.
    ///
    /// Its buffered bytes are dropped unwritten and the store moves to a
    /// fresh manifest. If that fails too, later commits fail with `Closed`.
    fn abandon_manifest(&self, inner: &mut VersionSetInner) {
        if let Some(failed) = inner.manifest.take() {
            failed.discard();
        }
        let failed_number = inner.manifest_file_number;

        match self.install_manifest(inner) {
            Ok(manifest_number) => {
                if let Err(e) = delete_file(&manifest_file_path(&self.store_path, failed_number)) {
                    warn!(manifest = failed_number, error = %e, "failed to remove old manifest");
                }
                warn!(
                    failed = failed_number,
                    manifest = manifest_number,
                    "manifest write failed, switched to a new manifest"
                );
            }
            Err(e) => {
                inner.manifest = None;
                warn!(
                    manifest = failed_number,
                    error = %e,
                    "manifest write failed and no replacement could be created"
                );
            }
        }
    }

    fn replay(&self, inner: &VersionSetInner, manifest_number: u64) -> Result<()> {
        let edit_logs = Manifest::recover(&self.store_path, manifest_number)
            .map_err(|e| e.context(format!("replay manifest {}", manifest_number)))?;

        // Apply to working copies; publish only once the whole journal replayed.
        let mut working = HashMap::new();
        for edit_log in &edit_logs {
            for log in edit_log.logs() {
                match log {
                    Log::NextFileNumber { file_number } => {
                        self.next_file_number
                            .fetch_max(*file_number, Ordering::SeqCst);
                    }
                    Log::NewFile { file, .. } => self.mark_file_number_used(file.file_number),
                    _ => {}
                }
            }
            if edit_log.is_store_log() {
                continue;
            }

            let name = inner.family_ids.get(&edit_log.family_id()).ok_or_else(|| {
                Error::manifest(format!(
                    "edit log for unknown family id {}",
                    edit_log.family_id()
                ))
            })?;
            let version = match working.entry(name.clone()) {
                std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
                std::collections::hash_map::Entry::Vacant(e) => {
                    e.insert(inner.family_versions[name].clone_current())
                }
            };
            edit_log.apply(version)?;
        }

        for (name, version) in working {
            inner.family_versions[&name].append_version(version);
        }
        Ok(())
    }

    fn snapshot_edit_logs(&self, inner: &VersionSetInner) -> Vec<EditLog> {
        let mut names: Vec<&String> = inner.family_versions.keys().collect();
        names.sort();

        let mut edit_logs = Vec::with_capacity(names.len() + 1);
        for name in names {
            let family_version = &inner.family_versions[name];
            let version = family_version.current();
            let mut edit_log = EditLog::new(family_version.id());
            for (level, file) in version.all_files() {
                edit_log.add(Log::NewFile { level, file: *file });
            }
            for (&file_number, &interval) in version.rollup_files() {
                edit_log.add(Log::NewRollupFile {
                    file_number,
                    interval,
                });
            }
            for (&family_id, files) in version.all_reference_files() {
                for &file_number in files {
                    edit_log.add(Log::NewReferenceFile {
                        family_id,
                        file_number,
                    });
                }
            }
            edit_logs.push(edit_log);
        }

        let mut store_log = EditLog::new_store();
        store_log.add(Log::NextFileNumber {
            file_number: self.next_file_number(),
        });
        edit_logs.push(store_log);
        edit_logs
    }

    /// Close the manifest. Later commits fail.
    ///
    /// The file number counter is journaled first, so numbers handed out
    /// since the last commit are not reused after reopening.
    pub fn close(&self) -> Result<()> {
        if let Some(mut manifest) = self.inner.write().manifest.take() {
            let mut store_log = EditLog::new_store();
            store_log.add(Log::NextFileNumber {
                file_number: self.next_file_number(),
            });
            manifest.log_edit(&store_log)?;
            manifest.close()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rollup::Interval;
    use crate::util::filename::{list_files_of_type, read_current_file, FileType};
    use crate::version::FileMeta;
    use tempfile::tempdir;

    fn open(path: &Path) -> StoreVersionSet {
        let cache = Arc::new(TableCache::new(path, 8));
        let vs = StoreVersionSet::new(path, cache, 2);
        vs.create_family_version("f1", 1).unwrap();
        vs.create_family_version("f2", 2).unwrap();
        vs
    }

    fn new_file(level: usize, number: u64, min: u32, max: u32) -> Log {
        Log::NewFile {
            level,
            file: FileMeta::new(number, min, max, 1000),
        }
    }

    #[test]
    fn test_fresh_store() {
        let dir = tempdir().unwrap();
        let vs = open(dir.path());

        assert!(!vs.recover().unwrap());
        assert_eq!(vs.manifest_file_number(), 2);
        assert_eq!(vs.next_file_number(), 3);
        assert_eq!(read_current_file(dir.path()).unwrap(), "MANIFEST-000002");
    }

    #[test]
    fn test_file_numbers() {
        let dir = tempdir().unwrap();
        let vs = open(dir.path());

        let first = vs.new_file_number();
        assert_eq!(vs.new_file_number(), first + 1);

        vs.mark_file_number_used(100);
        assert_eq!(vs.next_file_number(), 101);
        vs.mark_file_number_used(50);
        assert_eq!(vs.next_file_number(), 101);
    }

    #[test]
    fn test_create_family_version() {
        let dir = tempdir().unwrap();
        let vs = open(dir.path());

        let again = vs.create_family_version("f1", 1).unwrap();
        assert!(Arc::ptr_eq(&again, &vs.get_family_version("f1").unwrap()));
        assert!(vs.create_family_version("f1", 9).is_err());
        assert!(vs.create_family_version("f3", 2).is_err());
        assert_eq!(vs.get_family_version_by_id(2).unwrap().name(), "f2");
        assert!(vs.get_family_version("nope").is_none());
    }

    #[test]
    fn test_commit_family_edit_log() {
        let dir = tempdir().unwrap();
        let vs = open(dir.path());
        vs.recover().unwrap();

        let mut edit_log = EditLog::new(1);
        edit_log.add(new_file(0, 10, 1, 5));
        vs.commit_family_edit_log("f1", edit_log).unwrap();

        let current = vs.get_family_version("f1").unwrap().current();
        assert_eq!(current.num_files(0), 1);
        assert_eq!(vs.get_family_version("f2").unwrap().current().total_files(), 0);

        assert!(vs
            .commit_family_edit_log("missing", EditLog::new(1))
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn test_commit_failure_keeps_current() {
        let dir = tempdir().unwrap();
        let vs = open(dir.path());
        vs.recover().unwrap();
        let before = vs.get_family_version("f1").unwrap().current();

        // Level out of range fails to apply.
        let mut bad = EditLog::new(1);
        bad.add(new_file(9, 10, 1, 5));
        assert!(vs.commit_family_edit_log("f1", bad).is_err());

        // Closed manifest fails to persist.
        vs.close().unwrap();
        let mut edit_log = EditLog::new(1);
        edit_log.add(new_file(0, 11, 1, 5));
        assert!(matches!(
            vs.commit_family_edit_log("f1", edit_log),
            Err(Error::Closed(_))
        ));

        let after = vs.get_family_version("f1").unwrap().current();
        assert_eq!(before.id(), after.id());
        assert_eq!(after.total_files(), 0);
    }

    #[test]
    fn test_recover_idempotent() {
        let dir = tempdir().unwrap();
        let next_before;
        {
            let vs = open(dir.path());
            vs.recover().unwrap();

            let n1 = vs.new_file_number();
            let n2 = vs.new_file_number();
            let mut edit_log = EditLog::new(1);
            edit_log.add(new_file(0, n1, 1, 5));
            edit_log.add(new_file(1, n2, 3, 9));
            edit_log.add(Log::NewRollupFile {
                file_number: n1,
                interval: Interval::from_mins(5),
            });
            vs.commit_family_edit_log("f1", edit_log).unwrap();

            let mut edit_log = EditLog::new(2);
            edit_log.add(Log::NewReferenceFile {
                family_id: 1,
                file_number: n2,
            });
            vs.commit_family_edit_log("f2", edit_log).unwrap();

            let mut edit_log = EditLog::new(1);
            edit_log.add(Log::DeleteFile {
                level: 1,
                file_number: n2,
            });
            vs.commit_family_edit_log("f1", edit_log).unwrap();

            next_before = vs.next_file_number();
            vs.close().unwrap();
        }

        for _ in 0..2 {
            let vs = open(dir.path());
            assert!(vs.recover().unwrap());
            assert!(vs.next_file_number() >= next_before);

            let f1 = vs.get_family_version("f1").unwrap().current();
            let files: Vec<(usize, u64)> = f1.all_files().map(|(l, f)| (l, f.file_number)).collect();
            assert_eq!(files.len(), 1);
            assert_eq!(files[0].0, 0);
            assert_eq!(f1.rollup_files().len(), 1);

            let f2 = vs.get_family_version("f2").unwrap().current();
            assert_eq!(f2.reference_files(1).unwrap().len(), 1);
            vs.close().unwrap();
        }

        // Only the latest manifest is kept.
        let manifests = list_files_of_type(dir.path(), FileType::Manifest).unwrap();
        assert_eq!(manifests.len(), 1);
    }

    #[test]
    fn test_close_keeps_uncommitted_file_numbers() {
        let dir = tempdir().unwrap();
        let next_before;
        {
            let vs = open(dir.path());
            vs.recover().unwrap();

            let mut edit_log = EditLog::new(1);
            edit_log.add(new_file(0, vs.new_file_number(), 1, 5));
            vs.commit_family_edit_log("f1", edit_log).unwrap();

            // Handed out but never committed.
            vs.new_file_number();
            vs.new_file_number();
            next_before = vs.next_file_number();
            vs.close().unwrap();
        }

        let vs = open(dir.path());
        vs.recover().unwrap();
        assert!(vs.next_file_number() >= next_before);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_failed_manifest_write_is_never_replayed() {
        use crate::version::ManifestWriter;

        let dir = tempdir().unwrap();
        let (kept, failed);
        {
            let vs = open(dir.path());
            vs.recover().unwrap();
            let first_manifest = vs.manifest_file_number();

            // Appends to /dev/full fail with ENOSPC once flushed.
            let writer = ManifestWriter::new(Path::new("/dev/full"), first_manifest).unwrap();
            vs.inner.write().manifest = Some(Manifest::from_writer(writer, first_manifest));

            failed = vs.new_file_number();
            let mut edit_log = EditLog::new(1);
            edit_log.add(new_file(0, failed, 1, 5));
            assert!(vs.commit_family_edit_log("f1", edit_log).is_err());
            assert_eq!(vs.get_family_version("f1").unwrap().current().total_files(), 0);
            assert_ne!(vs.manifest_file_number(), first_manifest);

            kept = vs.new_file_number();
            let mut edit_log = EditLog::new(1);
            edit_log.add(new_file(0, kept, 10, 20));
            vs.commit_family_edit_log("f1", edit_log).unwrap();
            vs.close().unwrap();
        }

        let vs = open(dir.path());
        vs.recover().unwrap();
        let files: Vec<u64> = vs
            .get_family_version("f1")
            .unwrap()
            .current()
            .all_files()
            .map(|(_, f)| f.file_number)
            .collect();
        assert_eq!(files, vec![kept]);
        assert_ne!(kept, failed);
    }

    #[test]
    fn test_recover_unknown_family() {
        let dir = tempdir().unwrap();
        {
            let vs = open(dir.path());
            vs.recover().unwrap();
            let mut edit_log = EditLog::new(2);
            edit_log.add(new_file(0, 10, 1, 5));
            vs.commit_family_edit_log("f2", edit_log).unwrap();
            vs.close().unwrap();
        }

        let cache = Arc::new(TableCache::new(dir.path(), 8));
        let vs = StoreVersionSet::new(dir.path(), cache, 2);
        vs.create_family_version("f1", 1).unwrap();
        assert!(vs.recover().unwrap_err().is_corruption());
    }
}

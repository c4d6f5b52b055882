//! Store - one directory of families sharing a manifest.
//!
//! The Store is the main entry point. It coordinates:
//! - The directory lock held for the store's lifetime
//! - The `OPTIONS` file describing every family
//! - The version set (manifest, file numbers, versions)
//! - The table reader cache shared by all families
//!
//! # Thread Safety
//!
//! The Store is thread-safe and is shared across threads using Arc.

use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::Write as IoWrite;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::cache::TableCache;
use crate::family::Family;
use crate::merger::MergerRegistry;
use crate::options::{FamilyOptions, StoreOptions};
use crate::util::filename::{
    create_dir_if_missing, lock_file_path, options_file_path, sync_dir, temp_file_path,
    write_file_atomic,
};
use crate::version::StoreVersionSet;
use crate::{Error, Result};

/// Contents of the `OPTIONS` file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreInfo {
    levels: usize,
    #[serde(default)]
    families: Vec<FamilyOptions>,
}

impl StoreInfo {
    fn load(store_path: &Path) -> Result<Option<Self>> {
        let path = options_file_path(store_path);
        if !path.exists() {
            return Ok(None);
        }
        let data = std::fs::read(&path)?;
        let info: StoreInfo = serde_json::from_slice(&data)
            .map_err(|e| Error::from(e).context(format!("read {}", path.display())))?;
        Ok(Some(info))
    }

    fn save(&self, store_path: &Path, temp_number: u64) -> Result<()> {
        let data = serde_json::to_vec_pretty(self)?;
        write_file_atomic(
            &options_file_path(store_path),
            &temp_file_path(store_path, temp_number),
            &data,
        )?;
        sync_dir(store_path)?;
        Ok(())
    }

    fn next_family_id(&self) -> i32 {
        self.families.iter().map(|f| f.id).max().unwrap_or(0) + 1
    }
}

/// An open store.
pub struct Store {
    /// Store directory path.
    path: PathBuf,
    options: StoreOptions,
    version_set: Arc<StoreVersionSet>,
    cache: Arc<TableCache>,
    mergers: Arc<MergerRegistry>,
    families: RwLock<HashMap<String, Arc<Family>>>,
    /// Persisted configuration; also serializes family creation.
    info: Mutex<StoreInfo>,
    /// Lock file handle (kept open to hold the lock).
    lock_file: Mutex<Option<File>>,
    closed: AtomicBool,
}

impl Store {
    /// Open the store at `path`, recovering its families.
    pub fn open(
        path: impl AsRef<Path>,
        options: StoreOptions,
        mergers: Arc<MergerRegistry>,
    ) -> Result<Arc<Self>> {
        options.validate()?;
        let path = path.as_ref().to_path_buf();

        if !path.exists() {
            if options.create_if_missing {
                create_dir_if_missing(&path)?;
            } else {
                return Err(Error::NotFound(format!(
                    "store directory does not exist: {}",
                    path.display()
                )));
            }
        }

        let lock_file = Self::acquire_lock(&path)?;

        let info = match StoreInfo::load(&path)? {
            Some(info) => {
                if info.levels != options.levels {
                    warn!(
                        store = %path.display(),
                        stored = info.levels,
                        requested = options.levels,
                        "using level count from OPTIONS"
                    );
                }
                info
            }
            None => StoreInfo {
                levels: options.levels,
                families: Vec::new(),
            },
        };

        let cache = Arc::new(TableCache::new(&path, options.table_cache_capacity));
        let version_set = Arc::new(StoreVersionSet::new(&path, cache.clone(), info.levels));

        let mut families = HashMap::new();
        for family_options in &info.families {
            if !mergers.contains(&family_options.merger) {
                warn!(
                    family = %family_options.name,
                    merger = %family_options.merger,
                    "merger type not registered"
                );
            }
            let family_version =
                version_set.create_family_version(&family_options.name, family_options.id)?;
            let family = Family::new(
                family_options.clone(),
                family_version,
                version_set.clone(),
                cache.clone(),
                mergers.clone(),
            )?;
            families.insert(family_options.name.clone(), Arc::new(family));
        }

        let recovered = version_set
            .recover()
            .map_err(|e| e.context(format!("recover store {}", path.display())))?;
        if !options_file_path(&path).exists() {
            info.save(&path, version_set.new_file_number())?;
        }

        for family in families.values() {
            family.delete_obsolete_files()?;
        }

        info!(
            store = %path.display(),
            families = families.len(),
            levels = info.levels,
            recovered,
            "opened store"
        );

        Ok(Arc::new(Self {
            path,
            options,
            version_set,
            cache,
            mergers,
            families: RwLock::new(families),
            info: Mutex::new(info),
            lock_file: Mutex::new(Some(lock_file)),
            closed: AtomicBool::new(false),
        }))
    }

    /// Acquire the store lock file.
    fn acquire_lock(store_path: &Path) -> Result<File> {
        let lock_path = lock_file_path(store_path);

        let lock_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&lock_path)
            .map_err(|e| {
                Error::LockError(format!(
                    "failed to open lock file {}: {}",
                    lock_path.display(),
                    e
                ))
            })?;

        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            let fd = lock_file.as_raw_fd();
            let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
            if result != 0 {
                return Err(Error::LockError(format!(
                    "store {} is already locked",
                    store_path.display()
                )));
            }
        }

        #[allow(unused_mut)]
        let mut lock_file = lock_file;
        writeln!(lock_file, "tskv lock").ok();

        Ok(lock_file)
    }

    /// Get the store path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    /// Number of levels of every family, as persisted in `OPTIONS`.
    pub fn num_levels(&self) -> usize {
        self.version_set.num_levels()
    }

    pub fn version_set(&self) -> &Arc<StoreVersionSet> {
        &self.version_set
    }

    pub fn cache(&self) -> &Arc<TableCache> {
        &self.cache
    }

    pub fn mergers(&self) -> &Arc<MergerRegistry> {
        &self.mergers
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Get the family `name`, creating it with `options` if missing.
    ///
    /// A new family's options are written to `OPTIONS` before the family
    /// is constructed. An existing family keeps its stored options.
    pub fn create_family(&self, name: &str, options: FamilyOptions) -> Result<Arc<Family>> {
        if self.is_closed() {
            return Err(Error::Closed(format!("store {}", self.path.display())));
        }
        if let Some(family) = self.get_family(name) {
            return Ok(family);
        }
        validate_family_name(name)?;

        let mut info = self.info.lock();
        // Lost a race with another creator.
        if let Some(family) = self.get_family(name) {
            return Ok(family);
        }

        let mut options = options;
        options.name = name.to_string();
        options.id = info.next_family_id();
        options.validate()?;
        if !self.mergers.contains(&options.merger) {
            return Err(Error::UnknownMerger(options.merger));
        }

        let mut updated = info.clone();
        updated.families.push(options.clone());
        updated
            .save(&self.path, self.version_set.new_file_number())
            .map_err(|e| e.context(format!("create family {}", name)))?;
        *info = updated;

        let family_version = self.version_set.create_family_version(name, options.id)?;
        let family = Arc::new(Family::new(
            options,
            family_version,
            self.version_set.clone(),
            self.cache.clone(),
            self.mergers.clone(),
        )?);
        self.families
            .write()
            .insert(name.to_string(), family.clone());

        info!(store = %self.path.display(), family = name, id = family.id(), "created family");
        Ok(family)
    }

    /// Get a family by name.
    pub fn get_family(&self, name: &str) -> Option<Arc<Family>> {
        self.families.read().get(name).cloned()
    }

    /// All families, sorted by name.
    pub fn families(&self) -> Vec<Arc<Family>> {
        let mut families: Vec<Arc<Family>> = self.families.read().values().cloned().collect();
        families.sort_by(|a, b| a.name().cmp(b.name()));
        families
    }

    /// Run every compaction and rollup whose threshold is met.
    ///
    /// All families are visited; the first error is returned.
    pub fn compact(&self) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }

        let mut first_error = None;
        for family in self.families() {
            if let Err(e) = self.compact_family(&family) {
                warn!(
                    store = %self.path.display(),
                    family = family.name(),
                    error = %e,
                    "background job failed"
                );
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn compact_family(&self, family: &Arc<Family>) -> Result<()> {
        if family.need_compact() {
            family
                .compact()
                .map_err(|e| e.context(format!("compact family {}", family.name())))?;
        }
        if family.need_rollup() {
            let target_name = family.options().rollup_target.clone().unwrap_or_default();
            let target = self
                .get_family(&target_name)
                .ok_or_else(|| Error::FamilyNotFound(target_name.clone()))?;
            family.rollup(&target).map_err(|e| {
                e.context(format!("rollup family {} into {}", family.name(), target_name))
            })?;
        }
        Ok(())
    }

    /// Close the store: the manifest is closed, readers are dropped and the
    /// directory lock is released. Safe to call more than once.
    pub fn close(&self) -> Result<()> {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }

        let result = self.version_set.close();
        self.cache.close();
        self.lock_file.lock().take();
        info!(store = %self.path.display(), "closed store");
        result
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(store = %self.path.display(), error = %e, "failed to close store");
        }
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.path)
            .field("families", &self.families.read().len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn validate_family_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name.starts_with('.')
        || name.contains(|c: char| c == '/' || c == '\\')
    {
        return Err(Error::InvalidConfiguration(format!(
            "invalid family name: {:?}",
            name
        )));
    }
    Ok(())
}

/// Open stores polled by the [`JobScheduler`](crate::scheduler::JobScheduler).
#[derive(Debug, Default)]
pub struct StoreRegistry {
    stores: RwLock<BTreeMap<String, Arc<Store>>>,
}

impl StoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a store under `name`, replacing any previous one.
    pub fn register(&self, name: impl Into<String>, store: Arc<Store>) -> Option<Arc<Store>> {
        self.stores.write().insert(name.into(), store)
    }

    pub fn unregister(&self, name: &str) -> Option<Arc<Store>> {
        self.stores.write().remove(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Store>> {
        self.stores.read().get(name).cloned()
    }

    /// Every registered store, ordered by name.
    pub fn stores(&self) -> Vec<Arc<Store>> {
        self.stores.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.stores.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.read().is_empty()
    }
}

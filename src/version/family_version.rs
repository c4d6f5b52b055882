//! FamilyVersion - the version history of one family.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cache::TableCache;

use super::{Snapshot, Version, VersionId};

struct VersionArena {
    current: VersionId,
    /// Every version with a non-zero reference count, including `current`.
    active: HashMap<VersionId, Arc<Version>>,
}

/// Holds the current version of a family and every older version still
/// retained by a snapshot.
///
/// The `current` slot itself holds one reference, so a version leaves the
/// active set once it is no longer current and every snapshot released it.
pub struct FamilyVersion {
    id: i32,
    name: String,
    num_levels: usize,
    arena: Mutex<VersionArena>,
    /// Version id generator shared across the store.
    version_ids: Arc<AtomicU64>,
    cache: Arc<TableCache>,
}

impl FamilyVersion {
    pub(crate) fn new(
        id: i32,
        name: &str,
        num_levels: usize,
        version_ids: Arc<AtomicU64>,
        cache: Arc<TableCache>,
    ) -> Self {
        let version_id = version_ids.fetch_add(1, Ordering::SeqCst);
        let version = Arc::new(Version::new(version_id, num_levels));
        version.retain();

        let mut active = HashMap::new();
        active.insert(version_id, version);

        Self {
            id,
            name: name.to_string(),
            num_levels,
            arena: Mutex::new(VersionArena {
                current: version_id,
                active,
            }),
            version_ids,
            cache,
        }
    }

    /// Family id.
    pub fn id(&self) -> i32 {
        self.id
    }

    /// Family name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_levels(&self) -> usize {
        self.num_levels
    }

    /// The current version.
    pub fn current(&self) -> Arc<Version> {
        let arena = self.arena.lock();
        Self::current_of(&arena)
    }

    fn current_of(arena: &VersionArena) -> Arc<Version> {
        // The current version is always active.
        arena.active[&arena.current].clone()
    }

    /// Take a snapshot retaining the current version.
    pub fn get_snapshot(self: &Arc<Self>) -> Snapshot {
        let version = {
            let arena = self.arena.lock();
            let version = Self::current_of(&arena);
            version.retain();
            version
        };
        Snapshot::new(self.clone(), version, self.cache.clone())
    }

    /// Ids of every active version.
    pub fn active_version_ids(&self) -> Vec<VersionId> {
        let mut ids: Vec<VersionId> = self.arena.lock().active.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Files referenced by any active version, pending rollups included.
    pub fn live_files(&self) -> HashSet<u64> {
        let arena = self.arena.lock();
        let mut live = HashSet::new();
        for version in arena.active.values() {
            version.collect_live_files(&mut live);
        }
        live
    }

    /// Build an unpublished copy of the current version.
    pub(crate) fn clone_current(&self) -> Version {
        let id = self.version_ids.fetch_add(1, Ordering::SeqCst);
        self.current().clone_version(id)
    }

    /// Publish `version` as the new current version.
    pub(crate) fn append_version(&self, version: Version) {
        let version = Arc::new(version);
        version.retain();

        let old = {
            let mut arena = self.arena.lock();
            let old = std::mem::replace(&mut arena.current, version.id());
            arena.active.insert(version.id(), version);
            arena.active.get(&old).cloned()
        };

        if let Some(old) = old {
            self.release(&old);
        }
    }

    /// Release a version; it leaves the active set once unreferenced and
    /// no longer current.
    pub(crate) fn release(&self, version: &Version) {
        if version.release() > 0 {
            return;
        }

        let mut arena = self.arena.lock();
        if arena.current != version.id() && version.refs() == 0 {
            arena.active.remove(&version.id());
        }
    }
}

impl std::fmt::Debug for FamilyVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FamilyVersion")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("active", &self.active_version_ids())
            .finish()
    }
}

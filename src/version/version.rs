//! Version - immutable snapshot of a family's files.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::compaction::Compaction;
use crate::rollup::Interval;
use crate::{Error, Result};

use super::FileMeta;

/// Monotonic id of a version within a store.
pub type VersionId = u64;

/// Files of one level, keyed by file number.
#[derive(Debug, Clone, Default)]
pub struct Level {
    files: BTreeMap<u64, FileMeta>,
}

impl Level {
    /// Files in ascending file-number order.
    pub fn files(&self) -> impl Iterator<Item = &FileMeta> {
        self.files.values()
    }

    pub fn get(&self, file_number: u64) -> Option<&FileMeta> {
        self.files.get(&file_number)
    }

    pub fn num_files(&self) -> usize {
        self.files.len()
    }

    /// Total size of the level's files in bytes.
    pub fn total_size(&self) -> u64 {
        self.files.values().map(|f| f.file_size as u64).sum()
    }

    /// Files whose key range overlaps `[min, max]`.
    pub fn overlapping(&self, min: u32, max: u32) -> Vec<FileMeta> {
        self.files
            .values()
            .filter(|f| f.overlaps(min, max))
            .copied()
            .collect()
    }
}

/// An immutable snapshot of which files exist at which level.
///
/// Versions are built by cloning the current version and applying an
/// edit log, then published behind an `Arc`. The reference count tracks
/// snapshots (and the family's `current` slot) holding the version.
#[derive(Debug)]
pub struct Version {
    id: VersionId,
    levels: Vec<Level>,
    /// Own files still owing a rollup, with their target interval.
    rollup_files: BTreeMap<u64, Interval>,
    /// Source family id to the source files already rolled into this family.
    reference_files: BTreeMap<i32, BTreeSet<u64>>,
    refs: AtomicUsize,
}

impl Version {
    /// Create an empty version.
    pub fn new(id: VersionId, num_levels: usize) -> Self {
        Self {
            id,
            levels: vec![Level::default(); num_levels],
            rollup_files: BTreeMap::new(),
            reference_files: BTreeMap::new(),
            refs: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> VersionId {
        self.id
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    pub fn levels(&self) -> &[Level] {
        &self.levels
    }

    /// Get a level; out-of-range levels read as empty.
    pub fn level(&self, level: usize) -> Option<&Level> {
        self.levels.get(level)
    }

    /// Get number of files at a level.
    pub fn num_files(&self, level: usize) -> usize {
        self.levels.get(level).map_or(0, Level::num_files)
    }

    /// Get total number of files across all levels.
    pub fn total_files(&self) -> usize {
        self.levels.iter().map(Level::num_files).sum()
    }

    /// Iterate every file with its level.
    pub fn all_files(&self) -> impl Iterator<Item = (usize, &FileMeta)> {
        self.levels
            .iter()
            .enumerate()
            .flat_map(|(level, files)| files.files().map(move |f| (level, f)))
    }

    /// Files whose key range contains `key`, level by level.
    pub fn find_files(&self, key: u32) -> Vec<FileMeta> {
        self.all_files()
            .filter(|(_, f)| f.contains(key))
            .map(|(_, f)| *f)
            .collect()
    }

    pub fn rollup_files(&self) -> &BTreeMap<u64, Interval> {
        &self.rollup_files
    }

    /// Source files of `family_id` already rolled into this family.
    pub fn reference_files(&self, family_id: i32) -> Option<&BTreeSet<u64>> {
        self.reference_files.get(&family_id)
    }

    pub fn all_reference_files(&self) -> &BTreeMap<i32, BTreeSet<u64>> {
        &self.reference_files
    }

    /// Add every file this version keeps alive to `live`.
    pub fn collect_live_files(&self, live: &mut HashSet<u64>) {
        live.extend(self.all_files().map(|(_, f)| f.file_number));
        live.extend(self.rollup_files.keys().copied());
    }

    /// Copy every file reference into a new version with a fresh id.
    pub fn clone_version(&self, id: VersionId) -> Version {
        Version {
            id,
            levels: self.levels.clone(),
            rollup_files: self.rollup_files.clone(),
            reference_files: self.reference_files.clone(),
            refs: AtomicUsize::new(0),
        }
    }

    /// Pick a level-0 compaction once level 0 holds `threshold` files.
    ///
    /// All level-0 files are inputs. Level-1 inputs are the files
    /// overlapping any single level-0 file's own range, so level-1 files
    /// that only fall inside the union of those ranges are left out.
    pub fn pick_l0_compaction(&self, family_id: i32, threshold: usize) -> Option<Compaction> {
        let level0 = self.levels.first()?;
        if level0.num_files() == 0 || level0.num_files() < threshold {
            return None;
        }

        let level_inputs: Vec<FileMeta> = level0.files().copied().collect();
        let mut level_up_inputs = BTreeMap::new();
        if let Some(level1) = self.levels.get(1) {
            for file in &level_inputs {
                for up in level1.overlapping(file.min_key, file.max_key) {
                    level_up_inputs.insert(up.file_number, up);
                }
            }
        }

        Some(Compaction::new(
            family_id,
            0,
            level_inputs,
            level_up_inputs.into_values().collect(),
        ))
    }

    pub(crate) fn add_file(&mut self, level: usize, file: FileMeta) -> Result<()> {
        let num_levels = self.levels.len();
        let target = self.levels.get_mut(level).ok_or_else(|| {
            Error::corruption(format!(
                "file {} added at level {} but family has {} levels",
                file.file_number, level, num_levels
            ))
        })?;
        target.files.insert(file.file_number, file);
        Ok(())
    }

    pub(crate) fn delete_file(&mut self, level: usize, file_number: u64) -> Result<()> {
        let num_levels = self.levels.len();
        let target = self.levels.get_mut(level).ok_or_else(|| {
            Error::corruption(format!(
                "file {} deleted from level {} but family has {} levels",
                file_number, level, num_levels
            ))
        })?;
        target.files.remove(&file_number);
        Ok(())
    }

    pub(crate) fn add_rollup_file(&mut self, file_number: u64, interval: Interval) {
        self.rollup_files.insert(file_number, interval);
    }

    pub(crate) fn delete_rollup_file(&mut self, file_number: u64) {
        self.rollup_files.remove(&file_number);
    }

    pub(crate) fn add_reference_file(&mut self, family_id: i32, file_number: u64) {
        self.reference_files
            .entry(family_id)
            .or_default()
            .insert(file_number);
    }

    pub(crate) fn delete_reference_file(&mut self, family_id: i32, file_number: u64) {
        if let Some(files) = self.reference_files.get_mut(&family_id) {
            files.remove(&file_number);
            if files.is_empty() {
                self.reference_files.remove(&family_id);
            }
        }
    }

    /// Current reference count.
    pub fn refs(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    /// Increment the reference count, returning the new count.
    pub(crate) fn retain(&self) -> usize {
        self.refs.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrement the reference count, returning the new count.
    pub(crate) fn release(&self) -> usize {
        let prev = self
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .unwrap_or(0);
        prev.saturating_sub(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version_with(files: &[(usize, u64, u32, u32)]) -> Version {
        let mut version = Version::new(1, 2);
        for &(level, number, min, max) in files {
            version
                .add_file(level, FileMeta::new(number, min, max, 100))
                .unwrap();
        }
        version
    }

    #[test]
    fn test_find_files() {
        let version = version_with(&[(0, 1, 1, 10), (0, 2, 5, 20), (1, 3, 15, 30)]);

        let numbers = |key| -> Vec<u64> {
            version
                .find_files(key)
                .into_iter()
                .map(|f| f.file_number)
                .collect()
        };
        assert_eq!(numbers(7), vec![1, 2]);
        assert_eq!(numbers(16), vec![2, 3]);
        assert_eq!(numbers(31), Vec::<u64>::new());
    }

    #[test]
    fn test_clone_version_is_independent() {
        let mut version = version_with(&[(0, 1, 1, 10)]);
        version.add_rollup_file(1, Interval::from_mins(5));
        version.add_reference_file(4, 9);

        let mut clone = version.clone_version(2);
        assert_eq!(clone.id(), 2);
        assert_eq!(clone.num_files(0), 1);
        assert_eq!(clone.rollup_files().len(), 1);
        assert!(clone.reference_files(4).unwrap().contains(&9));
        assert_eq!(clone.refs(), 0);

        clone.delete_file(0, 1).unwrap();
        clone.delete_reference_file(4, 9);
        assert_eq!(clone.num_files(0), 0);
        assert!(clone.reference_files(4).is_none());
        assert_eq!(version.num_files(0), 1);
        assert!(version.reference_files(4).is_some());
    }

    #[test]
    fn test_pick_l0_compaction_per_file_overlap() {
        let version = version_with(&[
            (0, 1, 1, 10),
            (0, 2, 1000, 1001),
            (1, 3, 1, 5),
            (1, 4, 100, 200),
            (1, 5, 400, 500),
        ]);

        let compaction = version.pick_l0_compaction(1, 1).unwrap();
        assert_eq!(compaction.level(), Some(0));

        let inputs: Vec<u64> = compaction.level_inputs().iter().map(|f| f.file_number).collect();
        assert_eq!(inputs, vec![1, 2]);

        let up: Vec<u64> = compaction
            .level_up_inputs()
            .iter()
            .map(|f| f.file_number)
            .collect();
        assert_eq!(up, vec![3]);
    }

    #[test]
    fn test_pick_l0_compaction_dedups_level_up() {
        let version = version_with(&[(0, 1, 1, 10), (0, 2, 5, 15), (1, 3, 8, 9)]);

        let compaction = version.pick_l0_compaction(1, 2).unwrap();
        assert_eq!(compaction.level_up_inputs().len(), 1);
    }

    #[test]
    fn test_pick_l0_compaction_threshold() {
        let version = version_with(&[(0, 1, 1, 10), (0, 2, 5, 20)]);
        assert!(version.pick_l0_compaction(1, 3).is_none());
        assert!(version.pick_l0_compaction(1, 2).is_some());

        let empty = Version::new(1, 2);
        assert!(empty.pick_l0_compaction(1, 0).is_none());
    }

    #[test]
    fn test_live_files() {
        let mut version = version_with(&[(0, 1, 1, 10), (1, 2, 1, 10)]);
        version.add_rollup_file(7, Interval::from_hours(1));

        let mut live = HashSet::new();
        version.collect_live_files(&mut live);
        assert_eq!(live, HashSet::from([1, 2, 7]));
    }

    #[test]
    fn test_ref_counting() {
        let version = Version::new(1, 2);
        assert_eq!(version.retain(), 1);
        assert_eq!(version.retain(), 2);
        assert_eq!(version.release(), 1);
        assert_eq!(version.release(), 0);
        // Never goes negative.
        assert_eq!(version.release(), 0);
    }

    #[test]
    fn test_level_stats() {
        let version = version_with(&[(0, 1, 1, 10), (0, 2, 5, 20)]);
        let level0 = version.level(0).unwrap();
        assert_eq!(level0.num_files(), 2);
        assert_eq!(level0.total_size(), 200);
        assert_eq!(level0.overlapping(11, 12).len(), 1);
        assert!(version.level(5).is_none());
        assert_eq!(version.num_files(5), 0);
    }
}

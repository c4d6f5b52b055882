//! Family - one independently compacted namespace of a store.
//!
//! A family owns a directory of table files and a version history. Data is
//! written as whole level-0 files through a [`TableFlusher`]; background
//! compaction merges level 0 into level 1 with the family's merger, and a
//! rollup re-merges the family's new files into a coarser target family.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::cache::TableCache;
use crate::compaction::{CompactJob, Compaction, CompactionStats};
use crate::merger::{Flusher, Merger, MergerConfig, MergerRegistry};
use crate::options::FamilyOptions;
use crate::rollup::{pending_group, Rollup, RollupContext};
use crate::sstable::Builder;
use crate::util::filename::{
    create_dir_if_missing, delete_file, list_files_of_type, table_file_path, FileType,
};
use crate::version::{EditLog, FamilyVersion, FileMeta, Log, Snapshot, StoreVersionSet};
use crate::{Error, Result};

/// Background job a family is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum JobState {
    Idle = 0,
    CompactionRunning = 1,
    RollupRunning = 2,
}

impl JobState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => JobState::CompactionRunning,
            2 => JobState::RollupRunning,
            _ => JobState::Idle,
        }
    }
}

/// Resets the family to idle when the job ends.
struct JobGuard<'a> {
    state: &'a AtomicU8,
}

impl Drop for JobGuard<'_> {
    fn drop(&mut self) {
        self.state.store(JobState::Idle as u8, Ordering::Release);
    }
}

/// File count and size of one level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelStats {
    pub level: usize,
    pub num_files: usize,
    pub total_size: u64,
}

/// A family of a store.
pub struct Family {
    id: i32,
    name: String,
    path: PathBuf,
    options: FamilyOptions,
    family_version: Arc<FamilyVersion>,
    version_set: Arc<StoreVersionSet>,
    cache: Arc<TableCache>,
    mergers: Arc<MergerRegistry>,
    /// File numbers being written but not yet committed.
    pending_outputs: Mutex<HashSet<u64>>,
    job: AtomicU8,
}

impl Family {
    pub(crate) fn new(
        options: FamilyOptions,
        family_version: Arc<FamilyVersion>,
        version_set: Arc<StoreVersionSet>,
        cache: Arc<TableCache>,
        mergers: Arc<MergerRegistry>,
    ) -> Result<Self> {
        let path = version_set.store_path().join(&options.name);
        create_dir_if_missing(&path)?;

        Ok(Self {
            id: options.id,
            name: options.name.clone(),
            path,
            options,
            family_version,
            version_set,
            cache,
            mergers,
            pending_outputs: Mutex::new(HashSet::new()),
            job: AtomicU8::new(JobState::Idle as u8),
        })
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Directory holding the family's tables.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn options(&self) -> &FamilyOptions {
        &self.options
    }

    pub fn family_version(&self) -> &Arc<FamilyVersion> {
        &self.family_version
    }

    /// Get a consistent read view of the family.
    pub fn get_snapshot(&self) -> Snapshot {
        self.family_version.get_snapshot()
    }

    /// Get a flusher writing one new level-0 file per commit.
    pub fn new_flusher(self: &Arc<Self>) -> TableFlusher {
        TableFlusher {
            family: self.clone(),
            builder: None,
        }
    }

    pub fn job_state(&self) -> JobState {
        JobState::from_u8(self.job.load(Ordering::Acquire))
    }

    /// Number of outputs being written.
    pub fn pending_outputs(&self) -> usize {
        self.pending_outputs.lock().len()
    }

    /// File counts and sizes of every level of the current version.
    pub fn level_stats(&self) -> Vec<LevelStats> {
        let current = self.family_version.current();
        current
            .levels()
            .iter()
            .enumerate()
            .map(|(level, files)| LevelStats {
                level,
                num_files: files.num_files(),
                total_size: files.total_size(),
            })
            .collect()
    }

    /// Open a builder on a new file, registered as a pending output.
    pub(crate) fn new_table_builder(&self) -> Result<Builder> {
        let file_number = self.version_set.new_file_number();
        self.add_pending_output(file_number);
        match Builder::new(&table_file_path(&self.path, file_number), file_number) {
            Ok(builder) => Ok(builder),
            Err(e) => {
                self.remove_pending_output(file_number);
                Err(e)
            }
        }
    }

    pub(crate) fn add_pending_output(&self, file_number: u64) {
        self.pending_outputs.lock().insert(file_number);
    }

    pub(crate) fn remove_pending_output(&self, file_number: u64) {
        self.pending_outputs.lock().remove(&file_number);
    }

    /// Journal and install an edit log of this family.
    pub(crate) fn commit_edit_log(&self, edit_log: EditLog) -> Result<()> {
        self.version_set.commit_family_edit_log(&self.name, edit_log)
    }

    pub(crate) fn new_merger(&self, flusher: Box<dyn Flusher>) -> Result<Box<dyn Merger>> {
        self.mergers.create(&self.options.merger, flusher)
    }

    fn try_begin(&self, job: JobState) -> Option<JobGuard<'_>> {
        self.job
            .compare_exchange(
                JobState::Idle as u8,
                job as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .ok()
            .map(|_| JobGuard { state: &self.job })
    }

    /// Check if level 0 holds enough files to compact.
    pub fn need_compact(&self) -> bool {
        self.job_state() == JobState::Idle
            && self.family_version.current().num_files(0) >= self.options.compact_threshold
    }

    /// Compact level 0 into level 1 if the threshold is met.
    ///
    /// Returns `None` when nothing was done, including when another job of
    /// this family is running.
    pub fn compact(self: &Arc<Self>) -> Result<Option<CompactionStats>> {
        let _job = match self.try_begin(JobState::CompactionRunning) {
            Some(job) => job,
            None => return Ok(None),
        };

        let snapshot = self.get_snapshot();
        let compaction = match snapshot
            .version()
            .pick_l0_compaction(self.id, self.options.compact_threshold)
        {
            Some(compaction) => compaction,
            None => return Ok(None),
        };

        let stats = CompactJob::new(self, compaction, &snapshot, MergerConfig::Compaction).run()?;
        snapshot.close();
        self.sweep_obsolete_files();
        Ok(Some(stats))
    }

    /// Check if enough files are pending rollup.
    pub fn need_rollup(&self) -> bool {
        self.options.rollup().is_some()
            && self.job_state() == JobState::Idle
            && self.family_version.current().rollup_files().len() >= self.options.rollup_threshold
    }

    /// Roll every file pending rollup into `target`.
    ///
    /// Returns false when nothing was pending or another job was running.
    pub fn rollup(self: &Arc<Self>, target: &Arc<Family>) -> Result<bool> {
        let rollup = self.options.rollup().ok_or_else(|| {
            Error::Rollup(format!("family {} has no rollup target", self.name))
        })?;
        if rollup.target_family != target.name() {
            return Err(Error::Rollup(format!(
                "family {} rolls up into {}, not {}",
                self.name,
                rollup.target_family,
                target.name()
            )));
        }

        let _job = match self.try_begin(JobState::RollupRunning) {
            Some(job) => job,
            None => return Ok(false),
        };

        let current = self.family_version.current();
        let (interval, files) = match pending_group(current.rollup_files())? {
            Some(group) => group,
            None => return Ok(false),
        };
        drop(current);
        if interval != rollup.target_interval {
            return Err(Error::Rollup(format!(
                "family {} has no rollup relation for interval {}",
                self.name, interval
            )));
        }

        target.do_rollup_work(self, &rollup, &files)?;

        let mut edit_log = EditLog::new(self.id);
        for &file_number in &files {
            edit_log.add(Log::DeleteRollupFile { file_number });
        }
        self.commit_edit_log(edit_log)?;
        target.remove_references(self.id, &files)?;

        info!(
            source = %self.name,
            target = target.name(),
            interval = %interval,
            files = files.len(),
            "rollup finished"
        );
        self.sweep_obsolete_files();
        Ok(true)
    }

    /// Merge `files` of `source` into this family.
    ///
    /// Files already recorded as rolled into this family are skipped, so a
    /// rollup interrupted after this step never double-counts on retry.
    pub(crate) fn do_rollup_work(
        self: &Arc<Self>,
        source: &Family,
        rollup: &Rollup,
        files: &[u64],
    ) -> Result<Option<CompactionStats>> {
        let current = self.family_version.current();
        let done = current.reference_files(source.id());
        let todo: Vec<u64> = files
            .iter()
            .copied()
            .filter(|f| !done.map_or(false, |done| done.contains(f)))
            .collect();
        drop(current);

        if todo.is_empty() {
            debug!(
                source = source.name(),
                target = %self.name,
                "files already rolled up"
            );
            return Ok(None);
        }

        let snapshot = source.get_snapshot();
        let inputs = todo
            .iter()
            .map(|&file_number| {
                let reader = snapshot.get_reader(file_number)?;
                Ok(FileMeta::new(
                    file_number,
                    reader.min_key(),
                    reader.max_key(),
                    reader.file_size(),
                ))
            })
            .collect::<Result<Vec<_>>>()?;

        let compaction = Compaction::new_rollup(self.id, source.id(), inputs);
        let config = MergerConfig::Rollup(RollupContext::new(source.name(), rollup));
        let stats = CompactJob::new(self, compaction, &snapshot, config).run()?;
        Ok(Some(stats))
    }

    /// Drop the record of `files` of `source_id` having been rolled in.
    fn remove_references(&self, source_id: i32, files: &[u64]) -> Result<()> {
        let mut edit_log = EditLog::new(self.id);
        for &file_number in files {
            edit_log.add(Log::DeleteReferenceFile {
                family_id: source_id,
                file_number,
            });
        }
        self.commit_edit_log(edit_log)
    }

    /// Sweep after a committed job. Failures are logged and left to the
    /// next sweep.
    fn sweep_obsolete_files(&self) {
        if let Err(e) = self.delete_obsolete_files() {
            warn!(family = %self.name, error = %e, "failed to sweep obsolete files");
        }
    }

    /// Delete table files no active version, pending rollup or running job
    /// refers to. Returns the number of files deleted.
    pub fn delete_obsolete_files(&self) -> Result<usize> {
        // List first: anything created afterwards is never considered.
        let on_disk = list_files_of_type(&self.path, FileType::Table)?;

        // Pending outputs before versions; an output leaves the pending
        // set only after its version is installed.
        let mut live: HashSet<u64> = self.pending_outputs.lock().iter().copied().collect();
        live.extend(self.family_version.live_files());

        let mut deleted = 0;
        for file_number in on_disk {
            if live.contains(&file_number) {
                continue;
            }
            self.cache.evict(&self.name, file_number);
            match delete_file(&table_file_path(&self.path, file_number)) {
                Ok(()) => deleted += 1,
                Err(e) => warn!(
                    family = %self.name,
                    file = file_number,
                    error = %e,
                    "failed to delete obsolete file"
                ),
            }
        }
        if deleted > 0 {
            info!(family = %self.name, deleted, "deleted obsolete files");
        }
        Ok(deleted)
    }
}

impl std::fmt::Debug for Family {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Family")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("job", &self.job_state())
            .finish()
    }
}

/// Writes one level-0 file per commit.
///
/// Keys must be added in strictly increasing order. Dropping the flusher
/// with uncommitted records discards them.
pub struct TableFlusher {
    family: Arc<Family>,
    builder: Option<Builder>,
}

impl TableFlusher {
    fn finish(&mut self, builder: Builder) -> Result<()> {
        let file_number = builder.file_number();
        let result = builder.close().and_then(|info| {
            let file: FileMeta = info.into();
            let mut edit_log = EditLog::new(self.family.id);
            edit_log.add(Log::NewFile { level: 0, file });
            if let Some(interval) = self.family.options.rollup_interval {
                edit_log.add(Log::NewRollupFile {
                    file_number,
                    interval,
                });
            }
            self.family.commit_edit_log(edit_log).map_err(|e| {
                let _ = delete_file(&table_file_path(&self.family.path, file_number));
                e
            })
        });
        self.family.remove_pending_output(file_number);
        result
    }
}

impl Flusher for TableFlusher {
    fn add(&mut self, key: u32, value: &[u8]) -> Result<()> {
        if self.builder.is_none() {
            self.builder = Some(self.family.new_table_builder()?);
        }
        match self.builder.as_mut() {
            Some(builder) => builder.add(key, value),
            None => Err(Error::internal("flusher has no builder")),
        }
    }

    /// Write the added records as a new level-0 file. A commit with no
    /// records is a no-op.
    fn commit(&mut self) -> Result<()> {
        match self.builder.take() {
            Some(builder) => self.finish(builder),
            None => Ok(()),
        }
    }
}

impl Drop for TableFlusher {
    fn drop(&mut self) {
        if let Some(builder) = self.builder.take() {
            let file_number = builder.file_number();
            if let Err(e) = builder.abandon() {
                warn!(family = %self.family.name, error = %e, "failed to abandon flusher");
            }
            self.family.remove_pending_output(file_number);
        }
    }
}

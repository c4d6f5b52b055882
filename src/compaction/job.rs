//! CompactJob - runs one compaction or rollup.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::family::Family;
use crate::merger::{Flusher, Merger, MergerConfig};
use crate::sstable::{Builder, Reader};
use crate::util::filename::{delete_file, table_file_path};
use crate::version::{FileMeta, Snapshot};
use crate::Result;

use super::{Compaction, CompactionStats, MergedIterator};

/// Output side of a running job.
///
/// Opens a builder on the first record and rotates it once it reaches the
/// family's maximum file size. Every file number it allocates stays a
/// pending output of the family until the job commits or aborts.
pub(crate) struct CompactionState {
    family: Arc<Family>,
    max_file_size: u64,
    builder: Option<Builder>,
    outputs: Vec<FileMeta>,
    pending: Vec<u64>,
}

impl CompactionState {
    pub(crate) fn new(family: Arc<Family>) -> Self {
        Self {
            max_file_size: family.options().max_file_size as u64,
            family,
            builder: None,
            outputs: Vec::new(),
            pending: Vec::new(),
        }
    }

    fn add(&mut self, key: u32, value: &[u8]) -> Result<()> {
        if self.builder.is_none() {
            let builder = self.family.new_table_builder()?;
            self.pending.push(builder.file_number());
            self.builder = Some(builder);
        }

        if let Some(builder) = self.builder.as_mut() {
            builder.add(key, value)?;
            if builder.size() >= self.max_file_size {
                self.finish_output()?;
            }
        }
        Ok(())
    }

    /// Close the open output, if any.
    fn finish_output(&mut self) -> Result<()> {
        let builder = match self.builder.take() {
            Some(builder) => builder,
            None => return Ok(()),
        };
        if builder.count() == 0 {
            return builder.abandon();
        }
        let info = builder.close()?;
        debug!(
            family = self.family.name(),
            file = info.file_number,
            records = info.count,
            size = info.file_size,
            "finished compaction output"
        );
        self.outputs.push(info.into());
        Ok(())
    }

    fn outputs(&self) -> &[FileMeta] {
        &self.outputs
    }

    /// Forget the pending outputs once the outputs are committed.
    fn release(&mut self) {
        for file_number in self.pending.drain(..) {
            self.family.remove_pending_output(file_number);
        }
    }

    /// Remove every output of a failed job.
    fn abandon(&mut self) {
        if let Some(builder) = self.builder.take() {
            if let Err(e) = builder.abandon() {
                warn!(family = self.family.name(), error = %e, "failed to abandon builder");
            }
        }
        for file in self.outputs.drain(..) {
            let path = table_file_path(self.family.path(), file.file_number);
            if let Err(e) = delete_file(&path) {
                warn!(
                    family = self.family.name(),
                    file = file.file_number,
                    error = %e,
                    "failed to remove compaction output"
                );
            }
        }
        self.release();
    }
}

/// Flusher handed to the merger; writes into the job's outputs.
pub(crate) struct CompactFlusher {
    state: Rc<RefCell<CompactionState>>,
}

impl CompactFlusher {
    pub(crate) fn new(state: Rc<RefCell<CompactionState>>) -> Self {
        Self { state }
    }
}

impl Flusher for CompactFlusher {
    fn add(&mut self, key: u32, value: &[u8]) -> Result<()> {
        self.state.borrow_mut().add(key, value)
    }

    fn commit(&mut self) -> Result<()> {
        self.state.borrow_mut().finish_output()
    }
}

/// Executes a [`Compaction`] for a family.
///
/// Inputs are read through `snapshot`, which for a rollup belongs to the
/// source family. Outputs are always written to `family`.
pub struct CompactJob<'a> {
    family: &'a Arc<Family>,
    compaction: Compaction,
    snapshot: &'a Snapshot,
    config: MergerConfig,
}

impl<'a> CompactJob<'a> {
    pub fn new(
        family: &'a Arc<Family>,
        compaction: Compaction,
        snapshot: &'a Snapshot,
        config: MergerConfig,
    ) -> Self {
        Self {
            family,
            compaction,
            snapshot,
            config,
        }
    }

    /// Run the job and commit its edit log.
    pub fn run(self) -> Result<CompactionStats> {
        let start = Instant::now();
        let family = self.family;
        let mut stats = CompactionStats {
            num_input_files: self.compaction.num_input_files(),
            bytes_read: self.compaction.inputs().map(|f| f.file_size as u64).sum(),
            ..Default::default()
        };

        info!(
            family = family.name(),
            source = self.snapshot.family_name(),
            level = ?self.compaction.level(),
            inputs = stats.num_input_files,
            "compaction started"
        );

        let result = if self.compaction.is_trivial_move() {
            self.move_compaction(&mut stats)
        } else {
            self.merge_compaction(&mut stats)
        };

        stats.elapsed_ms = start.elapsed().as_millis() as u64;
        match &result {
            Ok(()) => info!(
                family = family.name(),
                inputs = stats.num_input_files,
                outputs = stats.num_output_files,
                trivial_move = stats.trivial_move,
                keys = stats.keys_merged,
                dropped = stats.keys_dropped,
                bytes_written = stats.bytes_written,
                elapsed_ms = stats.elapsed_ms,
                "compaction finished"
            ),
            Err(e) => warn!(family = family.name(), error = %e, "compaction failed"),
        }
        result.map(|()| stats)
    }

    /// Move the single input down one level without rewriting it.
    fn move_compaction(mut self, stats: &mut CompactionStats) -> Result<()> {
        self.compaction.mark_trivial_move();
        self.family.commit_edit_log(self.compaction.into_edit_log())?;
        stats.trivial_move = true;
        stats.num_output_files = 1;
        Ok(())
    }

    fn merge_compaction(mut self, stats: &mut CompactionStats) -> Result<()> {
        let state = Rc::new(RefCell::new(CompactionState::new(self.family.clone())));

        let result = self.merge_inputs(&state, stats).and_then(|()| {
            let mut state = state.borrow_mut();
            state.finish_output()?;
            self.compaction.mark_merged(state.outputs());
            stats.num_output_files = state.outputs().len();
            stats.bytes_written = state.outputs().iter().map(|f| f.file_size as u64).sum();
            Ok(())
        });
        let result = result.and_then(|()| {
            self.family
                .commit_edit_log(self.compaction.edit_log().clone())
        });

        let mut state = state.borrow_mut();
        match result {
            Ok(()) => {
                state.release();
                Ok(())
            }
            Err(e) => {
                state.abandon();
                Err(e)
            }
        }
    }

    fn merge_inputs(
        &self,
        state: &Rc<RefCell<CompactionState>>,
        stats: &mut CompactionStats,
    ) -> Result<()> {
        let readers: Vec<Arc<Reader>> = self
            .compaction
            .inputs()
            .map(|file| self.snapshot.get_reader(file.file_number))
            .collect::<Result<_>>()?;

        let flusher = Box::new(CompactFlusher::new(state.clone()));
        let mut merger = self.family.new_merger(flusher)?;
        merger.init(&self.config)?;

        let iter = MergedIterator::new(readers.iter().map(|r| r.iter()).collect())?;
        let mut current: Option<u32> = None;
        let mut values: Vec<&[u8]> = Vec::new();

        for entry in iter {
            let entry = entry?;
            stats.records_read += 1;
            if current != Some(entry.key) {
                if let Some(key) = current {
                    merge_key(merger.as_mut(), state, key, &values, stats)?;
                }
                values.clear();
                current = Some(entry.key);
            }
            values.push(entry.value);
        }
        if let Some(key) = current {
            merge_key(merger.as_mut(), state, key, &values, stats)?;
        }
        Ok(())
    }
}

fn merge_key(
    merger: &mut dyn Merger,
    state: &Rc<RefCell<CompactionState>>,
    key: u32,
    values: &[&[u8]],
    stats: &mut CompactionStats,
) -> Result<()> {
    let merged = merger
        .merge(key, values)
        .map_err(|e| e.context(format!("merge key {}", key)))?;
    stats.keys_merged += 1;
    if merged.is_empty() {
        stats.keys_dropped += 1;
        return Ok(());
    }
    state.borrow_mut().add(key, &merged)
}

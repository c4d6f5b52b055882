//! Compaction - merging a family's files with its merger.
//!
//! # Compaction Process
//!
//! 1. Pick the input files (all of level 0 plus overlapping level-1 files)
//! 2. Single input and nothing to merge with: move it down a level
//! 3. Otherwise merge all inputs; every key's values go through the merger
//! 4. Write output to new table file(s), rotated at the size limit
//! 5. Commit one edit log replacing the inputs with the outputs
//!
//! A rollup runs the same job on files of another family, with the outputs
//! landing in level 0 of the target family.

mod job;
mod merge_iterator;

pub use job::CompactJob;
pub use merge_iterator::{MergeEntry, MergedIterator};

use crate::version::{EditLog, FileMeta, Log};

/// Statistics from a compaction run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionStats {
    /// Number of input files.
    pub num_input_files: usize,
    /// Number of output files.
    pub num_output_files: usize,
    /// Total bytes of the input files.
    pub bytes_read: u64,
    /// Total bytes of the output files.
    pub bytes_written: u64,
    /// Records read from the inputs.
    pub records_read: u64,
    /// Distinct keys handed to the merger.
    pub keys_merged: u64,
    /// Keys whose merged value was empty.
    pub keys_dropped: u64,
    /// The inputs were moved without rewriting.
    pub trivial_move: bool,
    /// Time taken in milliseconds.
    pub elapsed_ms: u64,
}

/// Descriptor of one compaction run.
#[derive(Debug, Clone)]
pub struct Compaction {
    /// Input level; `None` for a rollup from another family.
    level: Option<usize>,
    level_inputs: Vec<FileMeta>,
    level_up_inputs: Vec<FileMeta>,
    edit_log: EditLog,
}

impl Compaction {
    /// Compaction of `level` into `level + 1` of one family.
    pub fn new(
        family_id: i32,
        level: usize,
        level_inputs: Vec<FileMeta>,
        level_up_inputs: Vec<FileMeta>,
    ) -> Self {
        Self {
            level: Some(level),
            level_inputs,
            level_up_inputs,
            edit_log: EditLog::new(family_id),
        }
    }

    /// Rollup of `source_family_id`'s files into `family_id`.
    ///
    /// The edit log records every input as a reference so the same source
    /// file is never rolled up twice.
    pub fn new_rollup(family_id: i32, source_family_id: i32, inputs: Vec<FileMeta>) -> Self {
        let mut edit_log = EditLog::new(family_id);
        for file in &inputs {
            edit_log.add(Log::NewReferenceFile {
                family_id: source_family_id,
                file_number: file.file_number,
            });
        }
        Self {
            level: None,
            level_inputs: inputs,
            level_up_inputs: Vec::new(),
            edit_log,
        }
    }

    pub fn level(&self) -> Option<usize> {
        self.level
    }

    pub fn is_rollup(&self) -> bool {
        self.level.is_none()
    }

    /// Level the outputs are written to.
    pub fn output_level(&self) -> usize {
        self.level.map_or(0, |level| level + 1)
    }

    pub fn level_inputs(&self) -> &[FileMeta] {
        &self.level_inputs
    }

    pub fn level_up_inputs(&self) -> &[FileMeta] {
        &self.level_up_inputs
    }

    /// Inputs in merge order: the input level first, then the level above.
    pub fn inputs(&self) -> impl Iterator<Item = &FileMeta> {
        self.level_inputs.iter().chain(self.level_up_inputs.iter())
    }

    pub fn num_input_files(&self) -> usize {
        self.level_inputs.len() + self.level_up_inputs.len()
    }

    /// A single input with nothing to merge can move down without rewriting.
    pub fn is_trivial_move(&self) -> bool {
        !self.is_rollup() && self.level_inputs.len() == 1 && self.level_up_inputs.is_empty()
    }

    pub fn edit_log(&self) -> &EditLog {
        &self.edit_log
    }

    /// Record the move of the single input down one level.
    pub(crate) fn mark_trivial_move(&mut self) {
        if let (Some(level), [file]) = (self.level, self.level_inputs.as_slice()) {
            self.edit_log.add(Log::DeleteFile {
                level,
                file_number: file.file_number,
            });
            self.edit_log.add(Log::NewFile {
                level: level + 1,
                file: *file,
            });
        }
    }

    /// Record the deletion of every input and the addition of `outputs`.
    ///
    /// Rollup inputs belong to another family and are left alone.
    pub(crate) fn mark_merged(&mut self, outputs: &[FileMeta]) {
        if let Some(level) = self.level {
            for file in &self.level_inputs {
                self.edit_log.add(Log::DeleteFile {
                    level,
                    file_number: file.file_number,
                });
            }
            for file in &self.level_up_inputs {
                self.edit_log.add(Log::DeleteFile {
                    level: level + 1,
                    file_number: file.file_number,
                });
            }
        }
        let output_level = self.output_level();
        for file in outputs {
            self.edit_log.add(Log::NewFile {
                level: output_level,
                file: *file,
            });
        }
    }

    pub(crate) fn into_edit_log(self) -> EditLog {
        self.edit_log
    }
}

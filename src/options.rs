//! Configuration options for tskv.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::rollup::{Interval, Rollup};
use crate::{Error, Result};

/// Default number of levels per family.
pub const DEFAULT_LEVELS: usize = 2;

/// Upper bound on levels per family.
pub const MAX_LEVELS: usize = 7;

/// Default level-0 file count that triggers compaction.
pub const DEFAULT_COMPACT_THRESHOLD: usize = 4;

/// Default number of files pending rollup that triggers a rollup.
pub const DEFAULT_ROLLUP_THRESHOLD: usize = 3;

/// Default maximum size of a compaction output file (256MB).
pub const DEFAULT_MAX_FILE_SIZE: u32 = 256 * 1024 * 1024;

/// Default interval between background compaction checks.
pub const DEFAULT_COMPACTION_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Default capacity hint for the table reader cache.
pub const DEFAULT_TABLE_CACHE_CAPACITY: usize = 1024;

/// Store-level configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreOptions {
    /// Create the store directory if it doesn't exist.
    pub create_if_missing: bool,

    /// Number of levels in every family of this store.
    pub levels: usize,

    /// Interval between background compaction/rollup checks.
    pub compaction_check_interval: Duration,

    /// Initial capacity of the table reader cache.
    pub table_cache_capacity: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            levels: DEFAULT_LEVELS,
            compaction_check_interval: DEFAULT_COMPACTION_CHECK_INTERVAL,
            table_cache_capacity: DEFAULT_TABLE_CACHE_CAPACITY,
        }
    }
}

impl StoreOptions {
    /// Create new options with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start building options from the defaults.
    pub fn builder() -> StoreOptionsBuilder {
        StoreOptionsBuilder::new()
    }

    /// Validate the options.
    pub fn validate(&self) -> Result<()> {
        if self.levels < 2 {
            return Err(Error::InvalidConfiguration(
                "levels must be at least 2".into(),
            ));
        }
        if self.levels > MAX_LEVELS {
            return Err(Error::InvalidConfiguration(format!(
                "levels cannot exceed {}",
                MAX_LEVELS
            )));
        }
        if self.compaction_check_interval.is_zero() {
            return Err(Error::InvalidConfiguration(
                "compaction_check_interval must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Builder for StoreOptions.
#[derive(Debug, Clone, Default)]
pub struct StoreOptionsBuilder {
    options: StoreOptions,
}

impl StoreOptionsBuilder {
    /// Create a new builder with default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set create_if_missing.
    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.options.create_if_missing = value;
        self
    }

    /// Set the number of levels.
    pub fn levels(mut self, levels: usize) -> Self {
        self.options.levels = levels;
        self
    }

    /// Set the background check interval.
    pub fn compaction_check_interval(mut self, interval: Duration) -> Self {
        self.options.compaction_check_interval = interval;
        self
    }

    /// Set the table cache capacity hint.
    pub fn table_cache_capacity(mut self, capacity: usize) -> Self {
        self.options.table_cache_capacity = capacity;
        self
    }

    /// Build the options.
    pub fn build(self) -> Result<StoreOptions> {
        self.options.validate()?;
        Ok(self.options)
    }
}

/// Per-family configuration, persisted in the store's OPTIONS file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FamilyOptions {
    /// Family id, assigned by the store on creation.
    #[serde(default)]
    pub id: i32,

    /// Family name, also the name of its directory.
    #[serde(default)]
    pub name: String,

    /// Merger type used when compacting this family.
    pub merger: String,

    /// Level-0 file count that triggers compaction.
    #[serde(default = "default_compact_threshold")]
    pub compact_threshold: usize,

    /// Pending rollup file count that triggers a rollup.
    #[serde(default = "default_rollup_threshold")]
    pub rollup_threshold: usize,

    /// Size at which a compaction output file is rotated.
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u32,

    /// Granularity of the data written to this family, if declared.
    #[serde(default)]
    pub interval: Option<Interval>,

    /// Target interval new files are rolled up into, if any.
    #[serde(default)]
    pub rollup_interval: Option<Interval>,

    /// Family receiving rolled-up data.
    #[serde(default)]
    pub rollup_target: Option<String>,
}

fn default_compact_threshold() -> usize {
    DEFAULT_COMPACT_THRESHOLD
}

fn default_rollup_threshold() -> usize {
    DEFAULT_ROLLUP_THRESHOLD
}

fn default_max_file_size() -> u32 {
    DEFAULT_MAX_FILE_SIZE
}

impl FamilyOptions {
    /// Create options for a family merged by `merger`.
    pub fn new(merger: impl Into<String>) -> Self {
        Self {
            id: 0,
            name: String::new(),
            merger: merger.into(),
            compact_threshold: DEFAULT_COMPACT_THRESHOLD,
            rollup_threshold: DEFAULT_ROLLUP_THRESHOLD,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            interval: None,
            rollup_interval: None,
            rollup_target: None,
        }
    }

    /// Set the level-0 compaction threshold.
    pub fn compact_threshold(mut self, threshold: usize) -> Self {
        self.compact_threshold = threshold;
        self
    }

    /// Set the rollup threshold.
    pub fn rollup_threshold(mut self, threshold: usize) -> Self {
        self.rollup_threshold = threshold;
        self
    }

    /// Set the maximum output file size.
    pub fn max_file_size(mut self, size: u32) -> Self {
        self.max_file_size = size;
        self
    }

    /// Declare the granularity of this family's data.
    pub fn interval(mut self, interval: Interval) -> Self {
        self.interval = Some(interval);
        self
    }

    /// Mark every flushed file as pending rollup into `target` at `interval`.
    pub fn rollup_into(mut self, target: impl Into<String>, interval: Interval) -> Self {
        self.rollup_target = Some(target.into());
        self.rollup_interval = Some(interval);
        self
    }

    /// The rollup relation configured for this family.
    pub fn rollup(&self) -> Option<Rollup> {
        match (&self.rollup_target, self.rollup_interval) {
            (Some(target), Some(interval)) => Some(Rollup {
                source_interval: self.interval,
                target_interval: interval,
                target_family: target.clone(),
            }),
            _ => None,
        }
    }

    /// Validate the options.
    pub fn validate(&self) -> Result<()> {
        if self.merger.is_empty() {
            return Err(Error::InvalidConfiguration(
                "family merger type must be set".into(),
            ));
        }
        if self.compact_threshold == 0 {
            return Err(Error::InvalidConfiguration(
                "compact_threshold must be at least 1".into(),
            ));
        }
        if self.rollup_threshold == 0 {
            return Err(Error::InvalidConfiguration(
                "rollup_threshold must be at least 1".into(),
            ));
        }
        if self.max_file_size == 0 {
            return Err(Error::InvalidConfiguration(
                "max_file_size must be positive".into(),
            ));
        }
        if self.rollup_target.is_some() != self.rollup_interval.is_some() {
            return Err(Error::InvalidConfiguration(
                "rollup_target and rollup_interval must be set together".into(),
            ));
        }
        if let Some(interval) = self.rollup_interval {
            if interval.millis() <= 0 {
                return Err(Error::InvalidConfiguration(
                    "rollup_interval must be positive".into(),
                ));
            }
        }
        if self.rollup_target.as_deref() == Some(self.name.as_str()) && !self.name.is_empty() {
            return Err(Error::InvalidConfiguration(
                "a family cannot roll up into itself".into(),
            ));
        }
        Ok(())
    }
}

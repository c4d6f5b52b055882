//! # tskv
//!
//! An embedded leveled key/value storage engine for time-series data.
//!
//! ## Features
//!
//! - **Families**: independent key spaces sharing one manifest and directory
//! - **Immutable tables**: `u32` keys with a roaring key bitmap, memory-mapped
//! - **MVCC metadata**: snapshots keep a consistent file set while compaction runs
//! - **Pluggable mergers**: compaction combines every value of a key
//! - **Rollup**: new files of a family are re-merged into a coarser family
//! - **Durability**: every metadata change is journaled before it is visible
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tskv::{FamilyOptions, Flusher, MergerRegistry, Store, StoreOptions};
//!
//! let mergers = MergerRegistry::new();
//! mergers.register("sum", |_flusher| Ok(Box::new(SumMerger) as Box<dyn Merger>));
//!
//! let store = Store::open("./data", StoreOptions::default(), Arc::new(mergers))?;
//! let family = store.create_family("metrics", FamilyOptions::new("sum"))?;
//!
//! // Write a level-0 file
//! let mut flusher = family.new_flusher();
//! flusher.add(1, b"value")?;
//! flusher.commit()?;
//!
//! // Read through a snapshot
//! let snapshot = family.get_snapshot();
//! let values = snapshot.get(1)?;
//! ```

// Public modules
pub mod error;
pub mod options;

pub mod cache;
pub mod compaction;
pub mod family;
pub mod merger;
pub mod rollup;
pub mod scheduler;
pub mod sstable;
pub mod store;
pub mod version;

// Internal modules
mod util;

// Re-export main types for convenience
pub use error::{Error, Result};
pub use options::{FamilyOptions, StoreOptions, StoreOptionsBuilder};

// Store and families
pub use family::{Family, JobState, LevelStats, TableFlusher};
pub use store::{Store, StoreRegistry};

// Merging and background work
pub use compaction::{CompactJob, Compaction, CompactionStats};
pub use merger::{Flusher, Merger, MergerConfig, MergerFactory, MergerRegistry};
pub use rollup::{Interval, Rollup, RollupContext};
pub use scheduler::JobScheduler;

// Reading
pub use cache::{CacheStats, TableCache};
pub use version::{FileMeta, Snapshot, Version};

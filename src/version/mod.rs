//! Version management for tracking the files of every family.
//!
//! The version system provides:
//! - **FileMeta**: Information about each table file
//! - **Version**: Immutable snapshot of one family's files by level
//! - **EditLog**: Journaled batch of changes to apply to a Version
//! - **FamilyVersion**: Current version plus versions held by snapshots
//! - **Snapshot**: Consistent read view that retains a Version
//! - **Manifest**: Append-only journal of EditLogs for recovery
//! - **StoreVersionSet**: Manifest, file numbers and family registry
//!
//! # Recovery
//!
//! On open:
//! 1. Read CURRENT to find the active manifest
//! 2. Replay every EditLog into its family's version
//! 3. Write a fresh manifest holding one snapshot EditLog per family

mod edit_log;
mod family_version;
mod file_meta;
mod manifest;
mod snapshot;
mod version;
mod version_set;

pub use edit_log::{EditLog, Log, LogTag, STORE_FAMILY_ID};
pub use family_version::FamilyVersion;
pub use file_meta::FileMeta;
pub use manifest::{Manifest, ManifestReader, ManifestWriter};
pub use snapshot::Snapshot;
pub use version::{Level, Version, VersionId};
pub use version_set::StoreVersionSet;

//! Rollup relations between families.
//!
//! A family configured with a rollup interval marks every file it flushes as
//! pending rollup. Once enough files are pending, the family's data is
//! re-merged into the coarser target family and the obligations are retired.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A time granularity, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Interval(i64);

impl Interval {
    const SECOND: i64 = 1000;
    const MINUTE: i64 = 60 * Self::SECOND;
    const HOUR: i64 = 60 * Self::MINUTE;
    const DAY: i64 = 24 * Self::HOUR;

    /// Interval of `millis` milliseconds.
    pub const fn from_millis(millis: i64) -> Self {
        Interval(millis)
    }

    pub const fn from_secs(secs: i64) -> Self {
        Interval(secs * Self::SECOND)
    }

    pub const fn from_mins(mins: i64) -> Self {
        Interval(mins * Self::MINUTE)
    }

    pub const fn from_hours(hours: i64) -> Self {
        Interval(hours * Self::HOUR)
    }

    pub const fn from_days(days: i64) -> Self {
        Interval(days * Self::DAY)
    }

    /// Length in milliseconds.
    pub const fn millis(&self) -> i64 {
        self.0
    }

    /// Start of the bucket of this interval that contains `timestamp` (ms).
    pub fn align(&self, timestamp: i64) -> i64 {
        if self.0 <= 0 {
            return timestamp;
        }
        timestamp - timestamp.rem_euclid(self.0)
    }

    /// Number of `source` buckets that fit in one bucket of this interval.
    pub fn ratio(&self, source: Interval) -> Option<i64> {
        if source.0 <= 0 || self.0 % source.0 != 0 {
            return None;
        }
        Some(self.0 / source.0)
    }
}

impl From<Duration> for Interval {
    fn from(d: Duration) -> Self {
        Interval(d.as_millis() as i64)
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ms = self.0;
        if ms != 0 && ms % Self::DAY == 0 {
            write!(f, "{}d", ms / Self::DAY)
        } else if ms != 0 && ms % Self::HOUR == 0 {
            write!(f, "{}h", ms / Self::HOUR)
        } else if ms != 0 && ms % Self::MINUTE == 0 {
            write!(f, "{}m", ms / Self::MINUTE)
        } else if ms != 0 && ms % Self::SECOND == 0 {
            write!(f, "{}s", ms / Self::SECOND)
        } else {
            write!(f, "{}ms", ms)
        }
    }
}

/// Relation from a source family to the family it rolls up into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rollup {
    /// Granularity of the source family's data, if declared.
    pub source_interval: Option<Interval>,
    /// Granularity of the target family.
    pub target_interval: Interval,
    /// Name of the target family in the same store.
    pub target_family: String,
}

/// Context handed to a merger running a rollup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollupContext {
    pub source_family: String,
    pub target_family: String,
    pub source_interval: Option<Interval>,
    pub target_interval: Interval,
}

impl RollupContext {
    pub fn new(source_family: &str, rollup: &Rollup) -> Self {
        Self {
            source_family: source_family.to_string(),
            target_family: rollup.target_family.clone(),
            source_interval: rollup.source_interval,
            target_interval: rollup.target_interval,
        }
    }
}

/// Collect the files pending rollup and the single interval they share.
///
/// Files are returned in ascending file-number order. Pending files with
/// different target intervals cannot be rolled up together.
pub fn pending_group(pending: &BTreeMap<u64, Interval>) -> Result<Option<(Interval, Vec<u64>)>> {
    let mut iter = pending.iter();
    let (first_file, &interval) = match iter.next() {
        Some(entry) => entry,
        None => return Ok(None),
    };

    let mut files = vec![*first_file];
    for (&file_number, &other) in iter {
        if other != interval {
            return Err(Error::Rollup(format!(
                "files pending rollup have different intervals: {} and {}",
                interval, other
            )));
        }
        files.push(file_number);
    }
    Ok(Some((interval, files)))
}

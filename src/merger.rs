//! Pluggable merge functions.
//!
//! Compaction does not keep the newest value of a key; it hands every raw
//! value sharing the key to the family's [`Merger`], which combines them.
//! Mergers are created per compaction run from a [`MergerRegistry`] the
//! application builds and passes to the store.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::rollup::RollupContext;
use crate::{Error, Result};

/// Sink for sorted records.
///
/// Families hand one out to write a new level-0 file; compactions hand
/// one to the merger so it can write output directly.
pub trait Flusher {
    /// Add a record. Keys must be strictly increasing.
    fn add(&mut self, key: u32, value: &[u8]) -> Result<()>;

    /// Finish the records added so far.
    fn commit(&mut self) -> Result<()>;
}

/// Configuration handed to a merger before a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergerConfig {
    /// A leveled compaction inside one family.
    Compaction,
    /// A rollup from one family into another.
    Rollup(RollupContext),
}

impl MergerConfig {
    pub fn rollup(&self) -> Option<&RollupContext> {
        match self {
            MergerConfig::Rollup(ctx) => Some(ctx),
            MergerConfig::Compaction => None,
        }
    }
}

/// Combines all values of one key.
pub trait Merger {
    /// Called once per run before any merge.
    fn init(&mut self, config: &MergerConfig) -> Result<()>;

    /// Combine `values`, given in input order (level-0 inputs first, then
    /// the next level, each in supplied file order). An empty result drops
    /// the key.
    fn merge(&mut self, key: u32, values: &[&[u8]]) -> Result<Vec<u8>>;
}

/// Builds a merger bound to the run's output flusher.
pub type MergerFactory =
    Arc<dyn Fn(Box<dyn Flusher>) -> Result<Box<dyn Merger>> + Send + Sync>;

/// Merger factories by merger type.
#[derive(Default)]
pub struct MergerRegistry {
    factories: RwLock<HashMap<String, MergerFactory>>,
}

impl MergerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory, replacing any previous one of the same type.
    pub fn register<F>(&self, merger_type: impl Into<String>, factory: F)
    where
        F: Fn(Box<dyn Flusher>) -> Result<Box<dyn Merger>> + Send + Sync + 'static,
    {
        self.factories
            .write()
            .insert(merger_type.into(), Arc::new(factory));
    }

    /// Check if a merger type is registered.
    pub fn contains(&self, merger_type: &str) -> bool {
        self.factories.read().contains_key(merger_type)
    }

    /// Create a merger writing through `flusher`.
    pub fn create(&self, merger_type: &str, flusher: Box<dyn Flusher>) -> Result<Box<dyn Merger>> {
        let factory = self
            .factories
            .read()
            .get(merger_type)
            .cloned()
            .ok_or_else(|| Error::UnknownMerger(merger_type.to_string()))?;
        factory(flusher)
    }

    /// Registered merger types, sorted.
    pub fn merger_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.read().keys().cloned().collect();
        types.sort();
        types
    }
}

impl fmt::Debug for MergerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MergerRegistry")
            .field("types", &self.merger_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullFlusher;

    impl Flusher for NullFlusher {
        fn add(&mut self, _key: u32, _value: &[u8]) -> Result<()> {
            Ok(())
        }

        fn commit(&mut self) -> Result<()> {
            Ok(())
        }
    }

    struct SumMerger {
        inited: bool,
    }

    impl Merger for SumMerger {
        fn init(&mut self, _config: &MergerConfig) -> Result<()> {
            self.inited = true;
            Ok(())
        }

        fn merge(&mut self, _key: u32, values: &[&[u8]]) -> Result<Vec<u8>> {
            if !self.inited {
                return Err(Error::merge("not initialized"));
            }
            let sum: u64 = values.iter().map(|v| v.len() as u64).sum();
            Ok(sum.to_le_bytes().to_vec())
        }
    }

    #[test]
    fn test_registry_create() {
        let registry = MergerRegistry::new();
        registry.register("sum", |_flusher| Ok(Box::new(SumMerger { inited: false }) as Box<dyn Merger>));

        assert!(registry.contains("sum"));
        assert_eq!(registry.merger_types(), vec!["sum".to_string()]);

        let mut merger = registry.create("sum", Box::new(NullFlusher)).unwrap();
        assert!(merger.merge(1, &[b"ab"]).is_err());
        merger.init(&MergerConfig::Compaction).unwrap();
        assert_eq!(merger.merge(1, &[b"ab", b"c"]).unwrap(), 3u64.to_le_bytes().to_vec());
    }

    #[test]
    fn test_registry_unknown_type() {
        let registry = MergerRegistry::new();
        let err = registry.create("missing", Box::new(NullFlusher)).err().unwrap();
        assert!(matches!(err, Error::UnknownMerger(name) if name == "missing"));
    }

    #[test]
    fn test_merger_config_rollup() {
        assert!(MergerConfig::Compaction.rollup().is_none());

        let ctx = RollupContext {
            source_family: "a".into(),
            target_family: "b".into(),
            source_interval: None,
            target_interval: crate::rollup::Interval::from_mins(5),
        };
        let config = MergerConfig::Rollup(ctx.clone());
        assert_eq!(config.rollup(), Some(&ctx));
    }
}

//! Caching of open table readers.

mod table_cache;

pub use table_cache::{CacheStats, TableCache};

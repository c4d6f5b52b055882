//! Merge iterator for combining several sorted table scans.
//!
//! The merge iterator keeps a min-heap holding the head record of every
//! input and always yields the smallest key next. Records with the same
//! key are all yielded, in the order their inputs were supplied.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::sstable::TableIterator;
use crate::Result;

/// A single record from one of the merged inputs.
#[derive(Debug, Clone, Copy)]
pub struct MergeEntry<'a> {
    pub key: u32,
    pub value: &'a [u8],
    /// Index of the input the record came from.
    pub source: usize,
}

// BinaryHeap is a max-heap, so the ordering is reversed: the smallest key
// wins, then the lowest source index.
impl PartialEq for MergeEntry<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.source == other.source
    }
}

impl Eq for MergeEntry<'_> {}

impl PartialOrd for MergeEntry<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MergeEntry<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .key
            .cmp(&self.key)
            .then_with(|| other.source.cmp(&self.source))
    }
}

/// K-way merge over table iterators.
pub struct MergedIterator<'a> {
    sources: Vec<TableIterator<'a>>,
    heap: BinaryHeap<MergeEntry<'a>>,
    /// First error hit while refilling the heap, yielded on the next call.
    pending_error: Option<crate::Error>,
}

impl<'a> MergedIterator<'a> {
    /// Create a merge iterator; ties are broken by position in `sources`.
    pub fn new(sources: Vec<TableIterator<'a>>) -> Result<Self> {
        let mut iter = Self {
            heap: BinaryHeap::with_capacity(sources.len()),
            sources,
            pending_error: None,
        };
        for source in 0..iter.sources.len() {
            iter.advance(source)?;
        }
        Ok(iter)
    }

    /// Number of merged inputs.
    pub fn num_sources(&self) -> usize {
        self.sources.len()
    }

    /// Key of the next record, if any.
    pub fn peek_key(&self) -> Option<u32> {
        self.heap.peek().map(|entry| entry.key)
    }

    fn advance(&mut self, source: usize) -> Result<()> {
        if let Some(entry) = self.sources[source].next() {
            let (key, value) = entry?;
            self.heap.push(MergeEntry { key, value, source });
        }
        Ok(())
    }
}

impl<'a> Iterator for MergedIterator<'a> {
    type Item = Result<MergeEntry<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(err) = self.pending_error.take() {
            return Some(Err(err));
        }

        let entry = self.heap.pop()?;
        if let Err(e) = self.advance(entry.source) {
            self.pending_error = Some(e);
        }
        Some(Ok(entry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sstable::{Builder, Reader};
    use std::path::Path;
    use tempfile::tempdir;

    fn table(dir: &Path, number: u64, records: &[(u32, &str)]) -> Reader {
        let path = dir.join(format!("{:06}.sst", number));
        let mut builder = Builder::new(&path, number).unwrap();
        for (key, value) in records {
            builder.add(*key, value.as_bytes()).unwrap();
        }
        builder.close().unwrap();
        Reader::open(&path, number).unwrap()
    }

    fn collect(iter: MergedIterator<'_>) -> Vec<(u32, String, usize)> {
        iter.map(|entry| {
            let entry = entry.unwrap();
            (
                entry.key,
                String::from_utf8(entry.value.to_vec()).unwrap(),
                entry.source,
            )
        })
        .collect()
    }

    #[test]
    fn test_merge_in_key_order() {
        let dir = tempdir().unwrap();
        let a = table(dir.path(), 1, &[(1, "a1"), (5, "a5"), (9, "a9")]);
        let b = table(dir.path(), 2, &[(2, "b2"), (6, "b6")]);
        let c = table(dir.path(), 3, &[(3, "c3")]);

        let iter = MergedIterator::new(vec![a.iter(), b.iter(), c.iter()]).unwrap();
        assert_eq!(iter.num_sources(), 3);
        assert_eq!(iter.peek_key(), Some(1));

        let keys: Vec<u32> = collect(iter).into_iter().map(|(k, _, _)| k).collect();
        assert_eq!(keys, vec![1, 2, 3, 5, 6, 9]);
    }

    #[test]
    fn test_duplicates_follow_source_order() {
        let dir = tempdir().unwrap();
        let a = table(dir.path(), 1, &[(10, "first"), (20, "a20")]);
        let b = table(dir.path(), 2, &[(10, "second")]);
        let c = table(dir.path(), 3, &[(10, "third"), (20, "c20")]);

        // Supply in reverse file order: ties follow the supplied order.
        let merged = collect(MergedIterator::new(vec![c.iter(), a.iter(), b.iter()]).unwrap());
        assert_eq!(
            merged,
            vec![
                (10, "third".to_string(), 0),
                (10, "first".to_string(), 1),
                (10, "second".to_string(), 2),
                (20, "c20".to_string(), 0),
                (20, "a20".to_string(), 1),
            ]
        );
    }

    #[test]
    fn test_empty_inputs() {
        let iter = MergedIterator::new(Vec::new()).unwrap();
        assert_eq!(iter.peek_key(), None);
        assert_eq!(iter.count(), 0);
    }
}

//! Ascending scan over a table.

use crate::Result;

use super::reader::Reader;

/// Iterator over the records of a table in ascending key order.
///
/// Yields `(key, value)` pairs whose values borrow the reader's mapping.
pub struct TableIterator<'a> {
    reader: &'a Reader,
    keys: roaring::bitmap::Iter<'a>,
    index: usize,
}

impl<'a> TableIterator<'a> {
    pub(super) fn new(reader: &'a Reader, keys: roaring::bitmap::Iter<'a>) -> Self {
        Self {
            reader,
            keys,
            index: 0,
        }
    }

    /// File number of the table being scanned.
    pub fn file_number(&self) -> u64 {
        self.reader.file_number()
    }
}

impl<'a> Iterator for TableIterator<'a> {
    type Item = Result<(u32, &'a [u8])>;

    fn next(&mut self) -> Option<Self::Item> {
        let key = self.keys.next()?;
        let index = self.index;
        self.index += 1;
        Some(self.reader.value_at(index).map(|value| (key, value)))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.keys.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use crate::sstable::{Builder, Reader};
    use tempfile::tempdir;

    #[test]
    fn test_iterator_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("000003.sst");

        let mut builder = Builder::new(&path, 3).unwrap();
        for key in [2u32, 70_000, 70_001, 4_000_000_000] {
            builder.add(key, key.to_string().as_bytes()).unwrap();
        }
        builder.close().unwrap();

        let reader = Reader::open(&path, 3).unwrap();
        let mut iter = reader.iter();
        assert_eq!(iter.file_number(), 3);

        let keys: Vec<u32> = iter.by_ref().map(|e| e.unwrap().0).collect();
        assert_eq!(keys, vec![2, 70_000, 70_001, 4_000_000_000]);
        assert!(iter.next().is_none());

        let (_, value) = reader.iter().nth(1).unwrap().unwrap();
        assert_eq!(value, b"70000");
    }
}

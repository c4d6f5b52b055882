//! Table reader over a memory-mapped file.

use std::fs::File;
use std::path::Path;

use memmap2::Mmap;
use roaring::RoaringBitmap;

use crate::util::coding::{decode_length_prefixed, decode_uvarint};
use crate::{Error, Result};

use super::iterator::TableIterator;
use super::Footer;

/// Reader for one table file.
///
/// The key bitmap and offset table are decoded into memory on open; values
/// are served straight from the mapping.
pub struct Reader {
    file_number: u64,
    mmap: Mmap,
    keys: RoaringBitmap,
    offsets: Vec<u32>,
    /// End of the value records region.
    data_end: u32,
}

impl Reader {
    /// Open a table file for reading.
    pub fn open(path: &Path, file_number: u64) -> Result<Self> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        let footer = Footer::decode(&mmap)?;

        let mut cursor = &mmap[footer.pos_of_offset as usize..footer.pos_of_keys as usize];
        let offset_data = decode_length_prefixed(&mut cursor)
            .ok_or_else(|| Error::corruption(format!("table {}: bad offset table", file_number)))?;
        let offsets = decode_offsets(offset_data, footer.pos_of_offset)
            .map_err(|e| e.context(format!("table {}", file_number)))?;

        let tail_end = mmap.len() - super::FOOTER_SIZE;
        let mut cursor = &mmap[footer.pos_of_keys as usize..tail_end];
        let bitmap_data = decode_length_prefixed(&mut cursor)
            .ok_or_else(|| Error::corruption(format!("table {}: bad key bitmap", file_number)))?;
        let keys = RoaringBitmap::deserialize_from(bitmap_data).map_err(|e| {
            Error::corruption(format!("table {}: decode key bitmap: {}", file_number, e))
        })?;

        if keys.len() != offsets.len() as u64 {
            return Err(Error::corruption(format!(
                "table {}: {} keys but {} offsets",
                file_number,
                keys.len(),
                offsets.len()
            )));
        }
        if keys.is_empty() {
            return Err(Error::corruption(format!("table {} is empty", file_number)));
        }

        Ok(Self {
            file_number,
            data_end: footer.pos_of_offset,
            mmap,
            keys,
            offsets,
        })
    }

    /// Get the file number.
    pub fn file_number(&self) -> u64 {
        self.file_number
    }

    /// Size of the file in bytes.
    pub fn file_size(&self) -> u32 {
        self.mmap.len() as u32
    }

    /// Number of records.
    pub fn count(&self) -> u64 {
        self.keys.len()
    }

    /// Smallest key in the table.
    pub fn min_key(&self) -> u32 {
        self.keys.min().unwrap_or_default()
    }

    /// Largest key in the table.
    pub fn max_key(&self) -> u32 {
        self.keys.max().unwrap_or_default()
    }

    /// Check if the table holds `key`.
    pub fn contains(&self, key: u32) -> bool {
        self.keys.contains(key)
    }

    /// Get the value stored for `key`.
    pub fn get(&self, key: u32) -> Result<Option<&[u8]>> {
        if !self.keys.contains(key) {
            return Ok(None);
        }
        // rank counts keys <= key, so the record index is rank - 1.
        let index = (self.keys.rank(key) - 1) as usize;
        self.value_at(index).map(Some)
    }

    /// Iterate all records in ascending key order.
    pub fn iter(&self) -> TableIterator<'_> {
        TableIterator::new(self, self.keys.iter())
    }

    pub(super) fn value_at(&self, index: usize) -> Result<&[u8]> {
        let offset = *self.offsets.get(index).ok_or_else(|| {
            Error::corruption(format!(
                "table {}: record {} out of range",
                self.file_number, index
            ))
        })? as usize;

        let mut cursor = &self.mmap[offset..self.data_end as usize];
        decode_length_prefixed(&mut cursor).ok_or_else(|| {
            Error::corruption(format!(
                "table {}: truncated record at {}",
                self.file_number, offset
            ))
        })
    }
}

fn decode_offsets(mut data: &[u8], data_end: u32) -> Result<Vec<u32>> {
    let mut offsets = Vec::new();
    let mut prev = 0u64;
    while !data.is_empty() {
        let delta = decode_uvarint(&mut data).ok_or_else(|| Error::corruption("bad offset delta"))?;
        let offset = prev + delta;
        if offset >= data_end as u64 {
            return Err(Error::corruption(format!(
                "record offset {} beyond data end {}",
                offset, data_end
            )));
        }
        offsets.push(offset as u32);
        prev = offset;
    }
    Ok(offsets)
}

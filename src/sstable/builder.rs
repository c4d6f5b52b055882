//! Table builder writing a sorted run of records.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use bytes::BytesMut;
use roaring::RoaringBitmap;
use tracing::warn;

use crate::util::coding::{encode_uvarint, varint_length};
use crate::util::filename::delete_file;
use crate::{Error, Result};

use super::Footer;

/// Result of a successfully closed table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableInfo {
    pub file_number: u64,
    pub min_key: u32,
    pub max_key: u32,
    pub file_size: u32,
    pub count: u64,
}

/// Writer for one table file.
///
/// Keys must be added in strictly increasing order; out-of-order keys are
/// dropped with a warning.
pub struct Builder {
    /// Buffered file writer.
    writer: BufWriter<File>,
    path: PathBuf,
    file_number: u64,
    /// Current offset in the file.
    offset: u64,
    /// Start offset of every value record.
    offsets: Vec<u32>,
    keys: RoaringBitmap,
    min_key: u32,
    max_key: u32,
    scratch: BytesMut,
}

impl Builder {
    /// Create a builder writing to `path`.
    pub fn new(path: &Path, file_number: u64) -> Result<Self> {
        let file = File::create(path)?;

        Ok(Self {
            writer: BufWriter::with_capacity(64 * 1024, file),
            path: path.to_path_buf(),
            file_number,
            offset: 0,
            offsets: Vec::new(),
            keys: RoaringBitmap::new(),
            min_key: 0,
            max_key: 0,
            scratch: BytesMut::with_capacity(16),
        })
    }

    /// Get the file number.
    pub fn file_number(&self) -> u64 {
        self.file_number
    }

    /// Smallest key added, 0 when empty.
    pub fn min_key(&self) -> u32 {
        self.min_key
    }

    /// Largest key added, 0 when empty.
    pub fn max_key(&self) -> u32 {
        self.max_key
    }

    /// Number of records added.
    pub fn count(&self) -> u64 {
        self.offsets.len() as u64
    }

    /// Bytes written so far.
    pub fn size(&self) -> u64 {
        self.offset
    }

    /// Add a record.
    pub fn add(&mut self, key: u32, value: &[u8]) -> Result<()> {
        if !self.offsets.is_empty() && key <= self.max_key {
            warn!(
                file_number = self.file_number,
                key,
                last_key = self.max_key,
                "key not in ascending order, ignoring record"
            );
            return Ok(());
        }

        let record_len = varint_length(value.len() as u64) as u64 + value.len() as u64;
        let record_offset = u32::try_from(self.offset)
            .ok()
            .filter(|_| self.offset + record_len <= u32::MAX as u64)
            .ok_or_else(|| {
                Error::invalid_format(format!("table {} exceeds 4GB", self.file_number))
            })?;

        self.scratch.clear();
        encode_uvarint(&mut self.scratch, value.len() as u64);
        self.writer.write_all(&self.scratch)?;
        self.writer.write_all(value)?;
        self.offset += record_len;

        if self.offsets.is_empty() {
            self.min_key = key;
        }
        self.max_key = key;
        self.offsets.push(record_offset);
        self.keys.insert(key);
        Ok(())
    }

    /// Finish the table: write the offset table, key bitmap and footer.
    ///
    /// The partial file is removed if closing fails.
    pub fn close(mut self) -> Result<TableInfo> {
        if self.offsets.is_empty() {
            self.discard();
            return Err(Error::EmptyKeys);
        }

        match self.write_tail() {
            Ok(file_size) => Ok(TableInfo {
                file_number: self.file_number,
                min_key: self.min_key,
                max_key: self.max_key,
                file_size,
                count: self.offsets.len() as u64,
            }),
            Err(e) => {
                self.discard();
                Err(e)
            }
        }
    }

    /// Drop the in-progress file without writing a footer.
    pub fn abandon(self) -> Result<()> {
        let Builder { writer, path, .. } = self;
        drop(writer);
        delete_file(&path)?;
        Ok(())
    }

    fn discard(&mut self) {
        if let Err(e) = delete_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to remove table file");
        }
    }

    fn write_tail(&mut self) -> Result<u32> {
        let mut buf = BytesMut::with_capacity(self.offsets.len() * 2 + 16);

        let mut offset_table = BytesMut::with_capacity(self.offsets.len() * 2);
        let mut prev = 0u32;
        for &offset in &self.offsets {
            encode_uvarint(&mut offset_table, (offset - prev) as u64);
            prev = offset;
        }
        encode_uvarint(&mut buf, offset_table.len() as u64);
        buf.extend_from_slice(&offset_table);
        let pos_of_offset = self.offset;

        let mut bitmap = Vec::with_capacity(self.keys.serialized_size());
        self.keys.serialize_into(&mut bitmap)?;
        let pos_of_keys = pos_of_offset + buf.len() as u64;
        encode_uvarint(&mut buf, bitmap.len() as u64);
        buf.extend_from_slice(&bitmap);

        if self.offset + (buf.len() + super::FOOTER_SIZE) as u64 > u32::MAX as u64 {
            return Err(Error::invalid_format(format!(
                "table {} exceeds 4GB",
                self.file_number
            )));
        }

        let footer = Footer {
            pos_of_offset: pos_of_offset as u32,
            pos_of_keys: pos_of_keys as u32,
        };
        buf.extend_from_slice(&footer.encode());

        self.writer.write_all(&buf)?;
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.offset += buf.len() as u64;

        Ok(self.offset as u32)
    }
}

//! Manifest - append-only journal of edit logs.
//!
//! Records are framed in 32KB blocks; each physical record carries a CRC
//! over its type and payload so torn or corrupt tails are detected.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::util::crc::crc32_multi;
use crate::util::filename::manifest_file_path;
use crate::{Error, Result};

use super::EditLog;

/// Block size for the manifest (32KB).
const BLOCK_SIZE: usize = 32 * 1024;

/// Header size: CRC (4) + Length (2) + Type (1) = 7 bytes.
const HEADER_SIZE: usize = 7;

/// Record fragment types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum RecordType {
    /// Zero is reserved for block padding.
    Zero = 0,
    /// Complete record in a single fragment.
    Full = 1,
    /// First fragment of a record.
    First = 2,
    /// Middle fragment(s) of a record.
    Middle = 3,
    /// Last fragment of a record.
    Last = 4,
}

impl RecordType {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(RecordType::Zero),
            1 => Some(RecordType::Full),
            2 => Some(RecordType::First),
            3 => Some(RecordType::Middle),
            4 => Some(RecordType::Last),
            _ => None,
        }
    }
}

/// Manifest file writer.
pub struct ManifestWriter {
    writer: BufWriter<File>,
    /// Current position within the current block.
    block_offset: usize,
    file_number: u64,
    path: PathBuf,
}

impl ManifestWriter {
    /// Create a new, empty manifest.
    pub fn new(path: &Path, file_number: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;

        Ok(Self {
            writer: BufWriter::with_capacity(BLOCK_SIZE, file),
            block_offset: 0,
            file_number,
            path: path.to_path_buf(),
        })
    }

    /// Get the file number.
    pub fn file_number(&self) -> u64 {
        self.file_number
    }

    /// Get the manifest file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append an edit log.
    pub fn add_edit_log(&mut self, edit_log: &EditLog) -> Result<()> {
        let data = edit_log.encode();
        self.add_record(&data)
    }

    fn add_record(&mut self, data: &[u8]) -> Result<()> {
        let mut left = data.len();
        let mut ptr = 0;
        let mut begin = true;

        // An empty record is still emitted as one Full fragment.
        loop {
            let leftover = BLOCK_SIZE - self.block_offset;
            if leftover < HEADER_SIZE {
                if leftover > 0 {
                    self.writer.write_all(&[0u8; HEADER_SIZE][..leftover])?;
                }
                self.block_offset = 0;
            }

            let avail = BLOCK_SIZE - self.block_offset - HEADER_SIZE;
            let fragment_length = left.min(avail);
            let end = left == fragment_length;

            let record_type = match (begin, end) {
                (true, true) => RecordType::Full,
                (true, false) => RecordType::First,
                (false, true) => RecordType::Last,
                (false, false) => RecordType::Middle,
            };

            self.emit_physical_record(record_type, &data[ptr..ptr + fragment_length])?;

            ptr += fragment_length;
            left -= fragment_length;
            begin = false;
            if left == 0 {
                return Ok(());
            }
        }
    }

    fn emit_physical_record(&mut self, record_type: RecordType, data: &[u8]) -> Result<()> {
        debug_assert!(data.len() <= 0xFFFF);
        debug_assert!(self.block_offset + HEADER_SIZE + data.len() <= BLOCK_SIZE);

        let crc = crc32_multi(&[&[record_type as u8], data]);

        let mut header = [0u8; HEADER_SIZE];
        header[0..4].copy_from_slice(&crc.to_le_bytes());
        header[4..6].copy_from_slice(&(data.len() as u16).to_le_bytes());
        header[6] = record_type as u8;

        self.writer.write_all(&header)?;
        self.writer.write_all(data)?;
        self.block_offset += HEADER_SIZE + data.len();
        Ok(())
    }

    /// Flush and sync to disk.
    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(())
    }

    /// Close the writer.
    pub fn close(mut self) -> Result<()> {
        self.sync()
    }

    /// Drop the writer without flushing what is still buffered.
    pub fn discard(self) {
        let (_file, _unwritten) = self.writer.into_parts();
    }
}

/// Manifest file reader.
pub struct ManifestReader {
    reader: BufReader<File>,
    buffer: Vec<u8>,
    buffer_offset: usize,
    buffer_size: usize,
    eof: bool,
}

impl ManifestReader {
    /// Create a new manifest reader.
    pub fn new(path: &Path) -> Result<Self> {
        let file = File::open(path)?;

        Ok(Self {
            reader: BufReader::with_capacity(BLOCK_SIZE, file),
            buffer: vec![0u8; BLOCK_SIZE],
            buffer_offset: 0,
            buffer_size: 0,
            eof: false,
        })
    }

    /// Read the next edit log, or None at the end of the journal.
    pub fn read_edit_log(&mut self) -> Result<Option<EditLog>> {
        match self.read_record()? {
            Some(data) => Ok(Some(EditLog::decode(&data)?)),
            None => Ok(None),
        }
    }

    /// Read every edit log in the manifest.
    pub fn read_all(&mut self) -> Result<Vec<EditLog>> {
        let mut edit_logs = Vec::new();
        while let Some(edit_log) = self.read_edit_log()? {
            edit_logs.push(edit_log);
        }
        Ok(edit_logs)
    }

    fn read_record(&mut self) -> Result<Option<Vec<u8>>> {
        let mut scratch = Vec::new();
        let mut in_fragmented_record = false;

        while let Some((record_type, data)) = self.read_physical_record()? {
            match record_type {
                RecordType::Full => {
                    if in_fragmented_record {
                        return Err(Error::manifest("full record inside fragmented record"));
                    }
                    return Ok(Some(data));
                }
                RecordType::First => {
                    if in_fragmented_record {
                        return Err(Error::manifest("first fragment inside fragmented record"));
                    }
                    scratch.extend_from_slice(&data);
                    in_fragmented_record = true;
                }
                RecordType::Middle => {
                    if !in_fragmented_record {
                        return Err(Error::manifest("unexpected middle record fragment"));
                    }
                    scratch.extend_from_slice(&data);
                }
                RecordType::Last => {
                    if !in_fragmented_record {
                        return Err(Error::manifest("unexpected last record fragment"));
                    }
                    scratch.extend_from_slice(&data);
                    return Ok(Some(scratch));
                }
                RecordType::Zero => continue,
            }
        }

        // A record cut short by a crash is ignored.
        Ok(None)
    }

    fn read_physical_record(&mut self) -> Result<Option<(RecordType, Vec<u8>)>> {
        loop {
            if self.buffer_offset + HEADER_SIZE > self.buffer_size {
                if !self.read_block()? {
                    return Ok(None);
                }
                continue;
            }

            let header = &self.buffer[self.buffer_offset..self.buffer_offset + HEADER_SIZE];
            let crc_expected = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
            let length = u16::from_le_bytes([header[4], header[5]]) as usize;
            let type_byte = header[6];

            if type_byte == RecordType::Zero as u8 && length == 0 && crc_expected == 0 {
                // Block padding.
                self.buffer_offset = self.buffer_size;
                continue;
            }

            let record_type = RecordType::from_byte(type_byte)
                .ok_or_else(|| Error::manifest(format!("invalid record type {}", type_byte)))?;

            if self.buffer_offset + HEADER_SIZE + length > self.buffer_size {
                if self.eof {
                    return Ok(None);
                }
                return Err(Error::manifest("record extends beyond block"));
            }

            let data_start = self.buffer_offset + HEADER_SIZE;
            let data_end = data_start + length;
            let data = &self.buffer[data_start..data_end];

            if crc32_multi(&[&[type_byte], data]) != crc_expected {
                if self.eof && data_end == self.buffer_size {
                    return Ok(None);
                }
                return Err(Error::manifest("record checksum mismatch"));
            }

            self.buffer_offset = data_end;
            return Ok(Some((record_type, data.to_vec())));
        }
    }

    fn read_block(&mut self) -> Result<bool> {
        if self.eof {
            return Ok(false);
        }

        self.buffer_offset = 0;
        let mut filled = 0;
        while filled < BLOCK_SIZE {
            let n = self.reader.read(&mut self.buffer[filled..])?;
            if n == 0 {
                self.eof = true;
                break;
            }
            filled += n;
        }
        self.buffer_size = filled;

        Ok(filled > 0)
    }
}

/// Manifest file manager.
pub struct Manifest {
    writer: ManifestWriter,
    manifest_number: u64,
}

impl Manifest {
    /// Create a new manifest in `store_path`.
    pub fn create(store_path: &Path, manifest_number: u64) -> Result<Self> {
        let path = manifest_file_path(store_path, manifest_number);
        Ok(Self {
            writer: ManifestWriter::new(&path, manifest_number)?,
            manifest_number,
        })
    }

    /// Get the manifest number.
    pub fn manifest_number(&self) -> u64 {
        self.manifest_number
    }

    /// Append an edit log and sync it to disk.
    pub fn log_edit(&mut self, edit_log: &EditLog) -> Result<()> {
        self.writer.add_edit_log(edit_log)?;
        self.writer.sync()
    }

    /// Append edit logs, syncing once at the end.
    pub fn log_edits(&mut self, edit_logs: &[EditLog]) -> Result<()> {
        for edit_log in edit_logs {
            self.writer.add_edit_log(edit_log)?;
        }
        self.writer.sync()
    }

    /// Read every edit log from a manifest file.
    pub fn recover(store_path: &Path, manifest_number: u64) -> Result<Vec<EditLog>> {
        let path = manifest_file_path(store_path, manifest_number);
        let mut reader = ManifestReader::new(&path)?;
        reader.read_all()
    }

    /// Close the manifest.
    pub fn close(self) -> Result<()> {
        self.writer.close()
    }

    /// Abandon the manifest after a failed append. Buffered bytes never
    /// reach the file.
    pub fn discard(self) {
        self.writer.discard()
    }

    #[cfg(test)]
    pub(crate) fn from_writer(writer: ManifestWriter, manifest_number: u64) -> Self {
        Self {
            writer,
            manifest_number,
        }
    }
}

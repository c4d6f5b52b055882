//! EditLog - the journaled unit of metadata change.
//!
//! # Encoding
//!
//! ```text
//! family_id: zig-zag varint | count: uvarint | entry * count
//! entry: tag: uvarint | len: uvarint | payload (len bytes)
//! ```

use bytes::{Bytes, BytesMut};

use crate::rollup::Interval;
use crate::util::coding::{
    decode_length_prefixed, decode_uvarint, decode_uvarint32, decode_varint,
    encode_length_prefixed, encode_uvarint, encode_varint,
};
use crate::{Error, Result};

use super::{FileMeta, Version};

/// Family id marking a store-level edit log.
pub const STORE_FAMILY_ID: i32 = -99_999_999;

/// Tag values of the log variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LogTag {
    NewFile = 1,
    DeleteFile = 2,
    NextFileNumber = 3,
    NewRollupFile = 4,
    DeleteRollupFile = 5,
    NewReferenceFile = 6,
    DeleteReferenceFile = 7,
}

impl LogTag {
    /// Create from the encoded tag.
    pub fn from_u64(tag: u64) -> Option<Self> {
        match tag {
            1 => Some(LogTag::NewFile),
            2 => Some(LogTag::DeleteFile),
            3 => Some(LogTag::NextFileNumber),
            4 => Some(LogTag::NewRollupFile),
            5 => Some(LogTag::DeleteRollupFile),
            6 => Some(LogTag::NewReferenceFile),
            7 => Some(LogTag::DeleteReferenceFile),
            _ => None,
        }
    }
}

/// One metadata mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Log {
    /// Add a file at a level.
    NewFile { level: usize, file: FileMeta },
    /// Remove a file from a level.
    DeleteFile { level: usize, file_number: u64 },
    /// Record the store's next file number.
    NextFileNumber { file_number: u64 },
    /// Mark a file as pending rollup into `interval`.
    NewRollupFile { file_number: u64, interval: Interval },
    /// Retire a file's rollup obligation.
    DeleteRollupFile { file_number: u64 },
    /// Record that a source family's file was rolled into this family.
    NewReferenceFile { family_id: i32, file_number: u64 },
    /// Drop a reference record.
    DeleteReferenceFile { family_id: i32, file_number: u64 },
}

impl Log {
    pub fn tag(&self) -> LogTag {
        match self {
            Log::NewFile { .. } => LogTag::NewFile,
            Log::DeleteFile { .. } => LogTag::DeleteFile,
            Log::NextFileNumber { .. } => LogTag::NextFileNumber,
            Log::NewRollupFile { .. } => LogTag::NewRollupFile,
            Log::DeleteRollupFile { .. } => LogTag::DeleteRollupFile,
            Log::NewReferenceFile { .. } => LogTag::NewReferenceFile,
            Log::DeleteReferenceFile { .. } => LogTag::DeleteReferenceFile,
        }
    }

    fn encode_payload(&self, buf: &mut BytesMut) {
        match *self {
            Log::NewFile { level, file } => {
                encode_uvarint(buf, level as u64);
                encode_uvarint(buf, file.file_number);
                encode_uvarint(buf, file.min_key as u64);
                encode_uvarint(buf, file.max_key as u64);
                encode_uvarint(buf, file.file_size as u64);
            }
            Log::DeleteFile { level, file_number } => {
                encode_uvarint(buf, level as u64);
                encode_uvarint(buf, file_number);
            }
            Log::NextFileNumber { file_number } | Log::DeleteRollupFile { file_number } => {
                encode_uvarint(buf, file_number);
            }
            Log::NewRollupFile {
                file_number,
                interval,
            } => {
                encode_uvarint(buf, file_number);
                encode_varint(buf, interval.millis());
            }
            Log::NewReferenceFile {
                family_id,
                file_number,
            }
            | Log::DeleteReferenceFile {
                family_id,
                file_number,
            } => {
                encode_varint(buf, family_id as i64);
                encode_uvarint(buf, file_number);
            }
        }
    }

    fn decode_payload(tag: LogTag, mut data: &[u8]) -> Result<Self> {
        let cursor = &mut data;
        let log = match tag {
            LogTag::NewFile => {
                let level = read_u64(cursor)? as usize;
                let file_number = read_u64(cursor)?;
                let min_key = read_u32(cursor)?;
                let max_key = read_u32(cursor)?;
                let file_size = read_u32(cursor)?;
                Log::NewFile {
                    level,
                    file: FileMeta::new(file_number, min_key, max_key, file_size),
                }
            }
            LogTag::DeleteFile => Log::DeleteFile {
                level: read_u64(cursor)? as usize,
                file_number: read_u64(cursor)?,
            },
            LogTag::NextFileNumber => Log::NextFileNumber {
                file_number: read_u64(cursor)?,
            },
            LogTag::NewRollupFile => Log::NewRollupFile {
                file_number: read_u64(cursor)?,
                interval: Interval::from_millis(read_i64(cursor)?),
            },
            LogTag::DeleteRollupFile => Log::DeleteRollupFile {
                file_number: read_u64(cursor)?,
            },
            LogTag::NewReferenceFile => Log::NewReferenceFile {
                family_id: read_i32(cursor)?,
                file_number: read_u64(cursor)?,
            },
            LogTag::DeleteReferenceFile => Log::DeleteReferenceFile {
                family_id: read_i32(cursor)?,
                file_number: read_u64(cursor)?,
            },
        };

        if !cursor.is_empty() {
            return Err(Error::corruption(format!(
                "{} trailing bytes in {:?} log",
                cursor.len(),
                tag
            )));
        }
        Ok(log)
    }

    /// Apply this log to a version under construction.
    ///
    /// `NextFileNumber` only matters to the version set and is a no-op here.
    pub fn apply(&self, version: &mut Version) -> Result<()> {
        match *self {
            Log::NewFile { level, file } => version.add_file(level, file),
            Log::DeleteFile { level, file_number } => version.delete_file(level, file_number),
            Log::NextFileNumber { .. } => Ok(()),
            Log::NewRollupFile {
                file_number,
                interval,
            } => {
                version.add_rollup_file(file_number, interval);
                Ok(())
            }
            Log::DeleteRollupFile { file_number } => {
                version.delete_rollup_file(file_number);
                Ok(())
            }
            Log::NewReferenceFile {
                family_id,
                file_number,
            } => {
                version.add_reference_file(family_id, file_number);
                Ok(())
            }
            Log::DeleteReferenceFile {
                family_id,
                file_number,
            } => {
                version.delete_reference_file(family_id, file_number);
                Ok(())
            }
        }
    }
}

fn read_u64(cursor: &mut &[u8]) -> Result<u64> {
    decode_uvarint(cursor).ok_or_else(|| Error::corruption("truncated log payload"))
}

fn read_u32(cursor: &mut &[u8]) -> Result<u32> {
    decode_uvarint32(cursor).ok_or_else(|| Error::corruption("bad u32 in log payload"))
}

fn read_i64(cursor: &mut &[u8]) -> Result<i64> {
    decode_varint(cursor).ok_or_else(|| Error::corruption("truncated log payload"))
}

fn read_i32(cursor: &mut &[u8]) -> Result<i32> {
    read_i64(cursor)?
        .try_into()
        .map_err(|_| Error::corruption("bad family id in log payload"))
}

/// A family's (or the store's) batch of logs, journaled as one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditLog {
    family_id: i32,
    logs: Vec<Log>,
}

impl EditLog {
    /// Create an empty edit log for a family.
    pub fn new(family_id: i32) -> Self {
        Self {
            family_id,
            logs: Vec::new(),
        }
    }

    /// Create an empty store-level edit log.
    pub fn new_store() -> Self {
        Self::new(STORE_FAMILY_ID)
    }

    pub fn family_id(&self) -> i32 {
        self.family_id
    }

    /// Whether this log belongs to the store rather than a family.
    pub fn is_store_log(&self) -> bool {
        self.family_id == STORE_FAMILY_ID
    }

    /// Append a log entry.
    pub fn add(&mut self, log: Log) {
        self.logs.push(log);
    }

    pub fn logs(&self) -> &[Log] {
        &self.logs
    }

    pub fn is_empty(&self) -> bool {
        self.logs.is_empty()
    }

    /// Apply every entry in order.
    pub fn apply(&self, version: &mut Version) -> Result<()> {
        for log in &self.logs {
            log.apply(version)?;
        }
        Ok(())
    }

    /// Encode the edit log to bytes.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(16 + self.logs.len() * 16);
        let mut payload = BytesMut::with_capacity(32);

        encode_varint(&mut buf, self.family_id as i64);
        encode_uvarint(&mut buf, self.logs.len() as u64);
        for log in &self.logs {
            encode_uvarint(&mut buf, log.tag() as u64);
            payload.clear();
            log.encode_payload(&mut payload);
            encode_length_prefixed(&mut buf, &payload);
        }

        buf.freeze()
    }

    /// Decode an edit log from bytes.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut cursor = data;

        let family_id = read_i32(&mut cursor)?;
        let count = read_u64(&mut cursor)?;

        let mut logs = Vec::with_capacity(count.min(1024) as usize);
        for _ in 0..count {
            let raw_tag = read_u64(&mut cursor)?;
            let tag = LogTag::from_u64(raw_tag)
                .ok_or_else(|| Error::corruption(format!("unknown log tag: {}", raw_tag)))?;
            let payload = decode_length_prefixed(&mut cursor)
                .ok_or_else(|| Error::corruption("truncated log entry"))?;
            logs.push(Log::decode_payload(tag, payload)?);
        }

        if !cursor.is_empty() {
            return Err(Error::corruption("trailing bytes after edit log"));
        }

        Ok(Self { family_id, logs })
    }
}

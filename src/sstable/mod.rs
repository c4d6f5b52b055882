//! SSTable - immutable sorted table of `u32` keys to opaque values.
//!
//! # File Format
//!
//! ```text
//! +--------------------+
//! | Value Record 1     |  uvarint len | value bytes
//! +--------------------+
//! | ...                |
//! +--------------------+
//! | Value Record N     |
//! +--------------------+
//! | Offset Table       |  uvarint len | delta-encoded uvarint record offsets
//! +--------------------+
//! | Key Bitmap         |  uvarint len | serialized roaring bitmap of keys
//! +--------------------+
//! | Footer (17 bytes)  |  pos_of_offset:u32 | pos_of_keys:u32 | version:u8 | magic:u64
//! +--------------------+
//! ```
//!
//! Records are written in strictly increasing key order, so the rank of a
//! key in the bitmap is the index of its record in the offset table. All
//! footer integers are little-endian.

mod builder;
mod iterator;
mod reader;

pub use builder::{Builder, TableInfo};
pub use iterator::TableIterator;
pub use reader::Reader;

use bytes::{BufMut, Bytes, BytesMut};

use crate::util::coding::{read_fixed32, read_fixed64};
use crate::{Error, Result};

/// Magic number closing every table file.
pub const FOOTER_MAGIC: u64 = 0x69632d656d656c65;

/// Footer size: pos_of_offset (4) + pos_of_keys (4) + version (1) + magic (8).
pub const FOOTER_SIZE: usize = 17;

/// Current table format version.
pub const FORMAT_VERSION: u8 = 0;

/// Footer of a table file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Footer {
    /// Position of the length-prefixed offset table.
    pub pos_of_offset: u32,
    /// Position of the length-prefixed key bitmap.
    pub pos_of_keys: u32,
}

impl Footer {
    /// Encode the footer to bytes.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FOOTER_SIZE);
        buf.put_u32_le(self.pos_of_offset);
        buf.put_u32_le(self.pos_of_keys);
        buf.put_u8(FORMAT_VERSION);
        buf.put_u64_le(FOOTER_MAGIC);
        buf.freeze()
    }

    /// Decode the footer from the tail of a table file.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < FOOTER_SIZE {
            return Err(Error::invalid_format("file too small for footer"));
        }

        let footer = &data[data.len() - FOOTER_SIZE..];
        let magic = read_fixed64(&footer[9..]).unwrap_or_default();
        if magic != FOOTER_MAGIC {
            return Err(Error::invalid_format(format!(
                "invalid footer magic {:#018x}",
                magic
            )));
        }
        if footer[8] != FORMAT_VERSION {
            return Err(Error::invalid_format(format!(
                "unsupported table format version {}",
                footer[8]
            )));
        }

        let pos_of_offset = read_fixed32(footer).unwrap_or_default();
        let pos_of_keys = read_fixed32(&footer[4..]).unwrap_or_default();
        let footer_start = (data.len() - FOOTER_SIZE) as u64;
        if pos_of_offset > pos_of_keys || pos_of_keys as u64 >= footer_start {
            return Err(Error::corruption(format!(
                "footer positions out of range: offsets at {}, keys at {}, footer at {}",
                pos_of_offset, pos_of_keys, footer_start
            )));
        }

        Ok(Self {
            pos_of_offset,
            pos_of_keys,
        })
    }
}

//! Encoding utilities for variable-length integers and fixed-width values.
//!
//! Unsigned varints use the LEB128 layout; signed varints are zig-zag
//! encoded first so small negative numbers stay short.

use bytes::{Buf, BufMut, BytesMut};

/// Maximum bytes needed to encode a varint64.
pub const MAX_VARINT64_LEN: usize = 10;

/// Encode a 64-bit unsigned integer as a varint.
///
/// Returns the number of bytes written.
pub fn encode_uvarint(buf: &mut BytesMut, mut value: u64) -> usize {
    let mut count = 0;
    while value >= 0x80 {
        buf.put_u8((value as u8) | 0x80);
        value >>= 7;
        count += 1;
    }
    buf.put_u8(value as u8);
    count + 1
}

/// Decode a 64-bit unsigned varint, consuming it from the buffer.
///
/// Returns None if the buffer is too short or the varint is malformed.
pub fn decode_uvarint(buf: &mut &[u8]) -> Option<u64> {
    let mut result = 0u64;
    let mut shift = 0;

    for _ in 0..MAX_VARINT64_LEN {
        if buf.is_empty() {
            return None;
        }

        let byte = buf.get_u8();
        result |= ((byte & 0x7F) as u64) << shift;

        if byte & 0x80 == 0 {
            return Some(result);
        }

        shift += 7;
    }

    None // Varint too long
}

/// Encode a signed integer as a zig-zag varint.
pub fn encode_varint(buf: &mut BytesMut, value: i64) -> usize {
    let zigzag = ((value << 1) ^ (value >> 63)) as u64;
    encode_uvarint(buf, zigzag)
}

/// Decode a zig-zag varint.
pub fn decode_varint(buf: &mut &[u8]) -> Option<i64> {
    let zigzag = decode_uvarint(buf)?;
    Some(((zigzag >> 1) as i64) ^ -((zigzag & 1) as i64))
}

/// Decode an unsigned varint that must fit in 32 bits.
pub fn decode_uvarint32(buf: &mut &[u8]) -> Option<u32> {
    decode_uvarint(buf).and_then(|v| u32::try_from(v).ok())
}

/// Get the number of bytes needed to encode a varint.
pub fn varint_length(value: u64) -> usize {
    let mut len = 1;
    let mut v = value;
    while v >= 0x80 {
        v >>= 7;
        len += 1;
    }
    len
}

/// Encode a length-prefixed byte slice.
pub fn encode_length_prefixed(buf: &mut BytesMut, data: &[u8]) {
    encode_uvarint(buf, data.len() as u64);
    buf.put_slice(data);
}

/// Decode a length-prefixed byte slice without copying.
pub fn decode_length_prefixed<'a>(buf: &mut &'a [u8]) -> Option<&'a [u8]> {
    let len = decode_uvarint(buf)? as usize;
    if buf.len() < len {
        return None;
    }
    let data = &buf[..len];
    *buf = &buf[len..];
    Some(data)
}

/// Read a fixed 32-bit little-endian value from a slice without consuming.
pub fn read_fixed32(data: &[u8]) -> Option<u32> {
    if data.len() < 4 {
        return None;
    }
    Some(u32::from_le_bytes([data[0], data[1], data[2], data[3]]))
}

/// Read a fixed 64-bit little-endian value from a slice without consuming.
pub fn read_fixed64(data: &[u8]) -> Option<u64> {
    if data.len() < 8 {
        return None;
    }
    Some(u64::from_le_bytes([
        data[0], data[1], data[2], data[3], data[4], data[5], data[6], data[7],
    ]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uvarint_roundtrip() {
        let test_values = [
            0u64,
            1,
            127,
            128,
            16383,
            16384,
            (1 << 35) - 1,
            u64::MAX >> 1,
            u64::MAX,
        ];

        for &val in &test_values {
            let mut buf = BytesMut::new();
            let written = encode_uvarint(&mut buf, val);
            assert_eq!(written, varint_length(val));

            let mut slice: &[u8] = &buf;
            assert_eq!(decode_uvarint(&mut slice), Some(val), "Failed for value {}", val);
            assert!(slice.is_empty(), "Buffer not fully consumed");
        }
    }

    #[test]
    fn test_signed_varint() {
        for &val in &[0i64, 1, -1, 63, -64, 1 << 40, -99_999_999, i64::MIN, i64::MAX] {
            let mut buf = BytesMut::new();
            encode_varint(&mut buf, val);
            let mut slice: &[u8] = &buf;
            assert_eq!(decode_varint(&mut slice), Some(val));
        }

        // Zig-zag keeps small negatives short.
        let mut buf = BytesMut::new();
        assert_eq!(encode_varint(&mut buf, -1), 1);
    }

    #[test]
    fn test_uvarint32_overflow() {
        let mut buf = BytesMut::new();
        encode_uvarint(&mut buf, u32::MAX as u64 + 1);
        let mut slice: &[u8] = &buf;
        assert_eq!(decode_uvarint32(&mut slice), None);
    }

    #[test]
    fn test_length_prefixed() {
        let mut buf = BytesMut::new();
        encode_length_prefixed(&mut buf, b"hello world");

        let mut slice: &[u8] = &buf;
        assert_eq!(decode_length_prefixed(&mut slice), Some(&b"hello world"[..]));
        assert!(slice.is_empty());
    }

    #[test]
    fn test_decode_truncated() {
        let mut empty: &[u8] = &[];
        assert!(decode_uvarint(&mut empty).is_none());

        let mut short: &[u8] = &[0x80, 0x80];
        assert!(decode_uvarint(&mut short).is_none());

        let mut truncated: &[u8] = &[0x05, b'a'];
        assert!(decode_length_prefixed(&mut truncated).is_none());
    }

    #[test]
    fn test_read_fixed() {
        assert_eq!(read_fixed32(&7u32.to_le_bytes()), Some(7));
        assert_eq!(read_fixed64(&0x69632d656d656c65u64.to_le_bytes()), Some(0x69632d656d656c65));
        assert_eq!(read_fixed32(&[1, 2]), None);
    }
}

//! Allocation-free protobuf primitives
//!
//! Every function takes the destination slice and the current write position and
//! returns the position after the write. Nothing here keeps state between calls, so
//! writers compose them freely and tests can drive them against a plain array.
//!
//! Each write checks the remaining room first and fails with
//! [`ExportError::BufferExhausted`] instead of touching bytes past the end.

use crate::errors::{ExportError, Result};

/// Width of a reserved length placeholder.
pub const RESERVED_LENGTH_BYTES: usize = 4;

/// Largest length a 4-byte padded varint can carry.
pub const MAX_RESERVED_LENGTH: usize = (1 << 28) - 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WireType {
    Varint = 0,
    Fixed64 = 1,
    Len = 2,
    Fixed32 = 5,
}

/// A reserved length placeholder waiting for its content to be written.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LengthPatch {
    position: usize,
}

impl LengthPatch {
    /// Offset of the placeholder bytes.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Offset of the first content byte after the placeholder.
    pub fn content_start(&self) -> usize {
        self.position + RESERVED_LENGTH_BYTES
    }
}

#[inline]
fn ensure(buf: &[u8], pos: usize, len: usize) -> Result<()> {
    let end = pos.saturating_add(len);
    if end > buf.len() {
        return Err(ExportError::BufferExhausted {
            requested: end,
            capacity: buf.len(),
        });
    }
    Ok(())
}

/// Number of bytes `value` takes as a varint.
#[inline]
pub fn varint_len(value: u64) -> usize {
    let bits = 64 - (value | 1).leading_zeros() as usize;
    bits.div_ceil(7)
}

#[inline]
pub fn tag_len(field: u32) -> usize {
    varint_len(u64::from(field) << 3)
}

/// Encoded size of a length-delimited field carrying `content_len` bytes.
#[inline]
pub fn len_field_len(field: u32, content_len: usize) -> usize {
    tag_len(field) + varint_len(content_len as u64) + content_len
}

pub fn write_varint(buf: &mut [u8], mut pos: usize, mut value: u64) -> Result<usize> {
    ensure(buf, pos, varint_len(value))?;
    while value >= 0x80 {
        buf[pos] = (value as u8) | 0x80;
        value >>= 7;
        pos += 1;
    }
    buf[pos] = value as u8;
    Ok(pos + 1)
}

pub fn write_tag(buf: &mut [u8], pos: usize, field: u32, wire_type: WireType) -> Result<usize> {
    write_varint(buf, pos, (u64::from(field) << 3) | wire_type as u64)
}

pub fn write_fixed32(buf: &mut [u8], pos: usize, value: u32) -> Result<usize> {
    write_bytes(buf, pos, &value.to_le_bytes())
}

pub fn write_fixed64(buf: &mut [u8], pos: usize, value: u64) -> Result<usize> {
    write_bytes(buf, pos, &value.to_le_bytes())
}

pub fn write_double(buf: &mut [u8], pos: usize, value: f64) -> Result<usize> {
    write_fixed64(buf, pos, value.to_bits())
}

/// Copies raw bytes with no tag or length.
pub fn write_bytes(buf: &mut [u8], pos: usize, bytes: &[u8]) -> Result<usize> {
    ensure(buf, pos, bytes.len())?;
    let end = pos + bytes.len();
    buf[pos..end].copy_from_slice(bytes);
    Ok(end)
}

/// Writes a length-delimited tag and skips the placeholder for its length.
pub fn reserve_length_prefix(
    buf: &mut [u8],
    pos: usize,
    field: u32,
) -> Result<(LengthPatch, usize)> {
    let pos = write_tag(buf, pos, field, WireType::Len)?;
    ensure(buf, pos, RESERVED_LENGTH_BYTES)?;
    Ok((LengthPatch { position: pos }, pos + RESERVED_LENGTH_BYTES))
}

/// Fills a placeholder with `content_length` as a 4-byte padded varint.
///
/// Padded varints decode like any other varint, so the output stays readable by
/// stock protobuf decoders.
///
/// # Panics
///
/// Panics if `content_length` cannot fit in the placeholder. Writers encode into
/// a `ScratchBuffer`, whose capacity never exceeds [`MAX_RESERVED_LENGTH`].
pub fn patch_length(buf: &mut [u8], patch: LengthPatch, content_length: usize) {
    assert!(
        content_length <= MAX_RESERVED_LENGTH,
        "length {} does not fit a reserved prefix",
        content_length
    );
    let p = patch.position;
    buf[p] = (content_length & 0x7F) as u8 | 0x80;
    buf[p + 1] = ((content_length >> 7) & 0x7F) as u8 | 0x80;
    buf[p + 2] = ((content_length >> 14) & 0x7F) as u8 | 0x80;
    buf[p + 3] = ((content_length >> 21) & 0x7F) as u8;
}

/// Resolves `patch` given the current end of its content and returns the length.
///
/// # Panics
///
/// Panics if `end` lies before the placeholder's content, which means patches were
/// closed out of order.
pub fn close_length(buf: &mut [u8], patch: LengthPatch, end: usize) -> usize {
    assert!(
        end >= patch.content_start(),
        "patch at {} closed at earlier position {}",
        patch.position,
        end
    );
    let content_length = end - patch.content_start();
    patch_length(buf, patch, content_length);
    content_length
}

pub fn write_bytes_with_tag(buf: &mut [u8], pos: usize, field: u32, bytes: &[u8]) -> Result<usize> {
    ensure(buf, pos, len_field_len(field, bytes.len()))?;
    let pos = write_tag(buf, pos, field, WireType::Len)?;
    let pos = write_varint(buf, pos, bytes.len() as u64)?;
    write_bytes(buf, pos, bytes)
}

pub fn write_string_with_tag(buf: &mut [u8], pos: usize, field: u32, value: &str) -> Result<usize> {
    write_bytes_with_tag(buf, pos, field, value.as_bytes())
}

pub fn write_varint_with_tag(buf: &mut [u8], pos: usize, field: u32, value: u64) -> Result<usize> {
    let pos = write_tag(buf, pos, field, WireType::Varint)?;
    write_varint(buf, pos, value)
}

/// Enums are int32 on the wire; negative values sign-extend to ten bytes.
pub fn write_enum_with_tag(buf: &mut [u8], pos: usize, field: u32, value: i32) -> Result<usize> {
    write_varint_with_tag(buf, pos, field, i64::from(value) as u64)
}

pub fn write_bool_with_tag(buf: &mut [u8], pos: usize, field: u32, value: bool) -> Result<usize> {
    write_varint_with_tag(buf, pos, field, u64::from(value))
}

pub fn write_fixed32_with_tag(buf: &mut [u8], pos: usize, field: u32, value: u32) -> Result<usize> {
    let pos = write_tag(buf, pos, field, WireType::Fixed32)?;
    write_fixed32(buf, pos, value)
}

pub fn write_fixed64_with_tag(buf: &mut [u8], pos: usize, field: u32, value: u64) -> Result<usize> {
    let pos = write_tag(buf, pos, field, WireType::Fixed64)?;
    write_fixed64(buf, pos, value)
}

pub fn write_sfixed64_with_tag(buf: &mut [u8], pos: usize, field: u32, value: i64) -> Result<usize> {
    write_fixed64_with_tag(buf, pos, field, value as u64)
}

pub fn write_double_with_tag(buf: &mut [u8], pos: usize, field: u32, value: f64) -> Result<usize> {
    write_fixed64_with_tag(buf, pos, field, value.to_bits())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_encoding() {
        let mut buf = [0u8; 16];
        let end = write_varint(&mut buf, 0, 300).unwrap();
        assert_eq!(&buf[..end], &[0xAC, 0x02]);

        let end = write_varint(&mut buf, 0, 0).unwrap();
        assert_eq!(&buf[..end], &[0x00]);

        let end = write_varint(&mut buf, 0, u64::MAX).unwrap();
        assert_eq!(end, 10);
        assert_eq!(buf[9], 0x01);
    }

    #[test]
    fn test_varint_len_boundaries() {
        assert_eq!(varint_len(0), 1);
        assert_eq!(varint_len(127), 1);
        assert_eq!(varint_len(128), 2);
        assert_eq!(varint_len(16_383), 2);
        assert_eq!(varint_len(16_384), 3);
        assert_eq!(varint_len(u64::MAX), 10);
    }

    #[test]
    fn test_tag_encoding() {
        let mut buf = [0u8; 4];
        let end = write_tag(&mut buf, 0, 1, WireType::Len).unwrap();
        assert_eq!(&buf[..end], &[0x0A]);

        // Field 16 no longer fits in a single tag byte.
        let end = write_tag(&mut buf, 0, 16, WireType::Fixed32).unwrap();
        assert_eq!(&buf[..end], &[0x85, 0x01]);
        assert_eq!(tag_len(16), 2);
    }

    #[test]
    fn test_negative_enum_takes_ten_bytes() {
        let mut buf = [0u8; 16];
        let end = write_enum_with_tag(&mut buf, 0, 1, -1).unwrap();
        assert_eq!(end, 11);
    }

    #[test]
    fn test_string_with_tag() {
        let mut buf = [0u8; 16];
        let end = write_string_with_tag(&mut buf, 0, 5, "op").unwrap();
        assert_eq!(&buf[..end], &[0x2A, 0x02, b'o', b'p']);
        assert_eq!(len_field_len(5, 2), end);
    }

    #[test]
    fn test_utf8_length_is_byte_length() {
        let mut buf = [0u8; 16];
        let end = write_string_with_tag(&mut buf, 0, 1, "é").unwrap();
        assert_eq!(buf[1], 2);
        assert_eq!(end, 4);
    }

    #[test]
    fn test_reserve_and_patch_length() {
        let mut buf = [0u8; 32];
        let (patch, pos) = reserve_length_prefix(&mut buf, 0, 2).unwrap();
        assert_eq!(buf[0], 0x12);
        assert_eq!(patch.position(), 1);
        assert_eq!(pos, 5);

        let pos = write_string_with_tag(&mut buf, pos, 1, "abc").unwrap();
        let len = close_length(&mut buf, patch, pos);
        assert_eq!(len, 5);
        assert_eq!(&buf[1..5], &[0x85, 0x80, 0x80, 0x00]);
    }

    #[test]
    fn test_patch_length_large_value() {
        let mut buf = [0u8; 4];
        patch_length(&mut buf, LengthPatch { position: 0 }, 300);
        assert_eq!(&buf, &[0xAC, 0x82, 0x80, 0x00]);
    }

    #[test]
    #[should_panic]
    fn test_patch_closed_before_content_panics() {
        let mut buf = [0u8; 8];
        let (patch, _) = reserve_length_prefix(&mut buf, 0, 1).unwrap();
        close_length(&mut buf, patch, 2);
    }

    #[test]
    fn test_exhaustion_is_reported_not_written() {
        let mut buf = [0u8; 4];
        let err = write_fixed64(&mut buf, 0, 7).unwrap_err();
        match err {
            ExportError::BufferExhausted { requested, capacity } => {
                assert_eq!(requested, 8);
                assert_eq!(capacity, 4);
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(buf, [0u8; 4]);

        let mut buf = [0u8; 5];
        assert!(write_string_with_tag(&mut buf, 0, 1, "hello").unwrap_err().is_capacity());
        assert_eq!(buf, [0u8; 5]);

        let mut buf = [0u8; 3];
        assert!(reserve_length_prefix(&mut buf, 0, 1).is_err());
    }

    #[test]
    fn test_fixed_width_little_endian() {
        let mut buf = [0u8; 16];
        let end = write_fixed32_with_tag(&mut buf, 0, 16, 0x0101).unwrap();
        assert_eq!(&buf[..end], &[0x85, 0x01, 0x01, 0x01, 0x00, 0x00]);

        let end = write_double(&mut buf, 0, 1.5).unwrap();
        assert_eq!(&buf[..end], &1.5f64.to_bits().to_le_bytes());
    }
}

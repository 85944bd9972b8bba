//! Bounded scratch arena that one writer encodes a whole batch into

use crate::encoder::{self, LengthPatch};
use crate::errors::Result;

/// Default arena size, large enough for one batch of a busy process.
pub const DEFAULT_CAPACITY: usize = 750_000;

/// Largest usable arena. Any record inside it has a length that fits a
/// reserved prefix, so running out of room is always `BufferExhausted`.
pub const MAX_CAPACITY: usize = encoder::MAX_RESERVED_LENGTH;

/// Fixed-capacity byte array with a write cursor.
///
/// Not thread-safe and never shared: each writer owns exactly one. `reset` only
/// rewinds the cursor; bytes past it are stale and unreachable.
#[derive(Debug)]
pub struct ScratchBuffer {
    bytes: Box<[u8]>,
    position: usize,
}

impl ScratchBuffer {
    /// `capacity` is clamped to [`MAX_CAPACITY`].
    pub fn new(capacity: usize) -> Self {
        Self {
            bytes: vec![0u8; capacity.min(MAX_CAPACITY)].into_boxed_slice(),
            position: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.position
    }

    pub fn is_empty(&self) -> bool {
        self.position == 0
    }

    /// The bytes written since the last reset.
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.position]
    }

    pub fn reset(&mut self) {
        self.position = 0;
    }

    /// Runs one encoder operation at the cursor and advances past what it wrote.
    ///
    /// On error the cursor stays where it was.
    #[inline]
    pub fn write<F>(&mut self, op: F) -> Result<()>
    where
        F: FnOnce(&mut [u8], usize) -> Result<usize>,
    {
        self.position = op(&mut self.bytes, self.position)?;
        Ok(())
    }

    /// Writes a length-delimited tag for `field` and reserves its length placeholder.
    pub fn reserve_length(&mut self, field: u32) -> Result<LengthPatch> {
        let (patch, position) = encoder::reserve_length_prefix(&mut self.bytes, self.position, field)?;
        self.position = position;
        Ok(patch)
    }

    /// Back-patches `patch` with everything written since it was reserved.
    pub fn close_length(&mut self, patch: LengthPatch) -> usize {
        encoder::close_length(&mut self.bytes, patch, self.position)
    }

    /// Buffer utilization as a percentage
    pub fn utilization(&self) -> f64 {
        if self.bytes.is_empty() {
            return 0.0;
        }
        (self.position as f64 / self.bytes.len() as f64) * 100.0
    }
}

impl Default for ScratchBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_advances_cursor() {
        let mut scratch = ScratchBuffer::new(16);
        scratch
            .write(|b, p| encoder::write_string_with_tag(b, p, 1, "ab"))
            .unwrap();
        assert_eq!(scratch.position(), 4);
        assert_eq!(scratch.as_slice(), &[0x0A, 0x02, b'a', b'b']);
        assert_eq!(scratch.remaining(), 12);
        assert_eq!(scratch.utilization(), 25.0);
    }

    #[test]
    fn test_failed_write_keeps_cursor() {
        let mut scratch = ScratchBuffer::new(6);
        scratch.write(|b, p| encoder::write_fixed32(b, p, 1)).unwrap();
        let err = scratch
            .write(|b, p| encoder::write_fixed32(b, p, 2))
            .unwrap_err();
        assert!(err.is_capacity());
        assert_eq!(scratch.position(), 4);
    }

    #[test]
    fn test_reset_rewinds_without_clearing() {
        let mut scratch = ScratchBuffer::new(8);
        scratch.write(|b, p| encoder::write_fixed32(b, p, 0xDEADBEEF)).unwrap();
        scratch.reset();
        assert!(scratch.is_empty());
        assert!(scratch.as_slice().is_empty());
        assert_eq!(scratch.capacity(), 8);
    }

    #[test]
    fn test_capacity_is_clamped_to_what_a_prefix_can_hold() {
        let scratch = ScratchBuffer::new(MAX_CAPACITY + 4096);
        assert_eq!(scratch.capacity(), MAX_CAPACITY);
        assert_eq!(ScratchBuffer::new(MAX_CAPACITY).capacity(), MAX_CAPACITY);
    }

    #[test]
    fn test_nested_patches_close_inner_first() {
        let mut scratch = ScratchBuffer::new(64);
        let outer = scratch.reserve_length(1).unwrap();
        let inner = scratch.reserve_length(2).unwrap();
        scratch
            .write(|b, p| encoder::write_string_with_tag(b, p, 1, "xyz"))
            .unwrap();
        assert_eq!(scratch.close_length(inner), 5);
        // Inner record = tag (1) + placeholder (4) + content (5).
        assert_eq!(scratch.close_length(outer), 10);
    }
}

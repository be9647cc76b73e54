//! # Byte Cursor
//!
//! Bounds-checked, big-endian read cursor over a module blob.

use crate::{LoadError, LoadResult};

/// Read cursor over an immutable blob
///
/// Every read either consumes exactly the requested bytes or fails with
/// [`LoadError::Truncated`] and leaves the position unchanged.
#[derive(Debug, Clone)]
pub struct ByteCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteCursor<'a> {
    /// Create cursor at the start of `data`
    pub const fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Create cursor positioned at `pos`
    pub fn at(data: &'a [u8], pos: usize) -> LoadResult<Self> {
        if pos > data.len() {
            return Err(LoadError::Truncated {
                offset: data.len(),
                needed: pos - data.len(),
                remaining: 0,
            });
        }
        Ok(Self { data, pos })
    }

    /// Current offset into the blob
    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left to read
    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Returns `true` once every byte has been consumed
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Borrow the next `len` bytes and advance past them
    pub fn take(&mut self, len: usize) -> LoadResult<&'a [u8]> {
        if len > self.remaining() {
            return Err(LoadError::Truncated {
                offset: self.pos,
                needed: len,
                remaining: self.remaining(),
            });
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    /// Advance without reading
    pub fn skip(&mut self, len: usize) -> LoadResult<()> {
        self.take(len).map(|_| ())
    }

    /// Read one byte
    pub fn read_u8(&mut self) -> LoadResult<u8> {
        Ok(self.take(1)?[0])
    }

    /// Read a big-endian half word
    pub fn read_u16(&mut self) -> LoadResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    /// Read a big-endian word
    pub fn read_u32(&mut self) -> LoadResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_big_endian_reads() {
        let data = [0x12, 0x34, 0x56, 0x78, 0x9A, 0xBC, 0xDE];
        let mut cur = ByteCursor::new(&data);

        assert_eq!(cur.read_u32().unwrap(), 0x12345678);
        assert_eq!(cur.read_u16().unwrap(), 0x9ABC);
        assert_eq!(cur.read_u8().unwrap(), 0xDE);
        assert!(cur.is_empty());
    }

    #[test]
    fn test_truncated_read_keeps_position() {
        let data = [1, 2, 3];
        let mut cur = ByteCursor::new(&data);
        cur.skip(1).unwrap();

        let err = cur.read_u32().unwrap_err();
        assert_eq!(
            err,
            LoadError::Truncated {
                offset: 1,
                needed: 4,
                remaining: 2
            }
        );
        assert_eq!(cur.position(), 1);
        assert_eq!(cur.read_u16().unwrap(), 0x0203);
    }

    #[test]
    fn test_at_bounds() {
        let data = [0u8; 8];
        assert_eq!(ByteCursor::at(&data, 8).unwrap().remaining(), 0);
        assert_eq!(
            ByteCursor::at(&data, 11).unwrap_err(),
            LoadError::Truncated {
                offset: 8,
                needed: 3,
                remaining: 0
            }
        );
    }
}

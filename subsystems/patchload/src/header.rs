//! # Module Header
//!
//! Validation and decoding of the fixed 32-byte module header.
//!
//! ```text
//! 0x00  u32  magic part 1   'Kame'
//! 0x04  u16  magic part 2   'k\0'
//! 0x06  u16  version        2
//! 0x08  u32  bss size
//! 0x0C  u32  code size
//! 0x10  u32  ctor range start (module offset)
//! 0x14  u32  ctor range end   (module offset)
//! 0x18  u32  padding[2]
//! ```
//!
//! The header is followed by `code size` bytes of code and then by the
//! patch record stream. All fields are big-endian.

use core::fmt;
use core::ops::Range;

use static_assertions::{assert_impl_all, const_assert, const_assert_eq};

use crate::{ByteCursor, LoadError, LoadResult};

// ============================================================================
// CONSTANTS
// ============================================================================

/// First magic word (`'Kame'`)
pub const MAGIC_1: u32 = u32::from_be_bytes(*b"Kame");

/// Second magic half word (`'k\0'`)
pub const MAGIC_2: u16 = u16::from_be_bytes(*b"k\0");

/// Only header version this loader accepts
pub const SUPPORTED_VERSION: u16 = 2;

/// Header size in bytes, including padding
pub const HEADER_SIZE: usize = 32;

/// Size of one constructor table entry
pub const CTOR_ENTRY_SIZE: u32 = 4;

const HEADER_PADDING: usize = 8;

const_assert_eq!(HEADER_SIZE, 4 + 2 + 2 + 4 * 4 + HEADER_PADDING);
const_assert!(HEADER_SIZE % 4 == 0);

// ============================================================================
// MODULE LAYOUT
// ============================================================================

/// Sizes and constructor range decoded from the header
///
/// Invariant: `ctor_start <= ctor_end <= code_size + bss_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleLayout {
    /// Bytes of code copied from the blob
    pub code_size: u32,
    /// Bytes zero-filled after the code
    pub bss_size: u32,
    /// Module offset of the first constructor entry
    pub ctor_start: u32,
    /// Module offset one past the last constructor entry
    pub ctor_end: u32,
}

assert_impl_all!(ModuleLayout: Copy, Send, Sync);

impl ModuleLayout {
    /// Size of the module's memory block (code + bss)
    #[inline]
    pub fn total_size(&self) -> u32 {
        // Checked during parsing
        self.code_size + self.bss_size
    }

    /// Blob range holding the code bytes
    #[inline]
    pub fn code_range(&self) -> Range<usize> {
        HEADER_SIZE..HEADER_SIZE + self.code_size as usize
    }

    /// Blob offset of the first patch record
    #[inline]
    pub fn commands_offset(&self) -> usize {
        self.code_range().end
    }

    /// Number of constructor entries
    #[inline]
    pub fn ctor_count(&self) -> u32 {
        (self.ctor_end - self.ctor_start) / CTOR_ENTRY_SIZE
    }

    fn validate(&self) -> LoadResult<()> {
        let total = self
            .code_size
            .checked_add(self.bss_size)
            .ok_or(LoadError::InvalidLayout("code + bss size overflows"))?;

        if self.ctor_start > self.ctor_end {
            return Err(LoadError::InvalidLayout("ctor range is reversed"));
        }
        if self.ctor_end > total {
            return Err(LoadError::InvalidLayout("ctor range exceeds module"));
        }
        if (self.ctor_end - self.ctor_start) % CTOR_ENTRY_SIZE != 0 {
            return Err(LoadError::InvalidLayout("ctor range is not a whole number of entries"));
        }
        Ok(())
    }
}

impl fmt::Display for ModuleLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "bssSize={}, codeSize={}, ctors={}-{}",
            self.bss_size, self.code_size, self.ctor_start, self.ctor_end
        )
    }
}

// ============================================================================
// HEADER PARSER
// ============================================================================

/// Module header parser
///
/// Parsing is all-or-nothing: any mismatch aborts before memory is allocated.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeaderParser;

impl HeaderParser {
    /// Validate the header and return the module layout
    ///
    /// Besides the magic and version gates this checks that the blob really
    /// carries every code byte the header announces.
    pub fn parse(blob: &[u8]) -> LoadResult<ModuleLayout> {
        let mut cur = ByteCursor::new(blob);

        let magic1 = cur.read_u32()?;
        let magic2 = cur.read_u16()?;
        if magic1 != MAGIC_1 || magic2 != MAGIC_2 {
            return Err(LoadError::BadMagic);
        }

        let version = cur.read_u16()?;
        if version != SUPPORTED_VERSION {
            return Err(LoadError::UnsupportedVersion(version));
        }

        let bss_size = cur.read_u32()?;
        let code_size = cur.read_u32()?;
        let ctor_start = cur.read_u32()?;
        let ctor_end = cur.read_u32()?;
        cur.skip(HEADER_PADDING)?;

        let layout = ModuleLayout {
            code_size,
            bss_size,
            ctor_start,
            ctor_end,
        };
        layout.validate()?;

        // The code section must be fully present
        cur.skip(code_size as usize)?;

        Ok(layout)
    }
}

// ============================================================================
// TESTS
// ============================================================================

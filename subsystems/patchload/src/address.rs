//! # Addresses
//!
//! Tagged address fields and their resolution against a loaded module.
//!
//! Address fields in the record stream are 32-bit. A field whose
//! most-significant bit is set names an absolute location in the host image;
//! any other field is an offset from the module base chosen at load time.

use core::fmt;

use static_assertions::assert_impl_all;

use crate::{LoadError, LoadResult};

// ============================================================================
// ADDRESS REFERENCE
// ============================================================================

/// Address field read from the record stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressRef {
    /// Literal address in the target address space
    Absolute(u32),
    /// Offset from the module base address
    ModuleRelative(u32),
}

assert_impl_all!(AddressRef: Copy, Send, Sync);

impl AddressRef {
    /// Bit selecting absolute addressing in an operand word
    pub const ABSOLUTE_FLAG: u32 = 0x8000_0000;

    /// Classify a raw operand word by its top bit
    #[inline]
    pub const fn from_word(word: u32) -> Self {
        if word & Self::ABSOLUTE_FLAG != 0 {
            Self::Absolute(word)
        } else {
            Self::ModuleRelative(word)
        }
    }

    /// Raw 32-bit value carried by the field
    #[inline]
    pub const fn raw(self) -> u32 {
        match self {
            Self::Absolute(v) | Self::ModuleRelative(v) => v,
        }
    }

    /// Returns `true` for absolute addresses
    #[inline]
    pub const fn is_absolute(self) -> bool {
        matches!(self, Self::Absolute(_))
    }

    /// Returns `true` if `from_word(self.raw())` yields `self` again
    ///
    /// Only such references can be stored in an operand word.
    #[inline]
    pub const fn is_operand_encodable(self) -> bool {
        match self {
            Self::Absolute(v) => v & Self::ABSOLUTE_FLAG != 0,
            Self::ModuleRelative(v) => v & Self::ABSOLUTE_FLAG == 0,
        }
    }

    /// Resolve to a machine address
    #[inline]
    pub fn resolve(self, module: &LoadedModule) -> usize {
        module.resolve(self)
    }
}

impl fmt::Display for AddressRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Absolute(v) => write!(f, "{:#010x}", v),
            Self::ModuleRelative(v) => write!(f, "module+{:#x}", v),
        }
    }
}

// ============================================================================
// LOADED MODULE
// ============================================================================

/// Memory block holding a module's code and bss
///
/// Owned by the loader between allocation and a successful return, and by
/// the caller afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadedModule {
    /// First byte of the block
    pub base_address: usize,
    /// Code + bss size in bytes
    pub total_size: u32,
}

assert_impl_all!(LoadedModule: Copy, Send, Sync);

impl LoadedModule {
    /// Create a module descriptor
    pub const fn new(base_address: usize, total_size: u32) -> Self {
        Self {
            base_address,
            total_size,
        }
    }

    /// Map an address field to its final address
    ///
    /// Absolute fields are returned unchanged; relative fields are added to
    /// the base address.
    #[inline]
    pub fn resolve(&self, addr: AddressRef) -> usize {
        match addr {
            AddressRef::Absolute(v) => v as usize,
            AddressRef::ModuleRelative(off) => self.base_address.wrapping_add(off as usize),
        }
    }

    /// One past the last byte of the block
    #[inline]
    pub fn end_address(&self) -> usize {
        self.base_address + self.total_size as usize
    }

    /// Returns `true` if `addr` lies inside the block
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base_address && addr < self.end_address()
    }
}

/// Narrow a resolved address to the 32-bit width of the module format
#[inline]
pub fn narrow(addr: usize) -> LoadResult<u32> {
    u32::try_from(addr).map_err(|_| LoadError::AddressOverflow(addr))
}

// ============================================================================
// TESTS
// ============================================================================

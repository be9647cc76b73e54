//! # Load Errors
//!
//! Error taxonomy shared by every stage of the loader.

use core::fmt;

/// Loader result type
pub type LoadResult<T> = Result<T, LoadError>;

/// Loader error types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadError {
    /// Header magic does not match (either part)
    BadMagic,
    /// Header version is not the one this loader understands
    UnsupportedVersion(u16),
    /// Header sizes or constructor range are inconsistent
    InvalidLayout(&'static str),
    /// Memory provider could not satisfy the request
    OutOfMemory {
        /// Requested size in bytes
        requested: usize,
    },
    /// Record carries a tag outside the known opcode set
    UnknownOpcode {
        /// Raw opcode tag
        tag: u8,
        /// Blob offset of the record header
        offset: usize,
    },
    /// Blob ends in the middle of a header, section or record
    Truncated {
        /// Blob offset where the read started
        offset: usize,
        /// Bytes required
        needed: usize,
        /// Bytes left in the blob
        remaining: usize,
    },
    /// Branch displacement is not a multiple of the instruction size
    MisalignedBranch {
        /// Branch instruction address
        source: usize,
        /// Branch target address
        target: usize,
    },
    /// Branch displacement does not fit the 26-bit signed field
    BranchOutOfRange {
        /// Branch instruction address
        source: usize,
        /// Branch target address
        target: usize,
    },
    /// Address does not fit the 32-bit module format
    AddressOverflow(usize),
    /// Access outside any mapped region of the target
    AccessFault {
        /// Faulting address
        address: usize,
        /// Access width in bytes
        len: usize,
    },
    /// Byte source has no file at the requested path
    SourceNotFound,
    /// Byte source failed while reading
    SourceReadFailed,
}

impl LoadError {
    /// Returns `true` for errors detected before any memory was allocated.
    pub fn is_header_error(&self) -> bool {
        matches!(
            self,
            Self::BadMagic | Self::UnsupportedVersion(_) | Self::InvalidLayout(_)
        )
    }
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadMagic => write!(f, "Corrupted module: bad magic"),
            Self::UnsupportedVersion(v) => {
                write!(
                    f,
                    "Incompatible module (version {}), loader supports {}",
                    v,
                    crate::header::SUPPORTED_VERSION
                )
            },
            Self::InvalidLayout(why) => write!(f, "Invalid module layout: {}", why),
            Self::OutOfMemory { requested } => {
                write!(f, "Out of memory: {:#x} bytes requested", requested)
            },
            Self::UnknownOpcode { tag, offset } => {
                write!(f, "Unknown patch opcode {} at offset {:#x}", tag, offset)
            },
            Self::Truncated {
                offset,
                needed,
                remaining,
            } => write!(
                f,
                "Truncated module at offset {:#x}: need {} bytes, {} left",
                offset, needed, remaining
            ),
            Self::MisalignedBranch { source, target } => {
                write!(f, "Misaligned branch {:#x} -> {:#x}", source, target)
            },
            Self::BranchOutOfRange { source, target } => {
                write!(f, "Branch out of range {:#x} -> {:#x}", source, target)
            },
            Self::AddressOverflow(addr) => {
                write!(f, "Address {:#x} does not fit in 32 bits", addr)
            },
            Self::AccessFault { address, len } => {
                write!(f, "Access fault at {:#x} ({} bytes)", address, len)
            },
            Self::SourceNotFound => write!(f, "Module file not found"),
            Self::SourceReadFailed => write!(f, "Module file could not be read"),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

//! # Branch Encoding
//!
//! The 24-bit relative branch field and the unconditional branch instruction.
//!
//! ```text
//!  31      26 25                                   2  1  0
//! ┌──────────┬──────────────────────────────────────┬──┬──┐
//! │  opcode  │          displacement >> 2           │AA│LK│
//! └──────────┴──────────────────────────────────────┴──┴──┘
//! ```
//!
//! The displacement is a signed byte offset from the instruction's own
//! address. Addresses wrap at 32 bits, as they do on the hardware.

use crate::address::narrow;
use crate::{LoadError, LoadResult};

bitflags::bitflags! {
    /// Low-order branch instruction bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BranchFlags: u32 {
        /// Store the return address in the link register
        const LINK = 1 << 0;
        /// Displacement is an absolute address
        const ABSOLUTE = 1 << 1;
    }
}

/// Unconditional branch, relative, no link
pub const OP_BRANCH: u32 = 0x4800_0000;

/// Bits a Rel24 fixup leaves untouched
pub const REL24_KEEP_MASK: u32 = 0xFC00_0003;

/// Bits holding the displacement
pub const REL24_FIELD_MASK: u32 = 0x03FF_FFFC;

/// Reach of the displacement in either direction
pub const BRANCH_REACH: i32 = 1 << 25;

/// Compute the displacement from `source` to `target`
///
/// The result is already masked to [`REL24_FIELD_MASK`].
pub fn displacement(source: usize, target: usize) -> LoadResult<u32> {
    let delta = narrow(target)?.wrapping_sub(narrow(source)?) as i32;

    if delta & 3 != 0 {
        return Err(LoadError::MisalignedBranch { source, target });
    }
    if !(-BRANCH_REACH..BRANCH_REACH).contains(&delta) {
        return Err(LoadError::BranchOutOfRange { source, target });
    }
    Ok(delta as u32 & REL24_FIELD_MASK)
}

/// Replace the displacement field of `word`
#[inline]
pub const fn encode_rel24(word: u32, field: u32) -> u32 {
    (word & REL24_KEEP_MASK) | (field & REL24_FIELD_MASK)
}

/// Sign-extended displacement carried by `word`
#[inline]
pub const fn decode_displacement(word: u32) -> i32 {
    (((word & REL24_FIELD_MASK) << 6) as i32) >> 6
}

/// Unconditional branch instruction with `flags`, displacement zero
#[inline]
pub const fn branch_word(flags: BranchFlags) -> u32 {
    OP_BRANCH | flags.bits()
}

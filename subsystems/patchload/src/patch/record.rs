//! # Patch Records
//!
//! Opcode set and decoding of the record stream.
//!
//! ```text
//! ┌────────┬────────────────────────┐
//! │ tag:8  │ address:24             │   header word
//! └────────┴────────────────────────┘
//! [ u32 absolute address ]              only if address == 0xFFFFFE
//! [ u32 operand ] [ u32 operand ]       0, 1 or 2 depending on tag
//! ```

use core::fmt;

use static_assertions::assert_impl_all;

use crate::{AddressRef, ByteCursor, LoadResult};

/// 24-bit address value announcing a trailing absolute address word
pub const ABSOLUTE_SENTINEL: u32 = 0x00FF_FFFE;

/// Mask of the address field in a header word
pub const ADDRESS_MASK: u32 = 0x00FF_FFFF;

// ============================================================================
// OPCODES
// ============================================================================

/// Record opcode tags
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// Store a resolved address
    Addr32 = 1,
    /// Store the low half of a resolved address
    Addr16Lo = 4,
    /// Store the high half of a resolved address
    Addr16Hi = 5,
    /// Store the high half, adjusted for a signed low half
    Addr16Ha = 6,
    /// Patch the displacement of a relative branch
    Rel24 = 10,
    /// Store a literal word
    Write32 = 32,
    /// Store a literal half word
    Write16 = 33,
    /// Store a literal byte
    Write8 = 34,
    /// Store a resolved address if the current word matches
    CondWritePointer = 35,
    /// Store a literal word if the current word matches
    CondWrite32 = 36,
    /// Store a literal half word if the current half word matches
    CondWrite16 = 37,
    /// Store a literal byte if the current byte matches
    CondWrite8 = 38,
    /// Inject an unconditional branch
    Branch = 64,
    /// Inject an unconditional branch-and-link
    BranchLink = 65,
}

impl Opcode {
    /// Every known opcode
    pub const ALL: [Opcode; 14] = [
        Self::Addr32,
        Self::Addr16Lo,
        Self::Addr16Hi,
        Self::Addr16Ha,
        Self::Rel24,
        Self::Write32,
        Self::Write16,
        Self::Write8,
        Self::CondWritePointer,
        Self::CondWrite32,
        Self::CondWrite16,
        Self::CondWrite8,
        Self::Branch,
        Self::BranchLink,
    ];

    /// Raw tag value
    #[inline]
    pub const fn tag(self) -> u8 {
        self as u8
    }

    /// Opcode name
    pub const fn name(self) -> &'static str {
        match self {
            Self::Addr32 => "Addr32",
            Self::Addr16Lo => "Addr16Lo",
            Self::Addr16Hi => "Addr16Hi",
            Self::Addr16Ha => "Addr16Ha",
            Self::Rel24 => "Rel24",
            Self::Write32 => "Write32",
            Self::Write16 => "Write16",
            Self::Write8 => "Write8",
            Self::CondWritePointer => "CondWritePointer",
            Self::CondWrite32 => "CondWrite32",
            Self::CondWrite16 => "CondWrite16",
            Self::CondWrite8 => "CondWrite8",
            Self::Branch => "Branch",
            Self::BranchLink => "BranchLink",
        }
    }

    /// Operand words following the record header
    pub const fn operand_words(self) -> usize {
        match self {
            Self::CondWritePointer | Self::CondWrite32 | Self::CondWrite16 | Self::CondWrite8 => 2,
            _ => 1,
        }
    }
}

impl TryFrom<u8> for Opcode {
    type Error = u8;

    fn try_from(tag: u8) -> Result<Self, u8> {
        Self::ALL.iter().copied().find(|op| op.tag() == tag).ok_or(tag)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// OPERATIONS
// ============================================================================

/// Store width
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    /// 8 bits
    Byte,
    /// 16 bits
    Half,
    /// 32 bits
    Word,
}

impl Width {
    /// Width in bytes
    #[inline]
    pub const fn bytes(self) -> usize {
        match self {
            Self::Byte => 1,
            Self::Half => 2,
            Self::Word => 4,
        }
    }

    /// Truncate `value` to this width
    #[inline]
    pub const fn mask(self, value: u32) -> u32 {
        match self {
            Self::Byte => value & 0xFF,
            Self::Half => value & 0xFFFF,
            Self::Word => value,
        }
    }
}

/// Which part of a resolved address an Addr fixup stores
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrKind {
    /// Whole word
    Full,
    /// Low 16 bits
    Lo,
    /// High 16 bits
    Hi,
    /// High 16 bits, plus one when bit 15 is set
    Ha,
}

impl AddrKind {
    /// Value stored for `target`, and its width
    pub const fn encode(self, target: u32) -> (u32, Width) {
        match self {
            Self::Full => (target, Width::Word),
            Self::Lo => (target & 0xFFFF, Width::Half),
            Self::Hi => (target >> 16, Width::Half),
            Self::Ha => {
                let carry = (target >> 15) & 1;
                (((target >> 16) + carry) & 0xFFFF, Width::Half)
            },
        }
    }
}

/// Decoded operation of one record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOp {
    /// Addr32 / Addr16Lo / Addr16Hi / Addr16Ha
    Addr {
        /// Part of the address stored
        kind: AddrKind,
        /// Location whose address is stored
        target: AddressRef,
    },
    /// Rel24
    Rel24 {
        /// Branch target
        target: AddressRef,
    },
    /// Write32 / Write16 / Write8
    Write {
        /// Store width
        width: Width,
        /// Literal, truncated to `width` when stored
        value: u32,
    },
    /// CondWrite32 / CondWrite16 / CondWrite8
    CondWrite {
        /// Store width
        width: Width,
        /// Literal to store
        value: u32,
        /// Value that must currently be present
        original: u32,
    },
    /// CondWritePointer
    CondWritePointer {
        /// Location whose address is stored
        target: AddressRef,
        /// Word that must currently be present
        original: u32,
    },
    /// Branch / BranchLink
    Branch {
        /// Branch-and-link
        link: bool,
        /// Branch target
        target: AddressRef,
    },
}

/// One decoded record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchRecord {
    /// Blob offset of the record header
    pub offset: usize,
    /// Location the record writes
    pub dest: AddressRef,
    /// Operation
    pub op: PatchOp,
}

assert_impl_all!(PatchRecord: Copy, Send, Sync);

impl PatchRecord {
    /// Opcode this record was decoded from
    pub fn opcode(&self) -> Opcode {
        match self.op {
            PatchOp::Addr { kind, .. } => match kind {
                AddrKind::Full => Opcode::Addr32,
                AddrKind::Lo => Opcode::Addr16Lo,
                AddrKind::Hi => Opcode::Addr16Hi,
                AddrKind::Ha => Opcode::Addr16Ha,
            },
            PatchOp::Rel24 { .. } => Opcode::Rel24,
            PatchOp::Write { width, .. } => match width {
                Width::Word => Opcode::Write32,
                Width::Half => Opcode::Write16,
                Width::Byte => Opcode::Write8,
            },
            PatchOp::CondWrite { width, .. } => match width {
                Width::Word => Opcode::CondWrite32,
                Width::Half => Opcode::CondWrite16,
                Width::Byte => Opcode::CondWrite8,
            },
            PatchOp::CondWritePointer { .. } => Opcode::CondWritePointer,
            PatchOp::Branch { link, .. } => {
                if link {
                    Opcode::BranchLink
                } else {
                    Opcode::Branch
                }
            },
        }
    }
}

impl fmt::Display for PatchRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#06x}] {} @ {}", self.offset, self.opcode(), self.dest)
    }
}

// ============================================================================
// DECODER
// ============================================================================

/// Result of decoding one record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decoded {
    /// Known opcode, fully decoded
    Record(PatchRecord),
    /// Unknown tag; only the header (and absolute word) was consumed
    Unknown {
        /// Raw tag
        tag: u8,
        /// Blob offset of the record header
        offset: usize,
        /// Destination field
        dest: AddressRef,
    },
}

/// Decode the record at the cursor
///
/// The destination is decoded before any operand is read.
pub fn decode_next(cur: &mut ByteCursor<'_>) -> LoadResult<Decoded> {
    let offset = cur.position();
    let header = cur.read_u32()?;
    let tag = (header >> 24) as u8;
    let field = header & ADDRESS_MASK;

    let dest = if field == ABSOLUTE_SENTINEL {
        AddressRef::Absolute(cur.read_u32()?)
    } else {
        AddressRef::ModuleRelative(field)
    };

    let opcode = match Opcode::try_from(tag) {
        Ok(op) => op,
        Err(tag) => return Ok(Decoded::Unknown { tag, offset, dest }),
    };

    let op = match opcode {
        Opcode::Addr32 => addr(AddrKind::Full, cur)?,
        Opcode::Addr16Lo => addr(AddrKind::Lo, cur)?,
        Opcode::Addr16Hi => addr(AddrKind::Hi, cur)?,
        Opcode::Addr16Ha => addr(AddrKind::Ha, cur)?,
        Opcode::Rel24 => PatchOp::Rel24 {
            target: location(cur)?,
        },
        Opcode::Write32 => write(Width::Word, cur)?,
        Opcode::Write16 => write(Width::Half, cur)?,
        Opcode::Write8 => write(Width::Byte, cur)?,
        Opcode::CondWritePointer => PatchOp::CondWritePointer {
            target: location(cur)?,
            original: cur.read_u32()?,
        },
        Opcode::CondWrite32 => cond_write(Width::Word, cur)?,
        Opcode::CondWrite16 => cond_write(Width::Half, cur)?,
        Opcode::CondWrite8 => cond_write(Width::Byte, cur)?,
        Opcode::Branch => PatchOp::Branch {
            link: false,
            target: location(cur)?,
        },
        Opcode::BranchLink => PatchOp::Branch {
            link: true,
            target: location(cur)?,
        },
    };

    Ok(Decoded::Record(PatchRecord { offset, dest, op }))
}

fn location(cur: &mut ByteCursor<'_>) -> LoadResult<AddressRef> {
    cur.read_u32().map(AddressRef::from_word)
}

fn addr(kind: AddrKind, cur: &mut ByteCursor<'_>) -> LoadResult<PatchOp> {
    Ok(PatchOp::Addr {
        kind,
        target: location(cur)?,
    })
}

fn write(width: Width, cur: &mut ByteCursor<'_>) -> LoadResult<PatchOp> {
    Ok(PatchOp::Write {
        width,
        value: cur.read_u32()?,
    })
}

fn cond_write(width: Width, cur: &mut ByteCursor<'_>) -> LoadResult<PatchOp> {
    Ok(PatchOp::CondWrite {
        width,
        value: cur.read_u32()?,
        original: cur.read_u32()?,
    })
}

// ============================================================================
// TESTS
// ============================================================================

//! # Module Builder
//!
//! Emits well-formed module blobs: header, code section and record stream.
//!
//! ```rust,ignore
//! use helix_patchload::AddressRef::{Absolute, ModuleRelative};
//!
//! let blob = ModuleBuilder::new()
//!     .code(&code)
//!     .bss(0x40)
//!     .ctors(0x20, 0x28)
//!     .branch_link(Absolute(0x8001_2340), ModuleRelative(0))
//!     .build()?;
//! ```
//!
//! Encoding problems are remembered and reported by [`ModuleBuilder::build`],
//! so calls can be chained freely.

use alloc::vec::Vec;
use core::fmt;

use crate::header::{HEADER_SIZE, MAGIC_1, MAGIC_2, SUPPORTED_VERSION};
use crate::patch::record::{ABSOLUTE_SENTINEL, ADDRESS_MASK};
use crate::patch::Opcode;
use crate::AddressRef;

// ============================================================================
// ERRORS
// ============================================================================

/// Reasons a blob cannot be encoded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildError {
    /// Relative destination does not fit the 24-bit address field
    DestinationOutOfRange(u32),
    /// Relative destination equals the absolute-address sentinel
    SentinelCollision,
    /// Operand address whose top bit contradicts its kind
    AmbiguousOperand(AddressRef),
    /// Code section larger than the header can describe
    CodeTooLarge(usize),
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DestinationOutOfRange(off) => {
                write!(f, "Destination offset {:#x} exceeds 24 bits", off)
            },
            Self::SentinelCollision => write!(f, "Destination offset collides with the sentinel"),
            Self::AmbiguousOperand(addr) => write!(f, "Operand {} cannot be encoded", addr),
            Self::CodeTooLarge(len) => write!(f, "Code section of {} bytes is too large", len),
        }
    }
}

// ============================================================================
// BUILDER
// ============================================================================

/// Module blob builder
#[derive(Debug, Clone)]
pub struct ModuleBuilder {
    version: u16,
    code: Vec<u8>,
    bss_size: u32,
    ctor_start: u32,
    ctor_end: u32,
    commands: Vec<u8>,
    error: Option<BuildError>,
}

impl Default for ModuleBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleBuilder {
    /// Empty module: no code, no bss, no constructors, no records
    pub fn new() -> Self {
        Self {
            version: SUPPORTED_VERSION,
            code: Vec::new(),
            bss_size: 0,
            ctor_start: 0,
            ctor_end: 0,
            commands: Vec::new(),
            error: None,
        }
    }

    /// Override the header version
    pub fn version(mut self, version: u16) -> Self {
        self.version = version;
        self
    }

    /// Set the code section
    pub fn code(mut self, code: &[u8]) -> Self {
        self.code = code.to_vec();
        self
    }

    /// Set the bss size
    pub fn bss(mut self, size: u32) -> Self {
        self.bss_size = size;
        self
    }

    /// Set the constructor table range (module offsets)
    pub fn ctors(mut self, start: u32, end: u32) -> Self {
        self.ctor_start = start;
        self.ctor_end = end;
        self
    }

    /// Append an Addr32 fixup
    pub fn addr32(self, dest: AddressRef, target: AddressRef) -> Self {
        self.located(Opcode::Addr32, dest, target)
    }

    /// Append an Addr16Lo fixup
    pub fn addr16_lo(self, dest: AddressRef, target: AddressRef) -> Self {
        self.located(Opcode::Addr16Lo, dest, target)
    }

    /// Append an Addr16Hi fixup
    pub fn addr16_hi(self, dest: AddressRef, target: AddressRef) -> Self {
        self.located(Opcode::Addr16Hi, dest, target)
    }

    /// Append an Addr16Ha fixup
    pub fn addr16_ha(self, dest: AddressRef, target: AddressRef) -> Self {
        self.located(Opcode::Addr16Ha, dest, target)
    }

    /// Append a Rel24 fixup
    pub fn rel24(self, dest: AddressRef, target: AddressRef) -> Self {
        self.located(Opcode::Rel24, dest, target)
    }

    /// Append a Write32
    pub fn write32(self, dest: AddressRef, value: u32) -> Self {
        self.raw_record(Opcode::Write32.tag(), dest, &[value])
    }

    /// Append a Write16
    pub fn write16(self, dest: AddressRef, value: u16) -> Self {
        self.raw_record(Opcode::Write16.tag(), dest, &[u32::from(value)])
    }

    /// Append a Write8
    pub fn write8(self, dest: AddressRef, value: u8) -> Self {
        self.raw_record(Opcode::Write8.tag(), dest, &[u32::from(value)])
    }

    /// Append a CondWritePointer
    pub fn cond_write_pointer(mut self, dest: AddressRef, target: AddressRef, original: u32) -> Self {
        self.check_operand(target);
        self.raw_record(Opcode::CondWritePointer.tag(), dest, &[target.raw(), original])
    }

    /// Append a CondWrite32
    pub fn cond_write32(self, dest: AddressRef, value: u32, original: u32) -> Self {
        self.raw_record(Opcode::CondWrite32.tag(), dest, &[value, original])
    }

    /// Append a CondWrite16
    pub fn cond_write16(self, dest: AddressRef, value: u16, original: u16) -> Self {
        self.raw_record(
            Opcode::CondWrite16.tag(),
            dest,
            &[u32::from(value), u32::from(original)],
        )
    }

    /// Append a CondWrite8
    pub fn cond_write8(self, dest: AddressRef, value: u8, original: u8) -> Self {
        self.raw_record(
            Opcode::CondWrite8.tag(),
            dest,
            &[u32::from(value), u32::from(original)],
        )
    }

    /// Append a Branch injection
    pub fn branch(self, dest: AddressRef, target: AddressRef) -> Self {
        self.located(Opcode::Branch, dest, target)
    }

    /// Append a BranchLink injection
    pub fn branch_link(self, dest: AddressRef, target: AddressRef) -> Self {
        self.located(Opcode::BranchLink, dest, target)
    }

    /// Append a record with an arbitrary tag and operand words
    pub fn raw_record(mut self, tag: u8, dest: AddressRef, operands: &[u32]) -> Self {
        let tag = u32::from(tag) << 24;
        match dest {
            AddressRef::Absolute(addr) => {
                self.push_word(tag | ABSOLUTE_SENTINEL);
                self.push_word(addr);
            },
            AddressRef::ModuleRelative(off) => {
                if off > ADDRESS_MASK {
                    self.fail(BuildError::DestinationOutOfRange(off));
                } else if off == ABSOLUTE_SENTINEL {
                    self.fail(BuildError::SentinelCollision);
                }
                self.push_word(tag | (off & ADDRESS_MASK));
            },
        }
        for &word in operands {
            self.push_word(word);
        }
        self
    }

    /// Append raw bytes to the record stream
    pub fn raw_bytes(mut self, bytes: &[u8]) -> Self {
        self.commands.extend_from_slice(bytes);
        self
    }

    /// Encode the blob
    pub fn build(self) -> Result<Vec<u8>, BuildError> {
        if let Some(err) = self.error {
            return Err(err);
        }
        let code_size =
            u32::try_from(self.code.len()).map_err(|_| BuildError::CodeTooLarge(self.code.len()))?;

        let mut out = Vec::with_capacity(HEADER_SIZE + self.code.len() + self.commands.len());
        out.extend_from_slice(&MAGIC_1.to_be_bytes());
        out.extend_from_slice(&MAGIC_2.to_be_bytes());
        out.extend_from_slice(&self.version.to_be_bytes());
        out.extend_from_slice(&self.bss_size.to_be_bytes());
        out.extend_from_slice(&code_size.to_be_bytes());
        out.extend_from_slice(&self.ctor_start.to_be_bytes());
        out.extend_from_slice(&self.ctor_end.to_be_bytes());
        out.resize(HEADER_SIZE, 0);

        out.extend_from_slice(&self.code);
        out.extend_from_slice(&self.commands);
        Ok(out)
    }

    fn located(mut self, op: Opcode, dest: AddressRef, target: AddressRef) -> Self {
        self.check_operand(target);
        self.raw_record(op.tag(), dest, &[target.raw()])
    }

    fn check_operand(&mut self, target: AddressRef) {
        if !target.is_operand_encodable() {
            self.fail(BuildError::AmbiguousOperand(target));
        }
    }

    fn push_word(&mut self, word: u32) {
        self.commands.extend_from_slice(&word.to_be_bytes());
    }

    fn fail(&mut self, err: BuildError) {
        self.error.get_or_insert(err);
    }
}

// ============================================================================
// TESTS
// ============================================================================

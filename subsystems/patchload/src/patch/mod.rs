//! # Patch Engine
//!
//! Applies the record stream that follows the code section.
//!
//! Records are applied strictly in order; a later record may rewrite a
//! location an earlier one produced. Every store is followed by cache
//! maintenance for exactly the bytes it touched, before the next record is
//! decoded.

pub mod branch;
pub mod record;

pub use self::record::{decode_next, AddrKind, Decoded, Opcode, PatchOp, PatchRecord, Width};

use self::branch::{BranchFlags, branch_word, displacement, encode_rel24};
use crate::address::narrow;
use crate::loader::UnknownOpcodePolicy;
use crate::platform::{AddressSpace, CacheSync};
use crate::{ByteCursor, LoadError, LoadResult, LoadedModule, PatchStats};

/// Bytes skipped after an unknown record's header
///
/// One operand word, the size of the smallest known record's payload.
pub const UNKNOWN_SKIP: usize = 4;

// ============================================================================
// ENGINE
// ============================================================================

/// Record stream interpreter
#[derive(Debug, Clone, Default)]
pub struct PatchEngine {
    policy: UnknownOpcodePolicy,
    stats: PatchStats,
}

impl PatchEngine {
    /// Create an engine handling unknown tags according to `policy`
    pub fn new(policy: UnknownOpcodePolicy) -> Self {
        Self {
            policy,
            stats: PatchStats::new(),
        }
    }

    /// Counters accumulated so far
    pub fn stats(&self) -> &PatchStats {
        &self.stats
    }

    /// Consume and apply every record until the cursor is exhausted
    ///
    /// Each iteration consumes at least eight bytes, so the loop always
    /// terminates.
    pub fn apply<S, C>(
        &mut self,
        cursor: &mut ByteCursor<'_>,
        module: &LoadedModule,
        space: &mut S,
        cache: &mut C,
    ) -> LoadResult<()>
    where
        S: AddressSpace + ?Sized,
        C: CacheSync + ?Sized,
    {
        while !cursor.is_empty() {
            match decode_next(cursor)? {
                Decoded::Record(record) => {
                    self.stats.total_records += 1;
                    self.apply_record(&record, module, space, cache)?;
                },
                Decoded::Unknown { tag, offset, .. } => {
                    self.stats.total_records += 1;
                    match self.policy {
                        UnknownOpcodePolicy::Abort => {
                            return Err(LoadError::UnknownOpcode { tag, offset });
                        },
                        UnknownOpcodePolicy::Skip => {
                            log::warn!("Unknown command: {} at offset {:#x}, skipping", tag, offset);
                            cursor.skip(UNKNOWN_SKIP)?;
                            self.stats.unknown_skipped += 1;
                        },
                    }
                },
            }
        }
        Ok(())
    }

    /// Apply one decoded record
    pub fn apply_record<S, C>(
        &mut self,
        record: &PatchRecord,
        module: &LoadedModule,
        space: &mut S,
        cache: &mut C,
    ) -> LoadResult<()>
    where
        S: AddressSpace + ?Sized,
        C: CacheSync + ?Sized,
    {
        #[cfg(feature = "debug_patch")]
        log::debug!("{} ({:?})", record, record.op);

        let dest = module.resolve(record.dest);

        let written = match record.op {
            PatchOp::Addr { kind, target } => {
                let (value, width) = kind.encode(narrow(module.resolve(target))?);
                store(space, dest, width, value)?;
                self.stats.addr_fixups += 1;
                Some(width.bytes())
            },
            PatchOp::Rel24 { target } => {
                let field = displacement(dest, module.resolve(target))?;
                let word = space.read_u32(dest)?;
                space.write_u32(dest, encode_rel24(word, field))?;
                self.stats.rel24_fixups += 1;
                Some(4)
            },
            PatchOp::Write { width, value } => {
                store(space, dest, width, value)?;
                self.stats.writes += 1;
                Some(width.bytes())
            },
            PatchOp::CondWrite {
                width,
                value,
                original,
            } => self.cond_store(space, dest, width, value, original)?,
            PatchOp::CondWritePointer { target, original } => {
                let value = narrow(module.resolve(target))?;
                self.cond_store(space, dest, Width::Word, value, original)?
            },
            PatchOp::Branch { link, target } => {
                let flags = if link {
                    BranchFlags::LINK
                } else {
                    BranchFlags::empty()
                };
                // Validate before the opcode is forced
                let field = displacement(dest, module.resolve(target))?;
                space.write_u32(dest, encode_rel24(branch_word(flags), field))?;
                self.stats.branches += 1;
                Some(4)
            },
        };

        if let Some(len) = written {
            cache.sync_range(dest, len);
            self.stats.applied += 1;
        }
        Ok(())
    }

    fn cond_store<S>(
        &mut self,
        space: &mut S,
        dest: usize,
        width: Width,
        value: u32,
        original: u32,
    ) -> LoadResult<Option<usize>>
    where
        S: AddressSpace + ?Sized,
    {
        if load(space, dest, width)? != width.mask(original) {
            self.stats.cond_skipped += 1;
            return Ok(None);
        }
        store(space, dest, width, value)?;
        self.stats.cond_written += 1;
        Ok(Some(width.bytes()))
    }
}

fn load<S: AddressSpace + ?Sized>(space: &S, addr: usize, width: Width) -> LoadResult<u32> {
    match width {
        Width::Byte => space.read_u8(addr).map(u32::from),
        Width::Half => space.read_u16(addr).map(u32::from),
        Width::Word => space.read_u32(addr),
    }
}

fn store<S: AddressSpace + ?Sized>(space: &mut S, addr: usize, width: Width, value: u32) -> LoadResult<()> {
    match width {
        Width::Byte => space.write_u8(addr, value as u8),
        Width::Half => space.write_u16(addr, value as u16),
        Width::Word => space.write_u32(addr, value),
    }
}

// ============================================================================
// TESTS
// ============================================================================

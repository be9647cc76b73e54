//! # Platform Capabilities
//!
//! Everything the loader needs from its environment, injected explicitly.
//! The loader never touches a global allocator, never dereferences raw
//! addresses itself and never calls into module code directly; it goes
//! through these traits instead.

use core::ptr::NonNull;

use crate::{LoadError, LoadResult};

// ============================================================================
// MEMORY PROVIDER
// ============================================================================

/// Source of module memory
pub trait MemoryProvider {
    /// Allocate `size` bytes; `executable` requests memory code can run from
    ///
    /// Returns the base address, or `None` when the request cannot be met.
    fn alloc(&mut self, size: usize, executable: bool) -> Option<usize>;

    /// Release a block obtained from [`MemoryProvider::alloc`]
    fn free(&mut self, address: usize, executable: bool);
}

/// Provider whose data blocks can be lent out as plain bytes
///
/// Module files are staged in a data block before they are parsed.
///
/// # Safety
/// For a block obtained from `alloc(_, false)`, a `Some` returned by
/// [`StagingMemory::staging_view`] must be valid for reads and writes of
/// `len` bytes until the block is freed. Until then nothing reachable
/// through `self` may access those bytes.
pub unsafe trait StagingMemory: MemoryProvider {
    /// Lend `len` bytes of the data block at `address`
    fn staging_view(&mut self, address: usize, len: usize) -> Option<NonNull<u8>>;
}

// ============================================================================
// ADDRESS SPACE
// ============================================================================

/// Reads and writes in the target address space
///
/// Values are exchanged in the target's byte order. Word and half-word
/// stores must be performed as single accesses: a hook may be written over
/// an instruction that another context is about to fetch.
pub trait AddressSpace {
    /// Read one byte
    fn read_u8(&self, addr: usize) -> LoadResult<u8>;

    /// Read a half word
    fn read_u16(&self, addr: usize) -> LoadResult<u16>;

    /// Read a word
    fn read_u32(&self, addr: usize) -> LoadResult<u32>;

    /// Write one byte
    fn write_u8(&mut self, addr: usize, value: u8) -> LoadResult<()>;

    /// Write a half word
    fn write_u16(&mut self, addr: usize, value: u16) -> LoadResult<()>;

    /// Write a word
    fn write_u32(&mut self, addr: usize, value: u32) -> LoadResult<()>;

    /// Copy `bytes` to `addr`
    fn write_bytes(&mut self, addr: usize, bytes: &[u8]) -> LoadResult<()> {
        for (i, &b) in bytes.iter().enumerate() {
            self.write_u8(addr + i, b)?;
        }
        Ok(())
    }

    /// Set `len` bytes at `addr` to `value`
    fn fill(&mut self, addr: usize, len: usize, value: u8) -> LoadResult<()> {
        for i in 0..len {
            self.write_u8(addr + i, value)?;
        }
        Ok(())
    }
}

// ============================================================================
// CACHE SYNC
// ============================================================================

/// Instruction/data cache maintenance
pub trait CacheSync {
    /// Make the `len` bytes written at `address` visible to instruction fetch
    fn sync_range(&mut self, address: usize, len: usize);

    /// Wait for all earlier maintenance to complete
    ///
    /// Called once after the last patch and before any constructor runs.
    fn barrier(&mut self) {}
}

/// Cache maintenance for targets with coherent instruction fetch
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCacheSync;

impl CacheSync for NoCacheSync {
    #[inline]
    fn sync_range(&mut self, _address: usize, _len: usize) {}
}

// ============================================================================
// FATAL REPORTER
// ============================================================================

/// Receives unrecoverable load errors before they are returned
///
/// Bare-metal hosts may halt here instead of returning.
pub trait FatalReporter {
    /// Report `error`
    fn fatal(&mut self, error: &LoadError);
}

/// Reporter that writes fatal errors to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct LogReporter;

impl FatalReporter for LogReporter {
    fn fatal(&mut self, error: &LoadError) {
        log::error!("FATAL ERROR: {}", error);
    }
}

// ============================================================================
// CONSTRUCTOR INVOKER
// ============================================================================

/// Calls module constructors
pub trait CtorInvoker {
    /// Call the no-argument function at `entry`
    fn invoke(&mut self, entry: usize);
}

// ============================================================================
// BYTE SOURCE
// ============================================================================

/// Storage holding module files (disc, flash, network cache)
pub trait ByteSource {
    /// Size in bytes of the file at `path`
    ///
    /// Fails with [`LoadError::SourceNotFound`] if there is no such file.
    fn size_of(&mut self, path: &str) -> LoadResult<usize>;

    /// Fill `buf` from the start of the file at `path`
    ///
    /// `buf` may be longer than the file; bytes past its end are unspecified.
    fn read(&mut self, path: &str, buf: &mut [u8]) -> LoadResult<()>;
}

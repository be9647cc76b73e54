//! # Simulated Target
//!
//! An in-memory stand-in for a live system, used to dry-run a module's patch
//! set off-target and as the loader's test fixture.
//!
//! [`SimMemory`] maps host-image regions at fixed addresses and hands out
//! module memory from a bump heap. Values are stored big-endian, the byte
//! order of the module format. Accesses outside every mapped region fail
//! with [`LoadError::AccessFault`] instead of corrupting anything. So do
//! accesses to a data block while it is lent out as a staging buffer.

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use core::ptr::NonNull;

use crate::platform::{
    AddressSpace, ByteSource, CacheSync, CtorInvoker, FatalReporter, MemoryProvider, StagingMemory,
};
use crate::{LoadError, LoadResult};

/// Byte pattern fresh allocations are filled with
pub const POISON: u8 = 0xA5;

// ============================================================================
// SIMULATED MEMORY
// ============================================================================

/// What a mapped region represents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    /// Pre-existing host image
    Host,
    /// Block allocated for code
    Code,
    /// Block allocated for data
    Data,
}

#[derive(Debug, Clone)]
struct Region {
    base: usize,
    bytes: Vec<u8>,
    kind: RegionKind,
    lent: bool,
}

impl Region {
    fn end(&self) -> usize {
        self.base + self.bytes.len()
    }
}

/// Region-mapped, big-endian simulated address space with a bump heap
#[derive(Debug, Clone)]
pub struct SimMemory {
    regions: Vec<Region>,
    heap_next: usize,
    heap_end: usize,
}

impl SimMemory {
    /// Alignment of every heap allocation
    pub const ALLOC_ALIGN: usize = 32;

    /// Create a target whose heap spans `heap_size` bytes from `heap_base`
    pub fn new(heap_base: usize, heap_size: usize) -> Self {
        Self {
            regions: Vec::new(),
            heap_next: heap_base,
            heap_end: heap_base + heap_size,
        }
    }

    /// Map a copy of `bytes` as host image at `base`
    pub fn map_host(&mut self, base: usize, bytes: &[u8]) -> &mut Self {
        debug_assert!(
            self.regions
                .iter()
                .all(|r| base + bytes.len() <= r.base || base >= r.end()),
            "overlapping host region"
        );
        self.regions.push(Region {
            base,
            bytes: bytes.to_vec(),
            kind: RegionKind::Host,
            lent: false,
        });
        self
    }

    /// Map `len` zero bytes as host image at `base`
    pub fn map_zeroed(&mut self, base: usize, len: usize) -> &mut Self {
        self.map_host(base, &vec![0; len])
    }

    /// Borrow `len` bytes at `addr` if they lie inside one region
    pub fn slice(&self, addr: usize, len: usize) -> Option<&[u8]> {
        self.locate(addr, len)
            .ok()
            .map(|(idx, off)| &self.regions[idx].bytes[off..off + len])
    }

    /// Number of heap blocks currently allocated
    pub fn live_allocations(&self) -> usize {
        self.regions
            .iter()
            .filter(|r| r.kind != RegionKind::Host)
            .count()
    }

    /// Kind of the region containing `addr`
    pub fn region_kind(&self, addr: usize) -> Option<RegionKind> {
        self.locate(addr, 1).ok().map(|(idx, _)| self.regions[idx].kind)
    }

    fn locate(&self, addr: usize, len: usize) -> LoadResult<(usize, usize)> {
        let end = addr.checked_add(len).ok_or(LoadError::AccessFault { address: addr, len })?;
        self.regions
            .iter()
            .position(|r| !r.lent && addr >= r.base && end <= r.end())
            .map(|idx| (idx, addr - self.regions[idx].base))
            .ok_or(LoadError::AccessFault { address: addr, len })
    }

    fn bytes<const N: usize>(&self, addr: usize) -> LoadResult<[u8; N]> {
        let (idx, off) = self.locate(addr, N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(&self.regions[idx].bytes[off..off + N]);
        Ok(out)
    }

    fn bytes_mut(&mut self, addr: usize, len: usize) -> LoadResult<&mut [u8]> {
        let (idx, off) = self.locate(addr, len)?;
        Ok(&mut self.regions[idx].bytes[off..off + len])
    }
}

impl MemoryProvider for SimMemory {
    fn alloc(&mut self, size: usize, executable: bool) -> Option<usize> {
        let base = self.heap_next.checked_add(Self::ALLOC_ALIGN - 1)? & !(Self::ALLOC_ALIGN - 1);
        let end = base.checked_add(size)?;
        if end > self.heap_end {
            return None;
        }

        self.heap_next = end;
        self.regions.push(Region {
            base,
            bytes: vec![POISON; size],
            kind: if executable {
                RegionKind::Code
            } else {
                RegionKind::Data
            },
            lent: false,
        });
        Some(base)
    }

    fn free(&mut self, address: usize, _executable: bool) {
        if let Some(idx) = self
            .regions
            .iter()
            .position(|r| r.base == address && r.kind != RegionKind::Host)
        {
            self.regions.swap_remove(idx);
        }
    }
}

// SAFETY: a lent region is skipped by `locate`, so no access through the
// simulator reaches it; its buffer never moves and is dropped only by `free`
unsafe impl StagingMemory for SimMemory {
    fn staging_view(&mut self, address: usize, len: usize) -> Option<NonNull<u8>> {
        let region = self
            .regions
            .iter_mut()
            .find(|r| r.base == address && r.kind == RegionKind::Data && !r.lent)?;
        if len > region.bytes.len() {
            return None;
        }
        region.lent = true;
        NonNull::new(region.bytes.as_mut_ptr())
    }
}

impl AddressSpace for SimMemory {
    fn read_u8(&self, addr: usize) -> LoadResult<u8> {
        Ok(self.bytes::<1>(addr)?[0])
    }

    fn read_u16(&self, addr: usize) -> LoadResult<u16> {
        Ok(u16::from_be_bytes(self.bytes(addr)?))
    }

    fn read_u32(&self, addr: usize) -> LoadResult<u32> {
        Ok(u32::from_be_bytes(self.bytes(addr)?))
    }

    fn write_u8(&mut self, addr: usize, value: u8) -> LoadResult<()> {
        self.bytes_mut(addr, 1)?[0] = value;
        Ok(())
    }

    fn write_u16(&mut self, addr: usize, value: u16) -> LoadResult<()> {
        self.bytes_mut(addr, 2)?.copy_from_slice(&value.to_be_bytes());
        Ok(())
    }

    fn write_u32(&mut self, addr: usize, value: u32) -> LoadResult<()> {
        self.bytes_mut(addr, 4)?.copy_from_slice(&value.to_be_bytes());
        Ok(())
    }

    fn write_bytes(&mut self, addr: usize, bytes: &[u8]) -> LoadResult<()> {
        self.bytes_mut(addr, bytes.len())?.copy_from_slice(bytes);
        Ok(())
    }

    fn fill(&mut self, addr: usize, len: usize, value: u8) -> LoadResult<()> {
        self.bytes_mut(addr, len)?.fill(value);
        Ok(())
    }
}

// ============================================================================
// RECORDERS
// ============================================================================

/// Cache back end that records every maintenance request
#[derive(Debug, Clone, Default)]
pub struct RecordingCache {
    /// `(address, len)` of every `sync_range` call, in order
    pub ranges: Vec<(usize, usize)>,
    /// Number of barriers issued
    pub barriers: usize,
}

impl RecordingCache {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if some recorded range covers `addr`
    pub fn covers(&self, addr: usize) -> bool {
        self.ranges
            .iter()
            .any(|&(start, len)| addr >= start && addr < start + len)
    }
}

impl CacheSync for RecordingCache {
    fn sync_range(&mut self, address: usize, len: usize) {
        self.ranges.push((address, len));
    }

    fn barrier(&mut self) {
        self.barriers += 1;
    }
}

/// Constructor invoker that records entry addresses instead of calling them
#[derive(Debug, Clone, Default)]
pub struct RecordingInvoker {
    /// Entry addresses in call order
    pub calls: Vec<usize>,
}

impl CtorInvoker for RecordingInvoker {
    fn invoke(&mut self, entry: usize) {
        self.calls.push(entry);
    }
}

/// Reporter that keeps every fatal error
#[derive(Debug, Clone, Default)]
pub struct RecordingReporter {
    /// Reported errors in order
    pub errors: Vec<LoadError>,
}

impl FatalReporter for RecordingReporter {
    fn fatal(&mut self, error: &LoadError) {
        self.errors.push(*error);
    }
}

// ============================================================================
// IN-MEMORY BYTE SOURCE
// ============================================================================

/// Byte source serving files from memory
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    files: Vec<(String, Vec<u8>)>,
    /// Make every read fail
    pub fail_reads: bool,
}

impl MemorySource {
    /// Create an empty source
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a file
    pub fn insert(&mut self, path: &str, contents: Vec<u8>) -> &mut Self {
        self.files.push((String::from(path), contents));
        self
    }

    fn find(&self, path: &str) -> LoadResult<&[u8]> {
        self.files
            .iter()
            .find(|(p, _)| p == path)
            .map(|(_, data)| data.as_slice())
            .ok_or(LoadError::SourceNotFound)
    }
}

impl ByteSource for MemorySource {
    fn size_of(&mut self, path: &str) -> LoadResult<usize> {
        self.find(path).map(<[u8]>::len)
    }

    fn read(&mut self, path: &str, buf: &mut [u8]) -> LoadResult<()> {
        if self.fail_reads {
            return Err(LoadError::SourceReadFailed);
        }
        let data = self.find(path)?;
        let len = data.len().min(buf.len());
        buf[..len].copy_from_slice(&data[..len]);
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_is_aligned_and_poisoned() {
        let mut mem = SimMemory::new(0x9000_0004, 0x1000);
        let a = mem.alloc(6, true).unwrap();
        let b = mem.alloc(4, false).unwrap();

        assert_eq!(a % SimMemory::ALLOC_ALIGN, 0);
        assert_eq!(b % SimMemory::ALLOC_ALIGN, 0);
        assert!(b >= a + 6);
        assert_eq!(mem.slice(a, 6).unwrap(), &[POISON; 6]);
        assert_eq!(mem.region_kind(a), Some(RegionKind::Code));
        assert_eq!(mem.region_kind(b), Some(RegionKind::Data));
    }

    #[test]
    fn test_alloc_exhaustion_and_free() {
        let mut mem = SimMemory::new(0x1000, 0x40);
        let a = mem.alloc(0x40, true).unwrap();
        assert!(mem.alloc(1, true).is_none());
        assert_eq!(mem.live_allocations(), 1);

        mem.free(a, true);
        assert_eq!(mem.live_allocations(), 0);
    }

    #[test]
    fn test_big_endian_access() {
        let mut mem = SimMemory::new(0, 0);
        mem.map_zeroed(0x8000_0000, 8);

        mem.write_u32(0x8000_0000, 0x1122_3344).unwrap();
        mem.write_u16(0x8000_0004, 0xAABB).unwrap();
        assert_eq!(
            mem.slice(0x8000_0000, 6).unwrap(),
            &[0x11, 0x22, 0x33, 0x44, 0xAA, 0xBB]
        );
        assert_eq!(mem.read_u8(0x8000_0001).unwrap(), 0x22);
        assert_eq!(mem.read_u16(0x8000_0002).unwrap(), 0x3344);
    }

    #[test]
    fn test_access_fault() {
        let mut mem = SimMemory::new(0, 0);
        mem.map_zeroed(0x8000_0000, 4);

        assert_eq!(
            mem.read_u32(0x8000_0002),
            Err(LoadError::AccessFault {
                address: 0x8000_0002,
                len: 4
            })
        );
        assert!(mem.write_u8(0x7FFF_FFFF, 0).is_err());
    }

    #[test]
    fn test_host_regions_survive_free() {
        let mut mem = SimMemory::new(0, 0);
        mem.map_zeroed(0x8000_0000, 4);
        mem.free(0x8000_0000, false);
        assert!(mem.read_u32(0x8000_0000).is_ok());
    }

    #[test]
    fn test_staging_view_locks_block() {
        let mut mem = SimMemory::new(0x9000_0000, 0x100);
        let code = mem.alloc(8, true).unwrap();
        let data = mem.alloc(8, false).unwrap();

        assert!(mem.staging_view(code, 8).is_none());
        assert!(mem.staging_view(data, 9).is_none());
        assert!(mem.staging_view(data, 8).is_some());
        assert!(mem.staging_view(data, 8).is_none());

        assert!(mem.write_u8(data, 0).is_err());
        assert!(mem.slice(data, 1).is_none());
        assert_eq!(mem.live_allocations(), 2);

        mem.free(data, false);
        assert_eq!(mem.live_allocations(), 1);
    }

    #[test]
    fn test_memory_source() {
        let mut src = MemorySource::new();
        src.insert("/modules/m.bin", vec![1, 2, 3]);

        assert_eq!(src.size_of("/modules/m.bin"), Ok(3));
        assert_eq!(src.size_of("/missing"), Err(LoadError::SourceNotFound));

        let mut buf = [0u8; 8];
        src.read("/modules/m.bin", &mut buf).unwrap();
        assert_eq!(&buf[..3], &[1, 2, 3]);
    }
}

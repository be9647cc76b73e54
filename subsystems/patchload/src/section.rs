//! # Sections
//!
//! Allocation of the module block and population of its code and bss.
//!
//! The block is laid out as `[code | bss]`. Code bytes are copied verbatim
//! from the blob; bss is zero-filled regardless of what the provider
//! handed out.

use crate::header::ModuleLayout;
use crate::loader::SectionSync;
use crate::platform::{AddressSpace, CacheSync, MemoryProvider};
use crate::{LoadError, LoadResult, LoadedModule};

// ============================================================================
// MODULE ALLOCATOR
// ============================================================================

/// Reserves the module block from an injected provider
#[derive(Debug, Clone, Copy, Default)]
pub struct ModuleAllocator;

impl ModuleAllocator {
    /// Allocate one contiguous, executable block of `code + bss` bytes
    ///
    /// Failure is final; the request is not retried.
    pub fn allocate<P>(memory: &mut P, layout: &ModuleLayout) -> LoadResult<LoadedModule>
    where
        P: MemoryProvider + ?Sized,
    {
        let total_size = layout.total_size();
        let requested = total_size as usize;

        let base = memory
            .alloc(requested, true)
            .ok_or(LoadError::OutOfMemory { requested })?;

        log::debug!("module block allocated at {:#x} ({:#x} bytes)", base, requested);
        Ok(LoadedModule::new(base, total_size))
    }

    /// Return a block obtained from [`ModuleAllocator::allocate`]
    pub fn release<P>(memory: &mut P, module: &LoadedModule)
    where
        P: MemoryProvider + ?Sized,
    {
        log::debug!("releasing module block at {:#x}", module.base_address);
        memory.free(module.base_address, true);
    }
}

// ============================================================================
// SECTION LOADER
// ============================================================================

/// Copies code and clears bss inside an allocated block
#[derive(Debug, Clone, Copy, Default)]
pub struct SectionLoader;

impl SectionLoader {
    /// Populate `module` from `blob`
    ///
    /// With [`SectionSync::PerByte`] every byte is synchronised as it is
    /// written. [`SectionSync::Region`] issues one range covering the block,
    /// which is sound only because nothing can execute the block before the
    /// load returns.
    pub fn load_sections<S, C>(
        blob: &[u8],
        layout: &ModuleLayout,
        module: &LoadedModule,
        space: &mut S,
        cache: &mut C,
        sync: SectionSync,
    ) -> LoadResult<()>
    where
        S: AddressSpace + ?Sized,
        C: CacheSync + ?Sized,
    {
        let code = blob.get(layout.code_range()).ok_or(LoadError::Truncated {
            offset: layout.code_range().start,
            needed: layout.code_size as usize,
            remaining: blob.len().saturating_sub(layout.code_range().start),
        })?;

        let base = module.base_address;
        let bss_base = base + code.len();
        let bss_size = layout.bss_size as usize;

        space.write_bytes(base, code)?;
        space.fill(bss_base, bss_size, 0)?;

        match sync {
            SectionSync::PerByte => {
                for addr in base..bss_base + bss_size {
                    cache.sync_range(addr, 1);
                }
            },
            SectionSync::Region => {
                if module.total_size != 0 {
                    cache.sync_range(base, module.total_size as usize);
                }
            },
        }

        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ModuleBuilder;
    use crate::header::HeaderParser;
    use crate::sim::{RecordingCache, SimMemory, POISON};

    fn prepare(code: &[u8], bss: u32) -> (Vec<u8>, ModuleLayout, SimMemory, LoadedModule) {
        let blob = ModuleBuilder::new().code(code).bss(bss).build().unwrap();
        let layout = HeaderParser::parse(&blob).unwrap();
        let mut mem = SimMemory::new(0x9000_0000, 0x1000);
        let module = ModuleAllocator::allocate(&mut mem, &layout).unwrap();
        (blob, layout, mem, module)
    }

    #[test]
    fn test_allocate_out_of_memory() {
        let blob = ModuleBuilder::new().code(&[0; 8]).bss(0x2000).build().unwrap();
        let layout = HeaderParser::parse(&blob).unwrap();
        let mut mem = SimMemory::new(0x9000_0000, 0x1000);

        assert_eq!(
            ModuleAllocator::allocate(&mut mem, &layout),
            Err(LoadError::OutOfMemory { requested: 0x2008 })
        );
        assert_eq!(mem.live_allocations(), 0);
    }

    #[test]
    fn test_copy_and_zero_fill() {
        let (blob, layout, mut mem, module) = prepare(&[1, 2, 3, 4], 4);
        assert_eq!(mem.slice(module.base_address, 8).unwrap(), &[POISON; 8]);

        let mut cache = RecordingCache::new();
        SectionLoader::load_sections(&blob, &layout, &module, &mut mem, &mut cache, SectionSync::PerByte)
            .unwrap();

        assert_eq!(mem.slice(module.base_address, 8).unwrap(), &[1, 2, 3, 4, 0, 0, 0, 0]);
        assert_eq!(cache.ranges.len(), 8);
        assert!((0..8).all(|i| cache.covers(module.base_address + i)));
    }

    #[test]
    fn test_region_sync_is_single_range() {
        let (blob, layout, mut mem, module) = prepare(&[9; 12], 20);
        let mut cache = RecordingCache::new();
        SectionLoader::load_sections(&blob, &layout, &module, &mut mem, &mut cache, SectionSync::Region)
            .unwrap();

        assert_eq!(cache.ranges, vec![(module.base_address, 32)]);
    }

    #[test]
    fn test_release_returns_block() {
        let (_, _, mut mem, module) = prepare(&[0; 4], 0);
        assert_eq!(mem.live_allocations(), 1);
        ModuleAllocator::release(&mut mem, &module);
        assert_eq!(mem.live_allocations(), 0);
    }
}

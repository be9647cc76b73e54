//! # Module Initialisation
//!
//! Runs the module's static constructors once every record is applied.

use crate::header::CTOR_ENTRY_SIZE;
use crate::platform::{AddressSpace, CacheSync, CtorInvoker};
use crate::{LoadResult, LoadedModule, ModuleLayout, PatchStats};

/// Constructor table walker
#[derive(Debug, Clone, Copy, Default)]
pub struct InitRunner;

impl InitRunner {
    /// Invoke every constructor in `[ctor_start, ctor_end)` in table order
    ///
    /// A cache barrier is issued first so that no constructor can observe a
    /// stale instruction. Entries are 32-bit code addresses; null entries are
    /// skipped.
    pub fn run<S, C, I>(
        module: &LoadedModule,
        layout: &ModuleLayout,
        space: &S,
        cache: &mut C,
        invoker: &mut I,
        stats: &mut PatchStats,
    ) -> LoadResult<()>
    where
        S: AddressSpace + ?Sized,
        C: CacheSync + ?Sized,
        I: CtorInvoker + ?Sized,
    {
        cache.barrier();

        let table = module.base_address + layout.ctor_start as usize;
        for i in 0..layout.ctor_count() as usize {
            let slot = table + i * CTOR_ENTRY_SIZE as usize;
            let entry = space.read_u32(slot)?;

            if entry == 0 {
                log::warn!("null constructor entry at {:#x}, skipping", slot);
                stats.ctors_skipped += 1;
                continue;
            }

            log::trace!("calling constructor {:#010x}", entry);
            invoker.invoke(entry as usize);
            stats.ctors_run += 1;
        }

        Ok(())
    }
}

//! # Module Loader
//!
//! Orchestrates a complete load: header, allocation, sections, records and
//! constructors, in that order and on the caller's thread.
//!
//! A load is all-or-nothing from the module's point of view. On any error
//! the fatal reporter is called and, if the block was already allocated, it
//! is handed back to the provider. Records applied to the host image before
//! the failure stay applied; the host is expected to treat a failed load as
//! fatal.

use core::fmt;

use crate::platform::{
    AddressSpace, ByteSource, CacheSync, CtorInvoker, FatalReporter, MemoryProvider, StagingMemory,
};
use crate::registry::{self, ModuleInfo};
use crate::{
    ByteCursor, HeaderParser, InitRunner, LoadError, LoadResult, LoadedModule, ModuleAllocator,
    ModuleLayout, PatchEngine, PatchStats, SectionLoader,
};

/// Alignment the staging buffer of [`ModuleLoader::load_from_source`] is
/// rounded up to
pub const STAGING_ALIGN: usize = 32;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// What to do with a record whose tag is not a known opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnknownOpcodePolicy {
    /// Log, skip the header and one operand word, continue
    Skip,
    /// Fail the load with [`LoadError::UnknownOpcode`]
    Abort,
}

impl Default for UnknownOpcodePolicy {
    fn default() -> Self {
        Self::Skip
    }
}

/// Granularity of cache maintenance while sections are populated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionSync {
    /// One maintenance call per byte written
    PerByte,
    /// One maintenance call covering the whole block
    Region,
}

impl Default for SectionSync {
    fn default() -> Self {
        Self::PerByte
    }
}

/// Loader configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoaderConfig {
    /// Unknown opcode handling
    pub unknown_opcode: UnknownOpcodePolicy,
    /// Section cache maintenance granularity
    pub section_sync: SectionSync,
    /// Publish the loaded module to the global registry
    pub publish: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            unknown_opcode: UnknownOpcodePolicy::Skip,
            section_sync: SectionSync::PerByte,
            publish: true,
        }
    }
}

impl LoaderConfig {
    /// Default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration rejecting unknown opcodes
    pub fn strict() -> Self {
        Self {
            unknown_opcode: UnknownOpcodePolicy::Abort,
            ..Self::default()
        }
    }

    /// Set unknown opcode handling
    pub fn with_unknown_opcode(mut self, policy: UnknownOpcodePolicy) -> Self {
        self.unknown_opcode = policy;
        self
    }

    /// Set section cache maintenance granularity
    pub fn with_section_sync(mut self, sync: SectionSync) -> Self {
        self.section_sync = sync;
        self
    }

    /// Enable or disable registry publication
    pub fn with_publish(mut self, publish: bool) -> Self {
        self.publish = publish;
        self
    }
}

// ============================================================================
// LOADER
// ============================================================================

/// Module loader bound to one set of platform capabilities
///
/// `memory` provides both the module block and access to the target address
/// space, since on real targets they are the same memory.
pub struct ModuleLoader<'h, M: ?Sized, C: ?Sized> {
    memory: &'h mut M,
    cache: &'h mut C,
    reporter: &'h mut dyn FatalReporter,
    config: LoaderConfig,
    stats: PatchStats,
}

impl<M: ?Sized, C: ?Sized> fmt::Debug for ModuleLoader<'_, M, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleLoader")
            .field("config", &self.config)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl<'h, M, C> ModuleLoader<'h, M, C>
where
    M: MemoryProvider + AddressSpace + ?Sized,
    C: CacheSync + ?Sized,
{
    /// Create a loader
    pub fn new(
        memory: &'h mut M,
        cache: &'h mut C,
        reporter: &'h mut dyn FatalReporter,
        config: LoaderConfig,
    ) -> Self {
        Self {
            memory,
            cache,
            reporter,
            config,
            stats: PatchStats::new(),
        }
    }

    /// Active configuration
    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Statistics of the most recent load
    pub fn stats(&self) -> &PatchStats {
        &self.stats
    }

    /// Load `blob` and run its constructors through `invoker`
    ///
    /// The blob is only borrowed for the duration of the call.
    pub fn load<I>(&mut self, blob: &[u8], invoker: &mut I) -> LoadResult<LoadedModule>
    where
        I: CtorInvoker + ?Sized,
    {
        self.stats = PatchStats::new();
        self.load_blob(blob, invoker).map_err(|err| self.report(err))
    }

    /// Read the module at `path` from `source` and load it
    ///
    /// The file is staged in a data block from the memory provider, rounded
    /// up to [`STAGING_ALIGN`] bytes and freed before this returns.
    pub fn load_from_source<B, I>(
        &mut self,
        source: &mut B,
        path: &str,
        invoker: &mut I,
    ) -> LoadResult<LoadedModule>
    where
        M: StagingMemory,
        B: ByteSource + ?Sized,
        I: CtorInvoker + ?Sized,
    {
        log::info!("Loading module '{}'...", path);
        self.stats = PatchStats::new();

        let len = source.size_of(path).map_err(|err| self.report(err))?;
        let rounded = staged_size(len).map_err(|err| self.report(err))?;
        let buffer = self
            .memory
            .alloc(rounded, false)
            .ok_or(LoadError::OutOfMemory { requested: rounded })
            .map_err(|err| self.report(err))?;

        let loaded = self.load_staged(source, path, buffer, len, rounded, invoker);
        self.memory.free(buffer, false);

        let module = loaded.map_err(|err| self.report(err))?;
        log::info!("All done!");
        Ok(module)
    }

    fn report(&mut self, err: LoadError) -> LoadError {
        self.reporter.fatal(&err);
        err
    }

    fn load_blob<I>(&mut self, blob: &[u8], invoker: &mut I) -> LoadResult<LoadedModule>
    where
        I: CtorInvoker + ?Sized,
    {
        let layout = HeaderParser::parse(blob)?;
        log::info!("header: {}", layout);

        let module = ModuleAllocator::allocate(&mut *self.memory, &layout)?;

        if let Err(err) = self.populate(blob, &layout, &module, invoker) {
            ModuleAllocator::release(&mut *self.memory, &module);
            return Err(err);
        }

        log::info!(
            "module loaded at {:#x}: {} records applied, {} constructors run",
            module.base_address,
            self.stats.applied,
            self.stats.ctors_run
        );
        Ok(module)
    }

    fn load_staged<B, I>(
        &mut self,
        source: &mut B,
        path: &str,
        buffer: usize,
        len: usize,
        rounded: usize,
        invoker: &mut I,
    ) -> LoadResult<LoadedModule>
    where
        M: StagingMemory,
        B: ByteSource + ?Sized,
        I: CtorInvoker + ?Sized,
    {
        let view = self
            .memory
            .staging_view(buffer, rounded)
            .ok_or(LoadError::AccessFault {
                address: buffer,
                len: rounded,
            })?;
        // SAFETY: `StagingMemory` keeps the block valid and untouched by the
        // provider until it is freed, which happens after this returns
        let staged = unsafe { core::slice::from_raw_parts_mut(view.as_ptr(), rounded) };

        source.read(path, staged)?;
        log::info!("module file staged: {} bytes ({} buffered)", len, rounded);

        self.load_blob(&staged[..len], invoker)
    }

    fn populate<I>(
        &mut self,
        blob: &[u8],
        layout: &ModuleLayout,
        module: &LoadedModule,
        invoker: &mut I,
    ) -> LoadResult<()>
    where
        I: CtorInvoker + ?Sized,
    {
        SectionLoader::load_sections(
            blob,
            layout,
            module,
            &mut *self.memory,
            &mut *self.cache,
            self.config.section_sync,
        )?;
        self.stats.code_bytes = layout.code_size as usize;
        self.stats.bss_bytes = layout.bss_size as usize;

        let info = ModuleInfo::new(module, layout, blob.len());
        log::info!("\n{}", info);

        let mut engine = PatchEngine::new(self.config.unknown_opcode);
        let mut cursor = ByteCursor::at(blob, layout.commands_offset())?;
        let applied = engine.apply(&mut cursor, module, &mut *self.memory, &mut *self.cache);
        self.stats = PatchStats {
            code_bytes: self.stats.code_bytes,
            bss_bytes: self.stats.bss_bytes,
            ..*engine.stats()
        };
        applied?;

        if self.config.publish {
            registry::publish(info);
        }

        let ran = InitRunner::run(
            module,
            layout,
            &*self.memory,
            &mut *self.cache,
            invoker,
            &mut self.stats,
        );
        if ran.is_err() && self.config.publish {
            registry::clear();
        }
        ran
    }
}

fn staged_size(len: usize) -> LoadResult<usize> {
    len.checked_add(STAGING_ALIGN - 1)
        .map(|end| end & !(STAGING_ALIGN - 1))
        .ok_or(LoadError::OutOfMemory { requested: len })
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ModuleBuilder;
    use crate::patch::branch::decode_displacement;
    use crate::sim::{MemorySource, RecordingCache, RecordingInvoker, RecordingReporter, SimMemory};
    use crate::AddressRef::{Absolute, ModuleRelative};

    const HOST: usize = 0x8000_0000;
    const HEAP: usize = 0x8100_0000;

    struct Target {
        mem: SimMemory,
        cache: RecordingCache,
        reporter: RecordingReporter,
        invoker: RecordingInvoker,
        stats: PatchStats,
    }

    impl Target {
        fn new() -> Self {
            let mut mem = SimMemory::new(HEAP, 0x1000);
            mem.map_zeroed(HOST, 0x2000);
            Self {
                mem,
                cache: RecordingCache::new(),
                reporter: RecordingReporter::default(),
                invoker: RecordingInvoker::default(),
                stats: PatchStats::new(),
            }
        }

        fn config() -> LoaderConfig {
            LoaderConfig::new().with_publish(false)
        }

        fn load_with(&mut self, blob: &[u8], config: LoaderConfig) -> LoadResult<LoadedModule> {
            let mut loader = ModuleLoader::new(&mut self.mem, &mut self.cache, &mut self.reporter, config);
            let result = loader.load(blob, &mut self.invoker);
            self.stats = *loader.stats();
            result
        }

        fn load(&mut self, blob: &[u8]) -> LoadResult<LoadedModule> {
            self.load_with(blob, Self::config())
        }
    }

    #[test]
    fn test_noop_module_round_trip() {
        let mut t = Target::new();
        let blob = ModuleBuilder::new().code(&[0x60, 0x00, 0x00, 0x00]).build().unwrap();

        let module = t.load(&blob).unwrap();
        assert_eq!(module.total_size, 4);
        assert_eq!(t.mem.slice(module.base_address, 4).unwrap(), &[0x60, 0, 0, 0]);
        assert!(t.invoker.calls.is_empty());
        assert!(t.reporter.errors.is_empty());
        assert_eq!(t.stats.total_records, 0);
        assert_eq!(t.cache.barriers, 1);
    }

    #[test]
    fn test_hook_module() {
        let mut t = Target::new();
        t.mem.write_u32(HOST + 0x1000, 0x9421_FFF0).unwrap();

        let code = [
            0x4E, 0x80, 0x00, 0x20, // blr
            0x00, 0x00, 0x00, 0x00, // ctor table
        ];
        let blob = ModuleBuilder::new()
            .code(&code)
            .bss(8)
            .ctors(4, 8)
            .addr32(ModuleRelative(4), ModuleRelative(0))
            .branch_link(Absolute((HOST + 0x1000) as u32), ModuleRelative(0))
            .build()
            .unwrap();

        let module = t.load(&blob).unwrap();
        let base = module.base_address;

        assert_eq!(t.mem.read_u32(base + 4).unwrap(), base as u32);
        assert_eq!(t.mem.slice(base + 8, 8).unwrap(), &[0; 8]);
        assert_eq!(t.invoker.calls, vec![base]);

        let hook = t.mem.read_u32(HOST + 0x1000).unwrap();
        assert_eq!(hook & 0xFC00_0003, 0x4800_0001);
        assert_eq!((HOST + 0x1000).wrapping_add(decode_displacement(hook) as usize), base);

        assert_eq!(t.stats.applied, 2);
        assert_eq!(t.stats.addr_fixups, 1);
        assert_eq!(t.stats.branches, 1);
        assert_eq!(t.stats.ctors_run, 1);
    }

    #[test]
    fn test_every_write_is_synced() {
        let mut t = Target::new();
        let blob = ModuleBuilder::new()
            .code(&[1, 2, 3, 4, 5, 6, 7, 8])
            .bss(4)
            .write16(Absolute(HOST as u32 + 0x10), 0xBEEF)
            .cond_write8(ModuleRelative(0), 0xFF, 0x01)
            .build()
            .unwrap();

        let module = t.load(&blob).unwrap();
        for addr in module.base_address..module.end_address() {
            assert!(t.cache.covers(addr), "{:#x} not synced", addr);
        }
        assert!(t.cache.covers(HOST + 0x10));
        assert!(t.cache.covers(HOST + 0x11));
        assert!(!t.cache.covers(HOST + 0x12));
        assert_eq!(t.mem.read_u8(module.base_address).unwrap(), 0xFF);
    }

    #[test]
    fn test_region_sync() {
        let mut t = Target::new();
        let blob = ModuleBuilder::new().code(&[0; 16]).bss(16).build().unwrap();
        let config = Target::config().with_section_sync(SectionSync::Region);

        let module = t.load_with(&blob, config).unwrap();
        assert_eq!(t.cache.ranges, vec![(module.base_address, 32)]);
    }

    #[test]
    fn test_header_errors_allocate_nothing() {
        let mut t = Target::new();
        let mut blob = ModuleBuilder::new().code(&[0; 4]).build().unwrap();
        blob[2] = b'X';
        assert_eq!(t.load(&blob), Err(LoadError::BadMagic));

        let blob = ModuleBuilder::new().version(3).build().unwrap();
        assert_eq!(t.load(&blob), Err(LoadError::UnsupportedVersion(3)));

        assert_eq!(t.mem.live_allocations(), 0);
        assert_eq!(
            t.reporter.errors,
            vec![LoadError::BadMagic, LoadError::UnsupportedVersion(3)]
        );
    }

    #[test]
    fn test_out_of_memory_reported() {
        let mut t = Target::new();
        let blob = ModuleBuilder::new().bss(0x2000).build().unwrap();

        assert_eq!(t.load(&blob), Err(LoadError::OutOfMemory { requested: 0x2000 }));
        assert_eq!(t.reporter.errors.len(), 1);
    }

    #[test]
    fn test_failure_after_allocation_frees_module() {
        let mut t = Target::new();
        let blob = ModuleBuilder::new()
            .code(&[0; 4])
            .write32(Absolute(0x9000_0000), 1)
            .build()
            .unwrap();

        let err = t.load(&blob).unwrap_err();
        assert!(matches!(err, LoadError::AccessFault { address: 0x9000_0000, .. }));
        assert_eq!(t.mem.live_allocations(), 0);
        assert_eq!(t.reporter.errors, vec![err]);
        assert!(t.invoker.calls.is_empty());
    }

    #[test]
    fn test_truncated_record_stream() {
        let mut t = Target::new();
        let blob = ModuleBuilder::new()
            .code(&[0; 4])
            .raw_bytes(&[0x20, 0x00, 0x00])
            .build()
            .unwrap();

        assert!(matches!(t.load(&blob), Err(LoadError::Truncated { .. })));
        assert_eq!(t.mem.live_allocations(), 0);
    }

    #[test]
    fn test_unknown_opcode_policies() {
        let blob = ModuleBuilder::new()
            .code(&[0; 4])
            .raw_record(99, ModuleRelative(0), &[0x1234_5678])
            .write8(ModuleRelative(2), 0x5A)
            .build()
            .unwrap();

        let mut t = Target::new();
        let module = t.load(&blob).unwrap();
        assert_eq!(t.mem.read_u8(module.base_address + 2).unwrap(), 0x5A);
        assert_eq!(t.stats.unknown_skipped, 1);

        let mut t = Target::new();
        let offset = crate::header::HEADER_SIZE + 4;
        let strict = LoaderConfig::strict().with_publish(false);
        assert_eq!(
            t.load_with(&blob, strict),
            Err(LoadError::UnknownOpcode { tag: 99, offset })
        );
        assert_eq!(t.mem.live_allocations(), 0);
    }

    #[test]
    fn test_load_from_source() {
        let blob = ModuleBuilder::new().code(&[0xAB; 5]).build().unwrap();
        let mut source = MemorySource::new();
        source.insert("/modules/hooks.bin", blob);

        let mut t = Target::new();
        let mut loader =
            ModuleLoader::new(&mut t.mem, &mut t.cache, &mut t.reporter, Target::config());

        let module = loader
            .load_from_source(&mut source, "/modules/hooks.bin", &mut t.invoker)
            .unwrap();
        assert_eq!(module.total_size, 5);

        assert_eq!(
            loader.load_from_source(&mut source, "/modules/missing.bin", &mut t.invoker),
            Err(LoadError::SourceNotFound)
        );

        source.fail_reads = true;
        assert_eq!(
            loader.load_from_source(&mut source, "/modules/hooks.bin", &mut t.invoker),
            Err(LoadError::SourceReadFailed)
        );
        drop(loader);

        assert_eq!(
            t.reporter.errors,
            vec![LoadError::SourceNotFound, LoadError::SourceReadFailed]
        );
        assert_eq!(t.mem.slice(module.base_address, 5).unwrap(), &[0xAB; 5]);
        assert_eq!(t.mem.live_allocations(), 1);
    }

    /// Provider that logs every allocation and release
    struct Counting {
        inner: SimMemory,
        allocs: Vec<(usize, bool)>,
        frees: Vec<(usize, bool)>,
    }

    impl MemoryProvider for Counting {
        fn alloc(&mut self, size: usize, executable: bool) -> Option<usize> {
            self.allocs.push((size, executable));
            self.inner.alloc(size, executable)
        }

        fn free(&mut self, address: usize, executable: bool) {
            self.frees.push((address, executable));
            self.inner.free(address, executable);
        }
    }

    unsafe impl StagingMemory for Counting {
        fn staging_view(&mut self, address: usize, len: usize) -> Option<core::ptr::NonNull<u8>> {
            self.inner.staging_view(address, len)
        }
    }

    impl AddressSpace for Counting {
        fn read_u8(&self, addr: usize) -> LoadResult<u8> {
            self.inner.read_u8(addr)
        }

        fn read_u16(&self, addr: usize) -> LoadResult<u16> {
            self.inner.read_u16(addr)
        }

        fn read_u32(&self, addr: usize) -> LoadResult<u32> {
            self.inner.read_u32(addr)
        }

        fn write_u8(&mut self, addr: usize, value: u8) -> LoadResult<()> {
            self.inner.write_u8(addr, value)
        }

        fn write_u16(&mut self, addr: usize, value: u16) -> LoadResult<()> {
            self.inner.write_u16(addr, value)
        }

        fn write_u32(&mut self, addr: usize, value: u32) -> LoadResult<()> {
            self.inner.write_u32(addr, value)
        }
    }

    #[test]
    fn test_staging_buffer_comes_from_provider() {
        let blob = ModuleBuilder::new().code(&[0x11; 5]).build().unwrap();
        let file_len = blob.len();
        let mut source = MemorySource::new();
        source.insert("/modules/hooks.bin", blob);

        let mut mem = Counting {
            inner: SimMemory::new(HEAP, 0x1000),
            allocs: Vec::new(),
            frees: Vec::new(),
        };
        let mut cache = RecordingCache::new();
        let mut reporter = RecordingReporter::default();
        let mut invoker = RecordingInvoker::default();
        let mut loader = ModuleLoader::new(&mut mem, &mut cache, &mut reporter, Target::config());

        let module = loader
            .load_from_source(&mut source, "/modules/hooks.bin", &mut invoker)
            .unwrap();
        drop(loader);

        let rounded = (file_len + STAGING_ALIGN - 1) & !(STAGING_ALIGN - 1);
        assert_eq!(mem.allocs, vec![(rounded, false), (5, true)]);
        assert_eq!(mem.frees.len(), 1);
        assert!(!mem.frees[0].1);
        assert_ne!(mem.frees[0].0, module.base_address);
        assert_eq!(mem.inner.live_allocations(), 1);
        assert_eq!(mem.inner.slice(module.base_address, 5).unwrap(), &[0x11; 5]);
    }

    #[test]
    fn test_staging_buffer_released_on_every_failure() {
        let mut source = MemorySource::new();
        source.insert("/modules/bad.bin", ModuleBuilder::new().version(7).build().unwrap());
        source.insert("/modules/ok.bin", ModuleBuilder::new().code(&[0; 4]).build().unwrap());

        let mut t = Target::new();
        let mut loader =
            ModuleLoader::new(&mut t.mem, &mut t.cache, &mut t.reporter, Target::config());
        assert_eq!(
            loader.load_from_source(&mut source, "/modules/bad.bin", &mut t.invoker),
            Err(LoadError::UnsupportedVersion(7))
        );
        source.fail_reads = true;
        assert_eq!(
            loader.load_from_source(&mut source, "/modules/ok.bin", &mut t.invoker),
            Err(LoadError::SourceReadFailed)
        );
        drop(loader);

        assert_eq!(t.mem.live_allocations(), 0);
        assert_eq!(t.reporter.errors.len(), 2);
    }

    #[test]
    fn test_staging_out_of_memory() {
        let mut source = MemorySource::new();
        source.insert("/modules/big.bin", ModuleBuilder::new().code(&[0; 0x1000]).build().unwrap());

        let mut t = Target::new();
        let mut loader =
            ModuleLoader::new(&mut t.mem, &mut t.cache, &mut t.reporter, Target::config());
        let requested = 0x1000 + crate::header::HEADER_SIZE;
        assert_eq!(
            loader.load_from_source(&mut source, "/modules/big.bin", &mut t.invoker),
            Err(LoadError::OutOfMemory { requested })
        );
        drop(loader);
        assert_eq!(t.reporter.errors, vec![LoadError::OutOfMemory { requested }]);
    }

    #[test]
    fn test_config_builders() {
        let config = LoaderConfig::strict()
            .with_section_sync(SectionSync::Region)
            .with_publish(false);
        assert_eq!(config.unknown_opcode, UnknownOpcodePolicy::Abort);
        assert_eq!(config.section_sync, SectionSync::Region);
        assert!(!config.publish);
        assert!(LoaderConfig::default().publish);
    }
}

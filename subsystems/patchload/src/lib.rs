//! # Helix Patch Loader
//!
//! Loads a compact, position-independent code module into memory and applies
//! the stream of patch records that follows it. Records rewrite bytes, words
//! and branch instructions either inside the freshly loaded module or anywhere
//! in the already-running host image, which makes this a small hot-patcher:
//! it resolves addresses, writes fixups, injects hooks and keeps the caches
//! coherent with every write.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌────────────────┐   ┌────────────────┐   ┌──────────────┐   ┌────────────┐
//! │ HeaderParser │──▶│ModuleAllocator │──▶│ SectionLoader  │──▶│ PatchEngine  │──▶│ InitRunner │
//! │ (validate)   │   │ (code + bss)   │   │ (copy, zero)   │   │ (records)    │   │ (ctors)    │
//! └──────────────┘   └────────────────┘   └───────┬────────┘   └──────┬───────┘   └────────────┘
//!                                                 │                   │
//!                                                 ▼                   ▼
//!                                          ┌─────────────────────────────────┐
//!                                          │   CacheSync (after each write)  │
//!                                          └─────────────────────────────────┘
//! ```
//!
//! Every side effect goes through an injected capability (see [`platform`]):
//! module memory comes from a [`MemoryProvider`], reads and writes go through
//! an [`AddressSpace`], cache maintenance through [`CacheSync`], fatal errors
//! through a [`FatalReporter`] and constructor calls through a
//! [`CtorInvoker`]. [`sim`] provides an in-memory target for dry runs and
//! tests; [`arch`] provides the native one.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use helix_patchload::{LoaderConfig, ModuleLoader, arch, platform::LogReporter};
//!
//! let mut target = unsafe { arch::NativeTarget::new(heap_alloc, heap_free) };
//! let mut cache = arch::HostCacheSync::new();
//! let mut reporter = LogReporter;
//! let mut ctors = unsafe { arch::NativeInvoker::new() };
//!
//! let mut loader = ModuleLoader::new(&mut target, &mut cache, &mut reporter, LoaderConfig::default());
//! let module = loader.load(&blob, &mut ctors)?;
//! log::info!("{}", loader.stats());
//! ```
//!
//! ## Caller Contract
//!
//! The loader cannot stop other execution contexts from fetching the memory
//! it rewrites. Until [`ModuleLoader::load`] returns, no control-flow path may
//! enter the module region or any host code the patch set touches.

#![cfg_attr(not(test), no_std)]
#![cfg_attr(target_arch = "powerpc", feature(asm_experimental_arch))]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

pub mod address;
pub mod arch;
pub mod builder;
pub mod cursor;
pub mod error;
pub mod header;
pub mod init;
pub mod loader;
pub mod patch;
pub mod platform;
pub mod registry;
pub mod section;
pub mod sim;
pub mod stats;

// =============================================================================
// RE-EXPORTS
// =============================================================================

pub use crate::address::{AddressRef, LoadedModule};
pub use crate::cursor::ByteCursor;
pub use crate::error::{LoadError, LoadResult};
pub use crate::header::{HeaderParser, ModuleLayout};
pub use crate::init::InitRunner;
pub use crate::loader::{LoaderConfig, ModuleLoader, SectionSync, UnknownOpcodePolicy};
pub use crate::patch::{Opcode, PatchEngine, PatchOp, PatchRecord};
pub use crate::platform::{
    AddressSpace, ByteSource, CacheSync, CtorInvoker, FatalReporter, MemoryProvider,
    StagingMemory,
};
pub use crate::registry::ModuleInfo;
pub use crate::section::{ModuleAllocator, SectionLoader};
pub use crate::stats::PatchStats;

//! # Module Registry
//!
//! Records where the most recent module landed so that crash handlers and
//! map tooling can symbolicate addresses inside it.

use core::fmt;
use core::ops::Range;

use spin::RwLock;
use static_assertions::assert_impl_all;

use crate::{LoadedModule, ModuleLayout};

// ============================================================================
// MODULE INFO
// ============================================================================

/// Placement of a loaded module
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleInfo {
    /// First byte of the text (code) section
    pub base_address: usize,
    /// Code section size
    pub code_size: u32,
    /// Bss section size
    pub bss_size: u32,
    /// Module offset of the constructor table
    pub ctor_start: u32,
    /// Module offset one past the constructor table
    pub ctor_end: u32,
    /// Length of the blob the module was loaded from
    pub source_len: usize,
}

assert_impl_all!(ModuleInfo: Copy, Send, Sync);

impl ModuleInfo {
    /// Describe `module` as laid out by `layout`
    pub fn new(module: &LoadedModule, layout: &ModuleLayout, source_len: usize) -> Self {
        Self {
            base_address: module.base_address,
            code_size: layout.code_size,
            bss_size: layout.bss_size,
            ctor_start: layout.ctor_start,
            ctor_end: layout.ctor_end,
            source_len,
        }
    }

    /// Address range of the text section
    pub fn text_range(&self) -> Range<usize> {
        self.base_address..self.base_address + self.code_size as usize
    }

    /// Address range of the bss section
    pub fn bss_range(&self) -> Range<usize> {
        let start = self.text_range().end;
        start..start + self.bss_size as usize
    }

    /// Returns `true` if `addr` lies in text or bss
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base_address && addr < self.bss_range().end
    }

    /// Offset of `addr` from the text start, if it lies in text
    pub fn text_offset(&self, addr: usize) -> Option<usize> {
        self.text_range()
            .contains(&addr)
            .then(|| addr - self.base_address)
    }
}

impl fmt::Display for ModuleInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=================================")?;
        writeln!(f, "[ Module Info ]")?;
        writeln!(f, "    textStart:  {:08X}", self.base_address)?;
        writeln!(f, "    textSize:   {:08X}", self.code_size)?;
        writeln!(f, "    bssStart:   {:08X}", self.bss_range().start)?;
        writeln!(f, "    bssSize:    {:08X}", self.bss_size)?;
        writeln!(f, "    ctorsStart: {:08X}", self.ctor_start)?;
        writeln!(f, "    ctorsSize:  {:08X}", self.ctor_end.wrapping_sub(self.ctor_start))?;
        writeln!(f, "MODULE BASE ADDRESS: {:#x}", self.base_address)?;
        write!(f, "=================================")
    }
}

// ============================================================================
// GLOBAL REGISTRY
// ============================================================================

static CURRENT: RwLock<Option<ModuleInfo>> = RwLock::new(None);

/// Record `info` as the current module, replacing any previous one
pub fn publish(info: ModuleInfo) {
    *CURRENT.write() = Some(info);
}

/// Most recently published module
pub fn current() -> Option<ModuleInfo> {
    *CURRENT.read()
}

/// Forget the current module
pub fn clear() {
    *CURRENT.write() = None;
}

/// Offset of `addr` inside the current module's text, for symbolication
pub fn text_offset_of(addr: usize) -> Option<usize> {
    CURRENT.read().as_ref()?.text_offset(addr)
}

// ============================================================================
// TESTS
// ============================================================================

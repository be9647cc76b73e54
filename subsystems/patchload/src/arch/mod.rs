//! # Native Target
//!
//! Platform capabilities backed by the real machine: raw memory access,
//! per-architecture cache maintenance and direct constructor calls.
//!
//! | Architecture | `sync_range`                         | `barrier`     |
//! |--------------|--------------------------------------|---------------|
//! | PowerPC      | `dcbst` / `sync` / `icbi` per line   | `sync; isync` |
//! | AArch64      | `dc cvau` / `ic ivau` per line + DSB | `isb`         |
//! | RISC-V       | `fence.i`                            | `fence.i`     |
//! | x86 / other  | coherent, ordering fence only        | fence         |

use core::ptr::{self, NonNull};

use crate::platform::{AddressSpace, CacheSync, CtorInvoker, MemoryProvider, StagingMemory};
use crate::LoadResult;

// ============================================================================
// CACHE MAINTENANCE
// ============================================================================

/// Aligned line addresses covering `[start, start + len)`
#[cfg_attr(not(any(target_arch = "powerpc", target_arch = "aarch64")), allow(dead_code))]
fn lines(start: usize, len: usize, line: usize) -> impl Iterator<Item = usize> {
    let first = start & !(line - 1);
    let end = if len == 0 { first } else { start + len };
    (first..end).step_by(line)
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "powerpc")] {
        mod imp {
            use core::arch::asm;

            /// Gekko/Broadway L1 line size
            const LINE: usize = 32;

            pub fn sync_range(start: usize, len: usize) {
                for line in super::lines(start, len, LINE) {
                    // SAFETY: cache block operations on a mapped address have no
                    // architectural memory effect
                    unsafe {
                        asm!(
                            "dcbst 0, {0}",
                            "sync",
                            "icbi 0, {0}",
                            in(reg) line,
                            options(nostack, preserves_flags)
                        );
                    }
                }
            }

            pub fn barrier() {
                // SAFETY: pure synchronisation
                unsafe { asm!("sync", "isync", options(nostack, preserves_flags)) };
            }
        }
    } else if #[cfg(target_arch = "aarch64")] {
        mod imp {
            use core::arch::asm;

            fn ctr_el0() -> u64 {
                let ctr: u64;
                // SAFETY: CTR_EL0 is readable from EL0 on every supported host
                unsafe { asm!("mrs {}, ctr_el0", out(reg) ctr, options(nomem, nostack, preserves_flags)) };
                ctr
            }

            pub fn sync_range(start: usize, len: usize) {
                let ctr = ctr_el0();
                let dline = 4usize << ((ctr >> 16) & 0xF);
                let iline = 4usize << (ctr & 0xF);

                for line in super::lines(start, len, dline) {
                    // SAFETY: clean to PoU of a mapped address
                    unsafe { asm!("dc cvau, {}", in(reg) line, options(nostack, preserves_flags)) };
                }
                // SAFETY: pure synchronisation
                unsafe { asm!("dsb ish", options(nostack, preserves_flags)) };

                for line in super::lines(start, len, iline) {
                    // SAFETY: invalidate to PoU of a mapped address
                    unsafe { asm!("ic ivau, {}", in(reg) line, options(nostack, preserves_flags)) };
                }
                // SAFETY: pure synchronisation
                unsafe { asm!("dsb ish", options(nostack, preserves_flags)) };
            }

            pub fn barrier() {
                // SAFETY: pure synchronisation
                unsafe { asm!("isb", options(nostack, preserves_flags)) };
            }
        }
    } else if #[cfg(any(target_arch = "riscv64", target_arch = "riscv32"))] {
        mod imp {
            use core::arch::asm;

            fn fence_i() {
                // SAFETY: FENCE.I only orders instruction fetch
                unsafe { asm!("fence.i", options(nostack, preserves_flags)) };
            }

            pub fn sync_range(_start: usize, _len: usize) {
                fence_i();
            }

            pub fn barrier() {
                fence_i();
            }
        }
    } else {
        mod imp {
            use core::sync::atomic::{fence, Ordering};

            // Instruction fetch is coherent with stores
            pub fn sync_range(_start: usize, _len: usize) {
                fence(Ordering::Release);
            }

            pub fn barrier() {
                fence(Ordering::SeqCst);
            }
        }
    }
}

/// Cache maintenance for the architecture this crate is compiled for
#[derive(Debug, Clone, Copy, Default)]
pub struct HostCacheSync {
    _private: (),
}

impl HostCacheSync {
    /// Create the host cache back end
    pub const fn new() -> Self {
        Self { _private: () }
    }
}

impl CacheSync for HostCacheSync {
    #[inline]
    fn sync_range(&mut self, address: usize, len: usize) {
        imp::sync_range(address, len);
    }

    #[inline]
    fn barrier(&mut self) {
        imp::barrier();
    }
}

// ============================================================================
// MEMORY
// ============================================================================

/// Host allocator entry point: `(size, executable) -> block or null`
pub type AllocFn = unsafe fn(usize, bool) -> *mut u8;

/// Host deallocator entry point: `(block, executable)`
pub type FreeFn = unsafe fn(*mut u8, bool);

/// Direct access to the running machine's memory
///
/// Values are stored in native byte order. Naturally aligned half words and
/// words are written with a single volatile store.
#[derive(Debug, Clone, Copy)]
pub struct NativeTarget {
    alloc: AllocFn,
    free: FreeFn,
}

impl NativeTarget {
    /// Create a target backed by the host allocator pair
    ///
    /// # Safety
    /// - `alloc`/`free` must behave as a matching allocator pair
    /// - Every address a module's records name must be mapped and writable
    ///   for the lifetime of the target
    /// - No record may name an address inside a staging buffer
    pub const unsafe fn new(alloc: AllocFn, free: FreeFn) -> Self {
        Self { alloc, free }
    }
}

impl MemoryProvider for NativeTarget {
    fn alloc(&mut self, size: usize, executable: bool) -> Option<usize> {
        // SAFETY: guaranteed by the caller of `new`
        let block = unsafe { (self.alloc)(size, executable) };
        (!block.is_null()).then(|| block as usize)
    }

    fn free(&mut self, address: usize, executable: bool) {
        // SAFETY: `address` came from `alloc`
        unsafe { (self.free)(address as *mut u8, executable) };
    }
}

// SAFETY: blocks stay valid until freed by the `new` contract, and records
// never name staging buffers
unsafe impl StagingMemory for NativeTarget {
    fn staging_view(&mut self, address: usize, _len: usize) -> Option<NonNull<u8>> {
        NonNull::new(address as *mut u8)
    }
}

macro_rules! native_access {
    ($read:ident, $write:ident, $ty:ty) => {
        fn $read(&self, addr: usize) -> LoadResult<$ty> {
            let src = addr as *const $ty;
            // SAFETY: mapping guaranteed by the caller of `new`
            Ok(unsafe {
                if addr % core::mem::align_of::<$ty>() == 0 {
                    ptr::read_volatile(src)
                } else {
                    ptr::read_unaligned(src)
                }
            })
        }

        fn $write(&mut self, addr: usize, value: $ty) -> LoadResult<()> {
            let dst = addr as *mut $ty;
            // SAFETY: mapping guaranteed by the caller of `new`
            unsafe {
                if addr % core::mem::align_of::<$ty>() == 0 {
                    ptr::write_volatile(dst, value)
                } else {
                    ptr::write_unaligned(dst, value)
                }
            }
            Ok(())
        }
    };
}

impl AddressSpace for NativeTarget {
    native_access!(read_u8, write_u8, u8);
    native_access!(read_u16, write_u16, u16);
    native_access!(read_u32, write_u32, u32);

    fn write_bytes(&mut self, addr: usize, bytes: &[u8]) -> LoadResult<()> {
        // SAFETY: mapping guaranteed by the caller of `new`; the module block
        // never overlaps the blob
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, bytes.len()) };
        Ok(())
    }

    fn fill(&mut self, addr: usize, len: usize, value: u8) -> LoadResult<()> {
        // SAFETY: mapping guaranteed by the caller of `new`
        unsafe { ptr::write_bytes(addr as *mut u8, value, len) };
        Ok(())
    }
}

// ============================================================================
// CONSTRUCTORS
// ============================================================================

/// Calls constructor entries as `extern "C" fn()`
#[derive(Debug)]
pub struct NativeInvoker {
    _private: (),
}

impl NativeInvoker {
    /// Create the invoker
    ///
    /// # Safety
    /// Every constructor entry of every module loaded with this invoker must
    /// be the address of a function with the C ABI taking no arguments.
    pub const unsafe fn new() -> Self {
        Self { _private: () }
    }
}

impl CtorInvoker for NativeInvoker {
    fn invoke(&mut self, entry: usize) {
        // SAFETY: guaranteed by the caller of `new`; entries are never null
        let ctor = unsafe { core::mem::transmute::<usize, extern "C" fn()>(entry) };
        ctor();
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    unsafe fn no_alloc(_size: usize, _executable: bool) -> *mut u8 {
        ptr::null_mut()
    }

    unsafe fn no_free(_block: *mut u8, _executable: bool) {}

    static CALLS: AtomicUsize = AtomicUsize::new(0);

    extern "C" fn bump() {
        CALLS.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn test_lines_cover_range() {
        let covered: Vec<usize> = lines(0x1010, 0x40, 32).collect();
        assert_eq!(covered, vec![0x1000, 0x1020, 0x1040]);
        assert_eq!(lines(0x1010, 0, 32).count(), 0);
    }

    #[test]
    fn test_native_access() {
        let mut buf = [0u32; 2];
        let base = buf.as_mut_ptr() as usize;
        let mut target = unsafe { NativeTarget::new(no_alloc, no_free) };

        target.write_u32(base, 0x1122_3344).unwrap();
        target.write_u16(base + 4, 0xAABB).unwrap();
        target.write_u8(base + 7, 0x5A).unwrap();
        assert_eq!(target.read_u32(base).unwrap(), 0x1122_3344);
        assert_eq!(target.read_u16(base + 4).unwrap(), 0xAABB);
        assert_eq!(target.read_u8(base + 7).unwrap(), 0x5A);

        target.fill(base, 4, 0).unwrap();
        target.write_bytes(base + 1, &[9, 9]).unwrap();
        assert_eq!(target.read_u32(base).unwrap(), u32::from_ne_bytes([0, 9, 9, 0]));
        assert!(target.alloc(16, true).is_none());
        assert_eq!(target.staging_view(base, 8).map(NonNull::as_ptr), Some(base as *mut u8));
    }

    #[test]
    fn test_native_invoker() {
        let mut invoker = unsafe { NativeInvoker::new() };
        let before = CALLS.load(Ordering::SeqCst);
        invoker.invoke(bump as usize);
        assert_eq!(CALLS.load(Ordering::SeqCst), before + 1);
    }

    #[test]
    fn test_host_cache_sync_runs() {
        let buf = [0u8; 64];
        let mut cache = HostCacheSync::new();
        cache.sync_range(buf.as_ptr() as usize, buf.len());
        cache.barrier();
    }
}

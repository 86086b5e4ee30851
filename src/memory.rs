//! Virtual memory primitives (C2, C6) and the page-protection lattice.
//!
//! Generalizes the teacher's `WindowsBox<T>` (a single `VirtualAlloc` +
//! `Drop`-time `VirtualFree`) into a reservation that is committed
//! incrementally, section by section, the way the section mapper (C3) and
//! the image allocator (C2) are split in spec.md 4.2/4.3.

use std::io;
use std::ptr;

use log::{debug, warn};
use winapi::shared::minwindef::LPVOID;
use winapi::um::memoryapi::{VirtualAlloc, VirtualFree, VirtualProtect};
use winapi::um::sysinfoapi::GetNativeSystemInfo;
use winapi::um::winnt::{
    MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE, PAGE_EXECUTE_READ,
    PAGE_EXECUTE_READWRITE, PAGE_EXECUTE_WRITECOPY, PAGE_NOACCESS, PAGE_NOCACHE, PAGE_READONLY,
    PAGE_READWRITE, PAGE_WRITECOPY,
};

use crate::error::{LoadError, Result};
use crate::headers::SectionFlags;

/// An exclusively-owned virtual address range reserved for one module's
/// image. Frees the whole range on `Drop`, mirroring [`crate::module::LoadedModule`]'s
/// ownership of exactly one resource.
pub struct Reservation {
    base: *mut u8,
    size: usize,
}

impl Reservation {
    pub fn base(&self) -> *mut u8 {
        self.base
    }

    pub fn base_addr(&self) -> u64 {
        self.base as u64
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Reserve (but do not commit) `size` bytes, preferring `preferred_base`
    /// and falling back to any address. This is spec.md 4.2's documented
    /// default behavior (`PreferredBase::Default`).
    pub fn reserve(preferred_base: u64, size: usize) -> Result<Reservation> {
        let preferred = unsafe {
            VirtualAlloc(preferred_base as LPVOID, size, MEM_RESERVE, PAGE_READWRITE)
        };

        if !preferred.is_null() {
            return Ok(Reservation {
                base: preferred as *mut u8,
                size,
            });
        }

        debug!(
            "preferred base {:#x} unavailable, reserving at any address",
            preferred_base
        );
        Reservation::reserve_any(size)
    }

    /// Reserve at exactly `address`; fail (no fallback) if unavailable.
    /// Backs `PreferredBase::Exact`.
    pub fn reserve_exact(address: u64, size: usize) -> Result<Reservation> {
        let result =
            unsafe { VirtualAlloc(address as LPVOID, size, MEM_RESERVE, PAGE_READWRITE) };
        if result.is_null() {
            warn!("VirtualAlloc at exact address {address:#x} failed");
            return Err(LoadError::OutOfMemory(io::Error::last_os_error()));
        }
        Ok(Reservation {
            base: result as *mut u8,
            size,
        })
    }

    /// Reserve at whatever address the OS chooses. Backs `PreferredBase::Any`
    /// and the fallback path of [`Self::reserve`].
    pub fn reserve_any(size: usize) -> Result<Reservation> {
        let any = unsafe { VirtualAlloc(ptr::null_mut(), size, MEM_RESERVE, PAGE_READWRITE) };
        if any.is_null() {
            warn!("VirtualAlloc reservation of {size} bytes failed entirely");
            return Err(LoadError::OutOfMemory(io::Error::last_os_error()));
        }
        Ok(Reservation {
            base: any as *mut u8,
            size,
        })
    }

    /// Commit `len` bytes at `self.base() + offset` as `PAGE_READWRITE`.
    pub fn commit(&self, offset: usize, len: usize) -> Result<*mut u8> {
        let addr = unsafe { self.base.add(offset) };
        let result = unsafe { VirtualAlloc(addr as LPVOID, len, MEM_COMMIT, PAGE_READWRITE) };
        if result.is_null() {
            Err(LoadError::OutOfMemory(io::Error::last_os_error()))
        } else {
            Ok(result as *mut u8)
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.base.is_null() {
            unsafe {
                VirtualFree(self.base as LPVOID, 0, MEM_RELEASE);
            }
        }
    }
}

/// `GetNativeSystemInfo().dwPageSize`, captured once at load time (C9's
/// `page_size` field).
pub fn native_page_size() -> u32 {
    unsafe {
        let mut info = std::mem::zeroed();
        GetNativeSystemInfo(&mut info);
        info.dwPageSize
    }
}

/// The 2x2x2 protection lattice from spec.md 4.6.
pub fn protection_for(executable: bool, readable: bool, writable: bool) -> u32 {
    match (executable, readable, writable) {
        (false, false, false) => PAGE_NOACCESS,
        (false, false, true) => PAGE_WRITECOPY,
        (false, true, false) => PAGE_READONLY,
        (false, true, true) => PAGE_READWRITE,
        (true, false, false) => PAGE_EXECUTE,
        (true, false, true) => PAGE_EXECUTE_WRITECOPY,
        (true, true, false) => PAGE_EXECUTE_READ,
        (true, true, true) => PAGE_EXECUTE_READWRITE,
    }
}

pub fn flags_to_protection(flags: SectionFlags) -> u32 {
    let mut protect = protection_for(
        flags.contains(SectionFlags::MEM_EXECUTE),
        flags.contains(SectionFlags::MEM_READ),
        flags.contains(SectionFlags::MEM_WRITE),
    );
    if flags.contains(SectionFlags::MEM_NOT_CACHED) {
        protect |= PAGE_NOCACHE;
    }
    protect
}

/// Apply `protect` to `[addr, addr+len)`. Used by the section finalizer (C6).
pub fn virtual_protect(addr: *mut u8, len: usize, protect: u32) -> Result<()> {
    let mut old_protect = 0u32;
    let ok = unsafe { VirtualProtect(addr as LPVOID, len, protect, &mut old_protect) };
    if ok == 0 {
        Err(LoadError::ProtectFailed(io::Error::last_os_error()))
    } else {
        Ok(())
    }
}

/// Decommit `[addr, addr+len)`. Used by the section finalizer for
/// page-aligned, whole-page discardable sections (C6).
pub fn virtual_decommit(addr: *mut u8, len: usize) -> Result<()> {
    let ok = unsafe { VirtualFree(addr as LPVOID, len, MEM_DECOMMIT) };
    if ok == 0 {
        Err(LoadError::OutOfMemory(io::Error::last_os_error()))
    } else {
        Ok(())
    }
}

//! The module registry (C9), entry-point dispatch (C8), and the unload path
//! (C11). [`LoadedModule`] is the sole long-lived entity described in
//! spec.md 3 — it is created exclusively by [`load_module`] and destroyed
//! exclusively by its `Drop` impl, which backs both the safe Rust API and
//! the raw C ABI's `unload`.

use std::ffi::CStr;

use log::{debug, info, warn};
use winapi::ctypes::c_void;
use winapi::shared::minwindef::BOOL;

use crate::config::{LoadOptions, PreferredBase};
use crate::error::{LoadError, Result};
use crate::exports;
use crate::headers::{DirectoryEntry, NtHeaders};
use crate::imports::{self, Dependency};
use crate::memory::{native_page_size, Reservation};
use crate::relocate;
use crate::sections;
use crate::tls;

const DLL_PROCESS_ATTACH: u32 = 1;
const DLL_PROCESS_DETACH: u32 = 0;

type DllMain = unsafe extern "system" fn(*mut c_void, u32, *mut c_void) -> BOOL;

/// The sole long-lived entity this crate produces. Exclusively owns its
/// virtual address reservation and every dependency handle acquired while
/// binding imports; both are released by `Drop`, matching spec.md 3's
/// lifecycle ("created exclusively by load ... destroyed exclusively by
/// unload").
pub struct LoadedModule {
    /// Declared before `reservation`: Rust drops fields in declaration order,
    /// and spec.md 4.10 requires every dependency `HMODULE` (`FreeLibrary`)
    /// to be released before the virtual reservation (`VirtualFree`).
    dependencies: Vec<Dependency>,
    reservation: Reservation,
    /// Offset of the NT headers within `reservation`, computed once after
    /// the headers were copied in (C2).
    nt_headers_offset: usize,
    page_size: u32,
    initialized: bool,
    relocated: bool,
    entry_point_rva: u32,
}

impl LoadedModule {
    /// `load`, spec.md 6.1, with the default `PreferredBase::Default` policy.
    pub fn load(image: &[u8]) -> Result<LoadedModule> {
        Self::load_with_options(image, LoadOptions::default())
    }

    /// `load` with an explicit base-placement policy (spec.md 9's
    /// `PreferredBase` sketch, promoted in [`crate::config`]).
    pub fn load_with_options(image: &[u8], options: LoadOptions) -> Result<LoadedModule> {
        load_module(image, options)
    }

    pub fn base(&self) -> u64 {
        self.reservation.base_addr()
    }

    fn nt_headers(&self) -> &NtHeaders {
        unsafe { &*((self.base() as usize + self.nt_headers_offset) as *const NtHeaders) }
    }

    /// `resolve`, spec.md 6.1 / 4.9.
    pub fn resolve(&self, name: &CStr) -> Result<u64> {
        let export_dir = unsafe {
            self.nt_headers()
                .optional_header
                .directory(DirectoryEntry::Export)
        };
        unsafe { exports::resolve(self.base(), export_dir, name) }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn is_relocated(&self) -> bool {
        self.relocated
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }
}

impl Drop for LoadedModule {
    fn drop(&mut self) {
        // C11: entry point DLL_PROCESS_DETACH first, while dependencies are
        // still loaded, then (via the fields below dropping in declaration
        // order) every dependency handle, then finally the image itself.
        if self.initialized && self.entry_point_rva != 0 {
            let entry = self.base() + self.entry_point_rva as u64;
            let entry: DllMain = unsafe { std::mem::transmute(entry) };
            let _ = unsafe { entry(self.base() as *mut c_void, DLL_PROCESS_DETACH, std::ptr::null_mut()) };
        }
        debug!(
            "unloaded module at {:#x} ({} dependencies)",
            self.base(),
            self.dependencies.len()
        );
        // `dependencies` and `reservation` are dropped automatically after
        // this body returns, in declaration order (dependencies first).
    }
}

/// Runs the full C1-through-C8 pipeline described in spec.md 2's control
/// flow. Any `?` before the final `Ok` leaves only RAII-owned locals
/// (`reservation`, `dependencies`) behind, which Rust drops on the way out —
/// the partial teardown spec.md 4 (State machine) requires falls out of
/// ordinary ownership instead of being hand-written.
fn load_module(image: &[u8], options: LoadOptions) -> Result<LoadedModule> {
    let nt_in_image = unsafe { crate::validate::validate(image)? };

    let size_of_image = nt_in_image.optional_header.size_of_image as usize;
    let size_of_headers = nt_in_image.optional_header.size_of_headers as usize;
    let preferred_image_base = nt_in_image.optional_header.image_base;
    let section_alignment = nt_in_image.optional_header.section_alignment;
    let lfanew = unsafe { &*(image.as_ptr() as *const crate::headers::DosHeader) }.e_lfanew as usize;

    if size_of_headers > image.len() {
        return Err(LoadError::BadExeFormat);
    }

    let reservation = match options.preferred_base {
        PreferredBase::Exact(addr) => Reservation::reserve_exact(addr, size_of_image)?,
        PreferredBase::Default => Reservation::reserve(preferred_image_base, size_of_image)?,
        PreferredBase::Any => Reservation::reserve_any(size_of_image)?,
    };

    let base = reservation.base_addr();
    info!(
        "mapping image at base {:#x} (preferred {:#x}, size {:#x})",
        base, preferred_image_base, size_of_image
    );

    let headers_ptr = reservation.commit(0, size_of_headers)?;
    unsafe { std::ptr::copy_nonoverlapping(image.as_ptr(), headers_ptr, size_of_headers) };

    // SAFETY: we just copied `size_of_headers` bytes starting at offset 0,
    // and `validate` already checked `lfanew + size_of::<NtHeaders>()` fits
    // within the original image, which is <= `size_of_headers` for any
    // well-formed PE.
    let nt: &mut NtHeaders = unsafe { &mut *(headers_ptr.add(lfanew) as *mut NtHeaders) };

    unsafe { sections::map_sections(&reservation, image, nt)? };

    let delta = base as i64 - preferred_image_base as i64;
    let reloc_dir = unsafe { nt.optional_header.directory(DirectoryEntry::BaseReloc) };
    let relocated = unsafe { relocate::relocate(base, delta, reloc_dir)? };

    let mut dependencies = Vec::new();
    let import_dir = unsafe { nt.optional_header.directory(DirectoryEntry::Import) };
    unsafe { imports::bind_imports(base, import_dir, &mut dependencies)? };

    let page_size = native_page_size();
    sections::finalize_sections(base, page_size, section_alignment, nt)?;

    let tls_dir = unsafe { nt.optional_header.directory(DirectoryEntry::Tls) };
    unsafe { tls::run_process_attach(base, tls_dir)? };

    let entry_point_rva = nt.optional_header.address_of_entry_point;
    let mut initialized = false;
    if entry_point_rva != 0 {
        let entry_addr = base + entry_point_rva as u64;
        let entry: DllMain = unsafe { std::mem::transmute(entry_addr) };
        let ok = unsafe { entry(base as *mut c_void, DLL_PROCESS_ATTACH, std::ptr::null_mut()) };
        if ok == 0 {
            warn!("entry point at {:#x} returned failure on DLL_PROCESS_ATTACH", entry_addr);
            // `dependencies` and `reservation` unwind normally here: this
            // function returns Err, so `LoadedModule` is never constructed
            // and its `Drop` never runs, but the locals already created
            // (the dependency handles, the virtual reservation) still fall
            // out of scope and free themselves.
            return Err(LoadError::DllInitFailed);
        }
        initialized = true;
    }

    let nt_headers_offset = lfanew;

    Ok(LoadedModule {
        dependencies,
        reservation,
        nt_headers_offset,
        page_size,
        initialized,
        relocated,
        entry_point_rva,
    })
}

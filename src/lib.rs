//! `manualpe` — an in-process, filesystem-free manual mapper for PE32+
//! (AMD64) dynamic libraries.
//!
//! Given a contiguous byte image of a DLL, [`load`] maps it into the host
//! process's address space, resolves its dependencies through the host OS
//! loader, applies base relocations, runs TLS callbacks and the entry point,
//! and returns an opaque handle. [`resolve`] looks up an exported symbol by
//! name; [`unload`] tears the module back down. The image never touches the
//! filesystem — see `SPEC_FULL.md` for the full design.
//!
//! The crate exposes two surfaces over the same pipeline:
//! - [`LoadedModule`], a safe, RAII-owned Rust handle (`Drop` unloads).
//! - The three C-ABI functions below (`load`/`resolve`/`unload`), matching
//!   the calling convention embedding callers (a loader stub, a packer, a
//!   game-engine plugin host) already expect.

#![cfg(windows)]

mod config;
mod error;
mod exports;
mod headers;
mod imports;
mod memory;
mod module;
mod relocate;
mod rva;
mod sections;
mod tls;
mod validate;

use std::ffi::CStr;
use std::os::raw::c_char;

pub use config::{LoadOptions, PreferredBase};
pub use error::{LastError, LoadError, Result};
pub use module::LoadedModule;

/// Opaque, pointer-sized handle. Only values previously returned by [`load`]
/// are legal inputs to [`resolve`]/[`unload`] — spec.md 3's "opaque" contract.
pub type Handle = usize;

/// `load`, spec.md 6.1. `size` is advisory (spec.md 9): every real extent is
/// re-derived from the PE headers themselves. Returns `0` on failure with
/// [`last_error`] set.
///
/// # Safety
/// `data` must be valid for reads of `size` bytes.
#[no_mangle]
pub unsafe extern "C" fn load(data: *const u8, size: usize) -> Handle {
    error::clear_last_error();
    let image = std::slice::from_raw_parts(data, size);
    match LoadedModule::load(image) {
        Ok(module) => Box::into_raw(Box::new(module)) as Handle,
        Err(e) => {
            error::set_last_error(&e);
            0
        }
    }
}

/// `resolve`, spec.md 6.1. Returns `NULL` on failure with [`last_error`] set
/// to `ProcNotFound`.
///
/// # Safety
/// `handle` must be a value previously returned by [`load`] that has not yet
/// been passed to [`unload`]. `name` must be a valid NUL-terminated C string.
#[no_mangle]
pub unsafe extern "C" fn resolve(handle: Handle, name: *const c_char) -> *const () {
    error::clear_last_error();
    let module = &*(handle as *const LoadedModule);
    let name = CStr::from_ptr(name);
    match module.resolve(name) {
        Ok(addr) => addr as *const (),
        Err(e) => {
            error::set_last_error(&e);
            std::ptr::null()
        }
    }
}

/// `unload`, spec.md 6.1. Infallible (spec.md 7): any internal teardown step
/// that fails is swallowed, since the handle is being destroyed regardless.
///
/// # Safety
/// `handle` must be a value previously returned by [`load`] that has not yet
/// been passed to [`unload`]; after this call the handle is invalid and must
/// not be reused.
#[no_mangle]
pub unsafe extern "C" fn unload(handle: Handle) {
    if handle != 0 {
        drop(Box::from_raw(handle as *mut LoadedModule));
    }
}

/// The platform's thread-local last-error code (spec.md 6.4), for callers
/// that went through the C ABI above.
pub fn last_error() -> LastError {
    error::last_error()
}

//! Error types and the C-ABI "last error" cell.
//!
//! `spec.md` 6.4/7 specifies a five-member error code surfaced through a
//! thread-local last-error value, in the style of `GetLastError`. The Rust
//! API returns [`LoadError`] directly; the C ABI in `lib.rs` translates it
//! into [`LastError`] and stashes it here.

use std::cell::Cell;
use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("not a PE32+/AMD64 image")]
    BadExeFormat,

    #[error("failed to reserve or commit virtual memory")]
    OutOfMemory(#[source] io::Error),

    #[error("dependency module could not be loaded")]
    ModuleNotFound(#[source] io::Error),

    #[error("import or export symbol could not be resolved")]
    ProcNotFound,

    #[error("DLL entry point returned failure on DLL_PROCESS_ATTACH")]
    DllInitFailed,

    #[error("VirtualProtect failed while finalizing section permissions")]
    ProtectFailed(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, LoadError>;

/// The five-way code from spec.md 6.4, as surfaced through the C ABI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum LastError {
    Success = 0,
    BadExeFormat = 1,
    OutOfMemory = 2,
    ModuleNotFound = 3,
    ProcNotFound = 4,
    DllInitFailed = 5,
}

impl From<&LoadError> for LastError {
    fn from(e: &LoadError) -> Self {
        match e {
            LoadError::BadExeFormat => LastError::BadExeFormat,
            LoadError::OutOfMemory(_) => LastError::OutOfMemory,
            LoadError::ModuleNotFound(_) => LastError::ModuleNotFound,
            LoadError::ProcNotFound => LastError::ProcNotFound,
            LoadError::DllInitFailed => LastError::DllInitFailed,
            LoadError::ProtectFailed(_) => LastError::OutOfMemory,
        }
    }
}

thread_local! {
    static LAST_ERROR: Cell<LastError> = Cell::new(LastError::Success);
}

pub fn set_last_error(e: &LoadError) {
    LAST_ERROR.with(|cell| cell.set(e.into()));
}

pub fn clear_last_error() {
    LAST_ERROR.with(|cell| cell.set(LastError::Success));
}

/// Mirrors `GetLastError` for callers going through the C ABI in `lib.rs`.
pub fn last_error() -> LastError {
    LAST_ERROR.with(|cell| cell.get())
}

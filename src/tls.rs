//! TLS callback execution (C7): spec.md 4.7.

use log::debug;
use winapi::ctypes::c_void;

use crate::error::Result;
use crate::headers::{DataDirectory, TlsDirectory64};
use crate::rva;

const DLL_PROCESS_ATTACH: u32 = 1;

type TlsCallback = unsafe extern "system" fn(*mut c_void, u32, *mut c_void);

/// Run every TLS callback with `DLL_PROCESS_ATTACH`, in directory order.
///
/// `AddressOfCallbacks` and every entry of the callback array it points to
/// are ordinary absolute VAs, the same as any other embedded pointer in the
/// image: the linker marks them for base relocation, so by the time this
/// runs (after [`crate::relocate::relocate`] in spec.md 4's pipeline) they
/// already hold addresses valid for the actual load base. Nothing here
/// re-adjusts them by `delta` — doing so would double-apply the fixup that
/// relocation already made.
///
/// # Safety
/// `base` must be the fully relocated, import-bound image base, and
/// `tls_dir` (when present) must describe a TLS directory copied into that
/// same image.
pub unsafe fn run_process_attach(base: u64, tls_dir: Option<&DataDirectory>) -> Result<()> {
    let tls_dir = match tls_dir {
        Some(d) => d,
        None => return Ok(()),
    };

    let directory = rva::resolve::<TlsDirectory64>(base, tls_dir.virtual_address);
    let callbacks_va = (*directory).address_of_callbacks;
    if callbacks_va == 0 {
        return Ok(());
    }

    let mut callback = callbacks_va as *const Option<TlsCallback>;
    let mut count = 0u32;
    while let Some(f) = *callback {
        f(base as *mut c_void, DLL_PROCESS_ATTACH, std::ptr::null_mut());
        count += 1;
        callback = callback.add(1);
    }
    debug!("ran {count} TLS callbacks on process attach");
    Ok(())
}

//! Import binding (C5): resolve each import descriptor through the host OS
//! loader and patch the IAT in place. Never recurses into this crate's own
//! loader — dependencies are always resolved by the real `LoadLibraryA`.

use std::ffi::CStr;
use std::io;
use std::os::raw::c_char;

use log::debug;
use winapi::shared::minwindef::{FARPROC, HMODULE};
use winapi::um::libloaderapi::{FreeLibrary, GetProcAddress, LoadLibraryA};

use crate::error::{LoadError, Result};
use crate::headers::{is_ordinal, ordinal_of, DataDirectory, ImportDescriptor};
use crate::rva;

/// One dependency DLL loaded through the host OS loader, exclusively owned
/// by the [`crate::module::LoadedModule`] that imported it. `FreeLibrary`s on
/// drop, the same ownership shape as the teacher's `WindowsBox`.
pub struct Dependency {
    handle: HMODULE,
}

// SAFETY: `HMODULE` is just an opaque base address; the OS loader's own
// internal refcounting is what makes concurrent use across threads sound,
// exactly as documented in spec.md 5 ("Thread-safety contract").
unsafe impl Send for Dependency {}

impl Dependency {
    pub fn load(name: &CStr) -> Result<Dependency> {
        let handle = unsafe { LoadLibraryA(name.as_ptr()) };
        if handle.is_null() {
            Err(LoadError::ModuleNotFound(io::Error::last_os_error()))
        } else {
            Ok(Dependency { handle })
        }
    }

    pub fn proc_by_name(&self, name: &CStr) -> FARPROC {
        unsafe { GetProcAddress(self.handle, name.as_ptr()) }
    }

    pub fn proc_by_ordinal(&self, ordinal: u16) -> FARPROC {
        unsafe { GetProcAddress(self.handle, ordinal as usize as *const c_char) }
    }
}

impl Drop for Dependency {
    fn drop(&mut self) {
        unsafe {
            FreeLibrary(self.handle);
        }
    }
}

/// C5: walk every import descriptor, load its DLL, and patch its IAT.
///
/// Every successfully loaded dependency is pushed onto `dependencies` before
/// its thunks are resolved, so a later `ProcNotFound` still leaves it where
/// the caller's teardown path (which frees every entry in `dependencies`) can
/// release it — matching spec.md 4.5's "freeing the just-loaded dependency"
/// without a double free.
///
/// # Safety
/// `base` must be the fully section-mapped and relocated image base, and
/// `import_dir` (when present) must describe an import directory copied into
/// that same image.
pub unsafe fn bind_imports(
    base: u64,
    import_dir: Option<&DataDirectory>,
    dependencies: &mut Vec<Dependency>,
) -> Result<()> {
    let import_dir = match import_dir {
        Some(d) => d,
        None => return Ok(()),
    };

    let mut descriptor = rva::resolve::<ImportDescriptor>(base, import_dir.virtual_address);

    while !(*descriptor).is_null() {
        let dll_name = rva::resolve_c_str(base, (*descriptor).name);
        debug!("binding imports from {:?}", dll_name);

        let dependency = Dependency::load(dll_name)?;
        dependencies.push(dependency);
        let dependency = dependencies.last().unwrap();

        let name_thunks_rva = if (*descriptor).original_first_thunk != 0 {
            (*descriptor).original_first_thunk
        } else {
            (*descriptor).first_thunk
        };

        let mut name_thunk = rva::resolve::<u64>(base, name_thunks_rva);
        let mut iat_slot = rva::resolve_mut::<u64>(base, (*descriptor).first_thunk);

        loop {
            let thunk = *name_thunk;
            if thunk == 0 {
                break;
            }

            let proc = if is_ordinal(thunk) {
                dependency.proc_by_ordinal(ordinal_of(thunk))
            } else {
                // `thunk` is an RVA to IMAGE_IMPORT_BY_NAME { hint: u16, name: [c_char] }.
                let name = rva::resolve_c_str(base, thunk as u32 + 2);
                dependency.proc_by_name(name)
            };

            if proc.is_none() {
                return Err(LoadError::ProcNotFound);
            }

            *iat_slot = proc.unwrap() as u64;

            name_thunk = name_thunk.add(1);
            iat_slot = iat_slot.add(1);
        }

        descriptor = descriptor.add(1);
    }

    Ok(())
}

//! Export resolution (C10): spec.md 4.9.

use std::ffi::CStr;

use crate::error::{LoadError, Result};
use crate::headers::{DataDirectory, ExportDirectory};
use crate::rva;

/// Resolve `name` against the module's export directory by binary search
/// over the name-sorted `AddressOfNames` array. Forwarded exports (an RVA
/// landing inside the export directory itself) are returned as-is, per
/// spec.md 4.9 — this loader does not chase them.
///
/// # Safety
/// `base` must be a fully loaded module's image base, and `export_dir` (when
/// present) must describe an export directory copied into that same image.
pub unsafe fn resolve(base: u64, export_dir: Option<&DataDirectory>, name: &CStr) -> Result<u64> {
    let export_dir = export_dir.ok_or(LoadError::ProcNotFound)?;
    let directory = rva::resolve::<ExportDirectory>(base, export_dir.virtual_address);
    let dir = &*directory;

    if dir.number_of_names == 0 || dir.number_of_functions == 0 {
        return Err(LoadError::ProcNotFound);
    }

    let names = std::slice::from_raw_parts(
        rva::resolve::<u32>(base, dir.address_of_names),
        dir.number_of_names as usize,
    );
    let ordinals = std::slice::from_raw_parts(
        rva::resolve::<u16>(base, dir.address_of_name_ordinals),
        dir.number_of_names as usize,
    );
    let functions = std::slice::from_raw_parts(
        rva::resolve::<u32>(base, dir.address_of_functions),
        dir.number_of_functions as usize,
    );

    let index = names.binary_search_by(|&name_rva| {
        let candidate = rva::resolve_c_str(base, name_rva);
        candidate.to_bytes().cmp(name.to_bytes())
    });
    let index = match index {
        Ok(i) => i,
        Err(_) => return Err(LoadError::ProcNotFound),
    };

    let ordinal = ordinals[index] as usize;
    let function_rva = *functions.get(ordinal).ok_or(LoadError::ProcNotFound)?;

    Ok(base + function_rva as u64)
}

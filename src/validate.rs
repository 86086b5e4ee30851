//! Header validation (C1): spec.md 4.1.

use std::mem::size_of;

use crate::error::{LoadError, Result};
use crate::headers::{
    DosHeader, NtHeaders, IMAGE_DOS_SIGNATURE, IMAGE_FILE_MACHINE_AMD64, IMAGE_NT_SIGNATURE,
};

/// Reject anything that is not a PE32+/AMD64 image with an even section
/// alignment. Returns a pointer to the (still foreign) NT headers on
/// success; later stages fault naturally on further malformation, per
/// spec.md 4.1 ("callers must only load trusted bytes").
///
/// # Safety
/// `image` must outlive the returned reference; the reference is only valid
/// for as long as `image` is.
pub unsafe fn validate(image: &[u8]) -> Result<&NtHeaders> {
    if image.len() < size_of::<DosHeader>() {
        return Err(LoadError::BadExeFormat);
    }
    let dos = &*(image.as_ptr() as *const DosHeader);
    if dos.e_magic != IMAGE_DOS_SIGNATURE {
        return Err(LoadError::BadExeFormat);
    }

    let lfanew = dos.e_lfanew as usize;
    if lfanew.checked_add(size_of::<NtHeaders>())
        .map_or(true, |end| end > image.len())
    {
        return Err(LoadError::BadExeFormat);
    }

    let nt = dos.nt_headers();
    if nt.signature != IMAGE_NT_SIGNATURE {
        return Err(LoadError::BadExeFormat);
    }
    if nt.file_header.machine != IMAGE_FILE_MACHINE_AMD64 {
        return Err(LoadError::BadExeFormat);
    }
    if nt.optional_header.section_alignment % 2 != 0 {
        return Err(LoadError::BadExeFormat);
    }

    Ok(nt)
}

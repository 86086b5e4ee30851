//! Base relocation (C4): spec.md 4.4.

use log::debug;

use crate::error::{LoadError, Result};
use crate::headers::{BaseRelocationBlock, DataDirectory, RelocationType};
use crate::rva;

/// Apply every base relocation block, or confirm none are needed.
///
/// `delta` is `actual_base - preferred_base`. If the `.reloc` directory is
/// absent, the load only succeeds when `delta == 0` (spec.md 4.4).
///
/// # Safety
/// `base` must be the committed, section-mapped image base, and `reloc_dir`
/// (when present) must describe a `.reloc` stream that was copied into that
/// same image.
pub unsafe fn relocate(base: u64, delta: i64, reloc_dir: Option<&DataDirectory>) -> Result<bool> {
    let reloc_dir = match reloc_dir {
        Some(d) => d,
        None if delta == 0 => return Ok(true),
        None => return Err(LoadError::BadExeFormat),
    };

    if delta == 0 {
        return Ok(true);
    }

    let end = base + reloc_dir.virtual_address as u64 + reloc_dir.size as u64;
    let mut block = rva::resolve::<BaseRelocationBlock>(base, reloc_dir.virtual_address);

    let mut applied = 0u64;
    while (block as u64) < end && (*block).page_rva != 0 {
        let page_rva = (*block).page_rva;
        for &entry in (*block).entries() {
            let kind = RelocationType::from_raw(entry >> 12);
            let offset = (entry & 0x0fff) as u32;
            let address = base + page_rva as u64 + offset as u64;

            match kind {
                RelocationType::Absolute => {
                    // Padding entry, no-op.
                }
                RelocationType::HighLow => {
                    let ptr = address as *mut u32;
                    *ptr = (*ptr).wrapping_add(delta as u32);
                    applied += 1;
                }
                RelocationType::Dir64 => {
                    let ptr = address as *mut u64;
                    *ptr = (*ptr).wrapping_add(delta as u64);
                    applied += 1;
                }
                RelocationType::Other(raw) => {
                    debug!("ignoring unrecognized relocation type {raw} at {address:#x}");
                }
            }
        }
        block = (*block).next();
    }

    debug!("applied {applied} base relocation entries (delta {delta:#x})");
    Ok(true)
}

//! Section mapping (C3) and section finalization (C6).

use log::debug;

use crate::error::Result;
use crate::headers::{NtHeaders, SectionFlags};
use crate::memory::{flags_to_protection, virtual_decommit, virtual_protect, Reservation};

/// C3: commit and populate every section's virtual range, zero-filling
/// sections with no raw data. Overwrites each section header's scratch
/// `misc` field with its `virtual_address`, per spec.md 4.3.
pub fn map_sections(reservation: &Reservation, image: &[u8], nt: &mut NtHeaders) -> Result<()> {
    let section_alignment = nt.optional_header.section_alignment;
    for section in unsafe { nt.sections_mut() } {
        if section.virtual_address == 0 {
            continue;
        }

        let dest = section.virtual_address as usize;
        if section.size_of_raw_data == 0 {
            if section_alignment > 0 {
                let ptr = reservation.commit(dest, section_alignment as usize)?;
                unsafe { ptr.write_bytes(0, section_alignment as usize) };
            }
        } else {
            let len = section.size_of_raw_data as usize;
            let ptr = reservation.commit(dest, len)?;
            let src_start = section.pointer_to_raw_data as usize;
            let src = &image[src_start..src_start + len];
            unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), ptr, len) };
        }

        section.misc = section.virtual_address;
    }
    Ok(())
}

struct Window {
    address: u64,
    aligned_address: u64,
    size: u64,
    flags: SectionFlags,
}

/// C6: coalesce page-sharing sections and apply final protection, per
/// spec.md 4.6. `page_size` is the value captured in the module registry
/// (C9); `section_alignment` comes straight from the optional header.
pub fn finalize_sections(
    base: u64,
    page_size: u32,
    section_alignment: u32,
    nt: &NtHeaders,
) -> Result<()> {
    let page_size = page_size as u64;
    let sections: Vec<_> = unsafe { nt.sections() }
        .iter()
        .filter(|s| s.virtual_address != 0)
        .collect();

    if sections.is_empty() {
        return Ok(());
    }

    let size_of = |raw: u32| -> u64 {
        if raw == 0 {
            section_alignment as u64
        } else {
            raw as u64
        }
    };

    let mut window = {
        let first = sections[0];
        let address = base + first.virtual_address as u64;
        Window {
            address,
            aligned_address: address & !(page_size - 1),
            size: size_of(first.size_of_raw_data),
            flags: first.flags(),
        }
    };

    let count = sections.len();
    for (i, section) in sections.iter().enumerate().skip(1) {
        let address = base + section.virtual_address as u64;
        let aligned_address = address & !(page_size - 1);
        let size = size_of(section.size_of_raw_data);

        if window.aligned_address == aligned_address || window.address + window.size > address {
            // Shares a page with the current window: merge.
            let both_discardable =
                window.flags.contains(SectionFlags::MEM_DISCARDABLE)
                    && section.flags().contains(SectionFlags::MEM_DISCARDABLE);
            let mut merged = window.flags | section.flags();
            if !both_discardable {
                merged.remove(SectionFlags::MEM_DISCARDABLE);
            }
            window.flags = merged;
            window.size = (aligned_address + size) - window.address;
            continue;
        }

        finalize_window(&window, i == count, page_size, section_alignment)?;
        window = Window {
            address,
            aligned_address,
            size,
            flags: section.flags(),
        };
    }
    finalize_window(&window, true, page_size, section_alignment)
}

fn finalize_window(
    window: &Window,
    is_last: bool,
    page_size: u64,
    section_alignment: u32,
) -> Result<()> {
    if window.size == 0 {
        return Ok(());
    }

    if window.flags.contains(SectionFlags::MEM_DISCARDABLE) {
        let page_aligned = window.address == window.aligned_address;
        let whole_pages = window.size % page_size == 0;
        if page_aligned && (is_last || section_alignment as u64 == page_size || whole_pages) {
            debug!(
                "decommitting discardable window at {:#x} ({} bytes)",
                window.address, window.size
            );
            virtual_decommit(window.address as *mut u8, window.size as usize)?;
        }
        return Ok(());
    }

    let protect = flags_to_protection(window.flags);
    virtual_protect(window.address as *mut u8, window.size as usize, protect)
}

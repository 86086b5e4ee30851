//! Hand-assembled, minimal PE32+/AMD64 image builder used by the
//! integration tests. Lays out exactly one RWX section holding whatever
//! code, tables, and directories a scenario needs; every RVA the builder
//! hands back is relative to that section's virtual address.
//!
//! This produces real machine code (tiny `mov`/`ret` sequences) that the
//! crate under test actually executes, so every test here requires running
//! on Windows, same as the crate itself.

#![allow(dead_code)]

pub const SECTION_ALIGNMENT: u32 = 0x1000;
pub const FILE_ALIGNMENT: u32 = 0x200;
pub const SECTION_RVA: u32 = 0x1000;
const IMAGE_REL_BASED_DIR64: u16 = 10;

fn round_up(value: u32, align: u32) -> u32 {
    (value + align - 1) / align * align
}

pub struct ImageBuilder {
    image_base: u64,
    payload: Vec<u8>,
    entry_point_rva: u32,
    export_dir: Option<(u32, u32)>,
    import_descriptors: Vec<(u32, u32)>, // (name_rva, first_thunk_rva) pending until finalized
    pending_int_rvas: Vec<u32>,
    import_dir: Option<(u32, u32)>,
    reloc_fixups: Vec<u32>,
    reloc_dir: Option<(u32, u32)>,
    tls_dir: Option<(u32, u32)>,
    section_characteristics: u32,
}

impl ImageBuilder {
    pub fn new(image_base: u64) -> Self {
        ImageBuilder {
            image_base,
            payload: Vec::new(),
            entry_point_rva: 0,
            export_dir: None,
            import_descriptors: Vec::new(),
            pending_int_rvas: Vec::new(),
            import_dir: None,
            reloc_fixups: Vec::new(),
            reloc_dir: None,
            tls_dir: None,
            // EXECUTE | READ | WRITE | CNT_INITIALIZED_DATA
            section_characteristics: 0x2000_0000 | 0x4000_0000 | 0x8000_0000 | 0x0000_0040,
        }
    }

    fn rva(&self) -> u32 {
        SECTION_RVA + self.payload.len() as u32
    }

    fn append(&mut self, bytes: &[u8]) -> u32 {
        let rva = self.rva();
        self.payload.extend_from_slice(bytes);
        rva
    }

    fn append_u16(&mut self, v: u16) -> u32 {
        self.append(&v.to_le_bytes())
    }

    fn append_u32(&mut self, v: u32) -> u32 {
        self.append(&v.to_le_bytes())
    }

    fn append_u64(&mut self, v: u64) -> u32 {
        self.append(&v.to_le_bytes())
    }

    fn append_cstr(&mut self, s: &str) -> u32 {
        let mut bytes = s.as_bytes().to_vec();
        bytes.push(0);
        self.append(&bytes)
    }

    pub fn set_entry_point(&mut self, rva: u32) {
        self.entry_point_rva = rva;
    }

    /// `mov eax, 1 ; ret` — DllMain/entry point that always reports success.
    pub fn entry_point_always_succeeds(&mut self) -> u32 {
        let rva = self.append(&[0xB8, 0x01, 0x00, 0x00, 0x00, 0xC3]);
        self.set_entry_point(rva);
        rva
    }

    /// `xor eax, eax ; ret` — DllMain/entry point that always reports failure.
    pub fn entry_point_always_fails(&mut self) -> u32 {
        let rva = self.append(&[0x31, 0xC0, 0xC3]);
        self.set_entry_point(rva);
        rva
    }

    /// `mov eax, <value> ; ret` — a plain exported function.
    pub fn code_returns_constant(&mut self, value: i32) -> u32 {
        let mut code = vec![0xB8];
        code.extend_from_slice(&value.to_le_bytes());
        code.push(0xC3);
        self.append(&code)
    }

    /// A TLS callback: `movabs rax, <preferred VA of marker_rva> ; mov byte
    /// [rax], 0x5A ; ret`. The embedded absolute address is recorded as a
    /// DIR64 fixup so it becomes correct for whatever address the image is
    /// actually mapped at.
    pub fn code_tls_marks(&mut self, marker_rva: u32) -> u32 {
        let start = self.rva();
        self.append(&[0x48, 0xB8]);
        let imm_rva = self.rva();
        self.append_u64(self.image_base + marker_rva as u64);
        self.append(&[0xC6, 0x00, 0x5A, 0xC3]);
        self.reloc_fixups.push(imm_rva);
        start
    }

    /// A zero-initialized qword slot, useful as an observable side-effect
    /// target.
    pub fn append_marker(&mut self) -> u32 {
        self.append_u64(0)
    }

    /// Export table with name-sorted binary search support (C10).
    pub fn set_exports(&mut self, exports: &[(&str, u32)]) {
        let name_rvas: Vec<u32> = exports.iter().map(|(n, _)| self.append_cstr(n)).collect();
        let mut order: Vec<usize> = (0..exports.len()).collect();
        order.sort_by_key(|&i| exports[i].0);

        let functions_rva = self.rva();
        for (_, f) in exports {
            self.append_u32(*f);
        }
        let names_rva = self.rva();
        for &i in &order {
            self.append_u32(name_rvas[i]);
        }
        let ordinals_rva = self.rva();
        for &i in &order {
            self.append_u16(i as u16);
        }
        let dll_name_rva = self.append_cstr("test.dll");

        let dir_rva = self.rva();
        self.append_u32(0); // characteristics
        self.append_u32(0); // time_date_stamp
        self.append_u16(0); // major_version
        self.append_u16(0); // minor_version
        self.append_u32(dll_name_rva);
        self.append_u32(1); // ordinal base
        self.append_u32(exports.len() as u32); // number_of_functions
        self.append_u32(exports.len() as u32); // number_of_names
        self.append_u32(functions_rva);
        self.append_u32(names_rva);
        self.append_u32(ordinals_rva);

        self.export_dir = Some((dir_rva, 40));
    }

    /// Queues one import descriptor: `dll_name` with every entry in
    /// `functions` imported by name. Descriptors are written out contiguously
    /// by `build()`, since [`crate::imports::bind_imports`] walks them as a
    /// flat array.
    /// Returns the RVA of each function's IAT slot, in `functions` order, so
    /// a test can build code that calls through one directly.
    pub fn add_import(&mut self, dll_name: &str, functions: &[&str]) -> Vec<u32> {
        let dll_name_rva = self.append_cstr(dll_name);
        let thunk_rvas: Vec<u32> = functions
            .iter()
            .map(|f| {
                let rva = self.rva();
                let mut bytes = vec![0u8, 0u8]; // hint
                bytes.extend_from_slice(f.as_bytes());
                bytes.push(0);
                self.append(&bytes);
                rva
            })
            .collect();

        let int_rva = self.rva();
        for &t in &thunk_rvas {
            self.append_u64(t as u64);
        }
        self.append_u64(0);

        let iat_rva = self.rva();
        let iat_slot_rvas: Vec<u32> = thunk_rvas
            .iter()
            .enumerate()
            .map(|(i, &t)| {
                let slot = iat_rva + (i as u32) * 8;
                self.append_u64(t as u64);
                slot
            })
            .collect();
        self.append_u64(0);

        self.import_descriptors.push((dll_name_rva, iat_rva));
        self.pending_int_rvas.push(int_rva);
        iat_slot_rvas
    }

    /// `movabs rax, <preferred VA of iat_slot_rva> ; call qword ptr [rax] ;
    /// ret` — calls through a bound IAT slot and returns whatever the callee
    /// left in `eax`/`rax`. The embedded absolute address is a DIR64 fixup,
    /// same as [`Self::code_tls_marks`].
    pub fn code_calls_import(&mut self, iat_slot_rva: u32) -> u32 {
        let start = self.rva();
        self.append(&[0x48, 0xB8]);
        let imm_rva = self.rva();
        self.append_u64(self.image_base + iat_slot_rva as u64);
        self.append(&[0xFF, 0x10, 0xC3]);
        self.reloc_fixups.push(imm_rva);
        start
    }

    fn finalize_imports(&mut self) {
        if self.import_descriptors.is_empty() {
            return;
        }
        let dir_rva = self.rva();
        let entries = std::mem::take(&mut self.import_descriptors);
        let int_rvas = std::mem::take(&mut self.pending_int_rvas);
        for ((dll_name_rva, first_thunk_rva), int_rva) in entries.iter().zip(int_rvas.iter()) {
            self.append_u32(*int_rva); // original_first_thunk
            self.append_u32(0); // time_date_stamp
            self.append_u32(0); // forwarder_chain
            self.append_u32(*dll_name_rva);
            self.append_u32(*first_thunk_rva);
        }
        // null terminator descriptor
        for _ in 0..5 {
            self.append_u32(0);
        }
        let size = (entries.len() as u32 + 1) * 20;
        self.import_dir = Some((dir_rva, size));
    }

    /// Always emits a (possibly empty) `.reloc` stream. A present-but-empty
    /// directory makes `relocate()` succeed unconditionally (spec.md 4.4's
    /// no-directory rule only kicks in when the directory is truly absent),
    /// so tests aren't at the mercy of where the OS actually places the
    /// image.
    fn finalize_relocations(&mut self) {
        if self.reloc_fixups.is_empty() {
            let dir_rva = self.rva();
            self.append_u32(0); // page_rva: 0 terminates the walk immediately
            self.append_u32(8); // block_size: header only, no entries
            self.reloc_dir = Some((dir_rva, 8));
            return;
        }
        let mut pages: std::collections::BTreeMap<u32, Vec<u16>> = Default::default();
        for &rva in &self.reloc_fixups {
            let page = rva & !0xFFFu32;
            let offset = (rva & 0xFFF) as u16;
            pages
                .entry(page)
                .or_default()
                .push((IMAGE_REL_BASED_DIR64 << 12) | offset);
        }
        let dir_rva = self.rva();
        let mut total_size = 0u32;
        for (page, mut entries) in pages {
            if entries.len() % 2 != 0 {
                entries.push(0);
            }
            let block_size = 8 + entries.len() as u32 * 2;
            self.append_u32(page);
            self.append_u32(block_size);
            for e in entries {
                self.append_u16(e);
            }
            total_size += block_size;
        }
        self.reloc_dir = Some((dir_rva, total_size));
    }

    /// TLS directory with one callback, `callback_code_rva`. Every absolute
    /// pointer the directory introduces (`AddressOfCallbacks` itself and the
    /// single callback-array slot) is recorded as a DIR64 fixup, matching
    /// what a real linker emits for these fields.
    pub fn set_tls(&mut self, callback_code_rva: u32) {
        let slot_rva = self.rva();
        self.append_u64(self.image_base + callback_code_rva as u64);
        self.append_u64(0); // null terminator

        let dir_rva = self.rva();
        self.append_u64(0); // start_address_of_raw_data
        self.append_u64(0); // end_address_of_raw_data
        self.append_u64(0); // address_of_index
        let callbacks_field_rva = self.rva();
        self.append_u64(self.image_base + slot_rva as u64);
        self.append_u32(0); // size_of_zero_fill
        self.append_u32(0); // characteristics

        self.reloc_fixups.push(callbacks_field_rva);
        self.reloc_fixups.push(slot_rva);
        self.tls_dir = Some((dir_rva, 40));
    }

    pub fn build(mut self) -> Vec<u8> {
        self.finalize_imports();
        self.finalize_relocations();

        while self.payload.len() % FILE_ALIGNMENT as usize != 0 {
            self.payload.push(0);
        }
        let section_raw_size = self.payload.len() as u32;
        let virtual_size = round_up(section_raw_size.max(1), SECTION_ALIGNMENT);

        const DOS_HEADER_SIZE: u32 = 64;
        const FILE_HEADER_SIZE: u32 = 20;
        const OPTIONAL_HEADER_SIZE: u32 = 112;
        const NUM_DATA_DIRECTORIES: u32 = 16;
        const SECTION_HEADER_SIZE: u32 = 40;

        let lfanew = DOS_HEADER_SIZE;
        let headers_size = lfanew
            + 4
            + FILE_HEADER_SIZE
            + OPTIONAL_HEADER_SIZE
            + NUM_DATA_DIRECTORIES * 8
            + SECTION_HEADER_SIZE;
        let size_of_headers = round_up(headers_size, FILE_ALIGNMENT);
        let size_of_image = SECTION_RVA + virtual_size;

        let mut image = Vec::with_capacity(size_of_headers as usize + self.payload.len());

        // DOS header
        image.extend_from_slice(&0x5A4Du16.to_le_bytes());
        image.extend_from_slice(&[0u8; 58]);
        image.extend_from_slice(&lfanew.to_le_bytes());
        assert_eq!(image.len() as u32, DOS_HEADER_SIZE);

        // NT signature + FileHeader
        image.extend_from_slice(&0x0000_4550u32.to_le_bytes());
        image.extend_from_slice(&0x8664u16.to_le_bytes()); // machine: AMD64
        image.extend_from_slice(&1u16.to_le_bytes()); // number_of_sections
        image.extend_from_slice(&0u32.to_le_bytes()); // time_date_stamp
        image.extend_from_slice(&0u32.to_le_bytes()); // pointer_to_symbol_table
        image.extend_from_slice(&0u32.to_le_bytes()); // number_of_symbols
        image.extend_from_slice(
            &((OPTIONAL_HEADER_SIZE + NUM_DATA_DIRECTORIES * 8) as u16).to_le_bytes(),
        );
        image.extend_from_slice(&0x2022u16.to_le_bytes()); // EXECUTABLE_IMAGE|LARGE_ADDRESS_AWARE|DLL

        // OptionalHeader64
        image.extend_from_slice(&0x20bu16.to_le_bytes()); // magic
        image.push(0); // major_linker_version
        image.push(0); // minor_linker_version
        image.extend_from_slice(&0u32.to_le_bytes()); // size_of_code
        image.extend_from_slice(&0u32.to_le_bytes()); // size_of_initialized_data
        image.extend_from_slice(&0u32.to_le_bytes()); // size_of_uninitialized_data
        image.extend_from_slice(&self.entry_point_rva.to_le_bytes());
        image.extend_from_slice(&SECTION_RVA.to_le_bytes()); // base_of_code
        image.extend_from_slice(&self.image_base.to_le_bytes());
        image.extend_from_slice(&SECTION_ALIGNMENT.to_le_bytes());
        image.extend_from_slice(&FILE_ALIGNMENT.to_le_bytes());
        image.extend_from_slice(&6u16.to_le_bytes()); // major_os_version
        image.extend_from_slice(&0u16.to_le_bytes()); // minor_os_version
        image.extend_from_slice(&0u16.to_le_bytes()); // major_image_version
        image.extend_from_slice(&0u16.to_le_bytes()); // minor_image_version
        image.extend_from_slice(&6u16.to_le_bytes()); // major_subsystem_version
        image.extend_from_slice(&0u16.to_le_bytes()); // minor_subsystem_version
        image.extend_from_slice(&0u32.to_le_bytes()); // win32_version_value
        image.extend_from_slice(&size_of_image.to_le_bytes());
        image.extend_from_slice(&size_of_headers.to_le_bytes());
        image.extend_from_slice(&0u32.to_le_bytes()); // checksum
        image.extend_from_slice(&1u16.to_le_bytes()); // subsystem: NATIVE
        image.extend_from_slice(&0u16.to_le_bytes()); // dll_characteristics
        image.extend_from_slice(&0x10_0000u64.to_le_bytes()); // size_of_stack_reserve
        image.extend_from_slice(&0x1000u64.to_le_bytes()); // size_of_stack_commit
        image.extend_from_slice(&0x10_0000u64.to_le_bytes()); // size_of_heap_reserve
        image.extend_from_slice(&0x1000u64.to_le_bytes()); // size_of_heap_commit
        image.extend_from_slice(&0u32.to_le_bytes()); // loader_flags
        image.extend_from_slice(&NUM_DATA_DIRECTORIES.to_le_bytes());

        // DataDirectory[16]
        let directory = |slot: Option<(u32, u32)>| -> [u8; 8] {
            let (rva, size) = slot.unwrap_or((0, 0));
            let mut bytes = [0u8; 8];
            bytes[..4].copy_from_slice(&rva.to_le_bytes());
            bytes[4..].copy_from_slice(&size.to_le_bytes());
            bytes
        };
        let dirs: [Option<(u32, u32)>; 16] = [
            self.export_dir,  // 0 Export
            self.import_dir,  // 1 Import
            None,             // 2 Resource
            None,             // 3 Exception
            None,             // 4 Security
            self.reloc_dir,   // 5 BaseReloc
            None,             // 6 Debug
            None,             // 7 Architecture
            None,             // 8 GlobalPtr
            self.tls_dir,     // 9 Tls
            None,             // 10 LoadConfig
            None,             // 11 BoundImport
            None,             // 12 Iat
            None,             // 13 DelayImport
            None,             // 14 ComDescriptor
            None,             // 15 reserved
        ];
        for slot in dirs {
            image.extend_from_slice(&directory(slot));
        }

        // SectionHeader (".data")
        let mut name = [0u8; 8];
        name[..5].copy_from_slice(b".data");
        image.extend_from_slice(&name);
        image.extend_from_slice(&virtual_size.to_le_bytes()); // misc/virtual_size
        image.extend_from_slice(&SECTION_RVA.to_le_bytes());
        image.extend_from_slice(&section_raw_size.to_le_bytes());
        image.extend_from_slice(&size_of_headers.to_le_bytes()); // pointer_to_raw_data
        image.extend_from_slice(&0u32.to_le_bytes());
        image.extend_from_slice(&0u32.to_le_bytes());
        image.extend_from_slice(&0u16.to_le_bytes());
        image.extend_from_slice(&0u16.to_le_bytes());
        image.extend_from_slice(&self.section_characteristics.to_le_bytes());

        while image.len() < size_of_headers as usize {
            image.push(0);
        }
        assert_eq!(image.len() as u32, size_of_headers);

        image.extend_from_slice(&self.payload);
        image
    }
}

//! Synthetic images for unit tests.
//!
//! [`ImageBuilder::minimal`] is a bare PE32 image with one code section and no data
//! directories. [`ImageBuilder::full`] adds an MS-DOS stub, all 16 directories, an import
//! section with one module and a base relocation section with one block.

use crate::pe::DirectoryKind;

/// RVA of the `.idata` section and its import directory table.
pub const IMPORT_RVA: u32 = 0x2000;
/// RVA of the import lookup table.
pub const ILT_RVA: u32 = IMPORT_RVA + 0x28;
/// RVA of the import address table.
pub const IAT_RVA: u32 = IMPORT_RVA + 0x48;
/// RVA of the imported module name.
pub const DLL_NAME_RVA: u32 = IMPORT_RVA + 0x68;
/// RVA of the only hint/name entry.
pub const HINT_NAME_RVA: u32 = IMPORT_RVA + 0x78;
/// Loaded size of `.idata`.
pub const IDATA_SIZE: u32 = 0x90;
/// RVA of the `.reloc` section and its base relocation table.
pub const RELOC_RVA: u32 = 0x3000;

/// One section of a synthetic image.
#[derive(Debug, Clone)]
pub struct SectionSpec {
    pub name: &'static str,
    pub fp: u32,
    pub fsize: u32,
    pub rva: u32,
    pub vsize: u32,
    pub characteristics: u32,
    pub bytes: Vec<u8>,
}

/// Assembles PE images byte by byte.
#[derive(Debug, Clone)]
pub struct ImageBuilder {
    pub dos: bool,
    pub wide: bool,
    pub directories: Vec<(DirectoryKind, u32, u32)>,
    pub directory_count: u32,
    pub file_alignment: u32,
    pub section_alignment: u32,
    pub size_of_headers: u32,
    pub size_of_image: u32,
    pub sections: Vec<SectionSpec>,
}

impl ImageBuilder {
    /// A PE32 image without MS-DOS stub or data directories and a single `.text` section.
    pub fn minimal() -> ImageBuilder {
        ImageBuilder {
            dos: false,
            wide: false,
            directories: Vec::new(),
            directory_count: 0,
            file_alignment: 0x200,
            section_alignment: 0x1000,
            size_of_headers: 0x200,
            size_of_image: 0x2000,
            sections: vec![SectionSpec {
                name: ".text",
                fp: 0x200,
                fsize: 0x200,
                rva: 0x1000,
                vsize: 0x180,
                characteristics: 0x6000_0020,
                bytes: code(0x180),
            }],
        }
    }

    /// An image with `.text`, `.idata` and `.reloc`.
    pub fn full() -> ImageBuilder {
        ImageBuilder {
            dos: true,
            wide: false,
            directories: Vec::new(),
            directory_count: 16,
            file_alignment: 0x200,
            section_alignment: 0x1000,
            size_of_headers: 0x400,
            size_of_image: 0x4000,
            sections: vec![
                SectionSpec {
                    name: ".text",
                    fp: 0x400,
                    fsize: 0x200,
                    rva: 0x1000,
                    vsize: 0x100,
                    characteristics: 0x6000_0020,
                    bytes: code(0x100),
                },
                SectionSpec {
                    name: ".idata",
                    fp: 0x600,
                    fsize: 0x200,
                    rva: IMPORT_RVA,
                    vsize: IDATA_SIZE,
                    characteristics: 0xC000_0040,
                    bytes: Vec::new(),
                },
                SectionSpec {
                    name: ".reloc",
                    fp: 0x800,
                    fsize: 0x200,
                    rva: RELOC_RVA,
                    vsize: 0x0C,
                    characteristics: 0x4200_0040,
                    bytes: Vec::new(),
                },
            ],
        }
        .with_tables()
    }

    /// Switches to the PE32+ layout with 8-byte import thunks.
    pub fn wide(mut self) -> ImageBuilder {
        self.wide = true;
        self.with_tables()
    }

    fn thunk_size(&self) -> usize {
        if self.wide {
            8
        } else {
            4
        }
    }

    /// Regenerates the `.idata` and `.reloc` contents and their directories.
    fn with_tables(mut self) -> ImageBuilder {
        let thunk = self.thunk_size();
        let ordinal_flag = if self.wide { 1u64 << 63 } else { 1u64 << 31 };

        let mut idata = vec![0u8; IDATA_SIZE as usize];
        for (at, value) in [ILT_RVA, 0, 0, DLL_NAME_RVA, IAT_RVA].into_iter().enumerate() {
            idata[at * 4..at * 4 + 4].copy_from_slice(&value.to_le_bytes());
        }
        for table in [ILT_RVA, IAT_RVA] {
            let at = (table - IMPORT_RVA) as usize;
            let thunks = [u64::from(HINT_NAME_RVA), ordinal_flag | 0x32];
            for (index, value) in thunks.into_iter().enumerate() {
                let start = at + index * thunk;
                idata[start..start + thunk].copy_from_slice(&value.to_le_bytes()[..thunk]);
            }
        }
        let name = (DLL_NAME_RVA - IMPORT_RVA) as usize;
        idata[name..name + 12].copy_from_slice(b"KERNEL32.dll");
        let hint = (HINT_NAME_RVA - IMPORT_RVA) as usize;
        idata[hint..hint + 2].copy_from_slice(&0x0120u16.to_le_bytes());
        idata[hint + 2..hint + 13].copy_from_slice(b"ExitProcess");

        let fixup: u16 = if self.wide { 0xA004 } else { 0x3004 };
        let mut reloc = Vec::new();
        reloc.extend_from_slice(&0x1000u32.to_le_bytes());
        reloc.extend_from_slice(&12u32.to_le_bytes());
        reloc.extend_from_slice(&fixup.to_le_bytes());
        reloc.extend_from_slice(&0u16.to_le_bytes());

        for section in &mut self.sections {
            match section.name {
                ".idata" => section.bytes = idata.clone(),
                ".reloc" => section.bytes = reloc.clone(),
                _ => {}
            }
        }

        self.directories = vec![
            (DirectoryKind::Import, IMPORT_RVA, 0x28),
            (DirectoryKind::BaseRelocation, RELOC_RVA, 0x0C),
            (DirectoryKind::Iat, IAT_RVA, 3 * thunk as u32),
        ];
        self
    }

    /// Size of the optional header as declared by the COFF header.
    pub fn optional_size(&self) -> usize {
        let core = if self.wide { 112 } else { 96 };
        core + self.directory_count as usize * 8
    }

    /// Serializes the image.
    pub fn build(&self) -> Vec<u8> {
        let file_size = self
            .sections
            .iter()
            .map(|section| (section.fp + section.fsize) as usize)
            .max()
            .unwrap_or(self.size_of_headers as usize)
            .max(self.size_of_headers as usize);
        let mut data = vec![0u8; file_size];

        let coff = if self.dos {
            data[..2].copy_from_slice(b"MZ");
            data[0x3C..0x40].copy_from_slice(&0x80u32.to_le_bytes());
            data[0x40..0x4E].copy_from_slice(b"This is a stub");
            data[0x80..0x84].copy_from_slice(b"PE\0\0");
            0x84
        } else {
            0
        };

        let machine: u16 = if self.wide { 0x8664 } else { 0x14C };
        put16(&mut data, coff, machine);
        put16(&mut data, coff + 2, self.sections.len() as u16);
        put32(&mut data, coff + 4, 0x6500_0000);
        put16(&mut data, coff + 16, self.optional_size() as u16);
        put16(&mut data, coff + 18, 0x0102);

        let opt = coff + 20;
        put16(&mut data, opt, if self.wide { 0x20B } else { 0x10B });
        data[opt + 2] = 14;
        put32(&mut data, opt + 16, 0x1000);
        put32(&mut data, opt + 20, 0x1000);
        if self.wide {
            data[opt + 24..opt + 32].copy_from_slice(&0x1_4000_0000u64.to_le_bytes());
        } else {
            put32(&mut data, opt + 24, 0x2000);
            put32(&mut data, opt + 28, 0x40_0000);
        }
        put32(&mut data, opt + 32, self.section_alignment);
        put32(&mut data, opt + 36, self.file_alignment);
        put16(&mut data, opt + 40, 6);
        put16(&mut data, opt + 48, 6);
        put32(&mut data, opt + 56, self.size_of_image);
        put32(&mut data, opt + 60, self.size_of_headers);
        put16(&mut data, opt + 68, 3);
        put16(&mut data, opt + 70, 0x8140);
        let (count_at, directories_at) = if self.wide { (108, 112) } else { (92, 96) };
        if self.wide {
            data[opt + 72..opt + 80].copy_from_slice(&0x10_0000u64.to_le_bytes());
            data[opt + 80..opt + 88].copy_from_slice(&0x1000u64.to_le_bytes());
        } else {
            put32(&mut data, opt + 72, 0x10_0000);
            put32(&mut data, opt + 76, 0x1000);
        }
        put32(&mut data, opt + count_at, self.directory_count);
        for &(kind, rva, size) in &self.directories {
            if (kind as u32) < self.directory_count {
                let at = opt + directories_at + kind as usize * 8;
                put32(&mut data, at, rva);
                put32(&mut data, at + 4, size);
            }
        }

        let mut at = opt + self.optional_size();
        for section in &self.sections {
            let mut name = [0u8; 8];
            name[..section.name.len()].copy_from_slice(section.name.as_bytes());
            data[at..at + 8].copy_from_slice(&name);
            put32(&mut data, at + 8, section.vsize);
            put32(&mut data, at + 12, section.rva);
            put32(&mut data, at + 16, section.fsize);
            put32(&mut data, at + 20, section.fp);
            put32(&mut data, at + 36, section.characteristics);
            at += 40;

            let start = section.fp as usize;
            let len = section.bytes.len().min(section.fsize as usize);
            data[start..start + len].copy_from_slice(&section.bytes[..len]);
        }

        data
    }
}

/// Recognizable filler for code sections.
pub fn code(len: usize) -> Vec<u8> {
    let mut bytes = vec![0xCC; len];
    let prologue = [0x55, 0x8B, 0xEC, 0xA1, 0x00, 0x20, 0x40, 0x00, 0x5D, 0xC3];
    let n = prologue.len().min(len);
    bytes[..n].copy_from_slice(&prologue[..n]);
    bytes
}

fn put16(data: &mut [u8], at: usize, value: u16) {
    data[at..at + 2].copy_from_slice(&value.to_le_bytes());
}

fn put32(data: &mut [u8], at: usize, value: u32) {
    data[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

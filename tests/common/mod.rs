//! Hand-assembled images shared by the integration tests.
#![allow(dead_code)]

use std::sync::Once;

static INIT: Once = Once::new();

/// Installs a test logger once per test binary.
pub fn init_logging() {
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

pub const TEXT_OFFSET: usize = 0x400;
pub const IDATA_OFFSET: usize = 0x600;
pub const RELOC_OFFSET: usize = 0x800;
pub const FILE_SIZE: usize = 0xA00;

/// Layout knobs for [`image`].
#[derive(Debug, Clone, Copy)]
pub struct Options {
    pub wide: bool,
    pub imports: bool,
    pub relocations: bool,
    pub directory_count: u32,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            wide: false,
            imports: true,
            relocations: true,
            directory_count: 16,
        }
    }
}

fn put(data: &mut [u8], at: usize, bytes: &[u8]) {
    data[at..at + bytes.len()].copy_from_slice(bytes);
}

/// An executable with an MS-DOS stub and the sections `.text`, `.idata` and `.reloc`.
///
/// `.idata` imports `ExitProcess` by name and ordinal 7 from `KERNEL32.dll`; `.reloc`
/// holds one block for page 0x1000 with one fixup and one padding entry.
pub fn image(options: Options) -> Vec<u8> {
    let mut data = vec![0u8; FILE_SIZE];
    let thunk = if options.wide { 8 } else { 4 };

    put(&mut data, 0, b"MZ");
    put(&mut data, 0x3C, &0x80u32.to_le_bytes());
    put(&mut data, 0x80, b"PE\0\0");

    let coff = 0x84;
    let optional_size: u16 =
        (if options.wide { 112 } else { 96 }) + options.directory_count as u16 * 8;
    put(&mut data, coff, &(if options.wide { 0x8664u16 } else { 0x14C }).to_le_bytes());
    put(&mut data, coff + 2, &3u16.to_le_bytes());
    put(&mut data, coff + 16, &optional_size.to_le_bytes());
    put(&mut data, coff + 18, &0x0102u16.to_le_bytes());

    let opt = coff + 20;
    put(&mut data, opt, &(if options.wide { 0x20Bu16 } else { 0x10B }).to_le_bytes());
    put(&mut data, opt + 16, &0x1000u32.to_le_bytes());
    if options.wide {
        put(&mut data, opt + 24, &0x1_4000_0000u64.to_le_bytes());
    } else {
        put(&mut data, opt + 28, &0x40_0000u32.to_le_bytes());
    }
    put(&mut data, opt + 32, &0x1000u32.to_le_bytes());
    put(&mut data, opt + 36, &0x200u32.to_le_bytes());
    put(&mut data, opt + 56, &0x4000u32.to_le_bytes());
    put(&mut data, opt + 60, &0x400u32.to_le_bytes());
    let (count_at, directories) = if options.wide { (108, 112) } else { (92, 96) };
    put(&mut data, opt + count_at, &options.directory_count.to_le_bytes());

    let mut directory = |index: usize, rva: u32, size: u32| {
        if index < options.directory_count as usize {
            let at = opt + directories + index * 8;
            put(&mut data, at, &rva.to_le_bytes());
            put(&mut data, at + 4, &size.to_le_bytes());
        }
    };
    if options.imports {
        directory(1, 0x2000, 0x28);
    }
    if options.relocations {
        directory(5, 0x3000, 0x0C);
    }

    let table = opt + optional_size as usize;
    let sections: [(&[u8], u32, u32, u32, u32, u32); 3] = [
        (&b".text"[..], 0x100, 0x1000, 0x200, TEXT_OFFSET as u32, 0x6000_0020),
        (&b".idata"[..], 0xA0, 0x2000, 0x200, IDATA_OFFSET as u32, 0xC000_0040),
        (&b".reloc"[..], 0x0C, 0x3000, 0x200, RELOC_OFFSET as u32, 0x4200_0040),
    ];
    for (index, (name, vsize, rva, fsize, fp, characteristics)) in sections.into_iter().enumerate() {
        let at = table + index * 40;
        put(&mut data, at, name);
        put(&mut data, at + 8, &vsize.to_le_bytes());
        put(&mut data, at + 12, &rva.to_le_bytes());
        put(&mut data, at + 16, &fsize.to_le_bytes());
        put(&mut data, at + 20, &fp.to_le_bytes());
        put(&mut data, at + 36, &characteristics.to_le_bytes());
    }

    // mov eax, [0x402000]; ret
    put(&mut data, TEXT_OFFSET, &[0xA1, 0x00, 0x20, 0x40, 0x00, 0xC3]);

    // Directory entry, ILT at +0x30, IAT at +0x50, name at +0x70, hint/name at +0x80.
    let idata = IDATA_OFFSET;
    for (index, value) in [0x2030u32, 0, 0, 0x2070, 0x2050].into_iter().enumerate() {
        put(&mut data, idata + index * 4, &value.to_le_bytes());
    }
    let ordinal = if options.wide { (1u64 << 63) | 7 } else { (1u64 << 31) | 7 };
    for array in [0x30, 0x50] {
        put(&mut data, idata + array, &0x2080u64.to_le_bytes()[..thunk]);
        put(&mut data, idata + array + thunk, &ordinal.to_le_bytes()[..thunk]);
    }
    put(&mut data, idata + 0x70, b"KERNEL32.dll\0");
    put(&mut data, idata + 0x80, &0x0120u16.to_le_bytes());
    put(&mut data, idata + 0x82, b"ExitProcess\0");

    put(&mut data, RELOC_OFFSET, &0x1000u32.to_le_bytes());
    put(&mut data, RELOC_OFFSET + 4, &12u32.to_le_bytes());
    let fixup: u16 = if options.wide { 0xA001 } else { 0x3001 };
    put(&mut data, RELOC_OFFSET + 8, &fixup.to_le_bytes());

    data
}

/// The default PE32 image.
pub fn pe32() -> Vec<u8> {
    image(Options::default())
}

/// The default image in the PE32+ layout.
pub fn pe32_plus() -> Vec<u8> {
    image(Options {
        wide: true,
        ..Options::default()
    })
}

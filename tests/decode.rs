//! Decoding, table resolution and region validation through the public API.

mod common;

use std::sync::Arc;

use pescope::{
    layout::AddressSpace,
    pe::{DirectoryKind, FileCharacteristics, Machine, OptionalState},
    rebuild::SectionKind,
    schema::{RecordKind, SchemaRegistry},
    tables::{BaseRelocationType, HintName, ImportName},
    AddressError, Error, Image,
};

use common::{image, init_logging, Options, IDATA_OFFSET, RELOC_OFFSET};

const SECTION_TABLE: usize = 0x84 + 20 + 96 + 16 * 8;

#[test]
fn headers() {
    init_logging();
    let image = Image::from_mem(common::pe32()).unwrap();

    let coff = image.coff();
    assert_eq!(coff.machine(), Some(Machine::I386));
    assert_eq!(coff.number_of_sections().unwrap(), 3);
    assert!(coff
        .characteristics()
        .unwrap()
        .contains(FileCharacteristics::EXECUTABLE_IMAGE));

    let optional = image.optional();
    assert_eq!(optional.state(), OptionalState::Width32);
    assert_eq!(optional.image_base().unwrap(), 0x40_0000);
    assert_eq!(optional.header().schema().field("ImageBase").unwrap().size, 4);
    assert_eq!(optional.data_directories().unwrap().len(), 16);

    let import = optional
        .data_directory(DirectoryKind::Import)
        .unwrap()
        .unwrap();
    assert_eq!((import.rva, import.size), (0x2000, 0x28));

    let names: Vec<String> = image.sections().iter().map(|s| s.name()).collect();
    assert_eq!(names, [".text", ".idata", ".reloc"]);
    assert_eq!(image.section_table_offset(), SECTION_TABLE);
}

#[test]
fn pe32_plus_headers() {
    let image = Image::from_mem(common::pe32_plus()).unwrap();
    let optional = image.optional();

    assert_eq!(image.coff().machine(), Some(Machine::Amd64));
    assert_eq!(optional.state(), OptionalState::Width64);
    assert_eq!(optional.image_base().unwrap(), 0x1_4000_0000);
    assert_eq!(optional.header().schema().field("ImageBase").unwrap().size, 8);
    assert!(optional.header().get("BaseOfData").is_none());
}

#[test]
fn section_contents() {
    let image = Image::from_mem(common::pe32()).unwrap();

    let kinds: Vec<SectionKind> = image
        .sections()
        .iter()
        .map(|section| section.content().unwrap().kind())
        .collect();
    assert_eq!(
        kinds,
        [SectionKind::Code, SectionKind::Import, SectionKind::Relocation]
    );
}

#[test]
fn imports_resolve() {
    for data in [common::pe32(), common::pe32_plus()] {
        let image = Image::from_mem(data).unwrap();
        let imports = image.imports().unwrap();
        assert_eq!(imports.offset(), IDATA_OFFSET);

        let module = imports.module("kernel32.dll").unwrap();
        let functions = module
            .functions(image.data(), &image.address_map().unwrap())
            .unwrap();
        assert_eq!(
            functions,
            [
                ImportName::Named(HintName {
                    hint: 0x120,
                    name: "ExitProcess".to_string(),
                }),
                ImportName::Ordinal(7),
            ]
        );
        assert_eq!(functions[0].to_string(), "ExitProcess");
        assert_eq!(functions[1].to_string(), "#7");
    }
}

#[test]
fn relocations_resolve() {
    let image = Image::from_mem(common::pe32()).unwrap();
    let table = image.relocations().unwrap();

    assert_eq!(table.offset(), RELOC_OFFSET);
    assert_eq!(table.blocks().len(), 1);
    assert_eq!(table.entry_count(), 2);

    let targets = table.blocks()[0].targets().unwrap();
    assert_eq!(targets.len(), 1);
    assert_eq!(targets[0].0, 0x1001);
    assert_eq!(targets[0].1.kind(), Some(BaseRelocationType::HighLow));
}

#[test]
fn relocation_size_mismatch() {
    let mut data = common::pe32();
    // BaseRelocationTableSize
    let at = 0x84 + 20 + 96 + 5 * 8 + 4;
    data[at..at + 4].copy_from_slice(&0x0Bu32.to_le_bytes());

    assert!(matches!(Image::from_mem(data), Err(Error::Format { .. })));
}

#[test]
fn missing_import_sentinel() {
    let mut data = common::pe32();
    // Fill the terminating directory entry and everything up to the end of the raw data.
    for byte in &mut data[IDATA_OFFSET + 20..IDATA_OFFSET + 0x200] {
        if *byte == 0 {
            *byte = 0x41;
        }
    }

    assert!(Image::from_mem(data).is_err());
}

#[test]
fn validation_accepts_clean_nesting() {
    let image = Image::from_mem(common::pe32()).unwrap();
    let report = image.validate().unwrap();

    let idata = report
        .covered_by("Raw data (.idata)")
        .map(|segment| segment.end - segment.start)
        .sum::<u64>();
    assert_eq!(idata, 0x200);
    assert!(report.covered_by("Import Table (by DD)").next().is_some());
    assert!(report.covered_by("Hint/Name Table").next().is_some());
    assert!(report.gaps().next().is_some());
}

#[test]
fn validation_rejects_overlapping_sections() {
    let mut data = common::pe32();
    // Move .reloc's raw data so it straddles the end of .idata.
    let entry = SECTION_TABLE + 2 * 40;
    data[entry + 20..entry + 24].copy_from_slice(&0x700u32.to_le_bytes());
    let block = data[RELOC_OFFSET..RELOC_OFFSET + 0x0C].to_vec();
    data[0x700..0x70C].copy_from_slice(&block);

    let image = Image::from_mem(data).unwrap();
    assert!(matches!(
        image.validate(),
        Err(Error::RegionConflict { .. })
    ));
}

#[test]
fn validation_reports_unmapped_directory() {
    let mut data = common::pe32();
    // Point the debug directory outside every section.
    let at = 0x84 + 20 + 96 + DirectoryKind::Debug as usize * 8;
    data[at..at + 4].copy_from_slice(&0x9000u32.to_le_bytes());
    data[at + 4..at + 8].copy_from_slice(&0x1Cu32.to_le_bytes());

    let image = Image::from_mem(data).unwrap();
    match image.validate() {
        Err(Error::Address(AddressError::Unmapped { value, space })) => {
            assert_eq!(value, 0x9000);
            assert_eq!(space, AddressSpace::Rva);
        }
        other => panic!("expected an unmapped address, got {other:?}"),
    }
}

#[test]
fn translation() {
    let image = Image::from_mem(common::pe32()).unwrap();

    assert_eq!(image.rva_to_offset(0x2070).unwrap(), 0x670);
    assert_eq!(image.offset_to_rva(0x670).unwrap(), 0x2070);
    assert_eq!(image.string_at_rva(0x2070).unwrap(), "KERNEL32.dll");
    // Past the loaded size of .reloc
    assert!(matches!(
        image.offset_to_rva(0x900),
        Err(Error::Address(AddressError::Unmapped { .. }))
    ));
    assert!(image.rva_to_offset(0x5000).is_err());
}

#[test]
fn shared_registry() {
    let registry = Arc::new(SchemaRegistry::new());
    let buffers = vec![
        common::pe32(),
        common::pe32_plus(),
        image(Options {
            relocations: false,
            ..Options::default()
        }),
        Vec::new(),
    ];

    let results = Image::parse_all(buffers, Arc::clone(&registry));
    assert!(results[..3].iter().all(Result::is_ok));
    assert!(matches!(results[3], Err(Error::Empty)));

    assert!(registry.is_cached(RecordKind::SectionHeader));
    assert!(registry.is_cached(RecordKind::ImportDirectoryEntry));
    assert!(registry.is_cached(RecordKind::BaseRelocationBlock));
    assert_eq!(registry.builds(), registry.len());
}

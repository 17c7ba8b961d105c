//! Section table entries and COFF relocations.

use bitflags::bitflags;

use crate::{
    layout::{Region, SectionSpan},
    schema::{Header, RecordKind, Row, SchemaRegistry},
    Result,
};

/// Field table of the 40-byte section header.
pub const SECTION_HEADER_ROWS: &[Row] = &[
    Row::string(0, 8, "Name", "An 8-byte, null-padded UTF-8 encoded string."),
    Row::uint(8, 4, "VirtualSize", "The total size of the section when loaded into memory."),
    Row::uint(12, 4, "VirtualAddress", "The address of the first byte of the section relative to the image base when loaded."),
    Row::uint(16, 4, "SizeOfRawData", "The size of the initialized data on disk, a multiple of FileAlignment."),
    Row::uint(20, 4, "PointerToRawData", "The file pointer to the first page of the section within the COFF file."),
    Row::uint(24, 4, "PointerToRelocations", "The file pointer to the beginning of relocation entries for the section."),
    Row::uint(28, 4, "PointerToLinenumbers", "The file pointer to the beginning of line-number entries for the section."),
    Row::uint(32, 2, "NumberOfRelocations", "The number of relocation entries for the section."),
    Row::uint(34, 2, "NumberOfLinenumbers", "The number of line-number entries for the section."),
    Row::uint(36, 4, "Characteristics", "The flags that describe the characteristics of the section."),
];

/// Field table of the 10-byte COFF relocation entry.
pub const RELOCATION_ENTRY_ROWS: &[Row] = &[
    Row::uint(0, 4, "VirtualAddress", "The address of the item to which relocation is applied."),
    Row::uint(4, 4, "SymbolTableIndex", "A zero-based index into the symbol table."),
    Row::uint(8, 2, "Type", "A value that indicates the kind of relocation that should be performed."),
];

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    /// Flags of the section header `Characteristics` field
    pub struct SectionCharacteristics : u32 {
        /// The section should not be padded to the next boundary
        const TYPE_NO_PAD = 0x0000_0008;
        /// The section contains executable code
        const CNT_CODE = 0x0000_0020;
        /// The section contains initialized data
        const CNT_INITIALIZED_DATA = 0x0000_0040;
        /// The section contains uninitialized data
        const CNT_UNINITIALIZED_DATA = 0x0000_0080;
        /// Reserved
        const LNK_OTHER = 0x0000_0100;
        /// The section contains comments or other information
        const LNK_INFO = 0x0000_0200;
        /// The section will not become part of the image
        const LNK_REMOVE = 0x0000_0800;
        /// The section contains COMDAT data
        const LNK_COMDAT = 0x0000_1000;
        /// The section contains data referenced through the global pointer
        const GPREL = 0x0000_8000;
        /// Mask of the object file alignment bits
        const ALIGN_MASK = 0x00F0_0000;
        /// The section contains extended relocations
        const LNK_NRELOC_OVFL = 0x0100_0000;
        /// The section can be discarded as needed
        const MEM_DISCARDABLE = 0x0200_0000;
        /// The section cannot be cached
        const MEM_NOT_CACHED = 0x0400_0000;
        /// The section is not pageable
        const MEM_NOT_PAGED = 0x0800_0000;
        /// The section can be shared in memory
        const MEM_SHARED = 0x1000_0000;
        /// The section can be executed as code
        const MEM_EXECUTE = 0x2000_0000;
        /// The section can be read
        const MEM_READ = 0x4000_0000;
        /// The section can be written to
        const MEM_WRITE = 0x8000_0000;
    }
}

impl SectionCharacteristics {
    /// Object file alignment encoded in the `ALIGN_*` bits, if any.
    #[must_use]
    pub fn alignment(self) -> Option<u32> {
        match (self.bits() & Self::ALIGN_MASK.bits()) >> 20 {
            0 => None,
            n => Some(1 << (n - 1)),
        }
    }
}

/// One entry of the section table.
#[derive(Debug, Clone)]
pub struct SectionHeader {
    header: Header,
}

impl SectionHeader {
    /// Decodes the section header at `offset`, sharing the cached schema.
    ///
    /// # Errors
    /// Returns [`crate::Error::Format`] if the input is too short.
    pub fn parse(data: &[u8], offset: usize, registry: &SchemaRegistry) -> Result<SectionHeader> {
        Ok(SectionHeader {
            header: registry.decode(data, offset, RecordKind::SectionHeader)?,
        })
    }

    /// Decodes `count` consecutive section headers.
    ///
    /// # Errors
    /// Returns [`crate::Error::Format`] if the table does not fit into `data`.
    pub fn parse_table(
        data: &[u8],
        offset: usize,
        count: usize,
        registry: &SchemaRegistry,
    ) -> Result<Vec<SectionHeader>> {
        Ok(registry
            .decode_array(data, offset, count, RecordKind::SectionHeader)?
            .into_iter()
            .map(|header| SectionHeader { header })
            .collect())
    }

    /// The decoded fields.
    #[must_use]
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Mutable access to the decoded fields.
    pub fn header_mut(&mut self) -> &mut Header {
        &mut self.header
    }

    /// Section name with NUL padding removed.
    #[must_use]
    pub fn name(&self) -> String {
        self.header
            .text("Name")
            .map(|name| name.into_owned())
            .unwrap_or_default()
    }

    /// Size of the section when loaded.
    ///
    /// # Errors
    /// Only fails if the field table is broken.
    pub fn virtual_size(&self) -> Result<u32> {
        self.header.u32("VirtualSize")
    }

    /// RVA of the section when loaded.
    ///
    /// # Errors
    /// Only fails if the field table is broken.
    pub fn virtual_address(&self) -> Result<u32> {
        self.header.u32("VirtualAddress")
    }

    /// Size of the raw data in the file.
    ///
    /// # Errors
    /// Only fails if the field table is broken.
    pub fn size_of_raw_data(&self) -> Result<u32> {
        self.header.u32("SizeOfRawData")
    }

    /// File offset of the raw data, zero if there is none.
    ///
    /// # Errors
    /// Only fails if the field table is broken.
    pub fn pointer_to_raw_data(&self) -> Result<u32> {
        self.header.u32("PointerToRawData")
    }

    /// File offset of the COFF relocations.
    ///
    /// # Errors
    /// Only fails if the field table is broken.
    pub fn pointer_to_relocations(&self) -> Result<u32> {
        self.header.u32("PointerToRelocations")
    }

    /// Number of COFF relocations.
    ///
    /// # Errors
    /// Only fails if the field table is broken.
    pub fn number_of_relocations(&self) -> Result<u16> {
        self.header.u16("NumberOfRelocations")
    }

    /// Section flags; unknown bits are retained.
    ///
    /// # Errors
    /// Only fails if the field table is broken.
    pub fn characteristics(&self) -> Result<SectionCharacteristics> {
        Ok(SectionCharacteristics::from_bits_retain(
            self.header.u32("Characteristics")?,
        ))
    }

    /// Sets `VirtualSize`.
    ///
    /// # Errors
    /// Only fails if the field table is broken.
    pub fn set_virtual_size(&mut self, value: u32) -> Result<()> {
        self.header.set_uint("VirtualSize", u64::from(value))
    }

    /// Sets `VirtualAddress`.
    ///
    /// # Errors
    /// Only fails if the field table is broken.
    pub fn set_virtual_address(&mut self, value: u32) -> Result<()> {
        self.header.set_uint("VirtualAddress", u64::from(value))
    }

    /// Sets `SizeOfRawData`.
    ///
    /// # Errors
    /// Only fails if the field table is broken.
    pub fn set_size_of_raw_data(&mut self, value: u32) -> Result<()> {
        self.header.set_uint("SizeOfRawData", u64::from(value))
    }

    /// Sets `PointerToRawData`.
    ///
    /// # Errors
    /// Only fails if the field table is broken.
    pub fn set_pointer_to_raw_data(&mut self, value: u32) -> Result<()> {
        self.header.set_uint("PointerToRawData", u64::from(value))
    }

    /// Returns `true` if the section has raw data in the file.
    ///
    /// # Errors
    /// Only fails if the field table is broken.
    pub fn has_raw_data(&self) -> Result<bool> {
        Ok(self.pointer_to_raw_data()? != 0)
    }

    /// Placement of the section in both address spaces.
    ///
    /// # Errors
    /// Only fails if the field table is broken.
    pub fn span(&self) -> Result<SectionSpan> {
        Ok(SectionSpan::new(
            self.pointer_to_raw_data()?,
            self.size_of_raw_data()?,
            self.virtual_address()?,
            self.virtual_size()?,
        ))
    }

    /// Decodes the COFF relocations of this section.
    ///
    /// # Errors
    /// Returns [`crate::Error::Format`] if the relocation array does not fit into `data`.
    pub fn relocations(
        &self,
        data: &[u8],
        registry: &SchemaRegistry,
    ) -> Result<Vec<CoffRelocation>> {
        let pointer = self.pointer_to_relocations()?;
        let count = self.number_of_relocations()?;
        if pointer == 0 || count == 0 {
            return Ok(Vec::new());
        }

        Ok(registry
            .decode_array(data, pointer as usize, count as usize, RecordKind::RelocationEntry)?
            .into_iter()
            .map(|header| CoffRelocation { header })
            .collect())
    }

    /// Regions declared by this entry: the header itself, its raw data and its COFF
    /// relocations.
    ///
    /// # Errors
    /// Only fails if the field table is broken.
    pub fn regions(&self) -> Result<Vec<Region>> {
        let name = self.name();
        let mut regions = vec![Region::file(
            self.header.start() as u64,
            self.header.size() as u64,
            format!("Section Header ({name})"),
        )];

        if self.has_raw_data()? {
            regions.push(Region::file(
                self.pointer_to_raw_data()?,
                self.size_of_raw_data()?,
                format!("Raw data ({name})"),
            ));
        }

        let relocations = self.pointer_to_relocations()?;
        let count = self.number_of_relocations()?;
        if relocations != 0 && count != 0 {
            regions.push(Region::file(
                relocations,
                u64::from(count) * 10,
                format!("COFF Relocations ({name})"),
            ));
        }

        Ok(regions)
    }
}

/// One COFF relocation entry of an object file section.
#[derive(Debug, Clone)]
pub struct CoffRelocation {
    header: Header,
}

impl CoffRelocation {
    /// The decoded fields.
    #[must_use]
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Address of the relocated item, relative to the section start.
    ///
    /// # Errors
    /// Only fails if the field table is broken.
    pub fn virtual_address(&self) -> Result<u32> {
        self.header.u32("VirtualAddress")
    }

    /// Index into the symbol table.
    ///
    /// # Errors
    /// Only fails if the field table is broken.
    pub fn symbol_table_index(&self) -> Result<u32> {
        self.header.u32("SymbolTableIndex")
    }

    /// Machine-specific relocation type.
    ///
    /// # Errors
    /// Only fails if the field table is broken.
    pub fn kind(&self) -> Result<u16> {
        self.header.u16("Type")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &[u8], fp: u32, fsize: u32, relocations: (u32, u16)) -> Vec<u8> {
        let mut data = vec![0u8; 40];
        data[..name.len()].copy_from_slice(name);
        data[8..12].copy_from_slice(&0x180_u32.to_le_bytes());
        data[12..16].copy_from_slice(&0x1000_u32.to_le_bytes());
        data[16..20].copy_from_slice(&fsize.to_le_bytes());
        data[20..24].copy_from_slice(&fp.to_le_bytes());
        data[24..28].copy_from_slice(&relocations.0.to_le_bytes());
        data[32..34].copy_from_slice(&relocations.1.to_le_bytes());
        data[36..40].copy_from_slice(&0x6050_0020_u32.to_le_bytes());
        data
    }

    #[test]
    fn decode_section_header() {
        let registry = SchemaRegistry::new();
        let data = entry(b".text", 0x400, 0x200, (0, 0));
        let section = SectionHeader::parse(&data, 0, &registry).unwrap();

        assert_eq!(section.name(), ".text");
        assert_eq!(section.virtual_size().unwrap(), 0x180);
        assert_eq!(section.span().unwrap(), SectionSpan::new(0x400, 0x200, 0x1000, 0x180));

        let flags = section.characteristics().unwrap();
        assert!(flags.contains(SectionCharacteristics::CNT_CODE | SectionCharacteristics::MEM_EXECUTE));
        assert_eq!(flags.alignment(), Some(16));
        assert_eq!(section.header().encode().unwrap(), data);
    }

    #[test]
    fn full_width_name() {
        let registry = SchemaRegistry::new();
        let data = entry(b".textbss", 0, 0, (0, 0));
        let section = SectionHeader::parse(&data, 0, &registry).unwrap();
        assert_eq!(section.name(), ".textbss");
        assert!(!section.has_raw_data().unwrap());
        assert_eq!(section.regions().unwrap().len(), 1);
    }

    #[test]
    fn coff_relocations() {
        let registry = SchemaRegistry::new();
        let mut data = entry(b".text", 0x40, 0x10, (0x50, 2));
        data.resize(0x50, 0xCC);
        for (address, symbol, kind) in [(0x4_u32, 7_u32, 0x14_u16), (0xA, 9, 0x06)] {
            data.extend_from_slice(&address.to_le_bytes());
            data.extend_from_slice(&symbol.to_le_bytes());
            data.extend_from_slice(&kind.to_le_bytes());
        }

        let section = SectionHeader::parse(&data, 0, &registry).unwrap();
        let relocations = section.relocations(&data, &registry).unwrap();
        assert_eq!(relocations.len(), 2);
        assert_eq!(relocations[1].virtual_address().unwrap(), 0xA);
        assert_eq!(relocations[1].symbol_table_index().unwrap(), 9);
        assert_eq!(relocations[0].kind().unwrap(), 0x14);

        let regions = section.regions().unwrap();
        assert_eq!(regions[2].label, "COFF Relocations (.text)");
        assert_eq!(regions[2].length, 20);
    }

    #[test]
    fn table_of_headers() {
        let registry = SchemaRegistry::new();
        let mut data = entry(b".text", 0x400, 0x200, (0, 0));
        data.extend(entry(b".data", 0x600, 0x200, (0, 0)));

        let table = SectionHeader::parse_table(&data, 0, 2, &registry).unwrap();
        assert_eq!(table[1].name(), ".data");
        assert_eq!(table[1].header().start(), 40);
        assert_eq!(registry.builds(), 1);
    }
}

//! The COFF file header.

use bitflags::bitflags;
use strum::FromRepr;

use crate::{
    layout::Region,
    schema::{Header, Layout, Row},
    Result,
};

/// Size of one COFF symbol table record.
pub const SYMBOL_SIZE: u64 = 18;

/// Field table of the 20-byte COFF file header.
pub const COFF_HEADER_ROWS: &[Row] = &[
    Row::uint(0, 2, "Machine", "The number that identifies the type of target machine."),
    Row::uint(2, 2, "NumberOfSections", "The number of sections. This indicates the size of the section table, which immediately follows the headers."),
    Row::uint(4, 4, "TimeDateStamp", "The low 32 bits of the number of seconds since 00:00 January 1, 1970, that indicates when the file was created."),
    Row::uint(8, 4, "PointerToSymbolTable", "The file offset of the COFF symbol table, or zero if no COFF symbol table is present."),
    Row::uint(12, 4, "NumberOfSymbols", "The number of entries in the symbol table."),
    Row::uint(16, 2, "SizeOfOptionalHeader", "The size of the optional header, which is required for executable files but not for object files."),
    Row::uint(18, 2, "Characteristics", "The flags that indicate the attributes of the file."),
];

/// Target machines seen in practice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr, strum::Display)]
#[repr(u16)]
pub enum Machine {
    /// Any machine
    Unknown = 0x0000,
    /// Intel 386 and compatible
    I386 = 0x014C,
    /// ARM little endian
    Arm = 0x01C0,
    /// ARM Thumb-2 little endian
    ArmNt = 0x01C4,
    /// Intel Itanium
    Ia64 = 0x0200,
    /// x64
    Amd64 = 0x8664,
    /// ARM64 little endian
    Arm64 = 0xAA64,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    /// Attributes of the image in the COFF `Characteristics` field
    pub struct FileCharacteristics : u16 {
        /// The file contains no base relocations and must load at its preferred base
        const RELOCS_STRIPPED = 0x0001;
        /// The image is valid and can be run
        const EXECUTABLE_IMAGE = 0x0002;
        /// COFF line numbers have been removed
        const LINE_NUMS_STRIPPED = 0x0004;
        /// COFF local symbols have been removed
        const LOCAL_SYMS_STRIPPED = 0x0008;
        /// Aggressively trim working set
        const AGGRESSIVE_WS_TRIM = 0x0010;
        /// The application can handle addresses above 2 GB
        const LARGE_ADDRESS_AWARE = 0x0020;
        /// Little endian byte order
        const BYTES_REVERSED_LO = 0x0080;
        /// The machine is based on a 32-bit-word architecture
        const MACHINE_32BIT = 0x0100;
        /// Debugging information is removed from the image file
        const DEBUG_STRIPPED = 0x0200;
        /// Copy the image to swap when run from removable media
        const REMOVABLE_RUN_FROM_SWAP = 0x0400;
        /// Copy the image to swap when run from the network
        const NET_RUN_FROM_SWAP = 0x0800;
        /// The image is a system file
        const SYSTEM = 0x1000;
        /// The image is a DLL
        const DLL = 0x2000;
        /// Run only on a uniprocessor machine
        const UP_SYSTEM_ONLY = 0x4000;
        /// Big endian byte order
        const BYTES_REVERSED_HI = 0x8000;
    }
}

/// The COFF file header.
#[derive(Debug, Clone)]
pub struct CoffHeader {
    header: Header,
}

impl CoffHeader {
    /// Decodes the header at `offset`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Format`] if the input is too short.
    pub fn parse(data: &[u8], offset: usize) -> Result<CoffHeader> {
        let header = crate::schema::decode(data, offset, COFF_HEADER_ROWS, Layout::Narrow)?;
        Ok(CoffHeader { header })
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

    /// Raw `Machine` value.
    ///
    /// # Errors
    /// Only fails if the field table is broken.
    pub fn machine_raw(&self) -> Result<u16> {
        self.header.u16("Machine")
    }

    /// Target machine, if it is one of the known values.
    #[must_use]
    pub fn machine(&self) -> Option<Machine> {
        self.machine_raw().ok().and_then(Machine::from_repr)
    }

    /// Number of entries in the section table.
    ///
    /// # Errors
    /// Only fails if the field table is broken.
    pub fn number_of_sections(&self) -> Result<u16> {
        self.header.u16("NumberOfSections")
    }

    /// Creation timestamp.
    ///
    /// # Errors
    /// Only fails if the field table is broken.
    pub fn time_date_stamp(&self) -> Result<u32> {
        self.header.u32("TimeDateStamp")
    }

    /// File offset of the COFF symbol table, zero if absent.
    ///
    /// # Errors
    /// Only fails if the field table is broken.
    pub fn pointer_to_symbol_table(&self) -> Result<u32> {
        self.header.u32("PointerToSymbolTable")
    }

    /// Number of symbol table records.
    ///
    /// # Errors
    /// Only fails if the field table is broken.
    pub fn number_of_symbols(&self) -> Result<u32> {
        self.header.u32("NumberOfSymbols")
    }

    /// Declared size of the optional header.
    ///
    /// # Errors
    /// Only fails if the field table is broken.
    pub fn size_of_optional_header(&self) -> Result<u16> {
        self.header.u16("SizeOfOptionalHeader")
    }

    /// Image attributes; unknown bits are retained.
    ///
    /// # Errors
    /// Only fails if the field table is broken.
    pub fn characteristics(&self) -> Result<FileCharacteristics> {
        Ok(FileCharacteristics::from_bits_retain(
            self.header.u16("Characteristics")?,
        ))
    }

    /// File offset of the optional header.
    #[must_use]
    pub fn optional_header_offset(&self) -> usize {
        self.header.end()
    }

    /// Regions declared by the COFF header: itself, the optional header extent it
    /// announces, and the symbol table if present.
    ///
    /// # Errors
    /// Only fails if the field table is broken.
    pub fn regions(&self) -> Result<Vec<Region>> {
        let mut regions = vec![
            Region::file(self.header.start() as u64, self.header.size() as u64, "COFF File Header"),
            Region::file(
                self.optional_header_offset() as u64,
                self.size_of_optional_header()?,
                "Optional Header (by COFF)",
            ),
        ];

        let symbols = self.pointer_to_symbol_table()?;
        let count = self.number_of_symbols()?;
        if symbols != 0 && count != 0 {
            regions.push(Region::file(
                symbols,
                u64::from(count) * SYMBOL_SIZE,
                "COFF Symbol Table",
            ));
        }

        Ok(regions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&0x8664_u16.to_le_bytes());
        data.extend_from_slice(&3_u16.to_le_bytes());
        data.extend_from_slice(&0x5F00_0000_u32.to_le_bytes());
        data.extend_from_slice(&0x1000_u32.to_le_bytes());
        data.extend_from_slice(&2_u32.to_le_bytes());
        data.extend_from_slice(&0xF0_u16.to_le_bytes());
        data.extend_from_slice(&0x2022_u16.to_le_bytes());
        data
    }

    #[test]
    fn parse_fields() {
        let coff = CoffHeader::parse(&sample(), 0).unwrap();
        assert_eq!(coff.header().size(), 20);
        assert_eq!(coff.machine(), Some(Machine::Amd64));
        assert_eq!(coff.number_of_sections().unwrap(), 3);
        assert_eq!(coff.size_of_optional_header().unwrap(), 0xF0);
        assert_eq!(coff.optional_header_offset(), 20);

        let flags = coff.characteristics().unwrap();
        assert!(flags.contains(FileCharacteristics::DLL));
        assert!(flags.contains(FileCharacteristics::EXECUTABLE_IMAGE));
        assert!(flags.contains(FileCharacteristics::LARGE_ADDRESS_AWARE));
    }

    #[test]
    fn regions_include_symbol_table() {
        let coff = CoffHeader::parse(&sample(), 0).unwrap();
        let regions = coff.regions().unwrap();
        assert_eq!(regions.len(), 3);
        assert_eq!(regions[1].length, 0xF0);
        assert_eq!(regions[2].start, 0x1000);
        assert_eq!(regions[2].length, 36);
    }

    #[test]
    fn encode_is_exact() {
        let data = sample();
        let coff = CoffHeader::parse(&data, 0).unwrap();
        assert_eq!(coff.header().encode().unwrap(), data);
    }
}

//! The optional header and its data directories.
//!
//! The optional header is decoded by accretion: the standard fields first, then the
//! `Magic` value selects the PE32 or PE32+ layout for the rest, and finally the
//! `NumberOfRvaAndSizes` field determines how many data directory rows are synthesized.

use strum::{EnumCount, EnumIter, FromRepr, IntoEnumIterator};

use crate::{
    layout::Region,
    schema::{Alt, Header, Layout, Row},
    Result,
};

/// `Magic` of a PE32 image.
pub const PE32_MAGIC: u16 = 0x10B;
/// `Magic` of a PE32+ image.
pub const PE32_PLUS_MAGIC: u16 = 0x20B;

const STANDARD_ROWS: &[Row] = &[
    Row::uint(0, 2, "Magic", "The unsigned integer that identifies the state of the image file."),
    Row::uint(2, 1, "MajorLinkerVersion", "The linker major version number."),
    Row::uint(3, 1, "MinorLinkerVersion", "The linker minor version number."),
    Row::uint(4, 4, "SizeOfCode", "The size of the code section, or the sum of all code sections."),
    Row::uint(8, 4, "SizeOfInitializedData", "The size of the initialized data section, or the sum of all such sections."),
    Row::uint(12, 4, "SizeOfUninitializedData", "The size of the uninitialized data section (BSS), or the sum of all such sections."),
    Row::uint(16, 4, "AddressOfEntryPoint", "The address of the entry point relative to the image base."),
    Row::uint(20, 4, "BaseOfCode", "The address relative to the image base of the beginning-of-code section."),
];

const BASE_OF_DATA_ROWS: &[Row] = &[Row::uint(
    24,
    4,
    "BaseOfData",
    "The address relative to the image base of the beginning-of-data section. Absent in PE32+.",
)];

const WINDOWS_ROWS: &[Row] = &[
    Row::variant(Alt::pair(28, 24), Alt::pair(4, 8), "ImageBase", "The preferred address of the first byte of image when loaded into memory."),
    Row::uint(32, 4, "SectionAlignment", "The alignment of sections when they are loaded into memory."),
    Row::uint(36, 4, "FileAlignment", "The alignment factor used to align the raw data of sections in the image file."),
    Row::uint(40, 2, "MajorOperatingSystemVersion", "The major version number of the required operating system."),
    Row::uint(42, 2, "MinorOperatingSystemVersion", "The minor version number of the required operating system."),
    Row::uint(44, 2, "MajorImageVersion", "The major version number of the image."),
    Row::uint(46, 2, "MinorImageVersion", "The minor version number of the image."),
    Row::uint(48, 2, "MajorSubsystemVersion", "The major version number of the subsystem."),
    Row::uint(50, 2, "MinorSubsystemVersion", "The minor version number of the subsystem."),
    Row::uint(52, 4, "Win32VersionValue", "Reserved, must be zero."),
    Row::uint(56, 4, "SizeOfImage", "The size of the image as loaded in memory, a multiple of SectionAlignment."),
    Row::uint(60, 4, "SizeOfHeaders", "The combined size of the MS-DOS stub, PE header and section headers rounded up to FileAlignment."),
    Row::uint(64, 4, "CheckSum", "The image file checksum."),
    Row::uint(68, 2, "Subsystem", "The subsystem that is required to run this image."),
    Row::uint(70, 2, "DllCharacteristics", "DLL characteristics flags."),
    Row::variant(Alt::pair(72, 72), Alt::pair(4, 8), "SizeOfStackReserve", "The size of the stack to reserve."),
    Row::variant(Alt::pair(76, 80), Alt::pair(4, 8), "SizeOfStackCommit", "The size of the stack to commit."),
    Row::variant(Alt::pair(80, 88), Alt::pair(4, 8), "SizeOfHeapReserve", "The size of the local heap space to reserve."),
    Row::variant(Alt::pair(84, 96), Alt::pair(4, 8), "SizeOfHeapCommit", "The size of the local heap space to commit."),
    Row::variant(Alt::pair(88, 104), Alt::same(4), "LoaderFlags", "Reserved, must be zero."),
    Row::variant(Alt::pair(92, 108), Alt::same(4), "NumberOfRvaAndSizes", "The number of data-directory entries in the remainder of the optional header."),
];

/// Offset of the first data directory for each layout.
const DIRECTORY_BASE: Alt = Alt::pair(96, 112);

/// Decoding progress of an optional header.
///
/// Decoding starts in [`OptionalState::AwaitingMagic`]; the `Magic` field moves it to
/// one of the width states exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum OptionalState {
    /// Only the standard fields are known
    AwaitingMagic,
    /// PE32, 32-bit addresses
    #[strum(to_string = "PE32")]
    Width32,
    /// PE32+, 64-bit addresses
    #[strum(to_string = "PE32+")]
    Width64,
}

impl OptionalState {
    /// Applies the `Magic` transition.
    ///
    /// # Errors
    /// Returns [`crate::Error::Format`] for an unknown magic, and if the width has already
    /// been decided.
    pub fn on_magic(self, magic: u16) -> Result<OptionalState> {
        match (self, magic) {
            (OptionalState::AwaitingMagic, PE32_MAGIC) => Ok(OptionalState::Width32),
            (OptionalState::AwaitingMagic, PE32_PLUS_MAGIC) => Ok(OptionalState::Width64),
            (OptionalState::AwaitingMagic, other) => {
                Err(format_error!("not a PE image: optional header magic {:#x}", other))
            }
            (decided, _) => Err(format_error!(
                "optional header width is already decided as {}",
                decided
            )),
        }
    }

    /// Layout column for the width-dependent rows, once decided.
    #[must_use]
    pub fn layout(self) -> Option<Layout> {
        match self {
            OptionalState::AwaitingMagic => None,
            OptionalState::Width32 => Some(Layout::Narrow),
            OptionalState::Width64 => Some(Layout::Wide),
        }
    }
}

/// The sixteen data directory slots, in table order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, EnumCount, FromRepr)]
#[repr(usize)]
pub enum DirectoryKind {
    /// Export table
    Export = 0,
    /// Import table
    Import,
    /// Resource table
    Resource,
    /// Exception table
    Exception,
    /// Attribute certificate table; its address is a file offset
    Certificate,
    /// Base relocation table
    BaseRelocation,
    /// Debug data
    Debug,
    /// Reserved, must be zero
    Architecture,
    /// Global pointer register value
    GlobalPtr,
    /// Thread local storage table
    Tls,
    /// Load configuration table
    LoadConfig,
    /// Bound import table
    BoundImport,
    /// Import address table
    Iat,
    /// Delay import descriptor
    DelayImport,
    /// CLR runtime header
    ClrRuntime,
    /// Reserved, must be zero
    Reserved,
}

impl DirectoryKind {
    /// Human readable name, as used in region labels.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            DirectoryKind::Export => "Export Table",
            DirectoryKind::Import => "Import Table",
            DirectoryKind::Resource => "Resource Table",
            DirectoryKind::Exception => "Exception Table",
            DirectoryKind::Certificate => "Certificate Table",
            DirectoryKind::BaseRelocation => "Base Relocation Table",
            DirectoryKind::Debug => "Debug",
            DirectoryKind::Architecture => "Architecture",
            DirectoryKind::GlobalPtr => "Global Ptr",
            DirectoryKind::Tls => "TLS Table",
            DirectoryKind::LoadConfig => "Load Config Table",
            DirectoryKind::BoundImport => "Bound Import",
            DirectoryKind::Iat => "IAT",
            DirectoryKind::DelayImport => "Delay Import Descriptor",
            DirectoryKind::ClrRuntime => "CLR Runtime Header",
            DirectoryKind::Reserved => "Reserved",
        }
    }

    /// Prefix of the two field names, e.g. `ImportTable` for `ImportTableRVA`.
    #[must_use]
    pub fn stem(self) -> String {
        self.label().replace(' ', "")
    }

    /// Name of the field holding the directory address.
    #[must_use]
    pub fn rva_field(self) -> String {
        format!("{}RVA", self.stem())
    }

    /// Name of the field holding the directory size.
    #[must_use]
    pub fn size_field(self) -> String {
        format!("{}Size", self.stem())
    }

    /// Returns `true` for the slots that must be zero and never declare a region.
    #[must_use]
    pub fn is_reserved(self) -> bool {
        matches!(self, DirectoryKind::Architecture | DirectoryKind::Reserved)
    }
}

/// Builds the rows of the first `count` data directories.
///
/// # Errors
/// Returns [`crate::Error::Format`] if `count` exceeds the sixteen defined directories.
pub fn directory_rows(count: u32) -> Result<Vec<Row>> {
    let count = count as usize;
    if count > DirectoryKind::COUNT {
        return Err(format_error!(
            "NumberOfRvaAndSizes is {}, at most {} directories are defined",
            count,
            DirectoryKind::COUNT
        ));
    }

    let mut rows = Vec::with_capacity(count * 2);
    for (index, kind) in DirectoryKind::iter().take(count).enumerate() {
        let offset = Alt::pair(
            DIRECTORY_BASE.narrow + index * 8,
            DIRECTORY_BASE.wide + index * 8,
        );
        rows.push(Row::owned(
            offset,
            Alt::same(4),
            kind.rva_field(),
            format!("The {} RVA.", kind.label()),
        ));
        rows.push(Row::owned(
            Alt::pair(offset.narrow + 4, offset.wide + 4),
            Alt::same(4),
            kind.size_field(),
            format!("The {} size.", kind.label()),
        ));
    }
    Ok(rows)
}

/// One data directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataDirectory {
    /// Which slot this is
    pub kind: DirectoryKind,
    /// Address of the table; a file offset for [`DirectoryKind::Certificate`]
    pub rva: u32,
    /// Size of the table in bytes
    pub size: u32,
}

impl DataDirectory {
    /// Returns `true` if the directory points anywhere.
    #[must_use]
    pub fn is_present(&self) -> bool {
        self.rva != 0 && self.size != 0
    }

    /// Returns `true` if the table starts in the memory range `[start, start + len)`.
    #[must_use]
    pub fn starts_within(&self, start: u32, len: u32) -> bool {
        self.is_present()
            && (u64::from(start)..u64::from(start) + u64::from(len)).contains(&u64::from(self.rva))
    }
}

/// The optional header.
#[derive(Debug, Clone)]
pub struct OptionalHeader {
    header: Header,
    state: OptionalState,
}

impl OptionalHeader {
    /// Decodes the optional header at `offset`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Format`] for an unknown magic, more than sixteen data
    /// directories, or a header that does not fit into `data`.
    pub fn parse(data: &[u8], offset: usize) -> Result<OptionalHeader> {
        let mut header = Header::per_instance(offset);
        header.decode_block(data, STANDARD_ROWS, Layout::Narrow)?;

        let state = OptionalState::AwaitingMagic.on_magic(header.u16("Magic")?)?;
        let layout = state.layout().unwrap_or_default();
        log::debug!("Optional header at {offset:#x} is {state}");

        if state == OptionalState::Width32 {
            header.decode_block(data, BASE_OF_DATA_ROWS, layout)?;
        }
        header.decode_block(data, WINDOWS_ROWS, layout)?;

        let rows = directory_rows(header.u32("NumberOfRvaAndSizes")?)?;
        header.decode_block(data, &rows, layout)?;

        Ok(OptionalHeader { header, state })
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

    /// Width state selected by the magic.
    #[must_use]
    pub fn state(&self) -> OptionalState {
        self.state
    }

    /// Returns `true` for PE32+ images.
    #[must_use]
    pub fn is_pe32_plus(&self) -> bool {
        self.state == OptionalState::Width64
    }

    /// Size of an import lookup or address table entry.
    #[must_use]
    pub fn thunk_size(&self) -> usize {
        if self.is_pe32_plus() {
            8
        } else {
            4
        }
    }

    /// RVA of the entry point.
    ///
    /// # Errors
    /// Only fails if the field table is broken.
    pub fn address_of_entry_point(&self) -> Result<u32> {
        self.header.u32("AddressOfEntryPoint")
    }

    /// Preferred load address.
    ///
    /// # Errors
    /// Only fails if the field table is broken.
    pub fn image_base(&self) -> Result<u64> {
        self.header.uint("ImageBase")
    }

    /// Alignment of sections in memory.
    ///
    /// # Errors
    /// Only fails if the field table is broken.
    pub fn section_alignment(&self) -> Result<u32> {
        self.header.u32("SectionAlignment")
    }

    /// Alignment of raw section data in the file.
    ///
    /// # Errors
    /// Only fails if the field table is broken.
    pub fn file_alignment(&self) -> Result<u32> {
        self.header.u32("FileAlignment")
    }

    /// Size of the loaded image.
    ///
    /// # Errors
    /// Only fails if the field table is broken.
    pub fn size_of_image(&self) -> Result<u32> {
        self.header.u32("SizeOfImage")
    }

    /// Size of all headers rounded up to the file alignment.
    ///
    /// # Errors
    /// Only fails if the field table is broken.
    pub fn size_of_headers(&self) -> Result<u32> {
        self.header.u32("SizeOfHeaders")
    }

    /// Number of data directories present.
    ///
    /// # Errors
    /// Only fails if the field table is broken.
    pub fn number_of_rva_and_sizes(&self) -> Result<u32> {
        self.header.u32("NumberOfRvaAndSizes")
    }

    /// Returns one data directory, or `None` if the header does not have that many.
    ///
    /// # Errors
    /// Only fails if the field table is broken.
    pub fn data_directory(&self, kind: DirectoryKind) -> Result<Option<DataDirectory>> {
        if kind as usize >= self.number_of_rva_and_sizes()? as usize {
            return Ok(None);
        }
        Ok(Some(DataDirectory {
            kind,
            rva: self.header.u32(&kind.rva_field())?,
            size: self.header.u32(&kind.size_field())?,
        }))
    }

    /// All data directories the header has, in slot order.
    ///
    /// # Errors
    /// Only fails if the field table is broken.
    pub fn data_directories(&self) -> Result<Vec<DataDirectory>> {
        let mut directories = Vec::new();
        for kind in DirectoryKind::iter() {
            match self.data_directory(kind)? {
                Some(directory) => directories.push(directory),
                None => break,
            }
        }
        Ok(directories)
    }

    /// Regions declared by the optional header: its own extent and every present,
    /// non-reserved data directory.
    ///
    /// Directory tables that start inside the headers (commonly the bound import table) are
    /// given as file offsets, since no section maps them.
    ///
    /// # Errors
    /// Only fails if the field table is broken.
    pub fn regions(&self) -> Result<Vec<Region>> {
        let mut regions = vec![Region::file(
            self.header.start() as u64,
            self.header.size() as u64,
            "Optional Header",
        )];

        let size_of_headers = self.size_of_headers()?;
        for directory in self.data_directories()? {
            if directory.kind.is_reserved() || !directory.is_present() {
                continue;
            }

            let label = format!("{} (by DD)", directory.kind.label());
            if directory.kind == DirectoryKind::Certificate || directory.rva < size_of_headers {
                regions.push(Region::file(directory.rva, directory.size, label));
            } else {
                regions.push(Region::rva(directory.rva, directory.size, label));
            }
        }

        Ok(regions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{layout::AddressSpace, Error};

    fn header_bytes(magic: u16, directories: u32) -> Vec<u8> {
        let wide = magic == PE32_PLUS_MAGIC;
        let core = if wide { 112 } else { 96 };
        let mut data = vec![0u8; core + directories as usize * 8];

        data[0..2].copy_from_slice(&magic.to_le_bytes());
        if wide {
            data[24..32].copy_from_slice(&0x1_4000_0000_u64.to_le_bytes());
        } else {
            data[28..32].copy_from_slice(&0x40_0000_u32.to_le_bytes());
        }
        data[32..36].copy_from_slice(&0x1000_u32.to_le_bytes());
        data[36..40].copy_from_slice(&0x200_u32.to_le_bytes());
        data[60..64].copy_from_slice(&0x400_u32.to_le_bytes());
        let count_at = if wide { 108 } else { 92 };
        data[count_at..count_at + 4].copy_from_slice(&directories.to_le_bytes());
        data
    }

    fn set_directory(data: &mut [u8], wide: bool, kind: DirectoryKind, rva: u32, size: u32) {
        let at = if wide { 112 } else { 96 } + kind as usize * 8;
        data[at..at + 4].copy_from_slice(&rva.to_le_bytes());
        data[at + 4..at + 8].copy_from_slice(&size.to_le_bytes());
    }

    #[test]
    fn pe32_layout() {
        let data = header_bytes(PE32_MAGIC, 16);
        let optional = OptionalHeader::parse(&data, 0).unwrap();

        assert_eq!(optional.state(), OptionalState::Width32);
        assert_eq!(optional.header().size(), 224);
        assert_eq!(optional.header().schema().field("ImageBase").unwrap().size, 4);
        assert!(optional.header().get("BaseOfData").is_some());
        assert_eq!(optional.image_base().unwrap(), 0x40_0000);
        assert_eq!(optional.file_alignment().unwrap(), 0x200);
        assert_eq!(optional.thunk_size(), 4);
        assert_eq!(optional.header().encode().unwrap(), data);
    }

    #[test]
    fn pe32_plus_layout() {
        let data = header_bytes(PE32_PLUS_MAGIC, 16);
        let optional = OptionalHeader::parse(&data, 0).unwrap();

        assert_eq!(optional.state(), OptionalState::Width64);
        assert_eq!(optional.header().size(), 240);
        assert_eq!(optional.header().schema().field("ImageBase").unwrap().size, 8);
        assert!(optional.header().get("BaseOfData").is_none());
        assert_eq!(optional.image_base().unwrap(), 0x1_4000_0000);
        assert_eq!(optional.number_of_rva_and_sizes().unwrap(), 16);
        assert_eq!(optional.thunk_size(), 8);
    }

    #[test]
    fn directory_count_drives_size() {
        let data = header_bytes(PE32_MAGIC, 2);
        let optional = OptionalHeader::parse(&data, 0).unwrap();

        assert_eq!(optional.header().size(), 96 + 16);
        assert!(optional.header().get("ImportTableSize").is_some());
        assert!(optional.header().get("ResourceTableRVA").is_none());
        assert_eq!(optional.data_directories().unwrap().len(), 2);
        assert_eq!(
            optional.data_directory(DirectoryKind::BaseRelocation).unwrap(),
            None
        );
    }

    #[test]
    fn fifteen_directories() {
        let mut data = header_bytes(PE32_MAGIC, 15);
        for kind in DirectoryKind::iter().take(15) {
            let index = kind as u32;
            set_directory(&mut data, false, kind, 0x1000 * (index + 1), index + 1);
        }
        let optional = OptionalHeader::parse(&data, 0).unwrap();

        assert_eq!(optional.header().size(), 96 + 15 * 8);
        let directories = optional.data_directories().unwrap();
        let kinds: Vec<DirectoryKind> = directories.iter().map(|d| d.kind).collect();
        let expected: Vec<DirectoryKind> = DirectoryKind::iter().take(15).collect();
        assert_eq!(kinds, expected);
        assert_eq!(kinds[5], DirectoryKind::BaseRelocation);
        assert_eq!(kinds[14], DirectoryKind::ClrRuntime);
        for (index, directory) in directories.iter().enumerate() {
            assert_eq!(directory.rva, 0x1000 * (index as u32 + 1));
            assert_eq!(directory.size, index as u32 + 1);
        }

        let names: Vec<&str> = optional
            .header()
            .schema()
            .fields()
            .iter()
            .map(|field| field.name.as_str())
            .collect();
        let tail = &names[names.len() - 30..];
        assert_eq!(tail[0], "ExportTableRVA");
        assert_eq!(tail[10], "BaseRelocationTableRVA");
        assert_eq!(tail[29], "CLRRuntimeHeaderSize");
        assert!(optional.header().get("ReservedRVA").is_none());
        assert_eq!(
            optional.data_directory(DirectoryKind::Reserved).unwrap(),
            None
        );
    }

    #[test]
    fn too_many_directories() {
        let data = header_bytes(PE32_MAGIC, 17);
        assert!(matches!(
            OptionalHeader::parse(&data, 0),
            Err(Error::Format { .. })
        ));
    }

    #[test]
    fn unknown_magic() {
        let data = header_bytes(0x107, 0);
        assert!(matches!(
            OptionalHeader::parse(&data, 0),
            Err(Error::Format { .. })
        ));
    }

    #[test]
    fn magic_transition_fires_once() {
        let state = OptionalState::AwaitingMagic.on_magic(PE32_MAGIC).unwrap();
        assert_eq!(state.layout(), Some(Layout::Narrow));
        assert!(state.on_magic(PE32_MAGIC).is_err());
        assert_eq!(OptionalState::AwaitingMagic.layout(), None);
    }

    #[test]
    fn directory_field_names() {
        let rows = directory_rows(16).unwrap();
        let names: Vec<&str> = rows.iter().map(|row| &*row.name).collect();
        assert_eq!(names[0], "ExportTableRVA");
        assert_eq!(names[11], "BaseRelocationTableSize");
        assert_eq!(names[18], "TLSTableRVA");
        assert_eq!(names[24], "IATRVA");
        assert_eq!(names[28], "CLRRuntimeHeaderRVA");
        assert_eq!(rows[2].offset, Alt::pair(104, 120));
    }

    #[test]
    fn directory_regions() {
        let mut data = header_bytes(PE32_MAGIC, 16);
        set_directory(&mut data, false, DirectoryKind::Import, 0x2000, 0x28);
        set_directory(&mut data, false, DirectoryKind::Certificate, 0x800, 0x100);
        set_directory(&mut data, false, DirectoryKind::BoundImport, 0x2A0, 0x40);
        set_directory(&mut data, false, DirectoryKind::Architecture, 0x3000, 0x10);
        set_directory(&mut data, false, DirectoryKind::Resource, 0x4000, 0);

        let optional = OptionalHeader::parse(&data, 0).unwrap();
        let regions = optional.regions().unwrap();
        let labels: Vec<&str> = regions.iter().map(|r| r.label.as_str()).collect();
        assert_eq!(
            labels,
            [
                "Optional Header",
                "Import Table (by DD)",
                "Certificate Table (by DD)",
                "Bound Import (by DD)"
            ]
        );
        assert_eq!(regions[1].space, AddressSpace::Rva);
        assert_eq!(regions[2].space, AddressSpace::FileOffset);
        assert_eq!(regions[3].space, AddressSpace::FileOffset);
    }
}

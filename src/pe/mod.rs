//! PE structural model.
//!
//! An [`Image`] is decoded front to back: the optional MS-DOS stub, the COFF file header, the
//! variant-width optional header and the section table. Afterwards every section with raw
//! data gets a [`crate::rebuild::SectionContent`] that decodes whatever tables it hosts.
//!
//! # Architecture
//!
//! - [`DosStub`] - `MZ` detection and the `e_lfanew` jump to the PE signature
//! - [`CoffHeader`] - the fixed 20-byte file header
//! - [`OptionalHeader`] - magic-driven PE32/PE32+ header with its data directories
//! - [`SectionHeader`] - the type-cached 40-byte section table entry
//!
//! Every header keeps the exact byte range it was decoded from, so the rebuild pipeline can
//! re-encode it in place. Headers and contents all report the [`crate::layout::Region`]s
//! they occupy; [`Image::validate`] sweeps those for inconsistent overlaps.
//!
//! # Examples
//!
//! ```rust,no_run
//! use pescope::Image;
//! use std::path::Path;
//!
//! let image = Image::from_file(Path::new("sample.exe"))?;
//! for section in image.sections() {
//!     println!("{:8} {:#010x}", section.name(), section.header().virtual_address()?);
//! }
//!
//! let report = image.validate()?;
//! println!("{} unclaimed ranges", report.gaps().count());
//! # Ok::<(), pescope::Error>(())
//! ```

mod coff;
mod dos;
mod optional;
mod section;

pub use coff::{CoffHeader, FileCharacteristics, Machine, COFF_HEADER_ROWS, SYMBOL_SIZE};
pub use dos::{DosStub, E_LFANEW_OFFSET, PE_SIGNATURE};
pub use optional::{
    directory_rows, DataDirectory, DirectoryKind, OptionalHeader, OptionalState, PE32_MAGIC,
    PE32_PLUS_MAGIC,
};
pub use section::{
    CoffRelocation, SectionCharacteristics, SectionHeader, RELOCATION_ENTRY_ROWS,
    SECTION_HEADER_ROWS,
};

use std::{fmt, path::Path, sync::Arc};

use rayon::prelude::*;

use crate::{
    file::{io::read_cstr, Backend, Memory, Physical},
    layout::{validate_regions, AddressMap, Region, RegionReport, SectionSpan},
    rebuild::{select_content, ParseContext, SectionContent},
    schema::SchemaRegistry,
    tables::{ImportTable, RelocationTable},
    Error::Empty,
    Result,
};

/// Size of one section table entry.
pub const SECTION_HEADER_SIZE: usize = 40;

/// One entry of the section table together with its decoded content.
#[derive(Debug)]
pub struct Section {
    pub(crate) header: SectionHeader,
    pub(crate) original: SectionSpan,
    pub(crate) content: Option<Box<dyn SectionContent>>,
}

impl Section {
    /// The section header.
    #[must_use]
    pub fn header(&self) -> &SectionHeader {
        &self.header
    }

    /// Section name, null-trimmed.
    #[must_use]
    pub fn name(&self) -> String {
        self.header.name()
    }

    /// Placement of the section as it was decoded.
    #[must_use]
    pub fn original_span(&self) -> SectionSpan {
        self.original
    }

    /// The decoded content, `None` for sections without raw data.
    #[must_use]
    pub fn content(&self) -> Option<&dyn SectionContent> {
        self.content.as_deref()
    }

    /// Mutable access to the decoded content.
    pub fn content_mut(&mut self) -> Option<&mut dyn SectionContent> {
        match &mut self.content {
            Some(content) => Some(content.as_mut()),
            None => None,
        }
    }
}

/// A decoded PE/COFF image.
///
/// The image exclusively owns the buffer it was decoded from and never writes into it;
/// [`Image::rebuild`] serializes into a fresh buffer.
pub struct Image {
    pub(crate) data: Box<dyn Backend>,
    pub(crate) registry: Arc<SchemaRegistry>,
    pub(crate) dos: Option<DosStub>,
    pub(crate) coff: CoffHeader,
    pub(crate) optional: OptionalHeader,
    pub(crate) table_offset: usize,
    pub(crate) sections: Vec<Section>,
}

impl Image {
    /// Loads an image from disk through a read-only memory mapping.
    ///
    /// # Arguments
    ///
    /// * `file` - Path to the image on disk.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::FileError`] if the file cannot be opened, and any decode
    /// error [`Image::from_mem`] can return.
    pub fn from_file(file: &Path) -> Result<Image> {
        let input = Physical::new(file)?;

        Self::load(Box::new(input), Arc::new(SchemaRegistry::new()))
    }

    /// Loads an image from a memory buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The buffer is empty ([`crate::Error::Empty`], a format error as reported by
    ///   [`crate::Error::is_format`])
    /// - A header or table is malformed ([`crate::Error::Format`])
    /// - A table is referenced through an unmapped RVA ([`crate::Error::Address`])
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// use pescope::Image;
    ///
    /// let data = std::fs::read("sample.exe")?;
    /// let image = Image::from_mem(data)?;
    /// println!("{} sections", image.sections().len());
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn from_mem(data: Vec<u8>) -> Result<Image> {
        Self::from_mem_with_registry(data, Arc::new(SchemaRegistry::new()))
    }

    /// Loads an image from a memory buffer, sharing an existing schema registry.
    ///
    /// # Errors
    ///
    /// See [`Image::from_mem`].
    pub fn from_mem_with_registry(data: Vec<u8>, registry: Arc<SchemaRegistry>) -> Result<Image> {
        Self::load(Box::new(Memory::new(data)), registry)
    }

    /// Decodes many buffers in parallel, sharing one schema registry.
    ///
    /// Results are returned in input order.
    #[must_use]
    pub fn parse_all(buffers: Vec<Vec<u8>>, registry: Arc<SchemaRegistry>) -> Vec<Result<Image>> {
        buffers
            .into_par_iter()
            .map(|data| Self::from_mem_with_registry(data, Arc::clone(&registry)))
            .collect()
    }

    fn load(data: Box<dyn Backend>, registry: Arc<SchemaRegistry>) -> Result<Image> {
        if data.is_empty() {
            return Err(Empty);
        }

        let bytes = data.data();
        let dos = DosStub::detect(bytes)?;
        let coff = CoffHeader::parse(bytes, dos.map_or(0, |stub| stub.coff_offset()))?;

        let declared = coff.size_of_optional_header()? as usize;
        if declared == 0 {
            return Err(format_error!(
                "COFF header declares no optional header, which images require"
            ));
        }

        let optional = OptionalHeader::parse(bytes, coff.optional_header_offset())?;
        if optional.header().size() > declared {
            return Err(format_error!(
                "optional header needs {:#x} bytes, SizeOfOptionalHeader is {:#x}",
                optional.header().size(),
                declared
            ));
        }

        let table_offset = coff.optional_header_offset() + declared;
        let count = coff.number_of_sections()? as usize;
        let headers = SectionHeader::parse_table(bytes, table_offset, count, &registry)?;
        log::debug!(
            "{} section headers at {:#x}, optional header is {} ({:#x} bytes)",
            count,
            table_offset,
            optional.state(),
            optional.header().size()
        );

        let map = AddressMap::new(
            headers
                .iter()
                .map(SectionHeader::span)
                .collect::<Result<Vec<_>>>()?,
        );
        let ctx = ParseContext {
            data: bytes,
            optional: &optional,
            map: &map,
            registry: &registry,
        };

        let mut sections = Vec::with_capacity(headers.len());
        for header in headers {
            let content = if header.has_raw_data()? {
                let mut content = select_content(&header, &optional)?;
                content.parse(&ctx)?;
                log::debug!("Section '{}' holds {} content", header.name(), content.kind());
                Some(content)
            } else {
                None
            };

            sections.push(Section {
                original: header.span()?,
                header,
                content,
            });
        }

        Ok(Image {
            data,
            registry,
            dos,
            coff,
            optional,
            table_offset,
            sections,
        })
    }

    /// The source buffer.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        self.data.data()
    }

    /// Size of the source buffer.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the source buffer is empty, which a decoded image never is.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The schema registry shared by this image.
    #[must_use]
    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    /// The MS-DOS stub, `None` for images starting with the COFF header.
    #[must_use]
    pub fn dos(&self) -> Option<&DosStub> {
        self.dos.as_ref()
    }

    /// The COFF file header.
    #[must_use]
    pub fn coff(&self) -> &CoffHeader {
        &self.coff
    }

    /// Mutable access to the COFF file header.
    pub fn coff_mut(&mut self) -> &mut CoffHeader {
        &mut self.coff
    }

    /// The optional header.
    #[must_use]
    pub fn optional(&self) -> &OptionalHeader {
        &self.optional
    }

    /// Mutable access to the optional header.
    pub fn optional_mut(&mut self) -> &mut OptionalHeader {
        &mut self.optional
    }

    /// The sections in table order.
    #[must_use]
    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    /// Looks up a section by its null-trimmed name.
    #[must_use]
    pub fn section_by_name(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|section| section.name() == name)
    }

    /// The content of the named section.
    #[must_use]
    pub fn content(&self, name: &str) -> Option<&dyn SectionContent> {
        self.section_by_name(name).and_then(Section::content)
    }

    /// Mutable access to the content of the named section.
    pub fn content_mut(&mut self, name: &str) -> Option<&mut dyn SectionContent> {
        self.sections
            .iter_mut()
            .find(|section| section.name() == name)
            .and_then(Section::content_mut)
    }

    /// File offset of the section table.
    #[must_use]
    pub fn section_table_offset(&self) -> usize {
        self.table_offset
    }

    /// File offset one past the last section table entry.
    #[must_use]
    pub fn headers_end(&self) -> usize {
        self.table_offset + self.sections.len() * SECTION_HEADER_SIZE
    }

    /// Address translation over the current section table.
    ///
    /// # Errors
    /// Only fails if the section field table is broken.
    pub fn address_map(&self) -> Result<AddressMap> {
        Ok(AddressMap::new(
            self.sections
                .iter()
                .map(|section| section.header.span())
                .collect::<Result<Vec<_>>>()?,
        ))
    }

    /// Translates an RVA into a file offset.
    ///
    /// # Errors
    /// Returns an [`crate::Error::Address`] unless exactly one section maps `rva`.
    pub fn rva_to_offset(&self, rva: u32) -> Result<u32> {
        self.address_map()?.rva_to_offset(rva)
    }

    /// Translates a file offset into an RVA.
    ///
    /// # Errors
    /// Returns an [`crate::Error::Address`] unless exactly one section maps `offset`.
    pub fn offset_to_rva(&self, offset: u32) -> Result<u32> {
        self.address_map()?.offset_to_rva(offset)
    }

    /// Reads the zero-terminated string at `rva`.
    ///
    /// # Errors
    /// Returns an [`crate::Error::Address`] if `rva` is unmapped and
    /// [`crate::Error::Format`] if the string is not terminated.
    pub fn string_at_rva(&self, rva: u32) -> Result<String> {
        let offset = self.rva_to_offset(rva)? as usize;
        Ok(String::from_utf8_lossy(read_cstr(self.data(), offset)?).into_owned())
    }

    /// The decoded import table, if the image has one.
    #[must_use]
    pub fn imports(&self) -> Option<&ImportTable> {
        self.sections
            .iter()
            .find_map(|section| section.content.as_ref()?.imports())
    }

    /// The decoded base relocation table, if the image has one.
    #[must_use]
    pub fn relocations(&self) -> Option<&RelocationTable> {
        self.sections
            .iter()
            .find_map(|section| section.content.as_ref()?.relocations())
    }

    /// Every region declared by the decoded structures.
    ///
    /// # Errors
    /// Only fails if a field table is broken.
    pub fn regions(&self) -> Result<Vec<Region>> {
        let mut regions = Vec::new();
        if let Some(dos) = &self.dos {
            regions.extend(dos.regions());
        }
        regions.extend(self.coff.regions()?);
        regions.extend(self.optional.regions()?);

        for section in &self.sections {
            regions.extend(section.header.regions()?);
            if let Some(content) = &section.content {
                regions.extend(content.regions()?);
            }
        }
        Ok(regions)
    }

    /// Checks that the declared regions nest cleanly.
    ///
    /// # Errors
    /// Returns [`crate::Error::RegionConflict`] for the first partial overlap and an
    /// [`crate::Error::Address`] if an RVA region cannot be placed in the file.
    pub fn validate(&self) -> Result<RegionReport> {
        validate_regions(&self.regions()?, self.len() as u64, &self.address_map()?)
    }
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Image")
            .field("len", &self.len())
            .field("dos", &self.dos)
            .field("coff", &self.coff)
            .field("optional", &self.optional)
            .field("sections", &self.sections)
            .finish_non_exhaustive()
    }
}

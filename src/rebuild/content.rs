//! Section contents and their placement.
//!
//! Every section with raw data owns a [`SectionContent`] implementation chosen by
//! [`select_content`]. The content holds a copy of the section bytes plus whatever
//! structures it decodes from them, and takes part in every rebuild phase: it reports its
//! size, accepts a new placement and writes its bytes back out.

use std::{fmt, ops::Range};

use crate::{
    layout::{AddressMap, Region, SectionSpan},
    pe::{DirectoryKind, OptionalHeader, SectionCharacteristics, SectionHeader},
    rebuild::{ImportSection, RawSection, RelocationSection},
    schema::SchemaRegistry,
    tables::{ImportTable, RelocationTable},
    Result,
};

/// The flavor of a section content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum SectionKind {
    /// Executable code, kept as raw bytes
    Code,
    /// Initialized data, kept as raw bytes
    Data,
    /// Resource data, kept as raw bytes
    Resource,
    /// Hosts the import directory table
    Import,
    /// Hosts the base relocation table
    Relocation,
}

/// Where a section sits and where it is going.
///
/// The current values come from the section header; the `new_*` values are staged by the
/// rebuild phases and start out equal to the current ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    /// Section name
    pub name: String,
    /// File offset of the raw data
    pub fp: u32,
    /// Size of the raw data
    pub fsize: u32,
    /// RVA when loaded
    pub rva: u32,
    /// Size when loaded
    pub vsize: u32,
    /// Bytes held as content: `min(fsize, vsize)`
    pub size: u32,
    /// `rva - fp`
    pub bias: i64,
    /// Staged content size
    pub new_size: u32,
    /// Staged raw data size
    pub new_fsize: u32,
    /// Staged loaded size
    pub new_vsize: u32,
    /// Staged file offset
    pub new_fp: u32,
    /// Staged RVA
    pub new_rva: u32,
}

impl Placement {
    /// Placement of a section at its current position.
    pub fn new(name: impl Into<String>, span: SectionSpan) -> Placement {
        Placement {
            name: name.into(),
            fp: span.pointer_to_raw_data,
            fsize: span.size_of_raw_data,
            rva: span.virtual_address,
            vsize: span.virtual_size,
            size: span.size(),
            bias: span.bias(),
            new_size: span.size(),
            new_fsize: span.size_of_raw_data,
            new_vsize: span.virtual_size,
            new_fp: span.pointer_to_raw_data,
            new_rva: span.virtual_address,
        }
    }

    /// The current span.
    #[must_use]
    pub fn span(&self) -> SectionSpan {
        SectionSpan::new(self.fp, self.fsize, self.rva, self.vsize)
    }

    /// File range of the content bytes.
    #[must_use]
    pub fn content_range(&self) -> Range<usize> {
        self.fp as usize..self.fp as usize + self.size as usize
    }

    /// Stages a new content size.
    ///
    /// # Errors
    /// Returns [`crate::Error::UnsupportedResize`] if `len` differs from the current size,
    /// and [`crate::Error::Format`] if the raw size is not a multiple of `file_alignment`.
    pub fn stage_size(&mut self, len: usize, file_alignment: u32) -> Result<()> {
        if len != self.size as usize {
            return Err(unsupported_resize!(
                self.name,
                "content is {:#x} bytes, the section holds {:#x}",
                len,
                self.size
            ));
        }
        if file_alignment == 0 {
            return Err(format_error!("FileAlignment is zero"));
        }
        if self.fsize % file_alignment != 0 {
            return Err(format_error!(
                "raw size {:#x} of '{}' is not a multiple of FileAlignment {:#x}",
                self.fsize,
                self.name,
                file_alignment
            ));
        }

        self.new_size = self.size;
        self.new_fsize = self.fsize;
        self.new_vsize = self.vsize;
        Ok(())
    }

    /// Stages a new position.
    ///
    /// # Errors
    /// Returns [`crate::Error::UnsupportedResize`] if the section would move.
    pub fn stage_address(&mut self, new_fp: u32, new_rva: u32) -> Result<()> {
        self.new_fp = new_fp;
        self.new_rva = new_rva;
        if new_fp != self.fp || new_rva != self.rva {
            return Err(unsupported_resize!(
                self.name,
                "moving from {:#x}/{:#x} to {:#x}/{:#x} (file offset/RVA)",
                self.fp,
                self.rva,
                new_fp,
                new_rva
            ));
        }
        Ok(())
    }

    /// Drops every staged value, going back to the current position.
    pub fn reset(&mut self) {
        self.new_size = self.size;
        self.new_fsize = self.fsize;
        self.new_vsize = self.vsize;
        self.new_fp = self.fp;
        self.new_rva = self.rva;
    }

    /// Returns `true` if every staged value equals the current one.
    #[must_use]
    pub fn is_identity(&self) -> bool {
        self.new_size == self.size
            && self.new_fsize == self.fsize
            && self.new_vsize == self.vsize
            && self.new_fp == self.fp
            && self.new_rva == self.rva
    }
}

/// Everything a section content may consult while decoding itself.
#[derive(Clone, Copy)]
pub struct ParseContext<'a> {
    /// The complete input
    pub data: &'a [u8],
    /// The decoded optional header
    pub optional: &'a OptionalHeader,
    /// Address translation over the whole section table
    pub map: &'a AddressMap,
    /// Schema cache for repeated records
    pub registry: &'a SchemaRegistry,
}

impl ParseContext<'_> {
    /// The content bytes of a section.
    ///
    /// # Errors
    /// Returns [`crate::Error::Format`] if they extend past the end of the input.
    pub fn content(&self, placement: &Placement) -> Result<&[u8]> {
        let range = placement.content_range();
        self.data.get(range.clone()).ok_or_else(|| {
            format_error!(
                "raw data of '{}' ({:#x}..{:#x}) extends past the end of the input ({:#x})",
                placement.name,
                range.start,
                range.end,
                self.data.len()
            )
        })
    }
}

/// Behavior shared by all section contents.
///
/// The provided methods implement the identity contract of the rebuild pipeline on top of
/// [`SectionContent::placement_mut`]; implementors only describe how they decode, which
/// regions they declare and how they serialize.
pub trait SectionContent: fmt::Debug + Send + Sync {
    /// Flavor of this content.
    fn kind(&self) -> SectionKind;

    /// Current and staged placement.
    fn placement(&self) -> &Placement;

    /// Mutable access to the placement.
    fn placement_mut(&mut self) -> &mut Placement;

    /// Decodes the content from the input.
    ///
    /// # Errors
    /// Returns [`crate::Error::Format`] or [`crate::Error::Address`] for malformed content.
    fn parse(&mut self, ctx: &ParseContext<'_>) -> Result<()>;

    /// Regions declared by decoded structures inside the content.
    ///
    /// # Errors
    /// Only fails if a field table is broken.
    fn regions(&self) -> Result<Vec<Region>> {
        Ok(Vec::new())
    }

    /// Number of bytes the content would serialize to.
    fn content_len(&self) -> usize;

    /// Stages the new size of the section.
    ///
    /// # Errors
    /// Returns [`crate::Error::UnsupportedResize`] if the size changed.
    fn calculate_new_size(&mut self, file_alignment: u32, _section_alignment: u32) -> Result<()> {
        let len = self.content_len();
        self.placement_mut().stage_size(len, file_alignment)
    }

    /// Stages the new position of the section and updates internal absolute addresses.
    ///
    /// # Errors
    /// Returns [`crate::Error::UnsupportedResize`] if the section moved.
    fn relocate(&mut self, new_fp: u32, new_rva: u32) -> Result<()> {
        self.placement_mut().stage_address(new_fp, new_rva)
    }

    /// Serializes the content bytes, without trailing padding.
    ///
    /// # Errors
    /// Returns [`crate::Error::UnsupportedResize`] for changes that cannot be written.
    fn write(&self) -> Result<Vec<u8>>;

    /// Mutable raw bytes, for contents that are kept as plain bytes.
    fn bytes_mut(&mut self) -> Option<&mut Vec<u8>> {
        None
    }

    /// The decoded import table, if this content hosts one.
    fn imports(&self) -> Option<&ImportTable> {
        None
    }

    /// Mutable access to the decoded import table.
    fn imports_mut(&mut self) -> Option<&mut ImportTable> {
        None
    }

    /// The decoded base relocation table, if this content hosts one.
    fn relocations(&self) -> Option<&RelocationTable> {
        None
    }

    /// Mutable access to the decoded base relocation table.
    fn relocations_mut(&mut self) -> Option<&mut RelocationTable> {
        None
    }
}

/// Chooses the content implementation for a section with raw data.
///
/// A section hosting the start of the import directory gets an [`ImportSection`], one
/// hosting the base relocation directory a [`RelocationSection`]; everything else is kept
/// as a [`RawSection`] flavored by its characteristics.
///
/// # Errors
/// Only fails if a field table is broken.
pub fn select_content(
    section: &SectionHeader,
    optional: &OptionalHeader,
) -> Result<Box<dyn SectionContent>> {
    let span = section.span()?;
    let placement = Placement::new(section.name(), span);
    let loaded = if span.virtual_size == 0 {
        span.size_of_raw_data
    } else {
        span.virtual_size
    };

    let hosts = |kind: DirectoryKind| -> Result<bool> {
        Ok(optional
            .data_directory(kind)?
            .is_some_and(|directory| directory.starts_within(span.virtual_address, loaded)))
    };

    if hosts(DirectoryKind::Import)? {
        if hosts(DirectoryKind::BaseRelocation)? {
            log::warn!(
                "Section '{}' hosts both the import and the base relocation table; the \
                 relocations are kept as raw bytes and not decoded",
                placement.name
            );
        }
        return Ok(Box::new(ImportSection::new(placement)));
    }
    if hosts(DirectoryKind::BaseRelocation)? {
        return Ok(Box::new(RelocationSection::new(placement)));
    }

    let kind = if section
        .characteristics()?
        .contains(SectionCharacteristics::CNT_CODE)
    {
        SectionKind::Code
    } else if hosts(DirectoryKind::Resource)? {
        SectionKind::Resource
    } else {
        SectionKind::Data
    };
    Ok(Box::new(RawSection::new(kind, placement)))
}

//! Rebuild pipeline.
//!
//! Rebuilding lays the image out anew in three phases, then serializes it:
//!
//! 1. [`Image::calculate_new_size`] - every section content reports its size and the
//!    section header is updated with the staged raw and loaded sizes
//! 2. [`Image::calculate_new_address`] - sections receive contiguous RVAs starting at
//!    [`RebuildConfig::rva_base`] and contiguous file offsets starting at the end of the
//!    headers, each rounded to the section and file alignment
//! 3. [`Image::relocate`] - every section content adjusts the absolute addresses it stores
//!    to its new position
//!
//! [`Image::write`] then emits the headers, the section contents in table order and any
//! trailing data. Only the identity layout is supported: a content that changed size or a
//! section that would move fails with [`crate::Error::UnsupportedResize`] instead of
//! producing a broken image. Without modifications the output equals the input byte for
//! byte.
//!
//! A failed [`Image::rebuild`] or [`Image::relocate`] puts every section header back to
//! the decoded layout, so the image keeps agreeing with its source bytes.
//!
//! # Examples
//!
//! ```rust,no_run
//! use pescope::{rebuild::RebuildConfig, Image};
//!
//! let data = std::fs::read("sample.exe")?;
//! let mut image = Image::from_mem(data.clone())?;
//! let output = image.rebuild(&RebuildConfig::default())?;
//! assert_eq!(output, data);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod config;
mod content;
mod imports;
mod raw;
mod relocs;

pub use config::RebuildConfig;
pub use content::{select_content, ParseContext, Placement, SectionContent, SectionKind};
pub use imports::ImportSection;
pub use raw::RawSection;
pub use relocs::RelocationSection;

use std::ops::Range;

use crate::{layout::align_up, Image, Result};

impl Image {
    /// Phase one: stages the size of every section with raw data.
    ///
    /// # Errors
    /// Returns [`crate::Error::Format`] if an alignment is zero or a raw size is not a
    /// multiple of `FileAlignment`, and [`crate::Error::UnsupportedResize`] if a content
    /// changed size.
    pub fn calculate_new_size(&mut self) -> Result<()> {
        let (file_alignment, section_alignment) = self.alignments()?;

        for section in &mut self.sections {
            let Some(content) = section.content.as_mut() else {
                continue;
            };

            content.calculate_new_size(file_alignment, section_alignment)?;
            let placement = content.placement();
            section.header.set_size_of_raw_data(placement.new_fsize)?;
            section.header.set_virtual_size(placement.new_vsize)?;
        }
        Ok(())
    }

    /// Phase two: assigns contiguous RVAs and file offsets.
    ///
    /// Sections without raw data still advance the RVA but are skipped for file offsets.
    ///
    /// # Errors
    /// Returns [`crate::Error::Format`] if an alignment is zero or the layout overflows
    /// 32 bits.
    pub fn calculate_new_address(&mut self, config: &RebuildConfig) -> Result<()> {
        let (file_alignment, section_alignment) = self.alignments()?;
        let overflow = || format_error!("section layout overflows the 32-bit address space");

        let mut rva = align_up(config.rva_base, section_alignment).ok_or_else(overflow)?;
        let mut fp = match config.file_base {
            Some(base) => base,
            None => self.first_raw_offset(file_alignment)?,
        };
        fp = align_up(fp, file_alignment).ok_or_else(overflow)?;

        for section in &mut self.sections {
            let (fsize, vsize) = match &section.content {
                Some(content) => {
                    let placement = content.placement();
                    (placement.new_fsize, placement.new_vsize)
                }
                None => (
                    section.header.size_of_raw_data()?,
                    section.header.virtual_size()?,
                ),
            };
            let loaded = if vsize == 0 { fsize } else { vsize };

            section.header.set_virtual_address(rva)?;
            if let Some(content) = section.content.as_mut() {
                let placement = content.placement_mut();
                placement.new_fp = fp;
                placement.new_rva = rva;
                section.header.set_pointer_to_raw_data(fp)?;

                fp = fp
                    .checked_add(fsize)
                    .and_then(|end| align_up(end, file_alignment))
                    .ok_or_else(overflow)?;
            }

            log::debug!("Section '{}' staged at RVA {:#x}", section.name(), rva);
            rva = rva
                .checked_add(loaded)
                .and_then(|end| align_up(end, section_alignment))
                .ok_or_else(overflow)?;
        }
        Ok(())
    }

    /// Phase three: moves every section content to its staged position.
    ///
    /// # Errors
    /// Returns [`crate::Error::UnsupportedResize`] if a section would move. The section
    /// headers are restored to the decoded layout in that case.
    pub fn relocate(&mut self) -> Result<()> {
        if let Err(error) = self.relocate_sections() {
            self.restore_layout()?;
            return Err(error);
        }
        Ok(())
    }

    fn relocate_sections(&mut self) -> Result<()> {
        for section in &mut self.sections {
            match section.content.as_mut() {
                Some(content) => {
                    let (new_fp, new_rva) = {
                        let placement = content.placement();
                        (placement.new_fp, placement.new_rva)
                    };
                    content.relocate(new_fp, new_rva)?;
                }
                None => {
                    let rva = section.header.virtual_address()?;
                    if rva != section.original.virtual_address {
                        return Err(unsupported_resize!(
                            section.name(),
                            "moving from RVA {:#x} to {:#x}",
                            section.original.virtual_address,
                            rva
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    /// Serializes the staged layout.
    ///
    /// # Errors
    /// Returns [`crate::Error::UnsupportedResize`] if the staged layout is not contiguous in
    /// section table order, or if a modified import structure outside the import section
    /// cannot be written back; and any error a header or content encoder returns.
    pub fn write(&self, config: &RebuildConfig) -> Result<Vec<u8>> {
        let source = self.data();
        let mut out = Vec::with_capacity(source.len());

        let coff = self.coff.header();
        let optional = self.optional.header();

        out.extend_from_slice(slice_or_empty(source, 0, coff.start()));
        out.extend_from_slice(&coff.encode()?);
        out.extend_from_slice(&optional.encode()?);
        // Declared optional header bytes past the decoded fields.
        out.extend_from_slice(slice_or_empty(
            source,
            optional.end(),
            self.section_table_offset(),
        ));
        for section in &self.sections {
            out.extend_from_slice(&section.header.header().encode()?);
        }

        let file_alignment = self.optional.file_alignment()?;
        let slack_end = match self
            .sections
            .iter()
            .filter_map(|section| section.content.as_ref())
            .map(|content| content.placement().new_fp as usize)
            .min()
        {
            Some(first) => first,
            None => self.first_raw_offset(file_alignment)? as usize,
        };
        let headers_end = out.len();
        if config.preserve_header_slack {
            copy_or_zero(&mut out, source, headers_end, slack_end);
        } else {
            if slice_or_empty(source, headers_end, slack_end)
                .iter()
                .any(|&byte| byte != 0)
            {
                log::warn!(
                    "Dropping non-zero header slack {:#x}..{:#x}",
                    headers_end,
                    slack_end
                );
            }
            out.resize(slack_end.max(headers_end), 0);
        }

        for section in &self.sections {
            let Some(content) = &section.content else {
                continue;
            };

            let placement = content.placement();
            if out.len() != placement.new_fp as usize {
                return Err(unsupported_resize!(
                    placement.name,
                    "raw data staged at {:#x}, but the output is {:#x} bytes at that point",
                    placement.new_fp,
                    out.len()
                ));
            }

            let bytes = content.write()?;
            if bytes.len() > placement.new_fsize as usize {
                return Err(unsupported_resize!(
                    placement.name,
                    "content of {:#x} bytes exceeds the raw size {:#x}",
                    bytes.len(),
                    placement.new_fsize
                ));
            }
            out.extend_from_slice(&bytes);

            let raw_end = placement.new_fp as usize + placement.new_fsize as usize;
            if config.preserve_section_slack && placement.is_identity() {
                let start = out.len();
                copy_or_zero(&mut out, source, start, raw_end);
            } else {
                out.resize(raw_end, 0);
            }
        }

        if config.preserve_overlay {
            let overlay = self.overlay_offset();
            if overlay < source.len() {
                log::debug!("Carrying {:#x} bytes of overlay", source.len() - overlay);
                out.extend_from_slice(&source[overlay..]);
            }
        }

        self.write_external_imports(&mut out)?;
        Ok(out)
    }

    /// Writes modified import directory entries and thunk arrays that live outside the
    /// import section (an IAT in `.rdata`, say) into the bytes of the section holding them.
    fn write_external_imports(&self, out: &mut [u8]) -> Result<()> {
        let Some((name, inside, table)) = self
            .sections
            .iter()
            .filter_map(|section| section.content.as_deref())
            .find_map(|content| {
                let placement = content.placement();
                Some((&placement.name, placement.content_range(), content.imports()?))
            })
        else {
            return Ok(());
        };
        let outside = |range: &Range<usize>| range.start < inside.start || range.end > inside.end;

        let mut patches = Vec::new();
        for module in table.modules() {
            let directory = module.directory.header();
            if outside(&directory.range()) && directory.is_modified()? {
                patches.push((directory.range(), directory.encode()?));
            }

            for array in [&module.lookup, &module.address].into_iter().flatten() {
                if outside(&(array.offset()..array.end())) && array.is_modified() {
                    let mut bytes = vec![0u8; array.byte_len()];
                    array.encode_into(&mut bytes, array.offset())?;
                    patches.push((array.offset()..array.offset() + array.byte_len(), bytes));
                }
            }
        }
        if patches.is_empty() {
            return Ok(());
        }

        let moved = self
            .sections
            .iter()
            .filter_map(|section| section.content.as_ref())
            .any(|content| !content.placement().is_identity());
        for (range, bytes) in patches {
            let Some(target) = out.get_mut(range.clone()).filter(|_| !moved) else {
                return Err(unsupported_resize!(
                    name,
                    "modified import structure at {:#x}..{:#x} lies outside the written image",
                    range.start,
                    range.end
                ));
            };
            log::debug!("Writing import structure at {:#x}..{:#x}", range.start, range.end);
            target.copy_from_slice(&bytes);
        }
        Ok(())
    }

    /// Runs all three phases and serializes the result.
    ///
    /// # Errors
    /// Returns the first error of any phase; see [`Image::calculate_new_size`],
    /// [`Image::calculate_new_address`], [`Image::relocate`] and [`Image::write`].
    pub fn rebuild(&mut self, config: &RebuildConfig) -> Result<Vec<u8>> {
        match self.run_phases(config) {
            Ok(output) => Ok(output),
            Err(error) => {
                log::warn!("Rebuild failed, restoring the decoded layout: {}", error);
                self.restore_layout()?;
                Err(error)
            }
        }
    }

    fn run_phases(&mut self, config: &RebuildConfig) -> Result<Vec<u8>> {
        log::info!("Rebuilding image: calculating section sizes");
        self.calculate_new_size()?;
        log::info!("Rebuilding image: assigning section addresses");
        self.calculate_new_address(config)?;
        log::info!("Rebuilding image: relocating section contents");
        self.relocate()?;
        log::info!("Rebuilding image: writing");
        self.write(config)
    }

    /// Puts every section header and placement back to the decoded layout.
    fn restore_layout(&mut self) -> Result<()> {
        for section in &mut self.sections {
            let span = section.original;
            section.header.set_virtual_size(span.virtual_size)?;
            section.header.set_virtual_address(span.virtual_address)?;
            section.header.set_size_of_raw_data(span.size_of_raw_data)?;
            section.header.set_pointer_to_raw_data(span.pointer_to_raw_data)?;
            if let Some(content) = section.content.as_mut() {
                content.placement_mut().reset();
            }
        }
        Ok(())
    }

    fn alignments(&self) -> Result<(u32, u32)> {
        let file_alignment = self.optional.file_alignment()?;
        let section_alignment = self.optional.section_alignment()?;
        if file_alignment == 0 || section_alignment == 0 {
            return Err(format_error!(
                "alignments must be non-zero (FileAlignment {:#x}, SectionAlignment {:#x})",
                file_alignment,
                section_alignment
            ));
        }
        Ok((file_alignment, section_alignment))
    }

    /// First file offset past the headers: the aligned end of the section table, or
    /// `SizeOfHeaders` if that is larger.
    fn first_raw_offset(&self, file_alignment: u32) -> Result<u32> {
        let end = u32::try_from(self.headers_end())
            .ok()
            .and_then(|end| align_up(end, file_alignment))
            .ok_or_else(|| format_error!("headers end beyond the 32-bit range"))?;
        Ok(end.max(self.optional.size_of_headers()?))
    }

    /// File offset one past the last byte owned by the headers or a section.
    fn overlay_offset(&self) -> usize {
        self.sections
            .iter()
            .filter(|section| section.original.pointer_to_raw_data != 0)
            .map(|section| usize::try_from(section.original.raw_end()).unwrap_or(usize::MAX))
            .fold(self.headers_end(), usize::max)
    }
}

fn slice_or_empty(data: &[u8], start: usize, end: usize) -> &[u8] {
    data.get(start..end).unwrap_or_default()
}

/// Extends `out` to `end` with the source bytes at the same offsets, zero-filling whatever
/// the source does not have.
fn copy_or_zero(out: &mut Vec<u8>, source: &[u8], start: usize, end: usize) {
    if end <= start {
        return;
    }
    let available = slice_or_empty(source, start, end.min(source.len()));
    out.extend_from_slice(available);
    out.resize(end, 0);
}

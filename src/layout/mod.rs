//! Address translation and region bookkeeping.
//!
//! A PE image lives in two address spaces: file offsets into the raw bytes, and relative
//! virtual addresses (RVAs) in the loaded image. The section table maps between them. This
//! module provides:
//!
//! - [`AddressMap`] - bidirectional translation built from the section table
//! - [`Region`] / [`validate_regions`] - the labelled byte ranges every decoded component
//!   declares, and the sweep that proves they nest cleanly
//! - [`align_up`] / [`align_down`] - alignment helpers for the rebuild pipeline
//!
//! # Translation rules
//!
//! An RVA translates only if exactly one section's memory range
//! `[VirtualAddress, VirtualAddress + VirtualSize)` contains it and the offset into that
//! section is still backed by raw data. A file offset translates only if exactly one
//! section's raw range `[PointerToRawData, PointerToRawData + SizeOfRawData)` contains it
//! and the offset into that section is within its virtual size. Everything else is an
//! [`crate::AddressError`], which callers may treat as fatal or not.

mod region;

pub use region::{validate_regions, Region, RegionReport, Segment};

use crate::{AddressError, Result};

/// The address space a value is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum AddressSpace {
    /// Offset into the raw file bytes
    #[strum(to_string = "file offset")]
    FileOffset,
    /// Relative virtual address
    #[strum(to_string = "RVA")]
    Rva,
}

/// Rounds `value` up to the next multiple of `alignment`.
///
/// Alignments are powers of two in every valid image; an alignment of zero leaves the
/// value unchanged. Returns `None` on overflow.
#[must_use]
pub fn align_up(value: u32, alignment: u32) -> Option<u32> {
    if alignment == 0 {
        return Some(value);
    }
    let rem = value % alignment;
    if rem == 0 {
        Some(value)
    } else {
        value.checked_add(alignment - rem)
    }
}

/// Rounds `value` down to the previous multiple of `alignment`.
#[must_use]
pub fn align_down(value: u32, alignment: u32) -> u32 {
    if alignment == 0 {
        return value;
    }
    value - value % alignment
}

/// The placement of one section in both address spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SectionSpan {
    /// File offset of the raw data
    pub pointer_to_raw_data: u32,
    /// Size of the raw data in the file
    pub size_of_raw_data: u32,
    /// RVA of the first byte when loaded
    pub virtual_address: u32,
    /// Size when loaded
    pub virtual_size: u32,
}

impl SectionSpan {
    /// Creates a span.
    #[must_use]
    pub fn new(
        pointer_to_raw_data: u32,
        size_of_raw_data: u32,
        virtual_address: u32,
        virtual_size: u32,
    ) -> SectionSpan {
        SectionSpan {
            pointer_to_raw_data,
            size_of_raw_data,
            virtual_address,
            virtual_size,
        }
    }

    /// Bytes that are both backed by the file and part of the loaded image.
    #[must_use]
    pub fn size(&self) -> u32 {
        self.size_of_raw_data.min(self.virtual_size)
    }

    /// Difference between the RVA and the file offset of the section start.
    #[must_use]
    pub fn bias(&self) -> i64 {
        i64::from(self.virtual_address) - i64::from(self.pointer_to_raw_data)
    }

    /// Returns `true` if the memory range contains `rva`.
    #[must_use]
    pub fn contains_rva(&self, rva: u32) -> bool {
        let start = u64::from(self.virtual_address);
        (start..start + u64::from(self.virtual_size)).contains(&u64::from(rva))
    }

    /// Returns `true` if the raw range contains `offset`.
    #[must_use]
    pub fn contains_offset(&self, offset: u32) -> bool {
        let start = u64::from(self.pointer_to_raw_data);
        (start..start + u64::from(self.size_of_raw_data)).contains(&u64::from(offset))
    }

    /// File offset one past the raw data.
    #[must_use]
    pub fn raw_end(&self) -> u64 {
        u64::from(self.pointer_to_raw_data) + u64::from(self.size_of_raw_data)
    }
}

/// Bidirectional translation between file offsets and RVAs.
///
/// # Examples
///
/// ```rust
/// use pescope::layout::{AddressMap, SectionSpan};
///
/// let map = AddressMap::new(vec![
///     SectionSpan::new(0x0000, 0x1000, 0x1000, 0x1000),
///     SectionSpan::new(0x1000, 0x1000, 0x2000, 0x1000),
/// ]);
///
/// assert_eq!(map.rva_to_offset(0x2010)?, 0x1010);
/// assert_eq!(map.offset_to_rva(0x0010)?, 0x1010);
/// assert!(map.rva_to_offset(0x0500).is_err());
/// # Ok::<(), pescope::Error>(())
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressMap {
    spans: Vec<SectionSpan>,
}

impl AddressMap {
    /// Creates a map over the given sections, in section table order.
    #[must_use]
    pub fn new(spans: Vec<SectionSpan>) -> AddressMap {
        AddressMap { spans }
    }

    /// The sections this map translates through.
    #[must_use]
    pub fn spans(&self) -> &[SectionSpan] {
        &self.spans
    }

    /// Index of the one section whose memory range contains `rva`.
    ///
    /// # Errors
    /// Returns [`AddressError::Unmapped`] if no section contains `rva` and
    /// [`AddressError::Ambiguous`] if several do.
    pub fn section_for_rva(&self, rva: u32) -> Result<usize> {
        self.unique(u64::from(rva), AddressSpace::Rva, |span| span.contains_rva(rva))
    }

    /// Index of the one section whose raw range contains `offset`.
    ///
    /// # Errors
    /// Returns [`AddressError::Unmapped`] if no section contains `offset` and
    /// [`AddressError::Ambiguous`] if several do.
    pub fn section_for_offset(&self, offset: u32) -> Result<usize> {
        self.unique(u64::from(offset), AddressSpace::FileOffset, |span| {
            span.contains_offset(offset)
        })
    }

    /// Translates an RVA into a file offset.
    ///
    /// # Errors
    /// Returns an [`AddressError`] unless exactly one section maps `rva` to file-backed
    /// bytes.
    pub fn rva_to_offset(&self, rva: u32) -> Result<u32> {
        let span = &self.spans[self.section_for_rva(rva)?];
        let delta = rva - span.virtual_address;
        if delta >= span.size_of_raw_data {
            return Err(AddressError::Unmapped {
                value: u64::from(rva),
                space: AddressSpace::Rva,
            }
            .into());
        }
        Ok(span.pointer_to_raw_data + delta)
    }

    /// Translates a file offset into an RVA.
    ///
    /// # Errors
    /// Returns an [`AddressError`] unless exactly one section maps `offset` into its loaded
    /// range.
    pub fn offset_to_rva(&self, offset: u32) -> Result<u32> {
        let span = &self.spans[self.section_for_offset(offset)?];
        let delta = offset - span.pointer_to_raw_data;
        if delta >= span.virtual_size {
            return Err(AddressError::Unmapped {
                value: u64::from(offset),
                space: AddressSpace::FileOffset,
            }
            .into());
        }
        span.virtual_address.checked_add(delta).ok_or_else(|| {
            AddressError::Unmapped {
                value: u64::from(offset),
                space: AddressSpace::FileOffset,
            }
            .into()
        })
    }

    fn unique(
        &self,
        value: u64,
        space: AddressSpace,
        hit: impl Fn(&SectionSpan) -> bool,
    ) -> Result<usize> {
        let mut found = None;
        let mut matches = 0;
        for (index, span) in self.spans.iter().enumerate() {
            if hit(span) {
                found.get_or_insert(index);
                matches += 1;
            }
        }

        match (found, matches) {
            (Some(index), 1) => Ok(index),
            (None, _) => Err(AddressError::Unmapped { value, space }.into()),
            (Some(_), matches) => Err(AddressError::Ambiguous {
                value,
                space,
                matches,
            }
            .into()),
        }
    }
}

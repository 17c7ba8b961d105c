//! Import table decoding.
//!
//! The import directory table is an array of 20-byte entries, one per imported module,
//! terminated by an entry whose `NameRVA` is zero. Each entry points to a module name and
//! to two zero-terminated thunk arrays: the import lookup table (ILT) and the import
//! address table (IAT). Thunks are 32 bits wide in PE32 images and 64 bits in PE32+; the
//! top bit selects import by ordinal, otherwise the low 31 bits are the RVA of a hint/name
//! entry.
//!
//! Every scan is bounded by the raw data of the section containing the table, so a
//! missing terminator is reported as a format error instead of reading into unrelated
//! data.

use std::fmt;

use crate::{
    file::io::{read_cstr, read_le, read_uint, write_uint},
    layout::{AddressMap, Region, SectionSpan},
    schema::{Header, RecordKind, Row, SchemaRegistry},
    Result,
};

/// Field table of the 20-byte import directory entry.
pub const IMPORT_DIRECTORY_ROWS: &[Row] = &[
    Row::uint(0, 4, "ImportLookupTableRVA", "The RVA of the import lookup table."),
    Row::uint(4, 4, "TimeDateStamp", "The stamp that is set to zero until the image is bound."),
    Row::uint(8, 4, "ForwarderChain", "The index of the first forwarder reference."),
    Row::uint(12, 4, "NameRVA", "The address of an ASCII string that contains the DLL name, relative to the image base."),
    Row::uint(16, 4, "ImportAddressTableRVA", "The RVA of the import address table."),
];

/// Size of one import directory entry.
pub const IMPORT_DIRECTORY_ENTRY_SIZE: usize = 20;

/// One entry of the import directory table.
#[derive(Debug, Clone)]
pub struct ImportDirectoryEntry {
    header: Header,
}

impl ImportDirectoryEntry {
    /// The decoded fields.
    #[must_use]
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Mutable access to the decoded fields.
    pub fn header_mut(&mut self) -> &mut Header {
        &mut self.header
    }

    /// File offset of the entry.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.header.start()
    }

    /// RVA of the import lookup table, zero if absent.
    ///
    /// # Errors
    /// Only fails if the field table is broken.
    pub fn import_lookup_table_rva(&self) -> Result<u32> {
        self.header.u32("ImportLookupTableRVA")
    }

    /// Binding timestamp.
    ///
    /// # Errors
    /// Only fails if the field table is broken.
    pub fn time_date_stamp(&self) -> Result<u32> {
        self.header.u32("TimeDateStamp")
    }

    /// Index of the first forwarder reference.
    ///
    /// # Errors
    /// Only fails if the field table is broken.
    pub fn forwarder_chain(&self) -> Result<u32> {
        self.header.u32("ForwarderChain")
    }

    /// RVA of the module name.
    ///
    /// # Errors
    /// Only fails if the field table is broken.
    pub fn name_rva(&self) -> Result<u32> {
        self.header.u32("NameRVA")
    }

    /// RVA of the import address table.
    ///
    /// # Errors
    /// Only fails if the field table is broken.
    pub fn import_address_table_rva(&self) -> Result<u32> {
        self.header.u32("ImportAddressTableRVA")
    }
}

/// Decodes import directory entries starting at file offset `offset` up to the
/// terminating entry, which is not included in the result.
///
/// # Errors
/// Returns [`crate::Error::Format`] if no terminating entry lies completely before `end`.
pub fn parse_directory_table(
    data: &[u8],
    offset: usize,
    end: usize,
    registry: &SchemaRegistry,
) -> Result<Vec<ImportDirectoryEntry>> {
    let end = end.min(data.len());
    let mut entries = Vec::new();
    let mut at = offset;

    loop {
        if at + IMPORT_DIRECTORY_ENTRY_SIZE > end {
            return Err(format_error!(
                "import directory table at {:#x} has no terminating entry before {:#x}",
                offset,
                end
            ));
        }

        let entry = ImportDirectoryEntry {
            header: registry.decode(data, at, RecordKind::ImportDirectoryEntry)?,
        };
        if entry.name_rva()? == 0 {
            return Ok(entries);
        }

        entries.push(entry);
        at += IMPORT_DIRECTORY_ENTRY_SIZE;
    }
}

/// A decoded import lookup or address table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImportLookupEntry {
    /// Import by ordinal
    Ordinal(u16),
    /// Import by name, through the hint/name entry at this RVA
    Name {
        /// RVA of the hint/name entry
        hint_name_rva: u32,
    },
}

impl ImportLookupEntry {
    /// Interprets a raw thunk of `thunk_size` bytes (4 or 8).
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn from_raw(value: u64, thunk_size: usize) -> ImportLookupEntry {
        let ordinal_flag = if thunk_size == 8 { 1 << 63 } else { 1 << 31 };
        if value & ordinal_flag != 0 {
            ImportLookupEntry::Ordinal((value & 0xFFFF) as u16)
        } else {
            ImportLookupEntry::Name {
                hint_name_rva: (value & 0x7FFF_FFFF) as u32,
            }
        }
    }
}

/// A zero-terminated array of thunks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThunkArray {
    offset: usize,
    thunk_size: usize,
    values: Vec<u64>,
    baseline: Vec<u64>,
}

impl ThunkArray {
    /// Decodes thunks of `thunk_size` bytes at file offset `offset` up to the zero
    /// terminator, which must lie completely before `end`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Format`] if the terminator is missing.
    pub fn parse(data: &[u8], offset: usize, end: usize, thunk_size: usize) -> Result<ThunkArray> {
        let end = end.min(data.len());
        let mut values = Vec::new();
        let mut at = offset;

        loop {
            if at + thunk_size > end {
                return Err(format_error!(
                    "thunk array at {:#x} is not terminated before {:#x}",
                    offset,
                    end
                ));
            }

            let value = read_uint(data, at, thunk_size)?;
            if value == 0 {
                return Ok(ThunkArray {
                    offset,
                    thunk_size,
                    baseline: values.clone(),
                    values,
                });
            }

            values.push(value);
            at += thunk_size;
        }
    }

    /// File offset of the first thunk.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Size of one thunk.
    #[must_use]
    pub fn thunk_size(&self) -> usize {
        self.thunk_size
    }

    /// Raw thunk values, terminator excluded.
    #[must_use]
    pub fn values(&self) -> &[u64] {
        &self.values
    }

    /// Mutable access to the raw thunk values. The number of thunks cannot change.
    pub fn values_mut(&mut self) -> &mut [u64] {
        &mut self.values
    }

    /// Returns `true` if a thunk value differs from the decoded one.
    #[must_use]
    pub fn is_modified(&self) -> bool {
        self.values != self.baseline
    }

    /// Number of thunks, terminator excluded.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns `true` if the array holds only the terminator.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Bytes covered by the thunks, terminator excluded.
    #[must_use]
    pub fn byte_len(&self) -> usize {
        self.values.len() * self.thunk_size
    }

    /// File offset one past the terminator.
    #[must_use]
    pub fn end(&self) -> usize {
        self.offset + (self.values.len() + 1) * self.thunk_size
    }

    /// Decoded entries in array order.
    pub fn entries(&self) -> impl Iterator<Item = ImportLookupEntry> + '_ {
        self.values
            .iter()
            .map(|&value| ImportLookupEntry::from_raw(value, self.thunk_size))
    }

    /// Writes the thunks into `buffer`, which holds the file bytes starting at `base`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the array does not lie inside `buffer`.
    pub fn encode_into(&self, buffer: &mut [u8], base: usize) -> Result<()> {
        let Some(start) = self.offset.checked_sub(base) else {
            return Err(crate::Error::OutOfBounds);
        };
        for (index, value) in self.values.iter().enumerate() {
            write_uint(buffer, start + index * self.thunk_size, self.thunk_size, *value)?;
        }
        Ok(())
    }
}

/// A hint/name table entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HintName {
    /// Index into the export name pointer table of the exporting module
    pub hint: u16,
    /// Imported symbol name
    pub name: String,
}

impl HintName {
    /// Decodes the entry at file offset `offset`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] or [`crate::Error::Format`] if the entry is
    /// truncated or the name is not terminated.
    pub fn parse(data: &[u8], offset: usize) -> Result<HintName> {
        let Some(hint_bytes) = data.get(offset..offset + 2) else {
            return Err(crate::Error::OutOfBounds);
        };
        Ok(HintName {
            hint: read_le::<u16>(hint_bytes)?,
            name: String::from_utf8_lossy(read_cstr(data, offset + 2)?).into_owned(),
        })
    }
}

/// A resolved imported symbol.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ImportName {
    /// Import by ordinal
    Ordinal(u16),
    /// Import by name
    Named(HintName),
}

impl fmt::Display for ImportName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImportName::Ordinal(ordinal) => write!(f, "#{ordinal}"),
            ImportName::Named(entry) => write!(f, "{}", entry.name),
        }
    }
}

/// Everything imported from one module.
#[derive(Debug, Clone)]
pub struct ImportedModule {
    /// The directory entry
    pub directory: ImportDirectoryEntry,
    /// Module name
    pub name: String,
    /// The import lookup table, absent if `ImportLookupTableRVA` is zero
    pub lookup: Option<ThunkArray>,
    /// The import address table, absent if `ImportAddressTableRVA` is zero
    pub address: Option<ThunkArray>,
}

impl ImportedModule {
    /// The thunks describing the imports: the lookup table, or the address table if there
    /// is no lookup table.
    #[must_use]
    pub fn thunks(&self) -> Option<&ThunkArray> {
        self.lookup.as_ref().or(self.address.as_ref())
    }

    /// Resolves every import of this module to an ordinal or a hint/name entry.
    ///
    /// # Errors
    /// Returns an [`crate::Error::Address`] if a hint/name RVA is unmapped and
    /// [`crate::Error::Format`] if an entry is truncated.
    pub fn functions(&self, data: &[u8], map: &AddressMap) -> Result<Vec<ImportName>> {
        let Some(thunks) = self.thunks() else {
            return Ok(Vec::new());
        };

        thunks
            .entries()
            .map(|entry| match entry {
                ImportLookupEntry::Ordinal(ordinal) => Ok(ImportName::Ordinal(ordinal)),
                ImportLookupEntry::Name { hint_name_rva } => {
                    let offset = map.rva_to_offset(hint_name_rva)? as usize;
                    Ok(ImportName::Named(HintName::parse(data, offset)?))
                }
            })
            .collect()
    }
}

/// A decoded import table.
#[derive(Debug, Clone)]
pub struct ImportTable {
    offset: usize,
    declared_size: usize,
    modules: Vec<ImportedModule>,
}

impl ImportTable {
    /// Decodes the import table the import data directory points to.
    ///
    /// A declared size that does not match the table found is logged, not rejected.
    ///
    /// # Errors
    /// Returns an [`crate::Error::Address`] if a referenced RVA is unmapped and
    /// [`crate::Error::Format`] if a table or array is not terminated inside its section.
    pub fn parse(
        data: &[u8],
        map: &AddressMap,
        rva: u32,
        declared_size: u32,
        thunk_size: usize,
        registry: &SchemaRegistry,
    ) -> Result<ImportTable> {
        let offset = map.rva_to_offset(rva)? as usize;
        let end = section_end(map, rva, data.len())?;
        let entries = parse_directory_table(data, offset, end, registry)?;

        let table_size = (entries.len() + 1) * IMPORT_DIRECTORY_ENTRY_SIZE;
        if table_size != declared_size as usize {
            log::warn!(
                "Import directory declares {declared_size:#x} bytes, the table at {offset:#x} spans {table_size:#x}"
            );
        }

        let thunks_at = |rva: u32| -> Result<Option<ThunkArray>> {
            if rva == 0 {
                return Ok(None);
            }
            let at = map.rva_to_offset(rva)? as usize;
            let end = section_end(map, rva, data.len())?;
            ThunkArray::parse(data, at, end, thunk_size).map(Some)
        };

        let mut modules = Vec::with_capacity(entries.len());
        for directory in entries {
            let name_offset = map.rva_to_offset(directory.name_rva()?)? as usize;
            let name = String::from_utf8_lossy(read_cstr(data, name_offset)?).into_owned();
            let lookup = thunks_at(directory.import_lookup_table_rva()?)?;
            let address = thunks_at(directory.import_address_table_rva()?)?;

            log::debug!(
                "Import of {name}: {} thunks",
                lookup.as_ref().or(address.as_ref()).map_or(0, ThunkArray::len)
            );

            modules.push(ImportedModule {
                directory,
                name,
                lookup,
                address,
            });
        }

        Ok(ImportTable {
            offset,
            declared_size: declared_size as usize,
            modules,
        })
    }

    /// File offset of the directory table.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Size declared by the data directory.
    #[must_use]
    pub fn declared_size(&self) -> usize {
        self.declared_size
    }

    /// File offset one past the terminating directory entry.
    #[must_use]
    pub fn table_end(&self) -> usize {
        self.offset + (self.modules.len() + 1) * IMPORT_DIRECTORY_ENTRY_SIZE
    }

    /// The imported modules in table order.
    #[must_use]
    pub fn modules(&self) -> &[ImportedModule] {
        &self.modules
    }

    /// Mutable access to the imported modules.
    pub fn modules_mut(&mut self) -> &mut [ImportedModule] {
        &mut self.modules
    }

    /// Looks up a module by name, ignoring ASCII case.
    #[must_use]
    pub fn module(&self, name: &str) -> Option<&ImportedModule> {
        self.modules
            .iter()
            .find(|module| module.name.eq_ignore_ascii_case(name))
    }

    /// Regions of the directory entries and thunk arrays.
    #[must_use]
    pub fn regions(&self) -> Vec<Region> {
        let mut regions = Vec::new();
        for module in &self.modules {
            regions.push(Region::file(
                module.directory.offset() as u64,
                IMPORT_DIRECTORY_ENTRY_SIZE as u64,
                format!("Import Directory Entry ({})", module.name),
            ));
            if let Some(lookup) = &module.lookup {
                regions.push(Region::file(
                    lookup.offset() as u64,
                    lookup.byte_len() as u64,
                    format!("Import Lookup Table ({})", module.name),
                ));
            }
            if let Some(address) = &module.address {
                regions.push(Region::file(
                    address.offset() as u64,
                    address.byte_len() as u64,
                    format!("Import Address Table ({})", module.name),
                ));
            }
        }
        regions
    }
}

fn section_end(map: &AddressMap, rva: u32, len: usize) -> Result<usize> {
    let span: &SectionSpan = &map.spans()[map.section_for_rva(rva)?];
    Ok(usize::try_from(span.raw_end()).unwrap_or(usize::MAX).min(len))
}

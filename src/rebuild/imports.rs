use std::ops::Range;

use crate::{
    layout::Region,
    pe::{DataDirectory, DirectoryKind},
    rebuild::{ParseContext, Placement, SectionContent, SectionKind},
    tables::{ImportTable, ThunkArray},
    Result,
};

/// Section content hosting the import directory table.
///
/// Besides the directory entries and thunk arrays, the section carries the module names
/// and hint/name entries. These are kept as one opaque blob running from the end of the
/// last decoded structure to the end of the content.
#[derive(Debug, Clone)]
pub struct ImportSection {
    placement: Placement,
    raw: Vec<u8>,
    table: Option<ImportTable>,
    hint_name: Range<usize>,
}

impl ImportSection {
    /// Creates an empty content; call [`SectionContent::parse`] to fill it.
    #[must_use]
    pub fn new(placement: Placement) -> ImportSection {
        ImportSection {
            placement,
            raw: Vec::new(),
            table: None,
            hint_name: 0..0,
        }
    }

    /// File range of the hint/name blob.
    #[must_use]
    pub fn hint_name_range(&self) -> Range<usize> {
        self.hint_name.clone()
    }

    /// The hint/name blob.
    #[must_use]
    pub fn hint_name_bytes(&self) -> &[u8] {
        let base = self.placement.fp as usize;
        let range = self.hint_name.start.saturating_sub(base)..self.hint_name.end.saturating_sub(base);
        self.raw.get(range).unwrap_or_default()
    }

    fn arrays(table: &ImportTable) -> impl Iterator<Item = &ThunkArray> {
        table
            .modules()
            .iter()
            .flat_map(|module| [&module.lookup, &module.address])
            .flatten()
    }
}

impl SectionContent for ImportSection {
    fn kind(&self) -> SectionKind {
        SectionKind::Import
    }

    fn placement(&self) -> &Placement {
        &self.placement
    }

    fn placement_mut(&mut self) -> &mut Placement {
        &mut self.placement
    }

    fn parse(&mut self, ctx: &ParseContext<'_>) -> Result<()> {
        self.raw = ctx.content(&self.placement)?.to_vec();

        let Some(directory) = ctx
            .optional
            .data_directory(DirectoryKind::Import)?
            .filter(DataDirectory::is_present)
        else {
            return Err(format_error!(
                "section '{}' was chosen for imports, but there is no import directory",
                self.placement.name
            ));
        };

        let table = ImportTable::parse(
            ctx.data,
            ctx.map,
            directory.rva,
            directory.size,
            ctx.optional.thunk_size(),
            ctx.registry,
        )?;

        let content = self.placement.content_range();
        let start = Self::arrays(&table)
            .filter(|array| content.contains(&array.offset()))
            .map(ThunkArray::end)
            .fold(table.table_end(), usize::max)
            .clamp(content.start, content.end);
        self.hint_name = start..content.end;

        log::debug!(
            "Import section '{}': {} modules, hint/name blob {:#x}..{:#x}",
            self.placement.name,
            table.modules().len(),
            self.hint_name.start,
            self.hint_name.end
        );

        self.table = Some(table);
        Ok(())
    }

    fn regions(&self) -> Result<Vec<Region>> {
        let mut regions = self.table.as_ref().map(ImportTable::regions).unwrap_or_default();
        if !self.hint_name.is_empty() {
            regions.push(Region::file(
                self.hint_name.start as u64,
                self.hint_name.len() as u64,
                "Hint/Name Table",
            ));
        }
        Ok(regions)
    }

    fn content_len(&self) -> usize {
        self.raw.len()
    }

    fn write(&self) -> Result<Vec<u8>> {
        let mut buffer = self.raw.clone();
        let Some(table) = &self.table else {
            return Ok(buffer);
        };

        // Structures outside the content are written by the image into the section holding them.
        let content = self.placement.content_range();
        for module in table.modules() {
            let directory = &module.directory;
            let range = directory.header().range();
            if range.start >= content.start && range.end <= content.end {
                let at = range.start - content.start;
                buffer[at..at + range.len()].copy_from_slice(&directory.header().encode()?);
            }
        }

        for array in Self::arrays(table) {
            if array.offset() >= content.start && array.end() <= content.end {
                array.encode_into(&mut buffer, content.start)?;
            }
        }

        Ok(buffer)
    }

    fn imports(&self) -> Option<&ImportTable> {
        self.table.as_ref()
    }

    fn imports_mut(&mut self) -> Option<&mut ImportTable> {
        self.table.as_mut()
    }
}

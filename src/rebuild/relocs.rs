use crate::{
    layout::Region,
    pe::{DataDirectory, DirectoryKind},
    rebuild::{ParseContext, Placement, SectionContent, SectionKind},
    tables::RelocationTable,
    Result,
};

/// Section content hosting the base relocation table.
#[derive(Debug, Clone)]
pub struct RelocationSection {
    placement: Placement,
    raw: Vec<u8>,
    table: Option<RelocationTable>,
}

impl RelocationSection {
    /// Creates an empty content; call [`SectionContent::parse`] to fill it.
    #[must_use]
    pub fn new(placement: Placement) -> RelocationSection {
        RelocationSection {
            placement,
            raw: Vec::new(),
            table: None,
        }
    }
}

impl SectionContent for RelocationSection {
    fn kind(&self) -> SectionKind {
        SectionKind::Relocation
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
            .data_directory(DirectoryKind::BaseRelocation)?
            .filter(DataDirectory::is_present)
        else {
            return Err(format_error!(
                "section '{}' was chosen for base relocations, but there is no relocation directory",
                self.placement.name
            ));
        };

        let offset = ctx.map.rva_to_offset(directory.rva)? as usize;
        let span = self.placement.span();
        let bound = usize::try_from(span.raw_end()).unwrap_or(usize::MAX);

        self.table = Some(RelocationTable::parse(
            ctx.data,
            offset,
            directory.size as usize,
            bound,
            ctx.registry,
        )?);
        Ok(())
    }

    fn regions(&self) -> Result<Vec<Region>> {
        match &self.table {
            Some(table) => table.regions(),
            None => Ok(Vec::new()),
        }
    }

    fn content_len(&self) -> usize {
        match &self.table {
            Some(table) => (self.raw.len() + table.encoded_len())
                .saturating_sub(table.declared_size()),
            None => self.raw.len(),
        }
    }

    fn write(&self) -> Result<Vec<u8>> {
        let mut buffer = self.raw.clone();
        let Some(table) = &self.table else {
            return Ok(buffer);
        };

        if table.encoded_len() != table.declared_size() {
            return Err(unsupported_resize!(
                self.placement.name,
                "base relocation table grew from {:#x} to {:#x} bytes",
                table.declared_size(),
                table.encoded_len()
            ));
        }

        let content = self.placement.content_range();
        for block in table.blocks() {
            let encoded = block.encode()?;
            let start = block.offset();
            if start >= content.start && start + encoded.len() <= content.end {
                let at = start - content.start;
                buffer[at..at + encoded.len()].copy_from_slice(&encoded);
            }
        }

        Ok(buffer)
    }

    fn relocations(&self) -> Option<&RelocationTable> {
        self.table.as_ref()
    }

    fn relocations_mut(&mut self) -> Option<&mut RelocationTable> {
        self.table.as_mut()
    }
}

use crate::{
    rebuild::{ParseContext, Placement, SectionContent, SectionKind},
    Result,
};

/// Section content kept as plain bytes: code, data and resources.
#[derive(Debug, Clone)]
pub struct RawSection {
    kind: SectionKind,
    placement: Placement,
    bytes: Vec<u8>,
}

impl RawSection {
    /// Creates an empty content; call [`SectionContent::parse`] to fill it.
    #[must_use]
    pub fn new(kind: SectionKind, placement: Placement) -> RawSection {
        RawSection {
            kind,
            placement,
            bytes: Vec::new(),
        }
    }

    /// The content bytes.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl SectionContent for RawSection {
    fn kind(&self) -> SectionKind {
        self.kind
    }

    fn placement(&self) -> &Placement {
        &self.placement
    }

    fn placement_mut(&mut self) -> &mut Placement {
        &mut self.placement
    }

    fn parse(&mut self, ctx: &ParseContext<'_>) -> Result<()> {
        self.bytes = ctx.content(&self.placement)?.to_vec();
        log::debug!(
            "{} section '{}': {:#x} bytes",
            self.kind,
            self.placement.name,
            self.bytes.len()
        );
        Ok(())
    }

    fn content_len(&self) -> usize {
        self.bytes.len()
    }

    fn write(&self) -> Result<Vec<u8>> {
        Ok(self.bytes.clone())
    }

    fn bytes_mut(&mut self) -> Option<&mut Vec<u8>> {
        Some(&mut self.bytes)
    }
}

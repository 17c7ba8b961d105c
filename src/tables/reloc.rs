//! Base relocation table decoding.
//!
//! The table is a sequence of variable-length blocks, each an 8-byte header (`PageRVA`,
//! `BlockSize`) followed by `(BlockSize - 8) / 2` two-byte entries. The high four bits of
//! an entry are the relocation type, the low twelve bits the offset into the page.
//! Decoding is driven by the declared directory size: blocks are consumed until exactly
//! that many bytes have been read.

use strum::FromRepr;

use crate::{
    file::io::read_le,
    layout::Region,
    schema::{Header, RecordKind, Row, SchemaRegistry},
    Result,
};

/// Field table of the 8-byte base relocation block header.
pub const BASE_RELOCATION_BLOCK_ROWS: &[Row] = &[
    Row::uint(0, 4, "PageRVA", "The image base plus the page RVA is added to each offset to create the VA where the base relocation must be applied."),
    Row::uint(4, 4, "BlockSize", "The total number of bytes in the base relocation block, including the PageRVA and BlockSize fields and the entries that follow."),
];

/// Size of the block header.
pub const BLOCK_HEADER_SIZE: usize = 8;

/// Base relocation types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromRepr, strum::Display)]
#[repr(u8)]
pub enum BaseRelocationType {
    /// Skipped; used to pad a block
    Absolute = 0,
    /// High 16 bits of the difference
    High = 1,
    /// Low 16 bits of the difference
    Low = 2,
    /// All 32 bits of the difference
    HighLow = 3,
    /// High 16 bits, adjusted with the following entry
    HighAdj = 4,
    /// Depends on the machine type
    MachineSpecific5 = 5,
    /// Reserved
    Reserved = 6,
    /// Depends on the machine type
    MachineSpecific7 = 7,
    /// Depends on the machine type
    MachineSpecific8 = 8,
    /// Depends on the machine type
    MachineSpecific9 = 9,
    /// All 64 bits of the difference
    Dir64 = 10,
}

/// One two-byte base relocation entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BaseRelocation {
    raw: u16,
}

impl BaseRelocation {
    /// Wraps a raw entry.
    #[must_use]
    pub fn from_raw(raw: u16) -> BaseRelocation {
        BaseRelocation { raw }
    }

    /// Builds an entry from a type and a page offset.
    ///
    /// # Errors
    /// Returns [`crate::Error::Format`] if `offset` does not fit into twelve bits.
    pub fn new(kind: BaseRelocationType, offset: u16) -> Result<BaseRelocation> {
        if offset > 0xFFF {
            return Err(format_error!(
                "page offset {:#x} does not fit into a relocation entry",
                offset
            ));
        }
        Ok(BaseRelocation {
            raw: (u16::from(kind as u8) << 12) | offset,
        })
    }

    /// The raw two-byte value.
    #[must_use]
    pub fn raw(self) -> u16 {
        self.raw
    }

    /// The type nibble.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn kind_raw(self) -> u8 {
        (self.raw >> 12) as u8
    }

    /// The relocation type, if defined.
    #[must_use]
    pub fn kind(self) -> Option<BaseRelocationType> {
        BaseRelocationType::from_repr(self.kind_raw())
    }

    /// Offset into the page.
    #[must_use]
    pub fn offset(self) -> u16 {
        self.raw & 0x0FFF
    }
}

/// One page worth of base relocations.
#[derive(Debug, Clone)]
pub struct RelocationBlock {
    header: Header,
    entries: Vec<BaseRelocation>,
}

impl RelocationBlock {
    /// Decodes the block at `offset`, which must end at or before `bound`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Format`] if `BlockSize` is smaller than the header, odd, or
    /// runs past `bound`.
    pub fn parse(
        data: &[u8],
        offset: usize,
        bound: usize,
        registry: &SchemaRegistry,
    ) -> Result<RelocationBlock> {
        let bound = bound.min(data.len());
        if offset + BLOCK_HEADER_SIZE > bound {
            return Err(format_error!(
                "base relocation block at {:#x} runs past {:#x}",
                offset,
                bound
            ));
        }

        let header = registry.decode(data, offset, RecordKind::BaseRelocationBlock)?;
        let block_size = header.u32("BlockSize")? as usize;
        if block_size < BLOCK_HEADER_SIZE || block_size % 2 != 0 {
            return Err(format_error!(
                "base relocation block at {:#x} has an invalid BlockSize of {:#x}",
                offset,
                block_size
            ));
        }
        if offset + block_size > bound {
            return Err(format_error!(
                "base relocation block at {:#x} with BlockSize {:#x} runs past {:#x}",
                offset,
                block_size,
                bound
            ));
        }

        let entries = data[offset + BLOCK_HEADER_SIZE..offset + block_size]
            .chunks_exact(2)
            .map(|chunk| read_le::<u16>(chunk).map(BaseRelocation::from_raw))
            .collect::<Result<Vec<_>>>()?;

        Ok(RelocationBlock { header, entries })
    }

    /// The decoded block header.
    #[must_use]
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Mutable access to the block header.
    ///
    /// Changing `BlockSize` by hand desynchronizes it from the entries.
    pub fn header_mut(&mut self) -> &mut Header {
        &mut self.header
    }

    /// File offset of the block.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.header.start()
    }

    /// RVA of the page the entries apply to.
    ///
    /// # Errors
    /// Only fails if the field table is broken.
    pub fn page_rva(&self) -> Result<u32> {
        self.header.u32("PageRVA")
    }

    /// Declared size of the block, header included.
    ///
    /// # Errors
    /// Only fails if the field table is broken.
    pub fn block_size(&self) -> Result<u32> {
        self.header.u32("BlockSize")
    }

    /// The entries in file order.
    #[must_use]
    pub fn entries(&self) -> &[BaseRelocation] {
        &self.entries
    }

    /// Appends an entry and grows `BlockSize` accordingly.
    ///
    /// # Errors
    /// Only fails if the field table is broken.
    pub fn push(&mut self, entry: BaseRelocation) -> Result<()> {
        self.entries.push(entry);
        self.header
            .set_uint("BlockSize", self.encoded_len() as u64)
    }

    /// Size this block encodes to.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        BLOCK_HEADER_SIZE + self.entries.len() * 2
    }

    /// RVAs targeted by the entries, skipping padding.
    ///
    /// # Errors
    /// Only fails if the field table is broken.
    pub fn targets(&self) -> Result<Vec<(u32, BaseRelocation)>> {
        let page = self.page_rva()?;
        Ok(self
            .entries
            .iter()
            .filter(|entry| entry.kind() != Some(BaseRelocationType::Absolute))
            .map(|entry| (page.wrapping_add(u32::from(entry.offset())), *entry))
            .collect())
    }

    /// Encodes the header and entries.
    ///
    /// # Errors
    /// Returns [`crate::Error::Schema`] if a header value no longer fits its field.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buffer = self.header.encode()?;
        buffer.reserve(self.entries.len() * 2);
        for entry in &self.entries {
            buffer.extend_from_slice(&entry.raw.to_le_bytes());
        }
        Ok(buffer)
    }
}

/// A decoded base relocation table.
///
/// # Examples
///
/// ```rust
/// use pescope::schema::SchemaRegistry;
/// use pescope::tables::RelocationTable;
///
/// let mut data = Vec::new();
/// data.extend_from_slice(&0x1000_u32.to_le_bytes());
/// data.extend_from_slice(&12_u32.to_le_bytes());
/// data.extend_from_slice(&0x3004_u16.to_le_bytes());
/// data.extend_from_slice(&0x0000_u16.to_le_bytes());
///
/// let registry = SchemaRegistry::new();
/// let table = RelocationTable::parse(&data, 0, 12, data.len(), &registry)?;
/// assert_eq!(table.blocks().len(), 1);
/// assert_eq!(table.blocks()[0].targets()?[0].0, 0x1004);
/// # Ok::<(), pescope::Error>(())
/// ```
#[derive(Debug, Clone)]
pub struct RelocationTable {
    offset: usize,
    declared_size: usize,
    blocks: Vec<RelocationBlock>,
}

impl RelocationTable {
    /// Decodes `declared_size` bytes of blocks starting at file offset `offset`; no block may
    /// extend past `bound`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Format`] if a block is malformed or the block sizes do not
    /// add up to exactly `declared_size`.
    pub fn parse(
        data: &[u8],
        offset: usize,
        declared_size: usize,
        bound: usize,
        registry: &SchemaRegistry,
    ) -> Result<RelocationTable> {
        let bound = bound.min(data.len());
        let mut blocks = Vec::new();
        let mut consumed = 0_usize;

        while consumed < declared_size {
            let block = RelocationBlock::parse(data, offset + consumed, bound, registry)?;
            consumed += block.block_size()? as usize;
            blocks.push(block);
        }

        if consumed != declared_size {
            return Err(format_error!(
                "base relocation blocks at {:#x} span {:#x} bytes, the directory declares {:#x}",
                offset,
                consumed,
                declared_size
            ));
        }

        log::debug!(
            "Decoded {} base relocation blocks at {offset:#x}",
            blocks.len()
        );

        Ok(RelocationTable {
            offset,
            declared_size,
            blocks,
        })
    }

    /// File offset of the first block.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Size declared by the data directory.
    #[must_use]
    pub fn declared_size(&self) -> usize {
        self.declared_size
    }

    /// The blocks in file order.
    #[must_use]
    pub fn blocks(&self) -> &[RelocationBlock] {
        &self.blocks
    }

    /// Mutable access to the blocks.
    pub fn blocks_mut(&mut self) -> &mut [RelocationBlock] {
        &mut self.blocks
    }

    /// Size the blocks currently encode to.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        self.blocks.iter().map(RelocationBlock::encoded_len).sum()
    }

    /// Total number of entries, padding included.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.blocks.iter().map(|block| block.entries().len()).sum()
    }

    /// One region per block.
    ///
    /// # Errors
    /// Only fails if the field table is broken.
    pub fn regions(&self) -> Result<Vec<Region>> {
        self.blocks
            .iter()
            .map(|block| {
                Ok(Region::file(
                    block.offset() as u64,
                    block.block_size()?,
                    format!("Base Relocation Block ({:#x})", block.page_rva()?),
                ))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    fn block(page: u32, entries: &[u16]) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&page.to_le_bytes());
        data.extend_from_slice(&(8 + entries.len() as u32 * 2).to_le_bytes());
        for entry in entries {
            data.extend_from_slice(&entry.to_le_bytes());
        }
        data
    }

    #[test]
    fn single_block() {
        let data = block(0x1000, &[0x3010, 0x3020, 0xA030, 0x0000]);
        let registry = SchemaRegistry::new();
        let table = RelocationTable::parse(&data, 0, 16, data.len(), &registry).unwrap();

        assert_eq!(table.blocks().len(), 1);
        let block = &table.blocks()[0];
        assert_eq!(block.entries().len(), 4);
        assert_eq!(block.entries()[0].kind(), Some(BaseRelocationType::HighLow));
        assert_eq!(block.entries()[2].kind(), Some(BaseRelocationType::Dir64));
        assert_eq!(block.entries()[2].offset(), 0x030);
        assert_eq!(block.targets().unwrap().len(), 3);
        assert_eq!(table.encoded_len(), 16);
        assert_eq!(block.encode().unwrap(), data);
    }

    #[test]
    fn several_blocks() {
        let mut data = block(0x1000, &[0x3004, 0x0000]);
        data.extend(block(0x2000, &[0x3008, 0x300C]));
        let registry = SchemaRegistry::new();
        let table = RelocationTable::parse(&data, 0, 24, data.len(), &registry).unwrap();

        assert_eq!(table.blocks().len(), 2);
        assert_eq!(table.blocks()[1].offset(), 12);
        assert_eq!(table.blocks()[1].page_rva().unwrap(), 0x2000);
        assert_eq!(table.entry_count(), 4);

        let regions = table.regions().unwrap();
        assert_eq!(regions[1].start, 12);
        assert_eq!(regions[1].length, 12);
        assert_eq!(regions[1].label, "Base Relocation Block (0x2000)");
    }

    #[test]
    fn declared_size_mismatch() {
        let data = block(0x1000, &[0x3010, 0x3020, 0x3030, 0x0000]);
        let registry = SchemaRegistry::new();
        assert!(matches!(
            RelocationTable::parse(&data, 0, 15, data.len(), &registry),
            Err(Error::Format { .. })
        ));
        assert!(matches!(
            RelocationTable::parse(&data, 0, 20, data.len(), &registry),
            Err(Error::Format { .. })
        ));
    }

    #[test]
    fn malformed_block_size() {
        let registry = SchemaRegistry::new();

        let mut short = block(0x1000, &[]);
        short[4..8].copy_from_slice(&4_u32.to_le_bytes());
        assert!(matches!(
            RelocationTable::parse(&short, 0, 8, short.len(), &registry),
            Err(Error::Format { .. })
        ));

        let mut odd = block(0x1000, &[0x3000, 0x3004]);
        odd[4..8].copy_from_slice(&11_u32.to_le_bytes());
        assert!(matches!(
            RelocationTable::parse(&odd, 0, 11, odd.len(), &registry),
            Err(Error::Format { .. })
        ));

        let data = block(0x1000, &[0x3000, 0x3004]);
        assert!(matches!(
            RelocationTable::parse(&data, 0, 12, 10, &registry),
            Err(Error::Format { .. })
        ));
    }

    #[test]
    fn empty_table() {
        let registry = SchemaRegistry::new();
        let table = RelocationTable::parse(&[], 0, 0, 0, &registry).unwrap();
        assert!(table.blocks().is_empty());
        assert_eq!(registry.builds(), 0);
    }

    #[test]
    fn push_grows_block() {
        let data = block(0x1000, &[0x3004]);
        let registry = SchemaRegistry::new();
        let mut table = RelocationTable::parse(&data, 0, 10, data.len(), &registry).unwrap();

        let entry = BaseRelocation::new(BaseRelocationType::HighLow, 0x8).unwrap();
        table.blocks_mut()[0].push(entry).unwrap();
        assert_eq!(table.blocks()[0].block_size().unwrap(), 12);
        assert_eq!(table.encoded_len(), 12);
        assert_eq!(entry.raw(), 0x3008);
        assert!(BaseRelocation::new(BaseRelocationType::HighLow, 0x1000).is_err());
    }
}

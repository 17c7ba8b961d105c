//! Decoders for the tables that data directories point to.
//!
//! - [`import`] - the import directory table, lookup and address thunks, hint/name entries
//! - [`reloc`] - the base relocation table
//!
//! Both decoders work on the complete file bytes and record absolute file offsets, so the
//! section content that owns a table can patch decoded values back in place.

pub mod import;
pub mod reloc;

pub use import::{
    parse_directory_table, HintName, ImportDirectoryEntry, ImportLookupEntry, ImportName,
    ImportTable, ImportedModule, ThunkArray, IMPORT_DIRECTORY_ROWS,
};
pub use reloc::{
    BaseRelocation, BaseRelocationType, RelocationBlock, RelocationTable,
    BASE_RELOCATION_BLOCK_ROWS,
};

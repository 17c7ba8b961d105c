//! # pescope Prelude
//!
//! The most commonly used types of the crate, for glob import.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all pescope operations
pub use crate::{AddressError, Error};

/// The result type used throughout pescope
pub use crate::Result;

// ================================================================================================
// Main Entry Points
// ================================================================================================

/// A decoded image and its sections
pub use crate::{pe::Section, Image};

/// Rebuild configuration and the section content interface
pub use crate::rebuild::{RebuildConfig, SectionContent, SectionKind};

// ================================================================================================
// Structural Model
// ================================================================================================

/// Headers and their typed fields
pub use crate::pe::{
    CoffHeader, DataDirectory, DirectoryKind, DosStub, FileCharacteristics, Machine,
    OptionalHeader, OptionalState, SectionCharacteristics, SectionHeader,
};

/// Schema engine
pub use crate::schema::{FieldValue, Header, HeaderKind, RecordKind, SchemaRegistry};

// ================================================================================================
// Layout and Tables
// ================================================================================================

/// Address translation and region validation
pub use crate::layout::{AddressMap, AddressSpace, Region, RegionReport};

/// Import and base relocation tables
pub use crate::tables::{
    BaseRelocation, BaseRelocationType, ImportName, ImportTable, ImportedModule, RelocationTable,
};

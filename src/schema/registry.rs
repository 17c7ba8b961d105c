use std::{
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use dashmap::DashMap;
use strum::{AsRefStr, Display, EnumCount, EnumIter, IntoEnumIterator};

use crate::{
    pe::{RELOCATION_ENTRY_ROWS, SECTION_HEADER_ROWS},
    schema::{Header, Layout, Row, Schema},
    tables::{BASE_RELOCATION_BLOCK_ROWS, IMPORT_DIRECTORY_ROWS},
    Result,
};

/// A schema shared between all headers of one [`RecordKind`].
pub type SchemaRef = Arc<Schema>;

/// Fixed-layout records that occur many times per image and share one schema.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr, EnumIter, EnumCount,
)]
pub enum RecordKind {
    /// A 40-byte section table entry
    #[strum(to_string = "section header")]
    SectionHeader,
    /// A 10-byte COFF relocation entry
    #[strum(to_string = "COFF relocation entry")]
    RelocationEntry,
    /// A 20-byte import directory table entry
    #[strum(to_string = "import directory entry")]
    ImportDirectoryEntry,
    /// The 8-byte header of a base relocation block
    #[strum(to_string = "base relocation block")]
    BaseRelocationBlock,
}

impl RecordKind {
    /// The field table describing this record.
    #[must_use]
    pub fn rows(self) -> &'static [Row] {
        match self {
            RecordKind::SectionHeader => SECTION_HEADER_ROWS,
            RecordKind::RelocationEntry => RELOCATION_ENTRY_ROWS,
            RecordKind::ImportDirectoryEntry => IMPORT_DIRECTORY_ROWS,
            RecordKind::BaseRelocationBlock => BASE_RELOCATION_BLOCK_ROWS,
        }
    }
}

/// How the schema of a header is managed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeaderKind {
    /// The header owns its schema, assembled block by block while decoding
    HeterogeneousPerInstance,
    /// The header shares the cached schema of its record kind
    HomogeneousCached(RecordKind),
}

impl fmt::Display for HeaderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderKind::HeterogeneousPerInstance => write!(f, "per-instance header"),
            HeaderKind::HomogeneousCached(kind) => write!(f, "{kind}"),
        }
    }
}

/// Thread-safe cache of record schemas.
///
/// Each [`RecordKind`] schema is built on first use and reused for every later record of
/// that kind, including across images and threads. Concurrent first uses of the same kind
/// build it exactly once.
///
/// # Examples
///
/// ```rust
/// use pescope::schema::{RecordKind, SchemaRegistry};
///
/// let registry = SchemaRegistry::new();
/// let first = registry.schema(RecordKind::SectionHeader)?;
/// let second = registry.schema(RecordKind::SectionHeader)?;
///
/// assert_eq!(first.size(), 40);
/// assert!(std::sync::Arc::ptr_eq(&first, &second));
/// assert_eq!(registry.builds(), 1);
/// # Ok::<(), pescope::Error>(())
/// ```
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    cache: DashMap<RecordKind, SchemaRef>,
    builds: AtomicUsize,
}

impl SchemaRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> SchemaRegistry {
        SchemaRegistry::default()
    }

    /// Creates a registry with every record schema already built.
    ///
    /// # Errors
    /// Returns [`crate::Error::Schema`] if a built-in table is malformed.
    pub fn preloaded() -> Result<SchemaRegistry> {
        let registry = SchemaRegistry::new();
        for kind in RecordKind::iter() {
            registry.schema(kind)?;
        }
        Ok(registry)
    }

    /// Returns the schema for `kind`, building it on first use.
    ///
    /// # Errors
    /// Returns [`crate::Error::Schema`] if the table of `kind` is malformed.
    pub fn schema(&self, kind: RecordKind) -> Result<SchemaRef> {
        if let Some(schema) = self.cache.get(&kind) {
            return Ok(Arc::clone(schema.value()));
        }

        let entry = self.cache.entry(kind).or_try_insert_with(|| {
            self.builds.fetch_add(1, Ordering::Relaxed);
            log::debug!("Building schema for {kind}");
            Schema::build(kind.rows(), Layout::Narrow).map(Arc::new)
        })?;

        Ok(Arc::clone(entry.value()))
    }

    /// Decodes one record of `kind` at `offset`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Format`] if the record does not fit into `data`.
    pub fn decode(&self, data: &[u8], offset: usize, kind: RecordKind) -> Result<Header> {
        Header::with_schema(data, offset, kind, self.schema(kind)?)
    }

    /// Decodes `count` consecutive records of `kind` starting at `offset`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Format`] if the records do not fit into `data`.
    pub fn decode_array(
        &self,
        data: &[u8],
        offset: usize,
        count: usize,
        kind: RecordKind,
    ) -> Result<Vec<Header>> {
        let schema = self.schema(kind)?;
        let stride = schema.size();

        (0..count)
            .map(|i| {
                let at = i
                    .checked_mul(stride)
                    .and_then(|delta| offset.checked_add(delta))
                    .ok_or_else(|| format_error!("{} array at {:#x} overflows", kind, offset))?;
                Header::with_schema(data, at, kind, Arc::clone(&schema))
            })
            .collect()
    }

    /// Number of schemas built so far.
    #[must_use]
    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::Relaxed)
    }

    /// Returns `true` if the schema of `kind` has been built.
    #[must_use]
    pub fn is_cached(&self, kind: RecordKind) -> bool {
        self.cache.contains_key(&kind)
    }

    /// Number of cached schemas.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Returns `true` if no schema has been built yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

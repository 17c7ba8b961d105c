//! Declarative binary-structure decoding and encoding.
//!
//! Every header kind in this crate is described by a table of [`Row`]s: offset, byte size,
//! name, optional explicit [`FieldKind`] and documentation. A table is turned into a
//! [`Schema`] (an ordered list of [`FieldDescriptor`]s plus the total byte size) once, and a
//! [`Header`] decoded against it holds the field values and encodes them back into the exact
//! bytes they came from.
//!
//! # Schema lifecycles
//!
//! - **Per instance** ([`HeaderKind::HeterogeneousPerInstance`]): headers whose shape depends
//!   on the file, such as the optional header, are assembled by *accretion*. A fresh
//!   [`Header`] receives several successive [`Header::decode_block`] calls, each appending
//!   descriptors and growing the header size.
//! - **Type cached** ([`HeaderKind::HomogeneousCached`]): fixed records that repeat many times
//!   (section headers, import directory entries, ...) share one schema per [`RecordKind`],
//!   built lazily by a [`SchemaRegistry`] and never rebuilt afterwards.
//!
//! # Width variants
//!
//! A row's offset and size are [`Alt`] pairs. Most rows use the same value in both columns;
//! rows whose layout changes between PE32 and PE32+ carry two values and the [`Layout`]
//! passed at decode time selects the column.
//!
//! # Field kinds
//!
//! Built-in tables declare kinds explicitly. Rows without a kind (for example rows parsed
//! from table text with [`parse_table`]) fall back to [`FieldKind::infer`], a keyword scan
//! over the first sentence of the description.
//!
//! # Examples
//!
//! ```rust
//! use pescope::schema::{decode, parse_table, Layout};
//!
//! let rows = parse_table("0\t2\tMachine\tThe target machine.\n2\t2\tNumberOfSections\tThe number of sections.")?;
//! let data = [0x4C, 0x01, 0x03, 0x00];
//! let header = decode(&data, 0, &rows, Layout::Narrow)?;
//!
//! assert_eq!(header.uint("Machine")?, 0x14C);
//! assert_eq!(header.uint("NumberOfSections")?, 3);
//! assert_eq!(header.encode()?, data);
//! # Ok::<(), pescope::Error>(())
//! ```

mod header;
mod registry;

pub use header::{FieldValue, Header};
pub use registry::{HeaderKind, RecordKind, SchemaRef, SchemaRegistry};

use std::{borrow::Cow, collections::HashMap};

use crate::Result;

/// How the bytes of a field are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum FieldKind {
    /// Little-endian unsigned integer of 1, 2, 4 or 8 bytes
    Unsigned,
    /// Fixed-length, NUL-padded byte string
    Str,
    /// Opaque bytes
    Bytes,
}

impl FieldKind {
    /// Infers the kind of a field from its byte size and description.
    ///
    /// Only the first sentence of `doc` is considered. A word `name` or `string` makes the
    /// field a [`FieldKind::Str`], a word `any` makes it [`FieldKind::Bytes`]; otherwise the
    /// field is an unsigned integer, which requires `size` to be 1, 2, 4 or 8.
    ///
    /// # Errors
    /// Returns [`crate::Error::Schema`] if the field would be an integer of unsupported width.
    pub fn infer(size: usize, doc: &str) -> Result<FieldKind> {
        let sentence = doc.split('.').next().unwrap_or_default();
        for word in sentence.split_whitespace() {
            let word = word.trim_matches(|c: char| !c.is_ascii_alphanumeric());
            if word.eq_ignore_ascii_case("name") || word.eq_ignore_ascii_case("string") {
                return Ok(FieldKind::Str);
            }
            if word.eq_ignore_ascii_case("any") {
                return Ok(FieldKind::Bytes);
            }
        }

        match size {
            1 | 2 | 4 | 8 => Ok(FieldKind::Unsigned),
            _ => Err(schema_error!(
                "cannot infer an integer field of {} bytes from '{}'",
                size,
                sentence
            )),
        }
    }
}

/// Selects the column of [`Alt`] values used while building a schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Layout {
    /// The left column (PE32)
    #[default]
    Narrow,
    /// The right column (PE32+)
    Wide,
}

/// A value that may differ between the [`Layout::Narrow`] and [`Layout::Wide`] layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Alt {
    /// Value used for [`Layout::Narrow`]
    pub narrow: usize,
    /// Value used for [`Layout::Wide`]
    pub wide: usize,
}

impl Alt {
    /// A value shared by both layouts.
    #[must_use]
    pub const fn same(value: usize) -> Alt {
        Alt {
            narrow: value,
            wide: value,
        }
    }

    /// A value that depends on the layout.
    #[must_use]
    pub const fn pair(narrow: usize, wide: usize) -> Alt {
        Alt { narrow, wide }
    }

    /// Returns the value for `layout`.
    #[must_use]
    pub fn pick(self, layout: Layout) -> usize {
        match layout {
            Layout::Narrow => self.narrow,
            Layout::Wide => self.wide,
        }
    }
}

/// One row of a declarative field table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    /// Offset of the field relative to the start of the header
    pub offset: Alt,
    /// Size of the field in bytes
    pub size: Alt,
    /// Field name, unique within a schema
    pub name: Cow<'static, str>,
    /// Explicit kind; `None` falls back to [`FieldKind::infer`]
    pub kind: Option<FieldKind>,
    /// Human readable description
    pub doc: Cow<'static, str>,
}

impl Row {
    /// An unsigned integer field with the same placement in both layouts.
    #[must_use]
    pub const fn uint(offset: usize, size: usize, name: &'static str, doc: &'static str) -> Row {
        Row::variant(Alt::same(offset), Alt::same(size), name, doc)
    }

    /// An unsigned integer field whose placement depends on the layout.
    #[must_use]
    pub const fn variant(offset: Alt, size: Alt, name: &'static str, doc: &'static str) -> Row {
        Row {
            offset,
            size,
            name: Cow::Borrowed(name),
            kind: Some(FieldKind::Unsigned),
            doc: Cow::Borrowed(doc),
        }
    }

    /// A fixed-length string field.
    #[must_use]
    pub const fn string(offset: usize, size: usize, name: &'static str, doc: &'static str) -> Row {
        Row {
            offset: Alt::same(offset),
            size: Alt::same(size),
            name: Cow::Borrowed(name),
            kind: Some(FieldKind::Str),
            doc: Cow::Borrowed(doc),
        }
    }

    /// An opaque byte field.
    #[must_use]
    pub const fn bytes(offset: usize, size: usize, name: &'static str, doc: &'static str) -> Row {
        Row {
            offset: Alt::same(offset),
            size: Alt::same(size),
            name: Cow::Borrowed(name),
            kind: Some(FieldKind::Bytes),
            doc: Cow::Borrowed(doc),
        }
    }

    /// An unsigned integer row with a name computed at runtime.
    #[must_use]
    pub fn owned(offset: Alt, size: Alt, name: String, doc: String) -> Row {
        Row {
            offset,
            size,
            name: Cow::Owned(name),
            kind: Some(FieldKind::Unsigned),
            doc: Cow::Owned(doc),
        }
    }
}

/// A resolved field: placement, name and kind. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    /// Offset relative to the start of the header
    pub offset: usize,
    /// Size in bytes
    pub size: usize,
    /// Field name
    pub name: String,
    /// How the bytes are interpreted
    pub kind: FieldKind,
    /// Description
    pub doc: String,
}

impl FieldDescriptor {
    /// End of the field relative to the start of the header (exclusive).
    #[must_use]
    pub fn end(&self) -> usize {
        self.offset + self.size
    }

    fn resolve(row: &Row, layout: Layout) -> Result<FieldDescriptor> {
        let offset = row.offset.pick(layout);
        let size = row.size.pick(layout);
        if size == 0 {
            return Err(schema_error!("field '{}' has a size of zero", row.name));
        }

        let kind = match row.kind {
            Some(FieldKind::Unsigned) if !matches!(size, 1 | 2 | 4 | 8) => {
                return Err(schema_error!(
                    "field '{}' is an integer of unsupported width {}",
                    row.name,
                    size
                ));
            }
            Some(kind) => kind,
            None => FieldKind::infer(size, &row.doc)?,
        };

        Ok(FieldDescriptor {
            offset,
            size,
            name: row.name.to_string(),
            kind,
            doc: row.doc.to_string(),
        })
    }
}

/// An ordered list of field descriptors plus the total byte size they span.
///
/// The size always equals the largest `offset + size` over all fields. Fields never
/// overlap, but need not be contiguous.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Schema {
    fields: Vec<FieldDescriptor>,
    index: HashMap<String, usize>,
    size: usize,
}

impl Schema {
    /// Builds a schema from a table.
    ///
    /// # Errors
    /// Returns [`crate::Error::Schema`] if a row cannot be resolved, two fields overlap or a
    /// name is used twice.
    pub fn build(rows: &[Row], layout: Layout) -> Result<Schema> {
        let mut schema = Schema::default();
        schema.extend(rows, layout)?;
        Ok(schema)
    }

    /// Appends the fields of another table to this schema.
    ///
    /// # Errors
    /// Returns [`crate::Error::Schema`] under the same conditions as [`Schema::build`], taking
    /// the existing fields into account. On error the schema is left unchanged.
    pub fn extend(&mut self, rows: &[Row], layout: Layout) -> Result<()> {
        let mut added: Vec<FieldDescriptor> = Vec::with_capacity(rows.len());

        for row in rows {
            let field = FieldDescriptor::resolve(row, layout)?;

            if self.index.contains_key(&field.name) || added.iter().any(|f| f.name == field.name)
            {
                return Err(schema_error!("duplicate field '{}'", field.name));
            }

            if let Some(other) = self
                .fields
                .iter()
                .chain(added.iter())
                .find(|other| field.offset < other.end() && other.offset < field.end())
            {
                return Err(schema_error!(
                    "field '{}' ({}..{}) overlaps '{}' ({}..{})",
                    field.name,
                    field.offset,
                    field.end(),
                    other.name,
                    other.offset,
                    other.end()
                ));
            }

            added.push(field);
        }

        for field in added {
            self.size = self.size.max(field.end());
            self.index.insert(field.name.clone(), self.fields.len());
            self.fields.push(field);
        }

        Ok(())
    }

    /// Total byte size spanned by the fields.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// All fields in declaration order.
    #[must_use]
    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    /// Number of fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Returns `true` if the schema has no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Looks up a field by name.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.index.get(name).map(|&i| &self.fields[i])
    }

    /// Position of a field in declaration order.
    #[must_use]
    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }
}

/// Parses table text into rows.
///
/// Each non-blank line holds four tab-separated cells: offset, size, name and description.
/// Offset and size cells may carry a `narrow/wide` pair such as `28/24`. The name is the
/// leading run of letters, digits and spaces of the name cell with the spaces removed, so
/// `Import Table (by DD)` becomes `ImportTable`. Parsed rows carry no explicit kind.
///
/// # Errors
/// Returns [`crate::Error::Schema`] if a line does not have exactly four cells, a number
/// cannot be parsed or a name is empty.
pub fn parse_table(text: &str) -> Result<Vec<Row>> {
    let mut rows = Vec::new();

    for (number, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }

        let cells: Vec<&str> = line.trim().split('\t').map(str::trim).collect();
        let [offset, size, name, doc] = cells.as_slice() else {
            return Err(schema_error!(
                "line {} has {} cells, expected 4",
                number + 1,
                cells.len()
            ));
        };

        let name: String = name
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == ' ')
            .filter(|c| *c != ' ')
            .collect();
        if name.is_empty() {
            return Err(schema_error!("line {} has an empty field name", number + 1));
        }

        rows.push(Row {
            offset: parse_alt(offset, number)?,
            size: parse_alt(size, number)?,
            name: Cow::Owned(name),
            kind: None,
            doc: Cow::Owned((*doc).to_string()),
        });
    }

    Ok(rows)
}

fn parse_alt(cell: &str, line: usize) -> Result<Alt> {
    let parse = |value: &str| {
        value
            .trim()
            .parse::<usize>()
            .map_err(|_| schema_error!("line {} has an invalid number '{}'", line + 1, value))
    };

    match cell.split_once('/') {
        Some((narrow, wide)) => Ok(Alt::pair(parse(narrow)?, parse(wide)?)),
        None => Ok(Alt::same(parse(cell)?)),
    }
}

/// Decodes a header with a per-instance schema built from `rows`.
///
/// This is the single-block form of [`Header::per_instance`] followed by
/// [`Header::decode_block`].
///
/// # Errors
/// Returns [`crate::Error::Schema`] for broken tables and [`crate::Error::Format`] if the
/// header does not fit into `data`.
pub fn decode(data: &[u8], offset: usize, rows: &[Row], layout: Layout) -> Result<Header> {
    let mut header = Header::per_instance(offset);
    header.decode_block(data, rows, layout)?;
    Ok(header)
}

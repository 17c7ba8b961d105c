use std::{borrow::Cow, fmt, ops::Range};

use crate::{
    file::io::{read_uint, write_uint},
    schema::{FieldDescriptor, FieldKind, HeaderKind, Layout, RecordKind, Row, Schema, SchemaRef},
    Result,
};

/// A decoded field value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    /// Value of a [`FieldKind::Unsigned`] field
    Unsigned(u64),
    /// Value of a [`FieldKind::Str`] field, trailing NUL padding removed
    Str(Vec<u8>),
    /// Value of a [`FieldKind::Bytes`] field
    Bytes(Vec<u8>),
}

impl FieldValue {
    /// The integer value, if this is an unsigned field.
    #[must_use]
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            FieldValue::Unsigned(value) => Some(*value),
            _ => None,
        }
    }

    /// The raw bytes, if this is a string or byte field.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            FieldValue::Str(bytes) | FieldValue::Bytes(bytes) => Some(bytes.as_slice()),
            FieldValue::Unsigned(_) => None,
        }
    }

    /// The kind of field this value belongs to.
    #[must_use]
    pub fn kind(&self) -> FieldKind {
        match self {
            FieldValue::Unsigned(_) => FieldKind::Unsigned,
            FieldValue::Str(_) => FieldKind::Str,
            FieldValue::Bytes(_) => FieldKind::Bytes,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Unsigned(value) => write!(f, "{value:#x}"),
            FieldValue::Str(bytes) => write!(f, "{}", String::from_utf8_lossy(bytes)),
            FieldValue::Bytes(bytes) => {
                for byte in bytes {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone)]
enum SchemaSlot {
    Instance(Schema),
    Cached(SchemaRef),
}

impl SchemaSlot {
    fn get(&self) -> &Schema {
        match self {
            SchemaSlot::Instance(schema) => schema,
            SchemaSlot::Cached(schema) => schema.as_ref(),
        }
    }
}

/// A decoded header: a schema bound to a start offset and one value per field.
///
/// The header keeps a copy of the bytes it was decoded from, so that [`Header::encode`]
/// reproduces bytes in gaps between fields unchanged.
#[derive(Debug, Clone)]
pub struct Header {
    kind: HeaderKind,
    schema: SchemaSlot,
    start: usize,
    values: Vec<FieldValue>,
    baseline: Vec<u8>,
}

impl Header {
    /// Creates an empty header with its own schema, ready for accretion through
    /// [`Header::decode_block`].
    #[must_use]
    pub fn per_instance(start: usize) -> Header {
        Header {
            kind: HeaderKind::HeterogeneousPerInstance,
            schema: SchemaSlot::Instance(Schema::default()),
            start,
            values: Vec::new(),
            baseline: Vec::new(),
        }
    }

    /// Decodes a header of a fixed record kind against a shared schema.
    ///
    /// Usually called through [`crate::schema::SchemaRegistry::decode`].
    ///
    /// # Errors
    /// Returns [`crate::Error::Format`] if the record does not fit into `data`.
    pub fn with_schema(
        data: &[u8],
        start: usize,
        kind: RecordKind,
        schema: SchemaRef,
    ) -> Result<Header> {
        let range = checked_range(data, start, schema.size(), kind.as_ref())?;
        let values = decode_values(&data[range.clone()], schema.fields())?;

        Ok(Header {
            kind: HeaderKind::HomogeneousCached(kind),
            baseline: data[range].to_vec(),
            schema: SchemaSlot::Cached(schema),
            start,
            values,
        })
    }

    /// Decodes another block of fields and appends it to this header.
    ///
    /// The rows are resolved with `layout`, checked against the fields already present and
    /// decoded from `data` relative to the header start. The header size grows to cover
    /// the new fields.
    ///
    /// # Errors
    /// Returns [`crate::Error::Schema`] if the header uses a shared schema or the rows
    /// conflict with existing fields, and [`crate::Error::Format`] if the grown header does
    /// not fit into `data`. On error the header is unchanged.
    pub fn decode_block(&mut self, data: &[u8], rows: &[Row], layout: Layout) -> Result<()> {
        let SchemaSlot::Instance(current) = &self.schema else {
            return Err(schema_error!(
                "cannot extend the shared schema of a {}",
                self.kind
            ));
        };

        let mut schema = current.clone();
        schema.extend(rows, layout)?;

        let range = checked_range(data, self.start, schema.size(), "header")?;
        let bytes = &data[range];
        let added = decode_values(bytes, &schema.fields()[current.len()..])?;

        self.values.extend(added);
        self.baseline = bytes.to_vec();
        self.schema = SchemaSlot::Instance(schema);
        Ok(())
    }

    /// How this header's schema is managed.
    #[must_use]
    pub fn kind(&self) -> HeaderKind {
        self.kind
    }

    /// The schema this header was decoded with.
    #[must_use]
    pub fn schema(&self) -> &Schema {
        self.schema.get()
    }

    /// File offset of the first byte.
    #[must_use]
    pub fn start(&self) -> usize {
        self.start
    }

    /// Byte size, equal to the schema size.
    #[must_use]
    pub fn size(&self) -> usize {
        self.schema().size()
    }

    /// File offset one past the last byte.
    #[must_use]
    pub fn end(&self) -> usize {
        self.start + self.size()
    }

    /// File range covered by this header.
    #[must_use]
    pub fn range(&self) -> Range<usize> {
        self.start..self.end()
    }

    /// Returns the value of a field.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.schema().position(name).map(|i| &self.values[i])
    }

    /// Returns the value of an unsigned field.
    ///
    /// # Errors
    /// Returns [`crate::Error::Schema`] if there is no such field or it is not unsigned.
    pub fn uint(&self, name: &str) -> Result<u64> {
        match self.get(name) {
            Some(FieldValue::Unsigned(value)) => Ok(*value),
            Some(other) => Err(schema_error!(
                "field '{}' is {}, not an integer",
                name,
                other.kind()
            )),
            None => Err(schema_error!("no field '{}' in {}", name, self.kind)),
        }
    }

    /// Returns the value of a field that is at most 32 bits wide.
    ///
    /// # Errors
    /// Returns [`crate::Error::Schema`] if there is no such field or it is wider.
    pub fn u32(&self, name: &str) -> Result<u32> {
        u32::try_from(self.uint(name)?)
            .map_err(|_| schema_error!("field '{}' does not fit into 32 bits", name))
    }

    /// Returns the value of a field that is at most 16 bits wide.
    ///
    /// # Errors
    /// Returns [`crate::Error::Schema`] if there is no such field or it is wider.
    pub fn u16(&self, name: &str) -> Result<u16> {
        u16::try_from(self.uint(name)?)
            .map_err(|_| schema_error!("field '{}' does not fit into 16 bits", name))
    }

    /// Returns a string field, decoded lossily as UTF-8.
    ///
    /// # Errors
    /// Returns [`crate::Error::Schema`] if there is no such field or it is an integer.
    pub fn text(&self, name: &str) -> Result<Cow<'_, str>> {
        match self.get(name).and_then(FieldValue::as_bytes) {
            Some(bytes) => Ok(String::from_utf8_lossy(bytes)),
            None => Err(schema_error!("no string field '{}' in {}", name, self.kind)),
        }
    }

    /// The bytes a field was decoded from.
    #[must_use]
    pub fn raw(&self, name: &str) -> Option<&[u8]> {
        let field = self.schema().field(name)?;
        self.baseline.get(field.offset..field.end())
    }

    /// Replaces the value of a field.
    ///
    /// # Errors
    /// Returns [`crate::Error::Schema`] if there is no such field, the value has the wrong
    /// kind or does not fit the field.
    pub fn set(&mut self, name: &str, value: FieldValue) -> Result<()> {
        let Some(index) = self.schema().position(name) else {
            return Err(schema_error!("no field '{}' in {}", name, self.kind));
        };

        check_value(&self.schema().fields()[index], &value)?;
        self.values[index] = value;
        Ok(())
    }

    /// Replaces the value of an unsigned field.
    ///
    /// # Errors
    /// Same as [`Header::set`].
    pub fn set_uint(&mut self, name: &str, value: u64) -> Result<()> {
        self.set(name, FieldValue::Unsigned(value))
    }

    /// Iterates over all fields and their current values in declaration order.
    pub fn fields(&self) -> impl Iterator<Item = (&FieldDescriptor, &FieldValue)> {
        self.schema().fields().iter().zip(self.values.iter())
    }

    /// Returns `true` if any field differs from the decoded bytes.
    ///
    /// # Errors
    /// Propagates encoding failures.
    pub fn is_modified(&self) -> Result<bool> {
        Ok(self.encode()? != self.baseline)
    }

    /// Encodes the header into exactly [`Header::size`] bytes.
    ///
    /// Integers are written little-endian at their full width, strings are padded with
    /// zeros, and gaps between fields keep the bytes the header was decoded from.
    ///
    /// # Errors
    /// Returns [`crate::Error::Schema`] if a value no longer fits its field.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buffer = self.baseline.clone();

        for (field, value) in self.fields() {
            match value {
                FieldValue::Unsigned(value) => {
                    write_uint(&mut buffer, field.offset, field.size, *value)?;
                }
                FieldValue::Str(bytes) | FieldValue::Bytes(bytes) => {
                    check_value(field, value)?;
                    let target = &mut buffer[field.offset..field.end()];
                    target.fill(0);
                    target[..bytes.len()].copy_from_slice(bytes);
                }
            }
        }

        Ok(buffer)
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} @ {:#x} ({} bytes)", self.kind, self.start, self.size())?;
        for (field, value) in self.fields() {
            writeln!(
                f,
                "  {:#06x} {:>2} {:<28} {}",
                field.offset, field.size, field.name, value
            )?;
        }
        Ok(())
    }
}

fn checked_range(data: &[u8], start: usize, size: usize, what: &str) -> Result<Range<usize>> {
    match start.checked_add(size) {
        Some(end) if end <= data.len() => Ok(start..end),
        _ => Err(format_error!(
            "{} at {:#x} needs {} bytes, but the input has only {}",
            what,
            start,
            size,
            data.len()
        )),
    }
}

fn decode_values(bytes: &[u8], fields: &[FieldDescriptor]) -> Result<Vec<FieldValue>> {
    fields
        .iter()
        .map(|field| {
            let raw = &bytes[field.offset..field.end()];
            Ok(match field.kind {
                FieldKind::Unsigned => FieldValue::Unsigned(read_uint(bytes, field.offset, field.size)?),
                FieldKind::Str => {
                    let len = raw.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
                    FieldValue::Str(raw[..len].to_vec())
                }
                FieldKind::Bytes => FieldValue::Bytes(raw.to_vec()),
            })
        })
        .collect()
}

fn check_value(field: &FieldDescriptor, value: &FieldValue) -> Result<()> {
    match (field.kind, value) {
        (FieldKind::Unsigned, FieldValue::Unsigned(v)) => {
            if field.size < 8 && v >> (field.size * 8) != 0 {
                return Err(schema_error!(
                    "value {:#x} does not fit into the {}-byte field '{}'",
                    v,
                    field.size,
                    field.name
                ));
            }
        }
        (FieldKind::Str, FieldValue::Str(bytes)) => {
            if bytes.len() > field.size {
                return Err(schema_error!(
                    "string of {} bytes does not fit into the {}-byte field '{}'",
                    bytes.len(),
                    field.size,
                    field.name
                ));
            }
        }
        (FieldKind::Bytes, FieldValue::Bytes(bytes)) => {
            if bytes.len() != field.size {
                return Err(schema_error!(
                    "field '{}' needs exactly {} bytes, got {}",
                    field.name,
                    field.size,
                    bytes.len()
                ));
            }
        }
        (kind, other) => {
            return Err(schema_error!(
                "field '{}' is {}, got a {} value",
                field.name,
                kind,
                other.kind()
            ));
        }
    }
    Ok(())
}

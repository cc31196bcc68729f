//! Fixed-width record model: field types, schemas and records.
//!
//! Every record of a schema serializes to exactly `record_width()` bytes, which
//! is what lets a page carve itself into equal slots.

use std::fmt;

use bytes::{Buf, BufMut};

use crate::page::RecordId;
use crate::{Result, StorageError};

/// Byte length of a text field when the schema does not say otherwise.
pub const DEFAULT_TEXT_LEN: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    /// 32-bit signed integer, stored big-endian.
    Int,
    /// Text of at most the given number of bytes, stored as a 4-byte
    /// big-endian length followed by the zero-padded bytes.
    Text(usize),
}

impl FieldType {
    pub fn text() -> Self {
        FieldType::Text(DEFAULT_TEXT_LEN)
    }

    /// On-disk width in bytes.
    pub fn width(&self) -> usize {
        match self {
            FieldType::Int => 4,
            FieldType::Text(max_len) => 4 + max_len,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::Int => write!(f, "int"),
            FieldType::Text(n) => write!(f, "text({})", n),
        }
    }
}

#[derive(Debug, Clone)]
struct FieldDef {
    field_type: FieldType,
    name: Option<String>,
}

/// Ordered field layout shared by every record of a table.
#[derive(Debug, Clone)]
pub struct Schema {
    fields: Vec<FieldDef>,
}

impl Schema {
    /// Anonymous fields. A schema needs at least one field.
    pub fn new(types: Vec<FieldType>) -> Result<Self> {
        if types.is_empty() {
            return Err(StorageError::InvalidArgument(
                "schema must have at least one field".to_string(),
            ));
        }
        Ok(Self {
            fields: types
                .into_iter()
                .map(|field_type| FieldDef {
                    field_type,
                    name: None,
                })
                .collect(),
        })
    }

    pub fn with_names(fields: Vec<(FieldType, &str)>) -> Result<Self> {
        let mut schema = Self::new(fields.iter().map(|(t, _)| *t).collect())?;
        for (def, (_, name)) in schema.fields.iter_mut().zip(fields) {
            def.name = Some(name.to_string());
        }
        Ok(schema)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn field_type(&self, index: usize) -> Option<FieldType> {
        self.fields.get(index).map(|f| f.field_type)
    }

    pub fn field_name(&self, index: usize) -> Option<&str> {
        self.fields.get(index).and_then(|f| f.name.as_deref())
    }

    /// Index of the first field carrying `name`.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields
            .iter()
            .position(|f| f.name.as_deref() == Some(name))
    }

    pub fn field_types(&self) -> impl Iterator<Item = FieldType> + '_ {
        self.fields.iter().map(|f| f.field_type)
    }

    /// Sum of the field widths; the slot width of pages holding this schema.
    pub fn record_width(&self) -> usize {
        self.field_types().map(|t| t.width()).sum()
    }

    /// Concatenation of `first`'s fields followed by `second`'s.
    pub fn merge(first: &Schema, second: &Schema) -> Schema {
        let mut fields = first.fields.clone();
        fields.extend(second.fields.iter().cloned());
        Schema { fields }
    }
}

/// Schemas are equal when their field types line up; names are ignored.
impl PartialEq for Schema {
    fn eq(&self, other: &Self) -> bool {
        self.field_types().eq(other.field_types())
    }
}

impl Eq for Schema {}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, def) in self.fields.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}({})", def.field_type, def.name.as_deref().unwrap_or(""))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Value {
    Int(i32),
    Text(String),
}

impl Value {
    pub fn matches(&self, field_type: FieldType) -> bool {
        match (self, field_type) {
            (Value::Int(_), FieldType::Int) => true,
            (Value::Text(s), FieldType::Text(max_len)) => s.len() <= max_len,
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(i) => write!(f, "{}", i),
            Value::Text(s) => write!(f, "{}", s),
        }
    }
}

/// A row of values plus, once stored, the slot it lives in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    fields: Vec<Value>,
    rid: Option<RecordId>,
}

impl Record {
    pub fn new(fields: Vec<Value>) -> Self {
        Self { fields, rid: None }
    }

    pub fn fields(&self) -> &[Value] {
        &self.fields
    }

    pub fn field(&self, index: usize) -> Option<&Value> {
        self.fields.get(index)
    }

    pub fn set_field(&mut self, index: usize, value: Value) -> Result<()> {
        let slot = self.fields.get_mut(index).ok_or_else(|| {
            StorageError::InvalidArgument(format!("field index {} out of range", index))
        })?;
        *slot = value;
        Ok(())
    }

    pub fn rid(&self) -> Option<RecordId> {
        self.rid
    }

    pub fn set_rid(&mut self, rid: Option<RecordId>) {
        self.rid = rid;
    }

    /// Checks arity, types and text lengths against `schema`.
    pub fn conforms_to(&self, schema: &Schema) -> bool {
        self.fields.len() == schema.len()
            && self
                .fields
                .iter()
                .zip(schema.field_types())
                .all(|(v, t)| v.matches(t))
    }

    /// Writes exactly `schema.record_width()` bytes.
    pub(crate) fn encode_into(&self, schema: &Schema, buf: &mut impl BufMut) -> Result<()> {
        if !self.conforms_to(schema) {
            return Err(StorageError::SchemaMismatch(format!(
                "record [{}] does not fit schema [{}]",
                self, schema
            )));
        }
        for (value, field_type) in self.fields.iter().zip(schema.field_types()) {
            match (value, field_type) {
                (Value::Int(i), FieldType::Int) => buf.put_i32(*i),
                (Value::Text(s), FieldType::Text(max_len)) => {
                    buf.put_u32(s.len() as u32);
                    buf.put_slice(s.as_bytes());
                    buf.put_bytes(0, max_len - s.len());
                }
                _ => unreachable!("checked by conforms_to"),
            }
        }
        Ok(())
    }

    /// Reads one record of `schema` from the front of `buf`.
    pub(crate) fn decode_from(schema: &Schema, mut buf: &[u8]) -> Result<Self> {
        if buf.len() < schema.record_width() {
            return Err(StorageError::Corrupt(format!(
                "slot holds {} bytes, schema needs {}",
                buf.len(),
                schema.record_width()
            )));
        }
        let mut fields = Vec::with_capacity(schema.len());
        for field_type in schema.field_types() {
            match field_type {
                FieldType::Int => fields.push(Value::Int(buf.get_i32())),
                FieldType::Text(max_len) => {
                    let len = buf.get_u32() as usize;
                    if len > max_len {
                        return Err(StorageError::Corrupt(format!(
                            "text length {} exceeds field width {}",
                            len, max_len
                        )));
                    }
                    let text = std::str::from_utf8(&buf[..len])
                        .map_err(|e| StorageError::Corrupt(format!("invalid utf-8 text: {}", e)))?
                        .to_string();
                    buf.advance(max_len);
                    fields.push(Value::Text(text));
                }
            }
        }
        Ok(Self::new(fields))
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, value) in self.fields.iter().enumerate() {
            if i > 0 {
                write!(f, "\t")?;
            }
            write!(f, "{}", value)?;
        }
        Ok(())
    }
}

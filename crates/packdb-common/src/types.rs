//! Common type definitions for PackDB
//!
//! Schema, scalar values and the row codec used by the storage core.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{QueryError, Result};

// ============================================================================
// Field Types and Values
// ============================================================================

/// Column data type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldType {
    Uint64,
    Int64,
    Float64,
    Boolean,
    String,
    Bytes,
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldType::Uint64 => "uint64",
            FieldType::Int64 => "int64",
            FieldType::Float64 => "float64",
            FieldType::Boolean => "boolean",
            FieldType::String => "string",
            FieldType::Bytes => "bytes",
        };
        f.write_str(name)
    }
}

/// A single typed scalar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Uint64(u64),
    Int64(i64),
    Float64(f64),
    Boolean(bool),
    String(String),
    Bytes(Vec<u8>),
}

impl Value {
    #[must_use]
    pub fn field_type(&self) -> FieldType {
        match self {
            Value::Uint64(_) => FieldType::Uint64,
            Value::Int64(_) => FieldType::Int64,
            Value::Float64(_) => FieldType::Float64,
            Value::Boolean(_) => FieldType::Boolean,
            Value::String(_) => FieldType::String,
            Value::Bytes(_) => FieldType::Bytes,
        }
    }

    /// Zero value of a type, used for freshly allocated rows.
    #[must_use]
    pub fn zero(typ: FieldType) -> Self {
        match typ {
            FieldType::Uint64 => Value::Uint64(0),
            FieldType::Int64 => Value::Int64(0),
            FieldType::Float64 => Value::Float64(0.0),
            FieldType::Boolean => Value::Boolean(false),
            FieldType::String => Value::String(String::new()),
            FieldType::Bytes => Value::Bytes(Vec::new()),
        }
    }

    /// Total order between values of the same type; `None` across types.
    /// Floats compare with `total_cmp` so NaN has a stable position.
    #[must_use]
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Uint64(a), Value::Uint64(b)) => Some(a.cmp(b)),
            (Value::Int64(a), Value::Int64(b)) => Some(a.cmp(b)),
            (Value::Float64(a), Value::Float64(b)) => Some(a.total_cmp(b)),
            (Value::Boolean(a), Value::Boolean(b)) => Some(a.cmp(b)),
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            (Value::Bytes(a), Value::Bytes(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Uint64(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int64(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float64(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(v) => Some(v.as_str()),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(v) => Some(v.as_slice()),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Uint64(v) => write!(f, "{v}"),
            Value::Int64(v) => write!(f, "{v}"),
            Value::Float64(v) => write!(f, "{v}"),
            Value::Boolean(v) => write!(f, "{v}"),
            Value::String(v) => write!(f, "{v:?}"),
            Value::Bytes(v) => write!(f, "0x{}", v.iter().map(|b| format!("{b:02x}")).collect::<String>()),
        }
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Uint64(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float64(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

// ============================================================================
// Schema
// ============================================================================

/// Secondary index flavour attached to a field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexKind {
    /// Order-preserving 8-byte key, exact
    Integer,
    /// xxh3 hash of the value, may collide
    Hash,
}

/// A named, typed column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub typ: FieldType,
    #[serde(default)]
    pub primary: bool,
    #[serde(default)]
    pub index: Option<IndexKind>,
}

impl Field {
    pub fn new(name: impl Into<String>, typ: FieldType) -> Self {
        Self {
            name: name.into(),
            typ,
            primary: false,
            index: None,
        }
    }

    /// The uint64 primary key column
    pub fn primary(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            typ: FieldType::Uint64,
            primary: true,
            index: None,
        }
    }

    #[must_use]
    pub fn with_index(mut self, kind: IndexKind) -> Self {
        self.index = Some(kind);
        self
    }
}

/// Ordered field list with exactly one uint64 primary key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    fields: Vec<Field>,
    pk_index: usize,
}

impl Schema {
    /// Build a schema, checking the primary key constraint.
    pub fn new(fields: Vec<Field>) -> Result<Self> {
        let mut pk_index = None;
        for (i, f) in fields.iter().enumerate() {
            if f.primary {
                if pk_index.is_some() {
                    return Err(QueryError::InvalidCondition(format!(
                        "schema has more than one primary key ({})",
                        f.name
                    ))
                    .into());
                }
                if f.typ != FieldType::Uint64 {
                    return Err(QueryError::TypeMismatch {
                        expected: FieldType::Uint64.to_string(),
                        actual: f.typ.to_string(),
                    }
                    .into());
                }
                pk_index = Some(i);
            }
        }
        let pk_index = pk_index.ok_or(QueryError::MissingPrimaryKey)?;
        Ok(Self { fields, pk_index })
    }

    #[must_use]
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    #[must_use]
    pub fn field(&self, i: usize) -> &Field {
        &self.fields[i]
    }

    #[must_use]
    pub fn pk_index(&self) -> usize {
        self.pk_index
    }

    #[must_use]
    pub fn position(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Resolve a field name or fail with `UnknownColumn`.
    pub fn resolve(&self, name: &str) -> Result<usize> {
        self.position(name)
            .ok_or_else(|| QueryError::UnknownColumn(name.to_string()).into())
    }

    /// Projection of this schema onto the given positions. The primary key
    /// is always kept.
    pub fn select(&self, positions: &[usize]) -> Result<Self> {
        let mut fields = Vec::with_capacity(positions.len() + 1);
        if !positions.contains(&self.pk_index) {
            fields.push(self.fields[self.pk_index].clone());
        }
        for &p in positions {
            fields.push(self.fields[p].clone());
        }
        Self::new(fields)
    }

    /// Check that a row matches this schema's arity and types.
    pub fn check_row(&self, row: &Row) -> Result<()> {
        if row.len() != self.fields.len() {
            return Err(QueryError::InvalidCondition(format!(
                "row has {} values, schema has {} fields",
                row.len(),
                self.fields.len()
            ))
            .into());
        }
        for (f, v) in self.fields.iter().zip(row.iter()) {
            if v.field_type() != f.typ {
                return Err(QueryError::TypeMismatch {
                    expected: f.typ.to_string(),
                    actual: v.field_type().to_string(),
                }
                .into());
            }
        }
        Ok(())
    }
}

// ============================================================================
// Rows and Record Codec
// ============================================================================

/// Values in schema order
pub type Row = Vec<Value>;

/// Explicit schema-to-accessor codec for typed rows.
///
/// Implementors map their struct fields onto a [`Schema`] by hand, which
/// keeps the storage core free of any runtime reflection.
pub trait Record: Sized {
    /// Schema describing the row layout produced by [`Record::to_row`].
    fn schema() -> Schema;

    /// Primary key, 0 when not yet assigned.
    fn pk(&self) -> u64;

    fn set_pk(&mut self, pk: u64);

    fn to_row(&self) -> Row;

    fn from_row(row: &Row) -> Result<Self>;
}

/// Typed accessor helpers for [`Record::from_row`] implementations.
pub fn get_u64(row: &Row, i: usize) -> Result<u64> {
    row.get(i).and_then(Value::as_u64).ok_or_else(|| mismatch(row, i, FieldType::Uint64))
}

pub fn get_i64(row: &Row, i: usize) -> Result<i64> {
    row.get(i).and_then(Value::as_i64).ok_or_else(|| mismatch(row, i, FieldType::Int64))
}

pub fn get_f64(row: &Row, i: usize) -> Result<f64> {
    row.get(i).and_then(Value::as_f64).ok_or_else(|| mismatch(row, i, FieldType::Float64))
}

pub fn get_bool(row: &Row, i: usize) -> Result<bool> {
    row.get(i).and_then(Value::as_bool).ok_or_else(|| mismatch(row, i, FieldType::Boolean))
}

pub fn get_string(row: &Row, i: usize) -> Result<String> {
    row.get(i)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| mismatch(row, i, FieldType::String))
}

pub fn get_bytes(row: &Row, i: usize) -> Result<Vec<u8>> {
    row.get(i)
        .and_then(Value::as_bytes)
        .map(<[u8]>::to_vec)
        .ok_or_else(|| mismatch(row, i, FieldType::Bytes))
}

fn mismatch(row: &Row, i: usize, expected: FieldType) -> crate::error::Error {
    QueryError::TypeMismatch {
        expected: expected.to_string(),
        actual: row
            .get(i)
            .map_or_else(|| "missing".to_string(), |v| v.field_type().to_string()),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_schema() -> Schema {
        Schema::new(vec![
            Field::primary("id"),
            Field::new("name", FieldType::String),
            Field::new("score", FieldType::Float64).with_index(IndexKind::Hash),
        ])
        .unwrap()
    }

    #[test]
    fn test_schema_requires_single_uint64_pk() {
        assert!(Schema::new(vec![Field::new("a", FieldType::Int64)]).is_err());
        assert!(Schema::new(vec![Field::primary("a"), Field::primary("b")]).is_err());
        let bad = Field {
            typ: FieldType::String,
            ..Field::primary("a")
        };
        assert!(Schema::new(vec![bad]).is_err());
        assert_eq!(test_schema().pk_index(), 0);
    }

    #[test]
    fn test_select_keeps_pk() {
        let schema = test_schema();
        let sub = schema.select(&[1]).unwrap();
        assert_eq!(sub.len(), 2);
        assert_eq!(sub.field(0).name, "id");
        assert_eq!(sub.field(1).name, "name");
        assert_eq!(sub.pk_index(), 0);
    }

    #[test]
    fn test_check_row() {
        let schema = test_schema();
        let good = vec![Value::Uint64(1), "a".into(), Value::Float64(1.0)];
        assert!(schema.check_row(&good).is_ok());
        let bad = vec![Value::Uint64(1), Value::Int64(2), Value::Float64(1.0)];
        assert!(schema.check_row(&bad).is_err());
        assert!(schema.check_row(&vec![Value::Uint64(1)]).is_err());
    }

    #[test]
    fn test_value_compare() {
        assert_eq!(Value::Int64(-1).compare(&Value::Int64(2)), Some(Ordering::Less));
        assert_eq!(Value::from("b").compare(&Value::from("a")), Some(Ordering::Greater));
        assert_eq!(Value::Uint64(1).compare(&Value::Int64(1)), None);
        assert_eq!(
            Value::Float64(f64::NAN).compare(&Value::Float64(1.0)),
            Some(Ordering::Greater)
        );
    }

    #[test]
    fn test_accessors() {
        let row = vec![Value::Uint64(3), "x".into(), Value::Float64(2.5)];
        assert_eq!(get_u64(&row, 0).unwrap(), 3);
        assert_eq!(get_string(&row, 1).unwrap(), "x");
        assert!(get_i64(&row, 2).is_err());
        assert!(get_bool(&row, 9).is_err());
    }
}

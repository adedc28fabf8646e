//! Typed column blocks
//!
//! A [`Block`] holds the values of one column of a pack. All row movement
//! during flush (append, out-of-order insert, overwrite, delete, split)
//! happens block by block through the helpers below.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use packdb_common::error::{Error, QueryError, Result};
use packdb_common::types::{FieldType, Value};

/// One column of a pack
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Block {
    Uint64(Vec<u64>),
    Int64(Vec<i64>),
    Float64(Vec<f64>),
    Boolean(Vec<bool>),
    String(Vec<String>),
    Bytes(Vec<Vec<u8>>),
}

/// Apply the same expression to the inner vector of any block variant.
macro_rules! with_vec {
    ($block:expr, $v:ident => $body:expr) => {
        match $block {
            Block::Uint64($v) => $body,
            Block::Int64($v) => $body,
            Block::Float64($v) => $body,
            Block::Boolean($v) => $body,
            Block::String($v) => $body,
            Block::Bytes($v) => $body,
        }
    };
}

/// Apply an expression to two blocks of the same variant, or fail.
macro_rules! with_pair {
    ($dst:expr, $src:expr, ($d:ident, $s:ident) => $body:expr) => {
        match ($dst, $src) {
            (Block::Uint64($d), Block::Uint64($s)) => $body,
            (Block::Int64($d), Block::Int64($s)) => $body,
            (Block::Float64($d), Block::Float64($s)) => $body,
            (Block::Boolean($d), Block::Boolean($s)) => $body,
            (Block::String($d), Block::String($s)) => $body,
            (Block::Bytes($d), Block::Bytes($s)) => $body,
            (d, s) => return Err(type_error(d.field_type(), s.field_type())),
        }
    };
}

impl Block {
    /// Empty block of the given type with room for `cap` values
    #[must_use]
    pub fn new(typ: FieldType, cap: usize) -> Self {
        match typ {
            FieldType::Uint64 => Block::Uint64(Vec::with_capacity(cap)),
            FieldType::Int64 => Block::Int64(Vec::with_capacity(cap)),
            FieldType::Float64 => Block::Float64(Vec::with_capacity(cap)),
            FieldType::Boolean => Block::Boolean(Vec::with_capacity(cap)),
            FieldType::String => Block::String(Vec::with_capacity(cap)),
            FieldType::Bytes => Block::Bytes(Vec::with_capacity(cap)),
        }
    }

    #[must_use]
    pub fn field_type(&self) -> FieldType {
        match self {
            Block::Uint64(_) => FieldType::Uint64,
            Block::Int64(_) => FieldType::Int64,
            Block::Float64(_) => FieldType::Float64,
            Block::Boolean(_) => FieldType::Boolean,
            Block::String(_) => FieldType::String,
            Block::Bytes(_) => FieldType::Bytes,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        with_vec!(self, v => v.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Primary key columns are always uint64
    #[must_use]
    pub fn as_u64(&self) -> Option<&[u64]> {
        match self {
            Block::Uint64(v) => Some(v),
            _ => None,
        }
    }

    /// Value at row `i`; panics when out of range like slice indexing.
    #[must_use]
    pub fn get(&self, i: usize) -> Value {
        match self {
            Block::Uint64(v) => Value::Uint64(v[i]),
            Block::Int64(v) => Value::Int64(v[i]),
            Block::Float64(v) => Value::Float64(v[i]),
            Block::Boolean(v) => Value::Boolean(v[i]),
            Block::String(v) => Value::String(v[i].clone()),
            Block::Bytes(v) => Value::Bytes(v[i].clone()),
        }
    }

    pub fn push(&mut self, val: &Value) -> Result<()> {
        match (self, val) {
            (Block::Uint64(v), Value::Uint64(x)) => v.push(*x),
            (Block::Int64(v), Value::Int64(x)) => v.push(*x),
            (Block::Float64(v), Value::Float64(x)) => v.push(*x),
            (Block::Boolean(v), Value::Boolean(x)) => v.push(*x),
            (Block::String(v), Value::String(x)) => v.push(x.clone()),
            (Block::Bytes(v), Value::Bytes(x)) => v.push(x.clone()),
            (b, x) => return Err(type_error(b.field_type(), x.field_type())),
        }
        Ok(())
    }

    pub fn set(&mut self, i: usize, val: &Value) -> Result<()> {
        match (self, val) {
            (Block::Uint64(v), Value::Uint64(x)) => v[i] = *x,
            (Block::Int64(v), Value::Int64(x)) => v[i] = *x,
            (Block::Float64(v), Value::Float64(x)) => v[i] = *x,
            (Block::Boolean(v), Value::Boolean(x)) => v[i] = *x,
            (Block::String(v), Value::String(x)) => v[i].clone_from(x),
            (Block::Bytes(v), Value::Bytes(x)) => v[i].clone_from(x),
            (b, x) => return Err(type_error(b.field_type(), x.field_type())),
        }
        Ok(())
    }

    /// Append `n` values of `src` starting at `pos`
    pub fn append_from(&mut self, src: &Block, pos: usize, n: usize) -> Result<()> {
        with_pair!(self, src, (d, s) => d.extend_from_slice(&s[pos..pos + n]));
        Ok(())
    }

    /// Insert `n` values of `src` starting at `src_pos` before row `dst_pos`
    pub fn insert_from(&mut self, src: &Block, dst_pos: usize, src_pos: usize, n: usize) -> Result<()> {
        with_pair!(self, src, (d, s) => {
            let tail = d.split_off(dst_pos);
            d.extend_from_slice(&s[src_pos..src_pos + n]);
            d.extend(tail);
        });
        Ok(())
    }

    /// Overwrite `n` rows starting at `dst_pos` with values from `src`
    pub fn replace_from(&mut self, src: &Block, dst_pos: usize, src_pos: usize, n: usize) -> Result<()> {
        with_pair!(self, src, (d, s) => d[dst_pos..dst_pos + n].clone_from_slice(&s[src_pos..src_pos + n]));
        Ok(())
    }

    /// Remove `n` rows starting at `pos`
    pub fn delete(&mut self, pos: usize, n: usize) {
        with_vec!(self, v => {
            v.drain(pos..pos + n);
        });
    }

    /// Move rows `at..` into a new block
    #[must_use]
    pub fn split_off(&mut self, at: usize) -> Block {
        match self {
            Block::Uint64(v) => Block::Uint64(v.split_off(at)),
            Block::Int64(v) => Block::Int64(v.split_off(at)),
            Block::Float64(v) => Block::Float64(v.split_off(at)),
            Block::Boolean(v) => Block::Boolean(v.split_off(at)),
            Block::String(v) => Block::String(v.split_off(at)),
            Block::Bytes(v) => Block::Bytes(v.split_off(at)),
        }
    }

    pub fn clear(&mut self) {
        with_vec!(self, v => v.clear());
    }

    /// Compare row `i` against a scalar without allocating. `None` when
    /// the scalar has a different type.
    #[must_use]
    pub fn cmp_at(&self, i: usize, val: &Value) -> Option<Ordering> {
        match (self, val) {
            (Block::Uint64(v), Value::Uint64(x)) => Some(v[i].cmp(x)),
            (Block::Int64(v), Value::Int64(x)) => Some(v[i].cmp(x)),
            (Block::Float64(v), Value::Float64(x)) => Some(v[i].total_cmp(x)),
            (Block::Boolean(v), Value::Boolean(x)) => Some(v[i].cmp(x)),
            (Block::String(v), Value::String(x)) => Some(v[i].as_str().cmp(x.as_str())),
            (Block::Bytes(v), Value::Bytes(x)) => Some(v[i].as_slice().cmp(x.as_slice())),
            _ => None,
        }
    }

    /// String view of row `i` for regular expression matching
    #[must_use]
    pub fn str_at(&self, i: usize) -> Option<&str> {
        match self {
            Block::String(v) => Some(v[i].as_str()),
            Block::Bytes(v) => std::str::from_utf8(&v[i]).ok(),
            _ => None,
        }
    }

    /// True when row `i` of self equals row `j` of `other`
    #[must_use]
    pub fn equal_at(&self, i: usize, other: &Block, j: usize) -> bool {
        match (self, other) {
            (Block::Uint64(a), Block::Uint64(b)) => a[i] == b[j],
            (Block::Int64(a), Block::Int64(b)) => a[i] == b[j],
            (Block::Float64(a), Block::Float64(b)) => a[i].to_bits() == b[j].to_bits(),
            (Block::Boolean(a), Block::Boolean(b)) => a[i] == b[j],
            (Block::String(a), Block::String(b)) => a[i] == b[j],
            (Block::Bytes(a), Block::Bytes(b)) => a[i] == b[j],
            _ => false,
        }
    }

    /// Minimum and maximum value, `None` for an empty block
    #[must_use]
    pub fn min_max(&self) -> Option<(Value, Value)> {
        if self.is_empty() {
            return None;
        }
        let (lo, hi) = match self {
            Block::Uint64(v) => min_max_by(v, Ord::cmp),
            Block::Int64(v) => min_max_by(v, Ord::cmp),
            Block::Float64(v) => min_max_by(v, f64::total_cmp),
            Block::Boolean(v) => min_max_by(v, Ord::cmp),
            Block::String(v) => min_max_by(v, Ord::cmp),
            Block::Bytes(v) => min_max_by(v, Ord::cmp),
        };
        Some((self.get(lo), self.get(hi)))
    }

    /// Approximate heap footprint, used for cache accounting
    #[must_use]
    pub fn heap_size(&self) -> usize {
        match self {
            Block::Uint64(v) => v.len() * 8,
            Block::Int64(v) => v.len() * 8,
            Block::Float64(v) => v.len() * 8,
            Block::Boolean(v) => v.len(),
            Block::String(v) => v.iter().map(|s| s.len() + 24).sum(),
            Block::Bytes(v) => v.iter().map(|s| s.len() + 24).sum(),
        }
    }
}

fn min_max_by<T>(v: &[T], cmp: impl Fn(&T, &T) -> Ordering) -> (usize, usize) {
    let (mut lo, mut hi) = (0, 0);
    for i in 1..v.len() {
        if cmp(&v[i], &v[lo]) == Ordering::Less {
            lo = i;
        }
        if cmp(&v[i], &v[hi]) == Ordering::Greater {
            hi = i;
        }
    }
    (lo, hi)
}

fn type_error(expected: FieldType, actual: FieldType) -> Error {
    QueryError::TypeMismatch {
        expected: expected.to_string(),
        actual: actual.to_string(),
    }
    .into()
}

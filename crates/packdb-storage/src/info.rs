//! Per-pack zone maps

use serde::{Deserialize, Serialize};

use packdb_common::types::{FieldType, Value};

use crate::package::Package;

/// Per-column statistics of one pack
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockInfo {
    pub typ: FieldType,
    pub min: Value,
    pub max: Value,
    /// Columns are non-nullable, so this stays 0; kept for format stability.
    pub null_count: u32,
}

impl BlockInfo {
    fn empty(typ: FieldType) -> Self {
        Self {
            typ,
            min: Value::zero(typ),
            max: Value::zero(typ),
            null_count: 0,
        }
    }
}

/// Zone map and size bookkeeping for one stored pack
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackInfo {
    pub key: u32,
    pub n_values: usize,
    pub packed_size: usize,
    pub blocks: Vec<BlockInfo>,
    #[serde(skip)]
    pub dirty: bool,
}

impl PackInfo {
    /// Compute statistics from a fully materialized package.
    #[must_use]
    pub fn from_package(pkg: &Package) -> Self {
        let blocks = pkg
            .schema()
            .fields()
            .iter()
            .enumerate()
            .map(|(i, f)| match pkg.block(i).and_then(|b| b.min_max()) {
                Some((min, max)) => BlockInfo {
                    typ: f.typ,
                    min,
                    max,
                    null_count: 0,
                },
                None => BlockInfo::empty(f.typ),
            })
            .collect();
        Self {
            key: pkg.key(),
            n_values: pkg.len(),
            packed_size: 0,
            blocks,
            dirty: true,
        }
    }

    /// Min and max pk read from the pk column statistics
    #[must_use]
    pub fn pk_range(&self, pk_index: usize) -> (u64, u64) {
        match self.blocks.get(pk_index) {
            Some(b) => (b.min.as_u64().unwrap_or(0), b.max.as_u64().unwrap_or(0)),
            None => (0, 0),
        }
    }

    /// Storage key of the pack blob and info record
    #[must_use]
    pub fn encoded_key(&self) -> [u8; 4] {
        self.key.to_be_bytes()
    }
}

/// 4-byte big-endian pack key
#[must_use]
pub fn encode_pack_key(key: u32) -> [u8; 4] {
    key.to_be_bytes()
}

/// Inverse of [`encode_pack_key`]
#[must_use]
pub fn decode_pack_key(buf: &[u8]) -> Option<u32> {
    let b: [u8; 4] = buf.try_into().ok()?;
    Some(u32::from_be_bytes(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use packdb_common::types::{Field, Schema};
    use std::sync::Arc;

    #[test]
    fn test_from_package() {
        let schema = Arc::new(
            Schema::new(vec![Field::primary("id"), Field::new("name", FieldType::String)]).unwrap(),
        );
        let mut pkg = Package::new(schema, 3, 16);
        for (pk, name) in [(10u64, "k"), (11, "b"), (15, "x")] {
            pkg.push_row(&vec![Value::Uint64(pk), name.into()]).unwrap();
        }
        let info = PackInfo::from_package(&pkg);
        assert_eq!(info.key, 3);
        assert_eq!(info.n_values, 3);
        assert_eq!(info.pk_range(0), (10, 15));
        assert_eq!(info.blocks[1].min, Value::from("b"));
        assert_eq!(info.blocks[1].max, Value::from("x"));
    }

    #[test]
    fn test_pack_key_encoding_sorts_numerically() {
        assert!(encode_pack_key(255) < encode_pack_key(256));
        assert_eq!(decode_pack_key(&encode_pack_key(0xdead_beef)), Some(0xdead_beef));
        assert_eq!(decode_pack_key(&[1, 2]), None);
    }
}

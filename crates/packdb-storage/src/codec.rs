//! Pack blob encoding
//!
//! Layout of a stored pack:
//!
//! ```text
//! [header_len: u32 LE][header (bincode)][block 0]...[block n-1]
//! block = [crc32: u32 LE][payload]
//! payload = bincode(Block), lz4 compressed with a size prefix when enabled
//! ```
//!
//! The header records each block's byte range so that a load decodes only
//! the requested columns.

use serde::{Deserialize, Serialize};

use packdb_common::error::{Error, Result, StorageError};
use packdb_common::types::FieldType;

use crate::block::Block;
use crate::package::Package;

const FORMAT_VERSION: u8 = 1;

/// Byte range of one encoded block, relative to the end of the header
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct BlockEntry {
    offset: u32,
    size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PackHeader {
    version: u8,
    key: u32,
    len: u32,
    compressed: bool,
    blocks: Vec<BlockEntry>,
}

/// Serialize a fully materialized package.
pub fn encode_pack(pkg: &Package, compress: bool) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    let mut blocks = Vec::with_capacity(pkg.schema().len());

    for i in 0..pkg.schema().len() {
        let block = pkg
            .block(i)
            .ok_or_else(|| Error::Internal(format!("pack {}: column {i} not loaded", pkg.key())))?;
        let data = bincode::serialize(block)?;

        // Compress if needed
        let data = if compress {
            lz4_flex::compress_prepend_size(&data)
        } else {
            data
        };

        let crc = crc32fast::hash(&data);
        blocks.push(BlockEntry {
            offset: to_u32(body.len())?,
            size: to_u32(data.len() + 4)?,
        });
        body.extend_from_slice(&crc.to_le_bytes());
        body.extend_from_slice(&data);
    }

    let header = PackHeader {
        version: FORMAT_VERSION,
        key: pkg.key(),
        len: to_u32(pkg.len())?,
        compressed: compress,
        blocks,
    };
    let header = bincode::serialize(&header)?;

    let mut out = Vec::with_capacity(4 + header.len() + body.len());
    out.extend_from_slice(&to_u32(header.len())?.to_le_bytes());
    out.extend_from_slice(&header);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Lazy reader over an encoded pack
pub struct PackReader<'a> {
    header: PackHeader,
    body: &'a [u8],
}

impl<'a> PackReader<'a> {
    pub fn new(buf: &'a [u8]) -> Result<Self> {
        let hlen = buf
            .get(..4)
            .and_then(|b| b.try_into().ok())
            .map(u32::from_le_bytes)
            .ok_or_else(|| corrupt("truncated pack header"))? as usize;
        let hbytes = buf
            .get(4..4 + hlen)
            .ok_or_else(|| corrupt("truncated pack header"))?;
        let header: PackHeader = bincode::deserialize(hbytes)?;
        if header.version != FORMAT_VERSION {
            return Err(corrupt(&format!("unsupported pack format {}", header.version)));
        }
        Ok(Self {
            header,
            body: &buf[4 + hlen..],
        })
    }

    #[must_use]
    pub fn key(&self) -> u32 {
        self.header.key
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.header.len as usize
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.header.len == 0
    }

    #[must_use]
    pub fn num_blocks(&self) -> usize {
        self.header.blocks.len()
    }

    /// Decode column `col`, verifying its checksum and type.
    pub fn block(&self, col: usize, typ: FieldType) -> Result<Block> {
        let entry = self
            .header
            .blocks
            .get(col)
            .ok_or_else(|| corrupt(&format!("pack {}: missing column {col}", self.header.key)))?;
        let start = entry.offset as usize;
        let end = start + entry.size as usize;
        let raw = self
            .body
            .get(start..end)
            .filter(|r| r.len() >= 4)
            .ok_or_else(|| corrupt(&format!("pack {}: column {col} out of range", self.header.key)))?;

        let (crc, data) = raw.split_at(4);
        let crc = u32::from_le_bytes([crc[0], crc[1], crc[2], crc[3]]);
        if crc32fast::hash(data) != crc {
            return Err(StorageError::ChecksumMismatch(format!(
                "pack {} column {col}",
                self.header.key
            ))
            .into());
        }

        let block: Block = if self.header.compressed {
            let data = lz4_flex::decompress_size_prepended(data)
                .map_err(|e| corrupt(&format!("pack {} column {col}: {e}", self.header.key)))?;
            bincode::deserialize(&data)?
        } else {
            bincode::deserialize(data)?
        };

        if block.field_type() != typ || block.len() != self.len() {
            return Err(corrupt(&format!(
                "pack {} column {col}: expected {typ} x {}, found {} x {}",
                self.header.key,
                self.len(),
                block.field_type(),
                block.len()
            )));
        }
        Ok(block)
    }
}

fn corrupt(msg: &str) -> Error {
    StorageError::CorruptData(msg.to_string()).into()
}

fn to_u32(n: usize) -> Result<u32> {
    u32::try_from(n).map_err(|_| corrupt(&format!("size {n} exceeds pack format limits")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use packdb_common::types::{Field, Schema, Value};
    use std::sync::Arc;

    fn pack() -> Package {
        let schema = Arc::new(
            Schema::new(vec![
                Field::primary("id"),
                Field::new("name", FieldType::String),
                Field::new("score", FieldType::Float64),
            ])
            .unwrap(),
        );
        let mut pkg = Package::new(schema, 9, 16);
        for i in 1..=5u64 {
            pkg.push_row(&vec![
                Value::Uint64(i),
                format!("row-{i}").into(),
                Value::Float64(i as f64 / 2.0),
            ])
            .unwrap();
        }
        pkg
    }

    #[test]
    fn test_partial_decode() {
        for compress in [false, true] {
            let pkg = pack();
            let buf = encode_pack(&pkg, compress).unwrap();
            let reader = PackReader::new(&buf).unwrap();
            assert_eq!(reader.key(), 9);
            assert_eq!(reader.len(), 5);
            assert_eq!(reader.num_blocks(), 3);
            let names = reader.block(1, FieldType::String).unwrap();
            assert_eq!(&names, pkg.block(1).unwrap());
        }
    }

    #[test]
    fn test_checksum_mismatch() {
        let mut buf = encode_pack(&pack(), false).unwrap();
        let last = buf.len() - 1;
        buf[last] ^= 0xff;
        let reader = PackReader::new(&buf).unwrap();
        let err = reader.block(2, FieldType::Float64).unwrap_err();
        assert!(matches!(err, Error::Storage(StorageError::ChecksumMismatch(_))));
        // untouched columns still decode
        assert!(reader.block(0, FieldType::Uint64).is_ok());
    }

    #[test]
    fn test_type_and_truncation_errors() {
        let buf = encode_pack(&pack(), true).unwrap();
        let reader = PackReader::new(&buf).unwrap();
        assert!(reader.block(0, FieldType::Int64).is_err());
        assert!(reader.block(7, FieldType::Int64).is_err());
        assert!(PackReader::new(&buf[..3]).is_err());
    }
}

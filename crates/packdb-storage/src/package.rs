//! In-memory columnar batches
//!
//! A [`Package`] is one block per schema field with the primary key column
//! kept sorted ascending. Blocks are reference counted: packs handed out by
//! the cache share blocks with it and may lack columns that were not
//! requested, while writable packs own every block and mutate through
//! copy-on-write (`Arc::make_mut`), so a cached block is never changed in
//! place.

use std::sync::Arc;

use packdb_common::error::{Error, Result};
use packdb_common::types::{Row, Schema, Value};

use crate::block::Block;

/// Columnar batch of rows sharing one schema
#[derive(Debug, Clone)]
pub struct Package {
    key: u32,
    schema: Arc<Schema>,
    blocks: Vec<Option<Arc<Block>>>,
    len: usize,
    capacity: usize,
    dirty: bool,
}

impl Package {
    /// Empty, fully materialized package
    #[must_use]
    pub fn new(schema: Arc<Schema>, key: u32, capacity: usize) -> Self {
        let blocks = schema
            .fields()
            .iter()
            .map(|f| Some(Arc::new(Block::new(f.typ, capacity.min(1 << 16)))))
            .collect();
        Self {
            key,
            schema,
            blocks,
            len: 0,
            capacity,
            dirty: false,
        }
    }

    /// Package assembled from loaded blocks; absent columns stay `None`.
    pub fn from_blocks(
        schema: Arc<Schema>,
        key: u32,
        capacity: usize,
        len: usize,
        blocks: Vec<Option<Arc<Block>>>,
    ) -> Result<Self> {
        if blocks.len() != schema.len() {
            return Err(Error::Internal(format!(
                "pack {key}: {} blocks for {} fields",
                blocks.len(),
                schema.len()
            )));
        }
        if let Some(b) = blocks.iter().flatten().find(|b| b.len() != len) {
            return Err(Error::Internal(format!(
                "pack {key}: block length {} differs from pack length {len}",
                b.len()
            )));
        }
        Ok(Self {
            key,
            schema,
            blocks,
            len,
            capacity,
            dirty: false,
        })
    }

    #[must_use]
    pub fn key(&self) -> u32 {
        self.key
    }

    pub fn set_key(&mut self, key: u32) {
        self.key = key;
    }

    #[must_use]
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.len >= self.capacity
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    /// True when every column is present
    #[must_use]
    pub fn is_materialized(&self) -> bool {
        self.blocks.iter().all(Option::is_some)
    }

    #[must_use]
    pub fn has_block(&self, i: usize) -> bool {
        self.blocks.get(i).is_some_and(Option::is_some)
    }

    #[must_use]
    pub fn block(&self, i: usize) -> Option<&Block> {
        self.blocks.get(i).and_then(|b| b.as_deref())
    }

    #[must_use]
    pub fn block_arc(&self, i: usize) -> Option<&Arc<Block>> {
        self.blocks.get(i).and_then(Option::as_ref)
    }

    pub fn set_block(&mut self, i: usize, block: Arc<Block>) -> Result<()> {
        if block.len() != self.len {
            return Err(Error::Internal(format!(
                "pack {}: block length {} differs from pack length {}",
                self.key,
                block.len(),
                self.len
            )));
        }
        self.blocks[i] = Some(block);
        Ok(())
    }

    fn block_mut(&mut self, i: usize) -> Result<&mut Block> {
        let key = self.key;
        self.blocks[i]
            .as_mut()
            .map(Arc::make_mut)
            .ok_or_else(|| Error::Internal(format!("pack {key}: column {i} not loaded")))
    }

    /// Sorted primary key column (empty when not loaded)
    #[must_use]
    pub fn pk_column(&self) -> &[u64] {
        self.block(self.schema.pk_index())
            .and_then(Block::as_u64)
            .unwrap_or(&[])
    }

    #[must_use]
    pub fn pk_at(&self, i: usize) -> u64 {
        self.pk_column()[i]
    }

    /// Smallest and largest pk, (0, 0) for an empty pack
    #[must_use]
    pub fn pk_range(&self) -> (u64, u64) {
        let pks = self.pk_column();
        match (pks.first(), pks.last()) {
            (Some(&lo), Some(&hi)) => (lo, hi),
            _ => (0, 0),
        }
    }

    /// Position of `pk`, searching from `last`. Returns the match (if any)
    /// and the position to resume from for the next larger pk.
    #[must_use]
    pub fn pk_index(&self, pk: u64, last: usize) -> (Option<usize>, usize) {
        let pks = self.pk_column();
        if last >= pks.len() {
            return (None, pks.len());
        }
        let pos = last + pks[last..].partition_point(|&v| v < pk);
        if pos < pks.len() && pks[pos] == pk {
            (Some(pos), pos)
        } else {
            (None, pos)
        }
    }

    /// Value of field `f` at row `i`, `None` when the column is absent
    #[must_use]
    pub fn value(&self, f: usize, i: usize) -> Option<Value> {
        self.block(f).map(|b| b.get(i))
    }

    /// Row `i`; absent columns decode to the type's zero value.
    #[must_use]
    pub fn row(&self, i: usize) -> Row {
        self.schema
            .fields()
            .iter()
            .enumerate()
            .map(|(f, field)| self.value(f, i).unwrap_or_else(|| Value::zero(field.typ)))
            .collect()
    }

    pub fn push_row(&mut self, row: &Row) -> Result<()> {
        self.schema.check_row(row)?;
        for (i, val) in row.iter().enumerate() {
            self.block_mut(i)?.push(val)?;
        }
        self.len += 1;
        self.dirty = true;
        Ok(())
    }

    /// Overwrite one field of row `i`
    pub fn set_value(&mut self, f: usize, i: usize, val: &Value) -> Result<()> {
        self.block_mut(f)?.set(i, val)?;
        self.dirty = true;
        Ok(())
    }

    /// Append `n` rows of `src` starting at `pos`
    pub fn append_from(&mut self, src: &Package, pos: usize, n: usize) -> Result<()> {
        for i in 0..self.blocks.len() {
            let s = src.source_block(i)?;
            self.block_mut(i)?.append_from(s, pos, n)?;
        }
        self.len += n;
        self.dirty = true;
        Ok(())
    }

    /// Insert `n` rows of `src` (from `src_pos`) before row `dst_pos`
    pub fn insert_from(&mut self, src: &Package, dst_pos: usize, src_pos: usize, n: usize) -> Result<()> {
        for i in 0..self.blocks.len() {
            let s = src.source_block(i)?;
            self.block_mut(i)?.insert_from(s, dst_pos, src_pos, n)?;
        }
        self.len += n;
        self.dirty = true;
        Ok(())
    }

    /// Overwrite `n` rows at `dst_pos` with rows of `src` from `src_pos`
    pub fn replace_from(&mut self, src: &Package, dst_pos: usize, src_pos: usize, n: usize) -> Result<()> {
        for i in 0..self.blocks.len() {
            let s = src.source_block(i)?;
            self.block_mut(i)?.replace_from(s, dst_pos, src_pos, n)?;
        }
        self.dirty = true;
        Ok(())
    }

    /// Remove `n` rows starting at `pos`
    pub fn delete(&mut self, pos: usize, n: usize) -> Result<()> {
        if n == 0 {
            return Ok(());
        }
        for i in 0..self.blocks.len() {
            self.block_mut(i)?.delete(pos, n);
        }
        self.len -= n;
        self.dirty = true;
        Ok(())
    }

    /// Move rows `at..` into a new package with key `key`
    pub fn split_off(&mut self, at: usize, key: u32) -> Result<Package> {
        let mut blocks = Vec::with_capacity(self.blocks.len());
        for i in 0..self.blocks.len() {
            blocks.push(Some(Arc::new(self.block_mut(i)?.split_off(at))));
        }
        let moved = self.len - at;
        self.len = at;
        self.dirty = true;
        Ok(Package {
            key,
            schema: Arc::clone(&self.schema),
            blocks,
            len: moved,
            capacity: self.capacity,
            dirty: true,
        })
    }

    /// Drop all rows, keeping schema and key
    pub fn clear(&mut self) -> Result<()> {
        for i in 0..self.blocks.len() {
            self.block_mut(i)?.clear();
        }
        self.len = 0;
        self.dirty = true;
        Ok(())
    }

    /// Private copy suitable for mutation. Requires every column present.
    pub fn to_writable(&self) -> Result<Package> {
        if !self.is_materialized() {
            return Err(Error::Internal(format!(
                "pack {}: cannot make a partially loaded pack writable",
                self.key
            )));
        }
        Ok(Package {
            dirty: false,
            ..self.clone()
        })
    }

    /// Approximate heap footprint of loaded blocks
    #[must_use]
    pub fn heap_size(&self) -> usize {
        self.blocks.iter().flatten().map(|b| b.heap_size()).sum()
    }

    fn source_block(&self, i: usize) -> Result<&Block> {
        self.block(i)
            .ok_or_else(|| Error::Internal(format!("pack {}: column {i} not loaded", self.key)))
    }
}

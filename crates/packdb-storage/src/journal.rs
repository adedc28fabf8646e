//! Write staging buffer
//!
//! The journal keeps every not-yet-flushed row in one live [`Package`].
//! Slots are append-only: an update pushes a new slot and marks the prior
//! slot of the same pk deleted, so the latest version is the only live
//! one. `keys` maps each pk to its latest slot and is always pk-sorted.
//! Deletes of rows that may already live in packs go to the sorted
//! tombstone list until flush removes them physically.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use packdb_common::error::{QueryError, Result};
use packdb_common::types::{Row, Schema, Value};

use crate::bitset::Bitset;
use crate::package::Package;

/// Position of a pk's latest row in the journal data pack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalEntry {
    pub pk: u64,
    pub idx: usize,
}

/// Persisted form of the journal
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JournalSnapshot {
    pub max_id: u64,
    pub rows: Vec<Row>,
    pub tomb: Vec<u64>,
}

#[derive(Debug)]
pub struct Journal {
    data: Package,
    keys: Vec<JournalEntry>,
    deleted: Bitset,
    tomb: Vec<u64>,
    max_id: u64,
    last_id: u64,
    max_size: usize,
}

impl Journal {
    #[must_use]
    pub fn new(schema: Arc<Schema>, max_id: u64, max_size: usize) -> Self {
        Self {
            data: Package::new(schema, 0, max_size),
            keys: Vec::new(),
            deleted: Bitset::new(0),
            tomb: Vec::new(),
            max_id,
            last_id: 0,
            max_size,
        }
    }

    /// Live data pack; deleted and superseded slots are still present.
    #[must_use]
    pub fn data(&self) -> &Package {
        &self.data
    }

    /// pk-sorted latest slot per pk
    #[must_use]
    pub fn keys(&self) -> &[JournalEntry] {
        &self.keys
    }

    /// Deleted and superseded slots
    #[must_use]
    pub fn deleted(&self) -> &Bitset {
        &self.deleted
    }

    /// Sorted pks pending deletion from packs
    #[must_use]
    pub fn tomb(&self) -> &[u64] {
        &self.tomb
    }

    /// Number of distinct pks with a journal entry
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty() && self.tomb.is_empty()
    }

    #[must_use]
    pub fn tomb_len(&self) -> usize {
        self.tomb.len()
    }

    /// Highest pk ever assigned or seen
    #[must_use]
    pub fn max_id(&self) -> u64 {
        self.max_id
    }

    /// Highest pk currently held by the journal
    #[must_use]
    pub fn last_id(&self) -> u64 {
        self.last_id
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.max_size
    }

    #[must_use]
    pub fn heap_size(&self) -> usize {
        self.data.heap_size() + self.keys.len() * 16 + self.tomb.len() * 8
    }

    /// Live slots plus tombstones exceed the configured size.
    #[must_use]
    pub fn should_flush(&self) -> bool {
        self.data.len() + self.tomb.len() > self.max_size
    }

    /// Remaining room before `should_flush` fires
    #[must_use]
    pub fn free(&self) -> usize {
        (self.max_size + 1).saturating_sub(self.data.len() + self.tomb.len())
    }

    fn next_id(&mut self) -> u64 {
        self.max_id += 1;
        self.max_id
    }

    /// Reserve the next sequence value without staging a row
    pub fn next_sequence(&mut self) -> u64 {
        self.next_id()
    }

    /// Stage a new row. A zero pk is replaced with the next sequence value;
    /// an explicit pk that already has a journal entry is superseded.
    /// Returns the row's pk.
    pub fn insert(&mut self, mut row: Row) -> Result<u64> {
        let pki = self.data.schema().pk_index();
        let pk = match row.get(pki) {
            Some(Value::Uint64(0)) => {
                let pk = self.next_id();
                row[pki] = Value::Uint64(pk);
                pk
            }
            Some(Value::Uint64(pk)) => *pk,
            _ => return Err(QueryError::MissingPrimaryKey.into()),
        };
        self.stage(pk, &row)?;
        Ok(pk)
    }

    pub fn insert_batch(&mut self, rows: Vec<Row>) -> Result<Vec<u64>> {
        rows.into_iter().map(|row| self.insert(row)).collect()
    }

    /// Stage a new version of an existing row. The pk must be set.
    pub fn update(&mut self, row: Row) -> Result<u64> {
        let pki = self.data.schema().pk_index();
        let pk = match row.get(pki) {
            Some(Value::Uint64(pk)) if *pk > 0 => *pk,
            _ => return Err(QueryError::MissingPrimaryKey.into()),
        };
        self.stage(pk, &row)?;
        Ok(pk)
    }

    pub fn update_batch(&mut self, rows: Vec<Row>) -> Result<usize> {
        let n = rows.len();
        for row in rows {
            self.update(row)?;
        }
        Ok(n)
    }

    fn stage(&mut self, pk: u64, row: &Row) -> Result<()> {
        self.data.push_row(row)?;
        let slot = self.data.len() - 1;
        self.deleted.resize(self.data.len());

        let pos = self.keys.partition_point(|e| e.pk < pk);
        if pos < self.keys.len() && self.keys[pos].pk == pk {
            let old = self.keys[pos].idx;
            self.deleted.set(old);
            self.keys[pos].idx = slot;
        } else {
            self.keys.insert(pos, JournalEntry { pk, idx: slot });
        }

        // insert or update after delete resurrects the pk
        if let Ok(t) = self.tomb.binary_search(&pk) {
            self.tomb.remove(t);
        }

        self.last_id = self.last_id.max(pk);
        self.max_id = self.max_id.max(pk);
        Ok(())
    }

    /// Mark rows deleted. Journal slots are flagged; pks that may live in
    /// flushed packs (`pk <= flushed_max`) are merged into the tombstone.
    /// Returns the number of pks affected.
    pub fn delete_batch(&mut self, pks: &[u64], flushed_max: u64) -> Result<usize> {
        let mut pks: Vec<u64> = pks.iter().copied().filter(|&pk| pk > 0).collect();
        pks.sort_unstable();
        pks.dedup();
        let Some(&largest) = pks.last() else {
            return Ok(0);
        };
        if largest > self.max_id {
            return Err(QueryError::OutOfBounds(largest).into());
        }

        let mut count = 0;
        let mut last = 0;
        let mut tomb = Vec::with_capacity(pks.len());
        for &pk in &pks {
            let mut hit = false;
            let (slot, l) = self.pk_index(pk, last);
            last = l;
            if let Some(slot) = slot {
                if !self.deleted.is_set(slot) {
                    self.deleted.set(slot);
                    hit = true;
                }
            }
            if pk <= flushed_max {
                tomb.push(pk);
                hit = true;
            }
            if hit {
                count += 1;
            }
        }
        self.merge_tomb(&tomb);
        Ok(count)
    }

    fn merge_tomb(&mut self, pks: &[u64]) {
        if pks.is_empty() {
            return;
        }
        if self.tomb.last().map_or(true, |&t| pks[0] > t) {
            self.tomb.extend_from_slice(pks);
            return;
        }
        let mut merged = Vec::with_capacity(self.tomb.len() + pks.len());
        let (mut i, mut j) = (0, 0);
        while i < self.tomb.len() || j < pks.len() {
            let next = match (self.tomb.get(i), pks.get(j)) {
                (Some(&a), Some(&b)) if a == b => {
                    i += 1;
                    j += 1;
                    a
                }
                (Some(&a), Some(&b)) if a < b => {
                    i += 1;
                    a
                }
                (Some(&a), None) => {
                    i += 1;
                    a
                }
                (_, Some(&b)) => {
                    j += 1;
                    b
                }
                (None, None) => break,
            };
            merged.push(next);
        }
        self.tomb = merged;
    }

    /// Latest slot of `pk` (even when that slot is deleted) searching
    /// `keys` from `last`, plus the position to resume from.
    #[must_use]
    pub fn pk_index(&self, pk: u64, last: usize) -> (Option<usize>, usize) {
        if pk > self.last_id || last >= self.keys.len() {
            return (None, self.keys.len());
        }
        let pos = last + self.keys[last..].partition_point(|e| e.pk < pk);
        if pos < self.keys.len() && self.keys[pos].pk == pk {
            (Some(self.keys[pos].idx), pos)
        } else {
            (None, pos)
        }
    }

    /// Tombstone membership of `pk`, searching from `last`.
    #[must_use]
    pub fn is_deleted(&self, pk: u64, last: usize) -> (bool, usize) {
        if last >= self.tomb.len() {
            return (false, self.tomb.len());
        }
        let pos = last + self.tomb[last..].partition_point(|&t| t < pk);
        if pos < self.tomb.len() && self.tomb[pos] == pk {
            (true, pos)
        } else if pos == self.tomb.len() {
            (false, pos)
        } else {
            (false, last)
        }
    }

    /// Slots set in `bits`, in ascending pk order
    #[must_use]
    pub fn sorted_indexes(&self, bits: &Bitset) -> Vec<JournalEntry> {
        self.keys
            .iter()
            .filter(|e| bits.is_set(e.idx))
            .copied()
            .collect()
    }

    /// Slots set in `bits`, in descending pk order
    #[must_use]
    pub fn sorted_indexes_reversed(&self, bits: &Bitset) -> Vec<JournalEntry> {
        self.keys
            .iter()
            .rev()
            .filter(|e| bits.is_set(e.idx))
            .copied()
            .collect()
    }

    /// Bitmap of live (not deleted, not superseded) slots
    #[must_use]
    pub fn live_bits(&self) -> Bitset {
        self.deleted.negated()
    }

    /// Drop all staged rows and tombstones; the sequence is kept.
    pub fn reset(&mut self) -> Result<()> {
        self.data.clear()?;
        self.data.clear_dirty();
        self.keys.clear();
        self.deleted.reset();
        self.tomb.clear();
        self.last_id = 0;
        Ok(())
    }

    /// Live rows in pk order plus the tombstone
    #[must_use]
    pub fn snapshot(&self) -> JournalSnapshot {
        JournalSnapshot {
            max_id: self.max_id,
            rows: self
                .keys
                .iter()
                .filter(|e| !self.deleted.is_set(e.idx))
                .map(|e| self.data.row(e.idx))
                .collect(),
            tomb: self.tomb.clone(),
        }
    }

    /// Replace contents with a persisted snapshot
    pub fn restore(&mut self, snap: JournalSnapshot) -> Result<()> {
        self.reset()?;
        self.max_id = self.max_id.max(snap.max_id);
        for row in snap.rows {
            self.insert(row)?;
        }
        self.tomb = snap.tomb;
        self.tomb.sort_unstable();
        self.tomb.dedup();
        Ok(())
    }
}

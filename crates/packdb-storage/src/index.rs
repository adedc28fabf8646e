//! Secondary indexes
//!
//! Each index is a bucket `<table>_<field>_index` whose keys are the 8-byte
//! index value followed by the 8-byte big-endian pk; values are empty.
//! Integer indexes store an order-preserving encoding of the value and are
//! exact. Hash indexes store the xxh3 hash of the value bytes and may
//! collide, so matches must be verified against the row.
//!
//! Flush reports added and removed rows through `add_tx`/`remove_tx`; the
//! changes are buffered and written by `flush_tx`, which flush calls before
//! every sub-commit and at the end.

use std::collections::BTreeMap;

use tracing::debug;
use xxhash_rust::xxh3::xxh3_64;

use packdb_common::error::{Error, Result};
use packdb_common::types::{Field, FieldType, IndexKind, Schema, Value};

use crate::block::Block;
use crate::condition::{Condition, FilterMode};
use crate::package::Package;
use crate::store::Tx;
use crate::tree::{ConditionTree, ConditionTreeNode};

const COUNT_KEY: &[u8] = b"_count";

/// Secondary index over one field of a table
#[derive(Debug)]
pub struct SecondaryIndex {
    field: String,
    position: usize,
    typ: FieldType,
    kind: IndexKind,
    bucket: String,
    /// Buffered changes, true = add
    pending: BTreeMap<[u8; 16], bool>,
}

impl SecondaryIndex {
    /// Index on schema field `position` of table `table`
    pub fn new(table: &str, schema: &Schema, position: usize, kind: IndexKind) -> Result<Self> {
        let field: &Field = schema.field(position);
        if kind == IndexKind::Integer
            && !matches!(
                field.typ,
                FieldType::Uint64 | FieldType::Int64 | FieldType::Float64 | FieldType::Boolean
            )
        {
            return Err(Error::Config(format!(
                "integer index on {} field {}",
                field.typ, field.name
            )));
        }
        Ok(Self {
            field: field.name.clone(),
            position,
            typ: field.typ,
            kind,
            bucket: format!("{table}_{}_index", field.name),
            pending: BTreeMap::new(),
        })
    }

    #[must_use]
    pub fn field(&self) -> &str {
        &self.field
    }

    #[must_use]
    pub fn position(&self) -> usize {
        self.position
    }

    #[must_use]
    pub fn kind(&self) -> IndexKind {
        self.kind
    }

    #[must_use]
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Hash indexes may report pks whose value only shares the hash.
    #[must_use]
    pub fn may_have_collisions(&self) -> bool {
        self.kind == IndexKind::Hash
    }

    pub fn create_tx(&self, tx: &mut Tx<'_>) -> Result<()> {
        tx.create_bucket(&self.bucket)
    }

    pub fn drop_tx(&mut self, tx: &mut Tx<'_>) -> Result<()> {
        self.pending.clear();
        tx.drop_bucket(&self.bucket)
    }

    /// 8-byte index key of a value
    #[must_use]
    pub fn encode_value(&self, val: &Value) -> [u8; 8] {
        match self.kind {
            IndexKind::Integer => ordered_bits(val).to_be_bytes(),
            IndexKind::Hash => hash_value(val).to_be_bytes(),
        }
    }

    fn entry_key(&self, block: &Block, pks: &[u64], i: usize) -> [u8; 16] {
        let mut key = [0u8; 16];
        key[..8].copy_from_slice(&self.encode_value(&block.get(i)));
        key[8..].copy_from_slice(&pks[i].to_be_bytes());
        key
    }

    fn stage(&mut self, pkg: &Package, pos: usize, n: usize, add: bool) -> Result<()> {
        let block = pkg.block(self.position).ok_or_else(|| {
            Error::Internal(format!("pack {}: index column {} not loaded", pkg.key(), self.field))
        })?;
        let pks = pkg.pk_column();
        for i in pos..pos + n {
            let key = self.entry_key(block, pks, i);
            self.pending.insert(key, add);
        }
        Ok(())
    }

    /// Index rows `pos..pos+n` of `pkg`
    pub fn add_tx(&mut self, pkg: &Package, pos: usize, n: usize) -> Result<()> {
        self.stage(pkg, pos, n, true)
    }

    /// Retract rows `pos..pos+n` of `pkg`
    pub fn remove_tx(&mut self, pkg: &Package, pos: usize, n: usize) -> Result<()> {
        self.stage(pkg, pos, n, false)
    }

    /// Write buffered changes and the entry counter into `tx`.
    pub fn flush_tx(&mut self, tx: &mut Tx<'_>) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let mut count = self.entries_tx(tx)?;
        let n = self.pending.len();
        for (key, add) in std::mem::take(&mut self.pending) {
            let exists = tx.get(&self.bucket, &key)?.is_some();
            match (add, exists) {
                (true, false) => {
                    tx.put(&self.bucket, &key, Vec::new())?;
                    count += 1;
                }
                (false, true) => {
                    tx.delete(&self.bucket, &key)?;
                    count = count.saturating_sub(1);
                }
                _ => {}
            }
        }
        tx.put(&self.bucket, COUNT_KEY, count.to_be_bytes().to_vec())?;
        debug!(index = %self.bucket, changes = n, entries = count, "Flushed index");
        Ok(())
    }

    /// Drop buffered changes after a failed flush
    pub fn reset(&mut self) {
        self.pending.clear();
    }

    /// Persisted number of index entries
    pub fn entries_tx(&self, tx: &Tx<'_>) -> Result<u64> {
        Ok(tx
            .get(&self.bucket, COUNT_KEY)?
            .and_then(|v| v.as_slice().try_into().ok())
            .map_or(0, u64::from_be_bytes))
    }

    /// True when a lookup can answer `cond`
    #[must_use]
    pub fn can_match(&self, cond: &Condition) -> bool {
        !cond.processed
            && cond.field_index() == self.position
            && matches!(cond.mode, FilterMode::Equal | FilterMode::In)
    }

    /// Sorted, distinct pks whose indexed value may satisfy `cond`
    pub fn lookup_tx(&self, tx: &Tx<'_>, cond: &Condition) -> Result<Vec<u64>> {
        let values: Vec<&Value> = match cond.mode {
            FilterMode::Equal => cond.value().into_iter().collect(),
            FilterMode::In => cond.values().iter().collect(),
            _ => Vec::new(),
        };
        let mut pks = Vec::new();
        for val in values {
            if val.field_type() != self.typ {
                continue;
            }
            let prefix = self.encode_value(val);
            for (key, _) in tx.scan_prefix(&self.bucket, &prefix)? {
                if let Some(pk) = key.get(8..16).and_then(|b| b.try_into().ok()) {
                    pks.push(u64::from_be_bytes(pk));
                }
            }
        }
        pks.sort_unstable();
        pks.dedup();
        Ok(pks)
    }
}

/// Order-preserving 64-bit image of a fixed-width value
fn ordered_bits(val: &Value) -> u64 {
    match val {
        Value::Uint64(v) => *v,
        Value::Int64(v) => (*v as u64) ^ (1 << 63),
        Value::Float64(v) => {
            let b = v.to_bits();
            if b >> 63 == 1 {
                !b
            } else {
                b | (1 << 63)
            }
        }
        Value::Boolean(v) => u64::from(*v),
        Value::String(_) | Value::Bytes(_) => hash_value(val),
    }
}

fn hash_value(val: &Value) -> u64 {
    match val {
        Value::Uint64(v) => xxh3_64(&v.to_le_bytes()),
        Value::Int64(v) => xxh3_64(&v.to_le_bytes()),
        Value::Float64(v) => xxh3_64(&v.to_bits().to_le_bytes()),
        Value::Boolean(v) => xxh3_64(&[u8::from(*v)]),
        Value::String(s) => xxh3_64(s.as_bytes()),
        Value::Bytes(b) => xxh3_64(b),
    }
}

// ============================================================================
// Planner
// ============================================================================

/// Rewrite leaves answerable by an index into `pk IN (...)` conditions.
///
/// The new condition is prepended to the children of the node holding the
/// leaf. Leaves of collision-free indexes are marked `processed`; others
/// stay for verification, which in OR context means a hash index cannot
/// be used. An empty lookup marks the new condition `nomatch`.
/// Returns the number of leaves rewritten.
pub fn query_indexes(
    tx: &Tx<'_>,
    tree: &mut ConditionTree,
    indexes: &[SecondaryIndex],
    schema: &Schema,
) -> Result<usize> {
    if indexes.is_empty() || tree.is_empty() {
        return Ok(0);
    }
    rewrite_children(tx, &mut tree.children, false, indexes, schema)
}

fn rewrite_children(
    tx: &Tx<'_>,
    children: &mut Vec<ConditionTreeNode>,
    is_or: bool,
    indexes: &[SecondaryIndex],
    schema: &Schema,
) -> Result<usize> {
    let mut added = Vec::new();
    let mut count = 0;
    for child in children.iter_mut() {
        match child {
            ConditionTreeNode::Leaf(cond) => {
                let Some(idx) = indexes.iter().find(|i| i.can_match(cond)) else {
                    continue;
                };
                if is_or && idx.may_have_collisions() {
                    continue;
                }
                let pks = idx.lookup_tx(tx, cond)?;
                let mut pkcond = Condition::in_list(schema.field(schema.pk_index()).name.clone(), pks);
                pkcond.compile(schema)?;
                pkcond.nomatch = pkcond.values().is_empty();
                if !idx.may_have_collisions() {
                    cond.processed = true;
                }
                added.push(ConditionTreeNode::Leaf(pkcond));
                count += 1;
            }
            ConditionTreeNode::And(nodes) => {
                count += rewrite_children(tx, nodes, false, indexes, schema)?;
            }
            ConditionTreeNode::Or(nodes) => {
                count += rewrite_children(tx, nodes, true, indexes, schema)?;
            }
        }
    }
    if !added.is_empty() {
        added.append(children);
        *children = added;
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use std::sync::Arc;

    fn schema() -> Arc<Schema> {
        Arc::new(
            Schema::new(vec![
                Field::primary("id"),
                Field::new("n", FieldType::Int64).with_index(IndexKind::Integer),
                Field::new("s", FieldType::String).with_index(IndexKind::Hash),
            ])
            .unwrap(),
        )
    }

    fn pack() -> Package {
        let mut pkg = Package::new(schema(), 0, 16);
        for (pk, n, s) in [(1u64, -5i64, "a"), (2, 7, "b"), (3, 7, "a"), (4, 9, "c")] {
            pkg.push_row(&vec![Value::Uint64(pk), Value::Int64(n), s.into()]).unwrap();
        }
        pkg
    }

    fn compiled(mut c: Condition) -> Condition {
        c.compile(&schema()).unwrap();
        c
    }

    #[test]
    fn test_ordered_bits() {
        let enc = |v: Value| ordered_bits(&v);
        assert!(enc(Value::Int64(-5)) < enc(Value::Int64(3)));
        assert!(enc(Value::Int64(i64::MIN)) < enc(Value::Int64(-1)));
        assert!(enc(Value::Float64(-2.5)) < enc(Value::Float64(-1.0)));
        assert!(enc(Value::Float64(-1.0)) < enc(Value::Float64(0.5)));
        assert!(enc(Value::Boolean(false)) < enc(Value::Boolean(true)));
    }

    #[test]
    fn test_integer_index_on_string_is_rejected() {
        let s = schema();
        assert!(SecondaryIndex::new("t", &s, 2, IndexKind::Integer).is_err());
    }

    #[test]
    fn test_add_lookup_remove() {
        let store = Store::temporary().unwrap();
        let s = schema();
        let mut idx = SecondaryIndex::new("t", &s, 1, IndexKind::Integer).unwrap();
        let pkg = pack();

        let mut tx = store.begin(true);
        idx.create_tx(&mut tx).unwrap();
        idx.add_tx(&pkg, 0, 4).unwrap();
        idx.flush_tx(&mut tx).unwrap();
        assert_eq!(idx.entries_tx(&tx).unwrap(), 4);

        let pks = idx.lookup_tx(&tx, &compiled(Condition::equal("n", 7i64))).unwrap();
        assert_eq!(pks, vec![2, 3]);
        let pks = idx
            .lookup_tx(&tx, &compiled(Condition::in_list("n", [9i64, -5, 100])))
            .unwrap();
        assert_eq!(pks, vec![1, 4]);

        idx.remove_tx(&pkg, 1, 1).unwrap();
        idx.flush_tx(&mut tx).unwrap();
        assert_eq!(idx.entries_tx(&tx).unwrap(), 3);
        let pks = idx.lookup_tx(&tx, &compiled(Condition::equal("n", 7i64))).unwrap();
        assert_eq!(pks, vec![3]);
        tx.commit().unwrap();
    }

    #[test]
    fn test_query_indexes_rewrites_tree() {
        let store = Store::temporary().unwrap();
        let s = schema();
        let mut int_idx = SecondaryIndex::new("t", &s, 1, IndexKind::Integer).unwrap();
        let mut hash_idx = SecondaryIndex::new("t", &s, 2, IndexKind::Hash).unwrap();
        let pkg = pack();

        let mut tx = store.begin(true);
        for idx in [&mut int_idx, &mut hash_idx] {
            idx.create_tx(&mut tx).unwrap();
            idx.add_tx(&pkg, 0, pkg.len()).unwrap();
            idx.flush_tx(&mut tx).unwrap();
        }
        let indexes = vec![int_idx, hash_idx];

        let mut tree = ConditionTree::new()
            .and(Condition::equal("n", 7i64))
            .and(Condition::equal("s", "a"));
        tree.compile(&s).unwrap();
        assert_eq!(query_indexes(&tx, &mut tree, &indexes, &s).unwrap(), 2);
        assert_eq!(tree.children.len(), 4);
        assert!(!tree.no_match());

        let processed: Vec<bool> = tree
            .children
            .iter()
            .filter_map(|c| match c {
                ConditionTreeNode::Leaf(c) if c.field != "id" => Some(c.processed),
                _ => None,
            })
            .collect();
        // integer leaf answered exactly, hash leaf kept for verification
        assert_eq!(processed, vec![true, false]);

        let bits = tree.match_pack(&pkg, None);
        assert_eq!(bits.indexes(), vec![2]);

        let mut empty = ConditionTree::new().and(Condition::equal("n", 1000i64));
        empty.compile(&s).unwrap();
        query_indexes(&tx, &mut empty, &indexes, &s).unwrap();
        assert!(empty.no_match());
    }
}

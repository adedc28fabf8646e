//! Pack loading and persistence

use std::sync::Arc;

use tracing::{debug, info};

use packdb_common::error::{Result, StorageError};
use packdb_common::metrics;

use crate::cache::block_key;
use crate::codec::{encode_pack, PackReader};
use crate::info::{decode_pack_key, encode_pack_key, PackInfo};
use crate::iterator::PackSource;
use crate::package::Package;
use crate::packindex::PackIndex;
use crate::store::Tx;

use super::{Table, TableStats};

impl PackSource for Table {
    fn load_shared(&self, tx: &Tx<'_>, key: u32, fields: &[usize], no_cache: bool) -> Result<Package> {
        self.load_shared_pack(tx, key, fields, no_cache)
    }
}

impl Table {
    /// Load a read-only pack restricted to `fields`. The pk column is always
    /// loaded. Cached blocks are shared, missing ones are decoded from the
    /// stored blob and cached unless `no_cache` is set.
    pub(crate) fn load_shared_pack(
        &self,
        tx: &Tx<'_>,
        key: u32,
        fields: &[usize],
        no_cache: bool,
    ) -> Result<Package> {
        let pk = self.schema.pk_index();
        let mut wanted: Vec<usize> = fields.to_vec();
        if !wanted.contains(&pk) {
            wanted.push(pk);
        }

        let mut blocks = vec![None; self.schema.len()];
        let mut missing = Vec::new();
        for &f in &wanted {
            match self.cache.get(block_key(key, f)) {
                Some(b) => blocks[f] = Some(b),
                None => missing.push(f),
            }
        }

        let mut len = blocks.iter().flatten().map(|b| b.len()).next();
        if !missing.is_empty() {
            let buf = tx
                .get(&self.data_bucket, &encode_pack_key(key))?
                .ok_or(StorageError::PackNotFound(key))?;
            metrics::record_pack_load(buf.len() as u64);
            TableStats::add(&self.stats.packs_loaded, 1);
            TableStats::add(&self.stats.bytes_read, buf.len());

            let reader = PackReader::new(&buf)?;
            len = Some(reader.len());
            for f in missing {
                let block = Arc::new(reader.block(f, self.schema.field(f).typ)?);
                if !no_cache {
                    self.cache.add(block_key(key, f), Arc::clone(&block));
                }
                blocks[f] = Some(block);
            }
        }

        Package::from_blocks(
            Arc::clone(&self.schema),
            key,
            self.options.pack_size,
            len.unwrap_or(0),
            blocks,
        )
    }

    /// Load a fully materialized private copy for mutation
    pub(crate) fn load_writable_pack(&self, tx: &Tx<'_>, key: u32) -> Result<Package> {
        let all: Vec<usize> = (0..self.schema.len()).collect();
        self.load_shared_pack(tx, key, &all, true)?.to_writable()
    }

    /// Persist `pkg` and refresh its directory entry. Empty packs are
    /// deleted instead. Cached blocks of the pack are always dropped.
    pub(crate) fn store_pack(&self, tx: &mut Tx<'_>, packidx: &mut PackIndex, pkg: &mut Package) -> Result<()> {
        let key = pkg.key();
        self.cache.remove_pack(key);

        if pkg.is_empty() {
            if packidx.position(key).is_some() {
                packidx.remove(key);
                tx.delete(&self.data_bucket, &encode_pack_key(key))?;
                debug!(table = %self.name, pack = key, "Deleted empty pack");
            }
            pkg.clear_dirty();
            return Ok(());
        }

        let buf = encode_pack(pkg, self.compress)?;
        let mut info = PackInfo::from_package(pkg);
        info.packed_size = buf.len();
        let size = buf.len();
        tx.put(&self.data_bucket, &encode_pack_key(key), buf)?;
        packidx.add_or_update(info);
        pkg.clear_dirty();

        metrics::record_pack_store(size as u64);
        TableStats::add(&self.stats.packs_stored, 1);
        TableStats::add(&self.stats.bytes_written, size);
        debug!(table = %self.name, pack = key, rows = pkg.len(), bytes = size, "Stored pack");
        Ok(())
    }

    /// Move the upper half of `pkg` into a new pack and store both halves.
    pub(crate) fn split_pack(&self, tx: &mut Tx<'_>, packidx: &mut PackIndex, pkg: &mut Package) -> Result<()> {
        let at = pkg.len() / 2;
        let mut upper = pkg.split_off(at, packidx.next_key())?;
        self.store_pack(tx, packidx, pkg)?;
        self.store_pack(tx, packidx, &mut upper)?;

        metrics::record_split(&self.name);
        TableStats::add(&self.stats.splits, 1);
        info!(
            table = %self.name,
            pack = pkg.key(),
            new_pack = upper.key(),
            lower = pkg.len(),
            upper = upper.len(),
            "Split pack"
        );
        Ok(())
    }

    /// Persist dirty pack headers and delete removed ones.
    pub(crate) fn store_pack_infos(&self, tx: &mut Tx<'_>, packidx: &mut PackIndex) -> Result<()> {
        for key in packidx.take_removed() {
            tx.delete(&self.info_bucket, &encode_pack_key(key))?;
        }
        let mut dirty = Vec::new();
        for info in packidx.dirty_infos() {
            dirty.push((info.encoded_key(), bincode::serialize(info)?));
        }
        for (key, buf) in dirty {
            tx.put(&self.info_bucket, &key, buf)?;
        }
        packidx.clear_dirty();
        Ok(())
    }

    /// Rebuild the directory from persisted pack headers
    pub(crate) fn load_pack_index(&self, tx: &Tx<'_>) -> Result<PackIndex> {
        let mut infos = Vec::new();
        for (k, v) in tx.scan(&self.info_bucket)? {
            let key = decode_pack_key(&k)
                .ok_or_else(|| StorageError::CorruptData(format!("table {}: bad pack key {k:?}", self.name)))?;
            let mut info: PackInfo = bincode::deserialize(&v)?;
            if info.key != key {
                return Err(StorageError::CorruptData(format!(
                    "table {}: pack header {key} claims key {}",
                    self.name, info.key
                ))
                .into());
            }
            info.dirty = false;
            infos.push(info);
        }
        Ok(PackIndex::new(infos, self.schema.pk_index(), self.options.pack_size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use packdb_common::config::TableOptions;
    use packdb_common::types::{Field, FieldType, Schema, Value};

    fn table() -> Table {
        let schema = Schema::new(vec![
            Field::primary("id"),
            Field::new("n", FieldType::Int64),
            Field::new("s", FieldType::String),
        ])
        .unwrap();
        let opts = TableOptions::default().with_pack_size(8);
        Table::create(Store::temporary().unwrap(), "packs", schema, opts).unwrap()
    }

    fn pack(t: &Table, key: u32, pks: std::ops::Range<u64>) -> Package {
        let mut pkg = Package::new(Arc::clone(&t.schema), key, 8);
        for pk in pks {
            #[allow(clippy::cast_possible_wrap)]
            let n = pk as i64;
            pkg.push_row(&vec![Value::Uint64(pk), Value::Int64(n), format!("r{pk}").into()])
                .unwrap();
        }
        pkg
    }

    #[test]
    fn test_store_and_load_partial() {
        let t = table();
        let mut idx = PackIndex::new(Vec::new(), 0, 8);
        let mut tx = t.store.begin(true);
        let mut pkg = pack(&t, 0, 1..5);
        t.store_pack(&mut tx, &mut idx, &mut pkg).unwrap();
        t.store_pack_infos(&mut tx, &mut idx).unwrap();
        tx.commit().unwrap();

        let tx = t.store.begin(false);
        let loaded = t.load_shared_pack(&tx, 0, &[1], false).unwrap();
        assert_eq!(loaded.len(), 4);
        assert!(loaded.has_block(0));
        assert!(loaded.has_block(1));
        assert!(!loaded.has_block(2));
        assert_eq!(loaded.value(1, 3), Some(Value::Int64(4)));

        // second load hits the cache for both columns
        let _ = t.load_shared_pack(&tx, 0, &[1], false).unwrap();
        assert_eq!(t.cache.stats().hits, 2);

        let reloaded = t.load_pack_index(&tx).unwrap();
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.min_max(0), (1, 4));
    }

    #[test]
    fn test_split_and_empty_pack_removal() {
        let t = table();
        let mut idx = PackIndex::new(Vec::new(), 0, 8);
        let mut tx = t.store.begin(true);
        let mut pkg = pack(&t, 0, 1..9);
        t.split_pack(&mut tx, &mut idx, &mut pkg).unwrap();
        assert_eq!(idx.len(), 2);
        assert_eq!(idx.min_max(0), (1, 4));
        assert_eq!(idx.min_max(1), (5, 8));

        pkg.clear().unwrap();
        t.store_pack(&mut tx, &mut idx, &mut pkg).unwrap();
        assert_eq!(idx.len(), 1);
        assert_eq!(idx.take_removed(), vec![0]);
        assert!(tx.get(&t.data_bucket, &encode_pack_key(0)).unwrap().is_none());
    }

    #[test]
    fn test_missing_pack_is_not_found() {
        let t = table();
        let tx = t.store.begin(false);
        let err = t.load_shared_pack(&tx, 7, &[0], false).unwrap_err();
        assert!(err.is_not_found());
    }
}

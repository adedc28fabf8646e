//! Transactional bucket store on top of sled
//!
//! Buckets are sled trees that must be created explicitly; opening an
//! unknown bucket is a structural error. A write [`Tx`] holds the store's
//! single writer lock, stages puts and deletes in memory (visible to its own
//! reads) and applies them per bucket as atomic sled batches on commit.
//! Dropping an uncommitted transaction rolls it back.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use sled::Db;
use tracing::{debug, info, warn};

use packdb_common::config::StorageConfig;
use packdb_common::error::{Error, Result, StorageError};

fn read_err(e: sled::Error) -> Error {
    Error::Storage(StorageError::ReadFailed(e.to_string()))
}

fn write_err(e: sled::Error) -> Error {
    Error::Storage(StorageError::WriteFailed(e.to_string()))
}

/// Embedded KV store shared by all tables of a database
pub struct Store {
    db: Db,
    config: StorageConfig,
    /// Known buckets
    trees: Mutex<HashMap<String, sled::Tree>>,
    /// One active writer transaction at a time
    writer: Mutex<()>,
}

impl Store {
    /// Open or create a store at `config.path`
    pub fn open(config: &StorageConfig) -> Result<Arc<Self>> {
        info!("Opening pack store at {}", config.path);

        let flush_every = (config.flush_every_ms > 0).then_some(config.flush_every_ms);
        let mut cfg = sled::Config::new()
            .temporary(config.temporary)
            .cache_capacity(config.cache_size_bytes as u64)
            .flush_every_ms(flush_every);
        // temporary stores get a unique generated path
        if !config.temporary {
            cfg = cfg.path(Path::new(&config.path));
        }
        let db = cfg.open().map_err(write_err)?;

        Ok(Arc::new(Self {
            db,
            config: config.clone(),
            trees: Mutex::new(HashMap::new()),
            writer: Mutex::new(()),
        }))
    }

    /// Store backed by a temporary directory removed on drop
    pub fn temporary() -> Result<Arc<Self>> {
        let config = StorageConfig {
            temporary: true,
            ..StorageConfig::default()
        };
        Self::open(&config)
    }

    #[must_use]
    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Begin a transaction. Write transactions block until the current
    /// writer finishes.
    pub fn begin(&self, writable: bool) -> Tx<'_> {
        let guard = writable.then(|| self.writer.lock());
        Tx {
            store: self,
            writable,
            _guard: guard,
            staged: BTreeMap::new(),
            created: Vec::new(),
            pending: 0,
        }
    }

    pub fn has_bucket(&self, name: &str) -> Result<bool> {
        if self.trees.lock().contains_key(name) {
            return Ok(true);
        }
        let names = self.db.tree_names();
        Ok(names.iter().any(|n| n.as_ref() == name.as_bytes()))
    }

    fn tree(&self, name: &str) -> Result<sled::Tree> {
        if let Some(t) = self.trees.lock().get(name) {
            return Ok(t.clone());
        }
        if !self.has_bucket(name)? {
            return Err(StorageError::BucketNotFound(name.to_string()).into());
        }
        let tree = self.db.open_tree(name).map_err(read_err)?;
        self.trees.lock().insert(name.to_string(), tree.clone());
        Ok(tree)
    }

    fn create_tree(&self, name: &str) -> Result<()> {
        let tree = self.db.open_tree(name).map_err(write_err)?;
        self.trees.lock().insert(name.to_string(), tree);
        Ok(())
    }

    fn drop_tree(&self, name: &str) -> Result<()> {
        self.trees.lock().remove(name);
        self.db.drop_tree(name).map_err(write_err)?;
        Ok(())
    }

    /// Persist all buffered writes to disk
    pub fn flush(&self) -> Result<usize> {
        self.db.flush().map_err(write_err)
    }

    /// On-disk footprint in bytes
    pub fn size_on_disk(&self) -> Result<u64> {
        self.db.size_on_disk().map_err(read_err)
    }
}

type Staged = BTreeMap<Vec<u8>, Option<Vec<u8>>>;

/// A read or write transaction
pub struct Tx<'a> {
    store: &'a Store,
    writable: bool,
    _guard: Option<MutexGuard<'a, ()>>,
    staged: BTreeMap<String, Staged>,
    created: Vec<String>,
    pending: usize,
}

impl<'a> Tx<'a> {
    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Number of staged writes since the last (sub-)commit
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending
    }

    #[must_use]
    pub fn store(&self) -> &'a Store {
        self.store
    }

    fn check_writable(&self) -> Result<()> {
        if self.writable {
            Ok(())
        } else {
            Err(StorageError::ReadOnlyTx.into())
        }
    }

    pub fn has_bucket(&self, name: &str) -> Result<bool> {
        self.store.has_bucket(name)
    }

    /// Create a bucket; no-op if it exists. Rolled back with the transaction.
    pub fn create_bucket(&mut self, name: &str) -> Result<()> {
        self.check_writable()?;
        if self.store.has_bucket(name)? {
            return Ok(());
        }
        self.store.create_tree(name)?;
        self.created.push(name.to_string());
        Ok(())
    }

    /// Remove a bucket and its contents immediately
    pub fn drop_bucket(&mut self, name: &str) -> Result<()> {
        self.check_writable()?;
        self.staged.remove(name);
        self.store.drop_tree(name)
    }

    pub fn get(&self, bucket: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(v) = self.staged.get(bucket).and_then(|s| s.get(key)) {
            return Ok(v.clone());
        }
        let tree = self.store.tree(bucket)?;
        Ok(tree.get(key).map_err(read_err)?.map(|v| v.to_vec()))
    }

    pub fn put(&mut self, bucket: &str, key: &[u8], value: Vec<u8>) -> Result<()> {
        self.check_writable()?;
        self.store.tree(bucket)?;
        self.staged
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_vec(), Some(value));
        self.pending += 1;
        Ok(())
    }

    pub fn delete(&mut self, bucket: &str, key: &[u8]) -> Result<()> {
        self.check_writable()?;
        self.store.tree(bucket)?;
        self.staged
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_vec(), None);
        self.pending += 1;
        Ok(())
    }

    /// Forward cursor over a bucket, staged writes included
    pub fn scan(&self, bucket: &str) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.scan_prefix(bucket, &[])
    }

    /// Forward cursor over keys starting with `prefix`
    pub fn scan_prefix(&self, bucket: &str, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let tree = self.store.tree(bucket)?;
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
        for item in tree.scan_prefix(prefix) {
            let (k, v) = item.map_err(read_err)?;
            merged.insert(k.to_vec(), v.to_vec());
        }
        if let Some(staged) = self.staged.get(bucket) {
            for (k, v) in staged.range(prefix.to_vec()..) {
                if !k.starts_with(prefix) {
                    break;
                }
                match v {
                    Some(v) => merged.insert(k.clone(), v.clone()),
                    None => merged.remove(k),
                };
            }
        }
        Ok(merged.into_iter().collect())
    }

    fn apply(&mut self) -> Result<()> {
        for (bucket, ops) in std::mem::take(&mut self.staged) {
            let tree = self.store.tree(&bucket)?;
            let mut batch = sled::Batch::default();
            for (k, v) in ops {
                match v {
                    Some(v) => batch.insert(k, v),
                    None => batch.remove(k),
                }
            }
            tree.apply_batch(batch).map_err(write_err)?;
        }
        self.store.flush()?;
        self.created.clear();
        self.pending = 0;
        Ok(())
    }

    /// Apply staged writes and end the transaction
    pub fn commit(mut self) -> Result<()> {
        if !self.writable {
            return Ok(());
        }
        self.apply()
    }

    /// Apply staged writes and keep the writer lock for a fresh batch
    pub fn commit_and_continue(&mut self) -> Result<()> {
        self.check_writable()?;
        debug!(writes = self.pending, "Committing transaction batch");
        self.apply()
    }

    /// Discard staged writes and buckets created by this transaction
    pub fn rollback(mut self) {
        self.discard();
    }

    fn discard(&mut self) {
        self.staged.clear();
        self.pending = 0;
        for name in std::mem::take(&mut self.created) {
            if let Err(e) = self.store.drop_tree(&name) {
                warn!("Failed to drop bucket {} on rollback: {}", name, e);
            }
        }
    }
}

impl Drop for Tx<'_> {
    fn drop(&mut self) {
        if self.pending > 0 || !self.created.is_empty() {
            debug!(writes = self.pending, "Rolling back uncommitted transaction");
        }
        self.discard();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_bucket_is_structural_error() {
        let store = Store::temporary().unwrap();
        let tx = store.begin(false);
        let err = tx.get("nope", b"k").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_read_your_writes_and_commit() {
        let store = Store::temporary().unwrap();
        let mut tx = store.begin(true);
        tx.create_bucket("b").unwrap();
        tx.put("b", b"k1", b"v1".to_vec()).unwrap();
        tx.put("b", b"k2", b"v2".to_vec()).unwrap();
        assert_eq!(tx.get("b", b"k1").unwrap(), Some(b"v1".to_vec()));
        assert_eq!(tx.pending(), 2);
        tx.commit().unwrap();

        let mut tx = store.begin(true);
        tx.delete("b", b"k1").unwrap();
        let keys: Vec<Vec<u8>> = tx.scan("b").unwrap().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![b"k2".to_vec()]);
        tx.rollback();

        let mut tx = store.begin(false);
        assert_eq!(tx.scan("b").unwrap().len(), 2);
        assert!(tx.put("b", b"k3", vec![]).is_err());
    }

    #[test]
    fn test_rollback_drops_created_buckets() {
        let store = Store::temporary().unwrap();
        {
            let mut tx = store.begin(true);
            tx.create_bucket("tmp").unwrap();
            tx.put("tmp", b"a", vec![1]).unwrap();
        }
        assert!(!store.has_bucket("tmp").unwrap());
    }

    #[test]
    fn test_commit_and_continue() {
        let store = Store::temporary().unwrap();
        let mut tx = store.begin(true);
        tx.create_bucket("b").unwrap();
        tx.put("b", b"a", vec![1]).unwrap();
        tx.commit_and_continue().unwrap();
        assert_eq!(tx.pending(), 0);
        tx.put("b", b"b", vec![2]).unwrap();
        drop(tx);

        let tx = store.begin(false);
        assert_eq!(tx.get("b", b"a").unwrap(), Some(vec![1]));
        assert_eq!(tx.get("b", b"b").unwrap(), None);
    }
}

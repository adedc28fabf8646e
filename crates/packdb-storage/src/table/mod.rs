//! Columnar tables
//!
//! A [`Table`] combines the journal, the pack directory, the block cache
//! and secondary indexes. Mutations stage rows in the journal and flush it
//! into packs once it fills up; queries scan packs and overlay the live
//! journal. One read/write lock per table serializes mutations and flushes
//! against scans.
//!
//! On-disk layout inside the shared [`Store`]:
//!
//! | bucket                   | content                                        |
//! |--------------------------|------------------------------------------------|
//! | `<name>`                 | pack blobs keyed by 4-byte big-endian pack key |
//! | `<name>_meta`            | `_options`, `_fields`, `_indexes`, `_meta`, `_journal`, `_flush` |
//! | `<name>_meta/_packinfo`  | bincode [`PackInfo`] per pack key              |
//! | `<name>_<field>_index`   | secondary index entries                        |

mod compact;
mod flush;
mod pack_io;
mod query;
mod stats;
mod write;

use std::sync::Arc;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use packdb_common::config::TableOptions;
use packdb_common::error::{Error, Result, StorageError};
use packdb_common::types::{IndexKind, Schema};

use crate::cache::BlockCache;
use crate::index::SecondaryIndex;
use crate::info::PackInfo;
use crate::iterator::check_cancelled;
use crate::journal::{Journal, JournalSnapshot};
use crate::packindex::PackIndex;
use crate::store::{Store, Tx};

pub use stats::{TableStats, TableStatsSnapshot};

const KEY_OPTIONS: &str = "_options";
const KEY_FIELDS: &str = "_fields";
const KEY_INDEXES: &str = "_indexes";
const KEY_META: &str = "_meta";
const KEY_JOURNAL: &str = "_journal";
const KEY_FLUSH: &str = "_flush";

/// Persisted table counters
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub(crate) struct TableMeta {
    /// Highest pk handed out
    pub sequence: u64,
    /// Rows stored in packs
    pub rows: u64,
}

/// Persisted index definition
#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexDef {
    field: String,
    kind: IndexKind,
}

/// In-progress flush marker, present only while sub-commits are pending
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub(crate) struct FlushMarker {
    pub epoch: u64,
    pub sub_commits: usize,
    pub journal_len: usize,
    pub tomb_len: usize,
}

/// Mutable table state guarded by the table lock
pub(crate) struct TableState {
    pub journal: Journal,
    pub packidx: PackIndex,
    pub indexes: Vec<SecondaryIndex>,
    pub meta: TableMeta,
    pub epoch: u64,
}

/// A columnar table stored in packs
pub struct Table {
    name: String,
    store: Arc<Store>,
    schema: Arc<Schema>,
    options: TableOptions,
    compress: bool,
    cache: BlockCache,
    stats: TableStats,
    state: RwLock<TableState>,
    data_bucket: String,
    meta_bucket: String,
    info_bucket: String,
}

fn get_json<T: DeserializeOwned>(tx: &Tx<'_>, bucket: &str, key: &str) -> Result<Option<T>> {
    match tx.get(bucket, key.as_bytes())? {
        Some(v) => Ok(Some(serde_json::from_slice(&v)?)),
        None => Ok(None),
    }
}

fn put_json<T: Serialize>(tx: &mut Tx<'_>, bucket: &str, key: &str, val: &T) -> Result<()> {
    tx.put(bucket, key.as_bytes(), serde_json::to_vec(val)?)
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') || name.starts_with('_') {
        return Err(Error::Config(format!("invalid table name {name:?}")));
    }
    Ok(())
}

impl Table {
    /// Create a new table and its buckets.
    pub fn create(store: Arc<Store>, name: &str, schema: Schema, options: TableOptions) -> Result<Self> {
        validate_name(name)?;
        options.validate()?;
        let schema = Arc::new(schema);

        let mut table = Self::new(store, name, Arc::clone(&schema), options.clone());
        let store = Arc::clone(&table.store);
        let mut tx = store.begin(true);
        if tx.has_bucket(&table.data_bucket)? {
            return Err(StorageError::TableExists(name.to_string()).into());
        }

        tx.create_bucket(&table.data_bucket)?;
        tx.create_bucket(&table.meta_bucket)?;
        tx.create_bucket(&table.info_bucket)?;

        let mut indexes = Vec::new();
        let mut defs = Vec::new();
        for (i, field) in schema.fields().iter().enumerate() {
            if let Some(kind) = field.index {
                let idx = SecondaryIndex::new(name, &schema, i, kind)?;
                idx.create_tx(&mut tx)?;
                defs.push(IndexDef {
                    field: field.name.clone(),
                    kind,
                });
                indexes.push(idx);
            }
        }

        put_json(&mut tx, &table.meta_bucket, KEY_OPTIONS, &options)?;
        put_json(&mut tx, &table.meta_bucket, KEY_FIELDS, schema.as_ref())?;
        put_json(&mut tx, &table.meta_bucket, KEY_INDEXES, &defs)?;
        put_json(&mut tx, &table.meta_bucket, KEY_META, &TableMeta::default())?;
        tx.commit()?;

        table.state.get_mut().indexes = indexes;
        info!(table = %name, fields = schema.len(), pack_size = options.pack_size, "Created table");
        Ok(table)
    }

    /// Open an existing table.
    pub fn open(store: Arc<Store>, name: &str) -> Result<Self> {
        validate_name(name)?;
        let data_bucket = name.to_string();
        let meta_bucket = format!("{name}_meta");

        let tx = store.begin(false);
        if !tx.has_bucket(&data_bucket)? || !tx.has_bucket(&meta_bucket)? {
            return Err(StorageError::TableNotFound(name.to_string()).into());
        }
        let missing = |key: &str| StorageError::CorruptData(format!("table {name}: missing {key}"));
        let options: TableOptions =
            get_json(&tx, &meta_bucket, KEY_OPTIONS)?.ok_or_else(|| missing(KEY_OPTIONS))?;
        let schema: Schema = get_json(&tx, &meta_bucket, KEY_FIELDS)?.ok_or_else(|| missing(KEY_FIELDS))?;
        let defs: Vec<IndexDef> = get_json(&tx, &meta_bucket, KEY_INDEXES)?.unwrap_or_default();
        let meta: TableMeta = get_json(&tx, &meta_bucket, KEY_META)?.unwrap_or_default();
        let marker: Option<FlushMarker> = get_json(&tx, &meta_bucket, KEY_FLUSH)?;
        let snapshot = match tx.get(&meta_bucket, KEY_JOURNAL.as_bytes())? {
            Some(buf) => Some(bincode::deserialize::<JournalSnapshot>(&buf)?),
            None => None,
        };
        drop(tx);

        let mut table = Self::new(Arc::clone(&store), name, Arc::new(schema), options);
        let tx = store.begin(false);
        let packidx = table.load_pack_index(&tx)?;

        let mut indexes = Vec::with_capacity(defs.len());
        for def in defs {
            let pos = table.schema.resolve(&def.field)?;
            indexes.push(SecondaryIndex::new(name, &table.schema, pos, def.kind)?);
        }
        drop(tx);

        let (_, max_pk) = packidx.global_min_max();
        let mut journal = Journal::new(
            Arc::clone(&table.schema),
            meta.sequence.max(max_pk),
            table.options.journal_size,
        );
        if let Some(snap) = snapshot {
            journal.restore(snap)?;
        }

        if let Some(m) = marker {
            warn!(
                table = %name,
                epoch = m.epoch,
                sub_commits = m.sub_commits,
                "Found interrupted flush, journal will be replayed"
            );
        }

        let state = table.state.get_mut();
        state.journal = journal;
        state.packidx = packidx;
        state.indexes = indexes;
        state.meta = meta;
        state.epoch = marker.map_or(0, |m| m.epoch);

        info!(
            table = %name,
            packs = state.packidx.len(),
            rows = state.packidx.count(),
            journal = state.journal.len(),
            "Opened table"
        );
        Ok(table)
    }

    fn new(store: Arc<Store>, name: &str, schema: Arc<Schema>, options: TableOptions) -> Self {
        let compress = cfg!(feature = "compression") && store.config().compression_enabled;
        let state = TableState {
            journal: Journal::new(Arc::clone(&schema), 0, options.journal_size),
            packidx: PackIndex::new(Vec::new(), schema.pk_index(), options.pack_size),
            indexes: Vec::new(),
            meta: TableMeta::default(),
            epoch: 0,
        };
        Self {
            name: name.to_string(),
            cache: BlockCache::new(options.cache_size_bytes),
            stats: TableStats::default(),
            state: RwLock::new(state),
            data_bucket: name.to_string(),
            meta_bucket: format!("{name}_meta"),
            info_bucket: format!("{name}_meta/_packinfo"),
            store,
            schema,
            options,
            compress,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    #[must_use]
    pub fn options(&self) -> &TableOptions {
        &self.options
    }

    /// Reserve the next primary key
    pub fn next_sequence(&self) -> u64 {
        self.state.write().journal.next_sequence()
    }

    /// Persist the journal so unflushed rows survive a restart.
    pub fn sync(&self, ctx: &CancellationToken) -> Result<()> {
        check_cancelled(ctx)?;
        let state = self.state.read();
        let mut tx = self.store.begin(true);
        self.store_journal(&mut tx, &state.journal)?;
        let meta = TableMeta {
            sequence: state.journal.max_id(),
            ..state.meta
        };
        put_json(&mut tx, &self.meta_bucket, KEY_META, &meta)?;
        tx.commit()?;
        debug!(table = %self.name, journal = state.journal.len(), "Synced journal");
        Ok(())
    }

    /// Sync and release the table.
    pub fn close(self) -> Result<()> {
        self.sync(&CancellationToken::new())?;
        self.cache.purge();
        info!(table = %self.name, "Closed table");
        Ok(())
    }

    /// Delete the table: packs, metadata, pack headers and every index.
    pub fn drop(self, ctx: &CancellationToken) -> Result<()> {
        check_cancelled(ctx)?;
        let mut state = self.state.write();
        self.cache.purge();

        let mut tx = self.store.begin(true);
        for idx in &mut state.indexes {
            idx.drop_tx(&mut tx)?;
        }
        tx.drop_bucket(&self.info_bucket)?;
        tx.drop_bucket(&self.meta_bucket)?;
        tx.drop_bucket(&self.data_bucket)?;
        tx.commit()?;

        info!(table = %self.name, indexes = state.indexes.len(), "Dropped table");
        state.indexes.clear();
        Ok(())
    }

    /// Pack headers in key order
    #[must_use]
    pub fn pack_infos(&self) -> Vec<PackInfo> {
        self.state.read().packidx.infos().to_vec()
    }

    /// Drop all cached blocks
    pub fn purge_cache(&self) {
        self.cache.purge();
        debug!(table = %self.name, "Purged block cache");
    }

    #[must_use]
    pub fn stats(&self) -> TableStatsSnapshot {
        let state = self.state.read();
        let gauges = stats::Gauges {
            packs: state.packidx.len(),
            rows: state.packidx.count(),
            table_size: state.packidx.table_size(),
            journal_rows: state.journal.len(),
            journal_tombstones: state.journal.tomb_len(),
            journal_size: state.journal.heap_size(),
            sequence: state.journal.max_id(),
        };
        self.stats.snapshot(&self.name, gauges, self.cache.stats())
    }

    /// Create and back-fill a secondary index on `field`.
    pub fn create_index(&self, ctx: &CancellationToken, field: &str, kind: IndexKind) -> Result<()> {
        check_cancelled(ctx)?;
        let mut state = self.state.write();
        let pos = self.schema.resolve(field)?;
        if state.indexes.iter().any(|i| i.position() == pos) {
            return Err(Error::Config(format!("table {}: field {field} is already indexed", self.name)));
        }
        let mut idx = SecondaryIndex::new(&self.name, &self.schema, pos, kind)?;
        let fields = [self.schema.pk_index(), pos];

        let mut tx = self.store.begin(true);
        idx.create_tx(&mut tx)?;
        let keys: Vec<u32> = state.packidx.infos().iter().map(|i| i.key).collect();
        for key in keys {
            check_cancelled(ctx)?;
            let pkg = self.load_shared_pack(&tx, key, &fields, true)?;
            idx.add_tx(&pkg, 0, pkg.len())?;
            if tx.pending() >= self.options.tx_max_pending {
                idx.flush_tx(&mut tx)?;
                tx.commit_and_continue()?;
            }
        }
        idx.flush_tx(&mut tx)?;

        state.indexes.push(idx);
        self.store_index_defs(&mut tx, &state.indexes)?;
        if let Err(e) = tx.commit() {
            state.indexes.pop();
            return Err(e);
        }
        info!(table = %self.name, field = %field, ?kind, "Created index");
        Ok(())
    }

    /// Remove the secondary index on `field`.
    pub fn drop_index(&self, ctx: &CancellationToken, field: &str) -> Result<()> {
        check_cancelled(ctx)?;
        let mut state = self.state.write();
        let pos = self.schema.resolve(field)?;
        let Some(i) = state.indexes.iter().position(|idx| idx.position() == pos) else {
            return Err(Error::Config(format!("table {}: field {field} is not indexed", self.name)));
        };
        let mut idx = state.indexes.remove(i);
        let mut tx = self.store.begin(true);
        self.store_index_defs(&mut tx, &state.indexes)?;
        idx.drop_tx(&mut tx)?;
        tx.commit()?;
        info!(table = %self.name, field = %field, "Dropped index");
        Ok(())
    }

    fn store_index_defs(&self, tx: &mut Tx<'_>, indexes: &[SecondaryIndex]) -> Result<()> {
        let defs: Vec<IndexDef> = indexes
            .iter()
            .map(|i| IndexDef {
                field: i.field().to_string(),
                kind: i.kind(),
            })
            .collect();
        put_json(tx, &self.meta_bucket, KEY_INDEXES, &defs)
    }

    fn store_journal(&self, tx: &mut Tx<'_>, journal: &Journal) -> Result<()> {
        let snap = bincode::serialize(&journal.snapshot())?;
        tx.put(&self.meta_bucket, KEY_JOURNAL.as_bytes(), snap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use packdb_common::types::{Field, FieldType, Value};

    fn schema() -> Schema {
        Schema::new(vec![
            Field::primary("id"),
            Field::new("n", FieldType::Int64).with_index(IndexKind::Integer),
        ])
        .unwrap()
    }

    #[test]
    fn test_create_and_reopen() {
        let store = Store::temporary().unwrap();
        let ctx = CancellationToken::new();
        let opts = TableOptions::default().with_pack_size(16);
        let table = Table::create(Arc::clone(&store), "t", schema(), opts.clone()).unwrap();
        assert!(Table::create(Arc::clone(&store), "t", schema(), opts).is_err());

        table
            .insert(&ctx, vec![vec![Value::Uint64(0), Value::Int64(5)]])
            .unwrap();
        assert_eq!(table.next_sequence(), 2);
        table.close().unwrap();

        let table = Table::open(Arc::clone(&store), "t").unwrap();
        assert_eq!(table.options().pack_size, 16);
        assert_eq!(table.stats().journal_rows, 1);
        assert_eq!(table.next_sequence(), 3);
        assert_eq!(table.state.read().indexes.len(), 1);
    }

    #[test]
    fn test_open_missing_table() {
        let store = Store::temporary().unwrap();
        let err = Table::open(store, "nope").err().unwrap();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_invalid_names_and_options() {
        let store = Store::temporary().unwrap();
        assert!(Table::create(Arc::clone(&store), "", schema(), TableOptions::default()).is_err());
        assert!(Table::create(Arc::clone(&store), "a/b", schema(), TableOptions::default()).is_err());
        let bad = TableOptions::default().with_pack_size(0);
        assert!(Table::create(store, "t", schema(), bad).is_err());
    }
}

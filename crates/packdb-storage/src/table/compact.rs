//! Pack compaction
//!
//! Compaction walks destination keys `0..n` in key order. Missing keys get
//! a fresh pack, under-full packs pull rows from the pack with the next
//! larger pk range, and emptied source packs disappear. Out-of-order packs
//! (min below the running max) are left alone.

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use packdb_common::error::Result;
use packdb_common::metrics;

use crate::package::Package;
use crate::packindex::PackIndex;
use crate::store::Tx;

use super::{check_cancelled, Table, TableStats};

impl Table {
    /// Remove key gaps and merge under-full packs. Returns the number of
    /// packs rewritten.
    pub fn compact(&self, ctx: &CancellationToken) -> Result<usize> {
        check_cancelled(ctx)?;
        let mut state = self.state.write();
        if state.packidx.is_compact() {
            debug!(table = %self.name, packs = state.packidx.len(), "Table already compact");
            return Ok(0);
        }

        let start = Instant::now();
        let mut tx = self.store.begin(true);
        let written = match self.compact_tx(ctx, &mut tx, &mut state.packidx) {
            Ok(n) => n,
            Err(e) => {
                tx.rollback();
                return Err(self.restore_committed_state(&mut state, e));
            }
        };
        if let Err(e) = tx.commit() {
            return Err(self.restore_committed_state(&mut state, e));
        }
        self.cache.purge();

        let elapsed = start.elapsed().as_secs_f64() * 1000.0;
        TableStats::add(&self.stats.compactions, 1);
        metrics::record_compaction(&self.name, written as u64, elapsed);
        info!(
            table = %self.name,
            packs_written = written,
            packs = state.packidx.len(),
            duration_ms = elapsed,
            "Compacted table"
        );
        Ok(written)
    }

    fn compact_tx(&self, ctx: &CancellationToken, tx: &mut Tx<'_>, packidx: &mut PackIndex) -> Result<usize> {
        let mut written = 0;
        let mut last_max = 0;
        let mut dst_key: u32 = 0;

        while (dst_key as usize) < packidx.len() {
            let mut dst = match packidx.position(dst_key) {
                Some(pos) => {
                    let info = packidx.get(pos);
                    let (min, max) = packidx.min_max(pos);
                    if info.n_values >= self.options.pack_size {
                        last_max = last_max.max(max);
                        dst_key += 1;
                        continue;
                    }
                    if min < last_max {
                        debug!(table = %self.name, pack = dst_key, min, last_max, "Skipping out-of-order pack");
                        last_max = last_max.max(max);
                        dst_key += 1;
                        continue;
                    }
                    self.load_writable_pack(tx, dst_key)?
                }
                None => Package::new(Arc::clone(&self.schema), dst_key, self.options.pack_size),
            };

            let mut changed = false;
            while !dst.is_full() {
                let floor = last_max.max(dst.pk_range().1);
                let Some(src_key) = next_source(packidx, dst_key, floor) else {
                    break;
                };
                let mut src = self.load_writable_pack(tx, src_key)?;
                let n = (dst.capacity() - dst.len()).min(src.len());
                dst.append_from(&src, 0, n)?;
                src.delete(0, n)?;
                self.store_pack(tx, packidx, &mut src)?;
                written += 1;
                changed = true;
                debug!(table = %self.name, from = src_key, to = dst_key, rows = n, "Moved rows");
            }

            if changed {
                self.store_pack(tx, packidx, &mut dst)?;
                written += 1;
                if tx.pending() >= self.options.tx_max_pending {
                    self.store_pack_infos(tx, packidx)?;
                    tx.commit_and_continue()?;
                    check_cancelled(ctx)?;
                }
            }
            last_max = last_max.max(dst.pk_range().1);
            dst_key += 1;
        }

        self.store_pack_infos(tx, packidx)?;
        Ok(written)
    }
}

/// Key of the non-empty pack with the smallest min above `floor` among keys
/// after `dst_key`
fn next_source(packidx: &PackIndex, dst_key: u32, floor: u64) -> Option<u32> {
    (packidx.first_sorted_above(floor)..packidx.len()).find_map(|i| {
        let info = packidx.get_sorted(i);
        (info.key > dst_key && info.n_values > 0).then_some(info.key)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Query;
    use crate::store::Store;
    use packdb_common::config::TableOptions;
    use packdb_common::types::{Field, FieldType, Schema, Value};

    fn table() -> Table {
        let schema = Schema::new(vec![Field::primary("id"), Field::new("n", FieldType::Int64)]).unwrap();
        let opts = TableOptions::default().with_pack_size(4);
        Table::create(Store::temporary().unwrap(), "c", schema, opts).unwrap()
    }

    fn fill(t: &Table, n: u64) {
        let ctx = CancellationToken::new();
        let rows = (1..=n).map(|pk| vec![Value::Uint64(pk), Value::Int64(0)]).collect();
        t.insert(&ctx, rows).unwrap();
        t.flush(&ctx).unwrap();
    }

    fn keys(t: &Table) -> Vec<u32> {
        t.state.read().packidx.infos().iter().map(|i| i.key).collect()
    }

    #[test]
    fn test_next_source_picks_smallest_min_above_floor() {
        use crate::info::{BlockInfo, PackInfo};

        let info = |key: u32, min: u64, max: u64, n: usize| PackInfo {
            key,
            n_values: n,
            packed_size: 0,
            blocks: vec![BlockInfo {
                typ: FieldType::Uint64,
                min: Value::Uint64(min),
                max: Value::Uint64(max),
                null_count: 0,
            }],
            dirty: false,
        };
        // pk order: key 3 [1..2], key 0 [5..6], key 2 [9..9], key 1 [20..22]
        let idx = PackIndex::new(
            vec![info(0, 5, 6, 2), info(1, 20, 22, 3), info(2, 9, 9, 1), info(3, 1, 2, 2)],
            0,
            4,
        );
        assert_eq!(next_source(&idx, 0, 6), Some(2));
        assert_eq!(next_source(&idx, 0, 8), Some(2));
        assert_eq!(next_source(&idx, 0, 9), Some(1));
        // candidates above the floor must also come after the destination key
        assert_eq!(next_source(&idx, 1, 6), Some(2));
        assert_eq!(next_source(&idx, 2, 6), None);
        // key 3 sits above the floor only when the floor is 0
        assert_eq!(next_source(&idx, 0, 0), Some(3));
        assert_eq!(next_source(&idx, 1, 22), None);
    }

    #[test]
    fn test_compact_table_is_untouched() {
        let t = table();
        fill(&t, 10);
        let ctx = CancellationToken::new();
        assert_eq!(t.compact(&ctx).unwrap(), 0);
        assert_eq!(keys(&t), vec![0, 1, 2]);
    }

    #[test]
    fn test_compact_fills_key_gap() {
        let t = table();
        fill(&t, 12);
        let ctx = CancellationToken::new();
        t.delete_pks(&ctx, &[5, 6, 7, 8]).unwrap();
        t.flush(&ctx).unwrap();
        assert_eq!(keys(&t), vec![0, 2]);

        assert!(t.compact(&ctx).unwrap() > 0);
        assert_eq!(keys(&t), vec![0, 1]);
        assert!(t.state.read().packidx.is_compact());
        let res = t.query(&ctx, &Query::new("all")).unwrap();
        assert_eq!(res.pks(), vec![1, 2, 3, 4, 9, 10, 11, 12]);
    }

    #[test]
    fn test_compact_merges_underfull_packs() {
        let t = table();
        fill(&t, 12);
        let ctx = CancellationToken::new();
        t.delete_pks(&ctx, &[1, 2]).unwrap();
        t.flush(&ctx).unwrap();

        assert_eq!(t.compact(&ctx).unwrap(), 4);
        let state = t.state.read();
        assert!(state.packidx.is_compact());
        assert_eq!(state.packidx.min_max(0), (3, 6));
        assert_eq!(state.packidx.min_max(1), (7, 10));
        assert_eq!(state.packidx.min_max(2), (11, 12));
        assert_eq!(state.packidx.count(), 10);
    }
}

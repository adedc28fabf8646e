//! Pack iterators
//!
//! Iterators walk the [`PackIndex`] in primary key order and hand out the
//! next pack holding at least one matching row together with the matching
//! row positions. Packs rejected by the zone map are never loaded; a loaded
//! pack whose exact bitmap turns out empty is dropped and the walk goes on.
//! Cancellation is checked once per pack load.

use tokio_util::sync::CancellationToken;
use tracing::trace;

use packdb_common::error::{QueryError, Result};

use crate::package::Package;
use crate::packindex::PackIndex;
use crate::store::Tx;
use crate::tree::ConditionTree;

/// Loads read-only packs restricted to a set of columns
pub(crate) trait PackSource {
    fn load_shared(&self, tx: &Tx<'_>, key: u32, fields: &[usize], no_cache: bool) -> Result<Package>;
}

pub(crate) fn check_cancelled(ctx: &CancellationToken) -> Result<()> {
    if ctx.is_cancelled() {
        Err(QueryError::Cancelled.into())
    } else {
        Ok(())
    }
}

/// Walk counters, reported in debug logs and table stats
#[derive(Debug, Clone, Copy, Default)]
pub struct ScanStats {
    pub packs_loaded: usize,
    pub packs_skipped: usize,
    pub rows_matched: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Reverse,
}

/// Filtered pack walk in ascending or descending pk order
pub(crate) struct ScanIterator<'a, S: PackSource> {
    source: &'a S,
    packidx: &'a PackIndex,
    tree: &'a ConditionTree,
    fields: &'a [usize],
    ctx: &'a CancellationToken,
    no_cache: bool,
    dir: Direction,
    /// Packs of the sorted permutation not yet visited
    remaining: usize,
    pack: Option<Package>,
    hits: Vec<u32>,
    stats: ScanStats,
}

impl<'a, S: PackSource> ScanIterator<'a, S> {
    pub fn forward(
        source: &'a S,
        packidx: &'a PackIndex,
        tree: &'a ConditionTree,
        fields: &'a [usize],
        ctx: &'a CancellationToken,
        no_cache: bool,
    ) -> Self {
        Self::new(source, packidx, tree, fields, ctx, no_cache, Direction::Forward)
    }

    pub fn reverse(
        source: &'a S,
        packidx: &'a PackIndex,
        tree: &'a ConditionTree,
        fields: &'a [usize],
        ctx: &'a CancellationToken,
        no_cache: bool,
    ) -> Self {
        Self::new(source, packidx, tree, fields, ctx, no_cache, Direction::Reverse)
    }

    fn new(
        source: &'a S,
        packidx: &'a PackIndex,
        tree: &'a ConditionTree,
        fields: &'a [usize],
        ctx: &'a CancellationToken,
        no_cache: bool,
        dir: Direction,
    ) -> Self {
        Self {
            source,
            packidx,
            tree,
            fields,
            ctx,
            no_cache,
            dir,
            remaining: packidx.len(),
            pack: None,
            hits: Vec::new(),
            stats: ScanStats::default(),
        }
    }

    fn next_sorted(&mut self) -> Option<usize> {
        if self.remaining == 0 {
            return None;
        }
        let total = self.packidx.len();
        let i = match self.dir {
            Direction::Forward => total - self.remaining,
            Direction::Reverse => self.remaining - 1,
        };
        self.remaining -= 1;
        Some(i)
    }

    /// Next pack with at least one match, `None` when exhausted. Hits are
    /// in iteration order: ascending forward, descending in reverse.
    pub fn next(&mut self, tx: &Tx<'_>) -> Result<Option<(&Package, &[u32])>> {
        self.pack = None;
        while let Some(i) = self.next_sorted() {
            let info = self.packidx.get_sorted(i);
            if !self.tree.maybe_match_pack(info) {
                self.stats.packs_skipped += 1;
                continue;
            }

            check_cancelled(self.ctx)?;
            let pkg = self.source.load_shared(tx, info.key, self.fields, self.no_cache)?;
            self.stats.packs_loaded += 1;

            let bits = self.tree.match_pack(&pkg, Some(info));
            if bits.is_empty() {
                trace!(pack = info.key, "Zone map false positive");
                continue;
            }

            self.hits = bits.indexes_u32();
            if self.dir == Direction::Reverse {
                self.hits.reverse();
            }
            self.stats.rows_matched += self.hits.len();
            self.pack = Some(pkg);
            break;
        }
        Ok(self.pack.as_ref().map(|p| (p, self.hits.as_slice())))
    }

    #[must_use]
    pub fn stats(&self) -> ScanStats {
        self.stats
    }

    /// Release the current pack and hit list
    pub fn close(&mut self) {
        self.pack = None;
        self.hits = Vec::new();
        self.remaining = 0;
    }
}

/// Walk restricted to a sorted list of target primary keys
pub(crate) struct LookupIterator<'a, S: PackSource> {
    source: &'a S,
    packidx: &'a PackIndex,
    pks: &'a [u64],
    fields: &'a [usize],
    ctx: &'a CancellationToken,
    no_cache: bool,
    next: usize,
    pack: Option<Package>,
    hits: Vec<u32>,
    stats: ScanStats,
}

impl<'a, S: PackSource> LookupIterator<'a, S> {
    /// `pks` must be sorted ascending and free of duplicates.
    pub fn new(
        source: &'a S,
        packidx: &'a PackIndex,
        pks: &'a [u64],
        fields: &'a [usize],
        ctx: &'a CancellationToken,
        no_cache: bool,
    ) -> Self {
        Self {
            source,
            packidx,
            pks,
            fields,
            ctx,
            no_cache,
            next: 0,
            pack: None,
            hits: Vec::new(),
            stats: ScanStats::default(),
        }
    }

    /// Next pack containing at least one target pk, with the positions of
    /// those pks in ascending order.
    pub fn next(&mut self, tx: &Tx<'_>) -> Result<Option<(&Package, &[u32])>> {
        self.pack = None;
        while self.next < self.packidx.len() {
            let i = self.next;
            self.next += 1;

            let (min, max) = self.packidx.min_max_sorted(i);
            let lo = self.pks.partition_point(|&pk| pk < min);
            let hi = self.pks.partition_point(|&pk| pk <= max);
            if lo >= hi || self.packidx.get_sorted(i).n_values == 0 {
                self.stats.packs_skipped += 1;
                continue;
            }

            check_cancelled(self.ctx)?;
            let key = self.packidx.get_sorted(i).key;
            let pkg = self.source.load_shared(tx, key, self.fields, self.no_cache)?;
            self.stats.packs_loaded += 1;

            self.hits.clear();
            let mut last = 0;
            for &pk in &self.pks[lo..hi] {
                let (pos, l) = pkg.pk_index(pk, last);
                last = l;
                if let Some(pos) = pos {
                    self.hits.push(u32::try_from(pos).unwrap_or(u32::MAX));
                }
            }
            if self.hits.is_empty() {
                continue;
            }
            self.stats.rows_matched += self.hits.len();
            self.pack = Some(pkg);
            break;
        }
        Ok(self.pack.as_ref().map(|p| (p, self.hits.as_slice())))
    }

    #[must_use]
    pub fn stats(&self) -> ScanStats {
        self.stats
    }

    pub fn close(&mut self) {
        self.pack = None;
        self.hits = Vec::new();
        self.next = self.packidx.len();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::Condition;
    use crate::info::PackInfo;
    use crate::store::Store;
    use packdb_common::error::StorageError;
    use packdb_common::types::{Field, FieldType, Schema, Value};
    use std::cell::Cell;
    use std::collections::HashMap;
    use std::sync::Arc;

    struct MemSource {
        packs: HashMap<u32, Package>,
        loads: Cell<usize>,
    }

    impl PackSource for MemSource {
        fn load_shared(&self, _tx: &Tx<'_>, key: u32, _fields: &[usize], _no_cache: bool) -> Result<Package> {
            self.loads.set(self.loads.get() + 1);
            self.packs
                .get(&key)
                .cloned()
                .ok_or_else(|| StorageError::PackNotFound(key).into())
        }
    }

    fn schema() -> Arc<Schema> {
        Arc::new(Schema::new(vec![Field::primary("id"), Field::new("n", FieldType::Int64)]).unwrap())
    }

    /// Packs keyed 0.. holding pks `lo..=hi` with n = pk % 10
    fn setup(ranges: &[(u64, u64)]) -> (MemSource, PackIndex) {
        let mut packs = HashMap::new();
        let mut infos = Vec::new();
        for (key, &(lo, hi)) in ranges.iter().enumerate() {
            let key = key as u32;
            let mut pkg = Package::new(schema(), key, 64);
            for pk in lo..=hi {
                pkg.push_row(&vec![Value::Uint64(pk), Value::Int64((pk % 10) as i64)]).unwrap();
            }
            infos.push(PackInfo::from_package(&pkg));
            packs.insert(key, pkg);
        }
        let source = MemSource {
            packs,
            loads: Cell::new(0),
        };
        (source, PackIndex::new(infos, 0, 64))
    }

    fn collect<S: PackSource>(it: &mut ScanIterator<'_, S>, tx: &Tx<'_>) -> Vec<u64> {
        let mut out = Vec::new();
        while let Some((pkg, hits)) = it.next(tx).unwrap() {
            out.extend(hits.iter().map(|&i| pkg.pk_at(i as usize)));
        }
        out
    }

    #[test]
    fn test_forward_and_reverse_order() {
        // keys out of pk order on purpose
        let (source, idx) = setup(&[(21, 30), (1, 10), (11, 20)]);
        let store = Store::temporary().unwrap();
        let tx = store.begin(false);
        let ctx = CancellationToken::new();
        let mut tree = ConditionTree::new().and(Condition::equal("n", 3i64));
        tree.compile(&schema()).unwrap();
        let fields = [0, 1];

        let mut it = ScanIterator::forward(&source, &idx, &tree, &fields, &ctx, false);
        assert_eq!(collect(&mut it, &tx), vec![3, 13, 23]);
        it.close();

        let mut it = ScanIterator::reverse(&source, &idx, &tree, &fields, &ctx, false);
        assert_eq!(collect(&mut it, &tx), vec![23, 13, 3]);
    }

    #[test]
    fn test_zone_map_skips_loads() {
        let (source, idx) = setup(&[(1, 10), (11, 20), (21, 30)]);
        let store = Store::temporary().unwrap();
        let tx = store.begin(false);
        let ctx = CancellationToken::new();
        let mut tree = ConditionTree::new().and(Condition::gt("id", 25u64));
        tree.compile(&schema()).unwrap();
        let fields = [0, 1];

        let mut it = ScanIterator::forward(&source, &idx, &tree, &fields, &ctx, false);
        assert_eq!(collect(&mut it, &tx), vec![26, 27, 28, 29, 30]);
        assert_eq!(source.loads.get(), 1);
        assert_eq!(it.stats().packs_skipped, 2);
    }

    #[test]
    fn test_cancelled_scan() {
        let (source, idx) = setup(&[(1, 10)]);
        let store = Store::temporary().unwrap();
        let tx = store.begin(false);
        let ctx = CancellationToken::new();
        ctx.cancel();
        let tree = ConditionTree::new();
        let fields = [0, 1];
        let mut it = ScanIterator::forward(&source, &idx, &tree, &fields, &ctx, false);
        assert!(it.next(&tx).unwrap_err().is_cancelled());
    }

    #[test]
    fn test_lookup() {
        let (source, idx) = setup(&[(11, 20), (1, 10), (31, 40)]);
        let store = Store::temporary().unwrap();
        let tx = store.begin(false);
        let ctx = CancellationToken::new();
        let pks = [2, 9, 25, 33];
        let fields = [0, 1];

        let mut it = LookupIterator::new(&source, &idx, &pks, &fields, &ctx, false);
        let mut found = Vec::new();
        while let Some((pkg, hits)) = it.next(&tx).unwrap() {
            found.extend(hits.iter().map(|&i| pkg.pk_at(i as usize)));
        }
        assert_eq!(found, vec![2, 9, 33]);
        // pack [11..20] holds no target and is never loaded
        assert_eq!(source.loads.get(), 2);
        let stats = it.stats();
        assert_eq!(stats.rows_matched, 3);
        assert_eq!(stats.packs_loaded, 2);
        assert_eq!(stats.packs_skipped, 1);
    }
}

//! Journal to pack merge
//!
//! Flush merges three pk-ordered sequences: live journal entries, the
//! tombstone list and the pack directory. Each outer iteration picks the
//! next pending pk, selects its target pack and drains every op that
//! belongs to that pack before moving on. Packs are loaded as private
//! writable copies; the journal is left untouched until the final commit
//! succeeds, so a failed or cancelled flush can be replayed from scratch.

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use packdb_common::error::{Error, Result, StorageError};
use packdb_common::metrics;

use crate::index::SecondaryIndex;
use crate::journal::{Journal, JournalEntry, JournalSnapshot};
use crate::package::Package;
use crate::packindex::PackIndex;
use crate::store::Tx;

use super::{
    check_cancelled, get_json, put_json, FlushMarker, Table, TableMeta, TableState, TableStats, KEY_FLUSH,
    KEY_JOURNAL, KEY_META,
};

// ============================================================================
// Circuit Breaker
// ============================================================================

/// Bounded-iteration guard for the flush loop.
///
/// The bound is `max_loop = 2 * packs + 2 * (entries + tombstones) / pack_size + 2`
/// outer iterations since the last split. Reaching `max_loop` switches the
/// loop to verbose diagnostics; exceeding `2 * max_loop` aborts the flush
/// with [`StorageError::FlushLoop`].
#[derive(Debug, Clone)]
pub(crate) struct CircuitBreaker {
    max_loop: usize,
    count: usize,
    verbose: bool,
}

impl CircuitBreaker {
    pub fn new(packs: usize, pending: usize, pack_size: usize) -> Self {
        Self {
            max_loop: 2 * packs + 2 * pending / pack_size.max(1) + 2,
            count: 0,
            verbose: false,
        }
    }

    pub fn tick(&mut self, table: &str) -> Result<()> {
        self.count += 1;
        if self.count > 2 * self.max_loop {
            error!(table = %table, loops = self.count, limit = self.max_loop, "Flush loop limit exceeded");
            return Err(StorageError::FlushLoop {
                loops: self.count,
                limit: self.max_loop,
            }
            .into());
        }
        if self.count >= self.max_loop && !self.verbose {
            warn!(table = %table, loops = self.count, limit = self.max_loop, "Flush loop is running long");
            self.verbose = true;
        }
        Ok(())
    }

    /// Splits add packs legitimately
    pub fn reset(&mut self) {
        self.count = 0;
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose
    }
}

// ============================================================================
// Placement
// ============================================================================

/// Target pack of a pending pk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Target {
    /// Directory position, `packidx.len()` for a new pack
    pub pos: usize,
    /// Exclusive upper pk bound for ops placed in this pack, 0 = unbounded
    pub bound: u64,
}

/// Pick the pack `pk` belongs to.
///
/// A pack whose range already contains `pk` (or any pack that still has
/// room) wins. A pk falling between a full pack and a non-full successor
/// goes to the successor. Anything else starts a new pack bounded by the
/// following pack's min.
pub(crate) fn find_best_pack(packidx: &PackIndex, pk: u64) -> Target {
    if packidx.is_empty() {
        return Target { pos: 0, bound: 0 };
    }
    let best = packidx.best(pk);
    if !best.is_full || (best.min..=best.max).contains(&pk) {
        return Target {
            pos: best.pos,
            bound: best.next_min,
        };
    }
    if pk < best.min {
        return Target {
            pos: packidx.len(),
            bound: best.min,
        };
    }
    if best.next_min > 0 && pk < best.next_min {
        let next = packidx.next(best.pos);
        if next.pos < packidx.len() && !next.is_full {
            return Target {
                pos: next.pos,
                bound: next.next_min,
            };
        }
    }
    Target {
        pos: packidx.len(),
        bound: best.next_min,
    }
}

// ============================================================================
// Flush Job
// ============================================================================

/// Result of a successful flush
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct FlushSummary {
    pub rows: usize,
    pub deleted: usize,
    pub sub_commits: usize,
    pub meta: TableMeta,
}

/// The pack currently being modified
struct OpenPack {
    pkg: Package,
    /// Not yet present in the directory
    is_new: bool,
    bound: u64,
    max: u64,
    hint: usize,
}

struct FlushJob<'a> {
    table: &'a Table,
    ctx: &'a CancellationToken,
    journal: &'a Journal,
    packidx: &'a mut PackIndex,
    indexes: &'a mut Vec<SecondaryIndex>,
    epoch: u64,
    live: Vec<JournalEntry>,
    tomb: &'a [u64],
    jpos: usize,
    tpos: usize,
    summary: FlushSummary,
}

enum Op {
    Tomb(u64),
    Row(JournalEntry),
}

impl Op {
    fn pk(&self) -> u64 {
        match self {
            Op::Tomb(pk) => *pk,
            Op::Row(e) => e.pk,
        }
    }
}

impl<'a> FlushJob<'a> {
    fn next_op(&self) -> Option<Op> {
        match (self.live.get(self.jpos), self.tomb.get(self.tpos)) {
            (None, None) => None,
            (Some(e), Some(&t)) if t <= e.pk => Some(Op::Tomb(t)),
            (Some(e), _) => Some(Op::Row(*e)),
            (None, Some(&t)) => Some(Op::Tomb(t)),
        }
    }

    fn run(&mut self, tx: &mut Tx<'_>) -> Result<()> {
        let pack_size = self.table.options.pack_size;
        let mut breaker = CircuitBreaker::new(self.packidx.len(), self.live.len() + self.tomb.len(), pack_size);
        let mut open: Option<OpenPack> = None;

        while let Some(op) = self.next_op() {
            let pk = op.pk();
            breaker.tick(&self.table.name)?;

            let mut target = find_best_pack(self.packidx, pk);
            if breaker.is_verbose() {
                warn!(
                    table = %self.table.name,
                    pk,
                    pos = target.pos,
                    bound = target.bound,
                    packs = self.packidx.len(),
                    "Flush loop iteration"
                );
            }

            if !open.as_ref().is_some_and(|o| self.keeps(o, target)) {
                if let Some(mut o) = open.take() {
                    if o.pkg.is_dirty() {
                        self.table.store_pack(tx, self.packidx, &mut o.pkg)?;
                        self.maybe_sub_commit(tx)?;
                    }
                    target = find_best_pack(self.packidx, pk);
                }
                open = Some(self.open_pack(tx, target)?);
            }

            let Some(o) = open.as_mut() else {
                continue;
            };
            match self.drain(tx, o)? {
                Drained::Open => {}
                Drained::Stored => {
                    open = None;
                    self.maybe_sub_commit(tx)?;
                }
                Drained::Split => {
                    breaker.reset();
                    open = None;
                    self.maybe_sub_commit(tx)?;
                }
            }
        }

        if let Some(mut o) = open.take() {
            if o.pkg.is_dirty() {
                self.table.store_pack(tx, self.packidx, &mut o.pkg)?;
            }
        }
        Ok(())
    }

    fn keeps(&self, open: &OpenPack, target: Target) -> bool {
        if open.is_new {
            target.pos == self.packidx.len() && target.bound == open.bound
        } else {
            target.pos < self.packidx.len() && self.packidx.get(target.pos).key == open.pkg.key()
        }
    }

    fn open_pack(&self, tx: &Tx<'_>, target: Target) -> Result<OpenPack> {
        let (pkg, is_new) = if target.pos < self.packidx.len() {
            let key = self.packidx.get(target.pos).key;
            (self.table.load_writable_pack(tx, key)?, false)
        } else {
            let key = self.packidx.next_key();
            (
                Package::new(Arc::clone(&self.table.schema), key, self.table.options.pack_size),
                true,
            )
        };
        let max = pkg.pk_range().1;
        Ok(OpenPack {
            pkg,
            is_new,
            bound: target.bound,
            max,
            hint: 0,
        })
    }

    /// Apply every pending op that belongs to the open pack.
    fn drain(&mut self, tx: &mut Tx<'_>, o: &mut OpenPack) -> Result<Drained> {
        let data = self.journal.data();
        let pack_size = self.table.options.pack_size;

        while let Some(op) = self.next_op() {
            let pk = op.pk();
            if o.bound > 0 && pk >= o.bound {
                break;
            }

            match op {
                Op::Tomb(_) => {
                    let (pos, n) = {
                        let pks = o.pkg.pk_column();
                        let from = o.hint.min(pks.len());
                        let pos = from + pks[from..].partition_point(|&v| v < pk);
                        let mut n = 0;
                        while pos + n < pks.len()
                            && self.tpos + n < self.tomb.len()
                            && pks[pos + n] == self.tomb[self.tpos + n]
                        {
                            n += 1;
                        }
                        (pos, n)
                    };
                    if n == 0 {
                        debug!(table = %self.table.name, pk, pack = o.pkg.key(), "Tombstone not found");
                        self.tpos += 1;
                        continue;
                    }
                    for idx in self.indexes.iter_mut() {
                        idx.remove_tx(&o.pkg, pos, n)?;
                    }
                    o.pkg.delete(pos, n)?;
                    self.tpos += n;
                    self.summary.deleted += n;
                    o.hint = pos;
                    o.max = o.pkg.pk_range().1;
                }
                Op::Row(e) => {
                    let (found, at) = o.pkg.pk_index(pk, o.hint);
                    if let Some(pos) = found {
                        let mut changed = Vec::new();
                        for (i, idx) in self.indexes.iter_mut().enumerate() {
                            let f = idx.position();
                            let same = match (o.pkg.block(f), data.block(f)) {
                                (Some(a), Some(b)) => a.equal_at(pos, b, e.idx),
                                _ => false,
                            };
                            if !same {
                                idx.remove_tx(&o.pkg, pos, 1)?;
                                changed.push(i);
                            }
                        }
                        o.pkg.replace_from(data, pos, e.idx, 1)?;
                        for i in changed {
                            self.indexes[i].add_tx(&o.pkg, pos, 1)?;
                        }
                        o.hint = pos;
                        self.jpos += 1;
                        self.summary.rows += 1;
                        continue;
                    }

                    if o.pkg.is_full() {
                        if pk < o.max {
                            self.table.split_pack(tx, self.packidx, &mut o.pkg)?;
                            return Ok(Drained::Split);
                        }
                        break;
                    }

                    let pos = if o.pkg.is_empty() || pk > o.max {
                        o.pkg.append_from(data, e.idx, 1)?;
                        o.max = pk;
                        o.pkg.len() - 1
                    } else {
                        o.pkg.insert_from(data, at, e.idx, 1)?;
                        at
                    };
                    for idx in self.indexes.iter_mut() {
                        idx.add_tx(&o.pkg, pos, 1)?;
                    }
                    o.hint = pos + 1;
                    self.jpos += 1;
                    self.summary.rows += 1;

                    if o.pkg.len() >= pack_size {
                        self.table.store_pack(tx, self.packidx, &mut o.pkg)?;
                        return Ok(Drained::Stored);
                    }
                }
            }
        }
        Ok(Drained::Open)
    }

    /// Commit the staged writes once the transaction grows large. The
    /// persisted journal and `_flush` marker let a later flush replay.
    fn maybe_sub_commit(&mut self, tx: &mut Tx<'_>) -> Result<()> {
        if tx.pending() < self.table.options.tx_max_pending {
            return Ok(());
        }
        for idx in self.indexes.iter_mut() {
            idx.flush_tx(tx)?;
        }
        self.table.store_pack_infos(tx, self.packidx)?;
        self.table.store_journal(tx, self.journal)?;
        self.summary.sub_commits += 1;
        let marker = FlushMarker {
            epoch: self.epoch,
            sub_commits: self.summary.sub_commits,
            journal_len: self.journal.len(),
            tomb_len: self.journal.tomb_len(),
        };
        put_json(tx, &self.table.meta_bucket, KEY_FLUSH, &marker)?;
        tx.commit_and_continue()?;
        debug!(
            table = %self.table.name,
            sub_commits = self.summary.sub_commits,
            rows = self.summary.rows,
            "Flush sub-commit"
        );
        check_cancelled(self.ctx)
    }

    /// Stage headers, counters and the emptied journal for the final commit.
    fn finish(&mut self, tx: &mut Tx<'_>) -> Result<()> {
        for idx in self.indexes.iter_mut() {
            idx.flush_tx(tx)?;
        }
        let meta = TableMeta {
            sequence: self.journal.max_id(),
            rows: self.packidx.count() as u64,
        };
        put_json(tx, &self.table.meta_bucket, KEY_META, &meta)?;
        self.table.store_pack_infos(tx, self.packidx)?;
        let empty = JournalSnapshot {
            max_id: self.journal.max_id(),
            ..JournalSnapshot::default()
        };
        tx.put(&self.table.meta_bucket, KEY_JOURNAL.as_bytes(), bincode::serialize(&empty)?)?;
        tx.delete(&self.table.meta_bucket, KEY_FLUSH.as_bytes())?;
        self.summary.meta = meta;
        Ok(())
    }
}

enum Drained {
    /// Ops exhausted or the next op belongs elsewhere
    Open,
    /// The pack filled up and was stored
    Stored,
    /// The pack was split; placement must restart
    Split,
}

// ============================================================================
// Table Entry Points
// ============================================================================

impl Table {
    /// Merge the journal into packs.
    pub fn flush(&self, ctx: &CancellationToken) -> Result<()> {
        check_cancelled(ctx)?;
        let mut state = self.state.write();
        self.flush_locked(ctx, &mut state).map(|_| ())
    }

    pub(crate) fn flush_locked(&self, ctx: &CancellationToken, state: &mut TableState) -> Result<FlushSummary> {
        if state.journal.is_empty() && state.journal.tomb_len() == 0 {
            return Ok(FlushSummary {
                meta: state.meta,
                ..FlushSummary::default()
            });
        }
        let start = Instant::now();
        debug!(
            table = %self.name,
            journal = state.journal.len(),
            tombstones = state.journal.tomb_len(),
            packs = state.packidx.len(),
            "Flushing journal"
        );

        let mut tx = self.store.begin(true);
        let result = {
            let TableState {
                journal,
                packidx,
                indexes,
                epoch,
                ..
            } = &mut *state;
            let journal: &Journal = journal;
            let (_, flushed_max) = packidx.global_min_max();
            let tomb = journal.tomb();
            let tomb = &tomb[..tomb.partition_point(|&t| t <= flushed_max)];
            let deleted = journal.deleted();
            let live = journal
                .keys()
                .iter()
                .filter(|e| !deleted.is_set(e.idx))
                .copied()
                .collect();

            let mut job = FlushJob {
                table: self,
                ctx,
                journal,
                packidx,
                indexes,
                epoch: *epoch,
                live,
                tomb,
                jpos: 0,
                tpos: 0,
                summary: FlushSummary::default(),
            };
            job.run(&mut tx).and_then(|()| job.finish(&mut tx)).map(|()| job.summary)
        };

        let summary = match result {
            Ok(s) => s,
            Err(e) => {
                tx.rollback();
                return Err(self.restore_committed_state(state, e));
            }
        };
        if let Err(e) = tx.commit() {
            return Err(self.restore_committed_state(state, e));
        }

        state.journal.reset()?;
        state.meta = summary.meta;
        state.epoch += 1;

        let elapsed = start.elapsed().as_secs_f64() * 1000.0;
        let total = summary.rows + summary.deleted;
        TableStats::add(&self.stats.flushes, 1);
        TableStats::add(&self.stats.flushed_rows, total);
        metrics::record_flush(&self.name, total as u64, elapsed);
        info!(
            table = %self.name,
            rows = summary.rows,
            deleted = summary.deleted,
            packs = state.packidx.len(),
            sub_commits = summary.sub_commits,
            duration_ms = elapsed,
            "Flushed journal"
        );
        Ok(summary)
    }

    /// Restore in-memory metadata from the last committed state. The
    /// journal is kept so the next flush replays it.
    pub(super) fn restore_committed_state(&self, state: &mut TableState, err: Error) -> Error {
        warn!(table = %self.name, error = %err, "Write transaction failed, reloading pack headers");
        for idx in &mut state.indexes {
            idx.reset();
        }
        self.cache.purge();

        let tx = self.store.begin(false);
        match self.load_pack_index(&tx) {
            Ok(packidx) => state.packidx = packidx,
            Err(e) => error!(table = %self.name, error = %e, "Failed to reload pack headers"),
        }
        match get_json::<TableMeta>(&tx, &self.meta_bucket, KEY_META) {
            Ok(Some(meta)) => state.meta = meta,
            Ok(None) => {}
            Err(e) => error!(table = %self.name, error = %e, "Failed to reload table meta"),
        }
        err
    }
}

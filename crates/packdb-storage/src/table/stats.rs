//! Per-table counters

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::cache::CacheStats;

/// Monotonic counters updated by table operations
#[derive(Debug, Default)]
pub struct TableStats {
    pub inserted: AtomicU64,
    pub updated: AtomicU64,
    pub deleted: AtomicU64,
    pub queries: AtomicU64,
    pub lookups: AtomicU64,
    pub flushes: AtomicU64,
    pub flushed_rows: AtomicU64,
    pub splits: AtomicU64,
    pub compactions: AtomicU64,
    pub packs_loaded: AtomicU64,
    pub packs_stored: AtomicU64,
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
}

impl TableStats {
    pub(crate) fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// Point-in-time view of a table
#[derive(Debug, Clone, Serialize)]
pub struct TableStatsSnapshot {
    pub name: String,
    pub packs: usize,
    pub rows: usize,
    pub table_size: usize,
    pub journal_rows: usize,
    pub journal_tombstones: usize,
    pub journal_size: usize,
    pub sequence: u64,
    pub inserted: u64,
    pub updated: u64,
    pub deleted: u64,
    pub queries: u64,
    pub lookups: u64,
    pub flushes: u64,
    pub flushed_rows: u64,
    pub splits: u64,
    pub compactions: u64,
    pub packs_loaded: u64,
    pub packs_stored: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub cache: CacheStats,
}

/// Table state sampled together with the counters
pub(crate) struct Gauges {
    pub packs: usize,
    pub rows: usize,
    pub table_size: usize,
    pub journal_rows: usize,
    pub journal_tombstones: usize,
    pub journal_size: usize,
    pub sequence: u64,
}

impl TableStats {
    pub(crate) fn snapshot(&self, name: &str, g: Gauges, cache: CacheStats) -> TableStatsSnapshot {
        TableStatsSnapshot {
            name: name.to_string(),
            packs: g.packs,
            rows: g.rows,
            table_size: g.table_size,
            journal_rows: g.journal_rows,
            journal_tombstones: g.journal_tombstones,
            journal_size: g.journal_size,
            sequence: g.sequence,
            inserted: Self::get(&self.inserted),
            updated: Self::get(&self.updated),
            deleted: Self::get(&self.deleted),
            queries: Self::get(&self.queries),
            lookups: Self::get(&self.lookups),
            flushes: Self::get(&self.flushes),
            flushed_rows: Self::get(&self.flushed_rows),
            splits: Self::get(&self.splits),
            compactions: Self::get(&self.compactions),
            packs_loaded: Self::get(&self.packs_loaded),
            packs_stored: Self::get(&self.packs_stored),
            bytes_read: Self::get(&self.bytes_read),
            bytes_written: Self::get(&self.bytes_written),
            cache,
        }
    }
}

//! Metrics for the storage core
//!
//! Thin wrappers around the `metrics` facade. No exporter is installed here;
//! without a recorder the calls are no-ops.
#![allow(clippy::cast_precision_loss)]

use metrics::{counter, histogram};

// ============================================================================
// Flush Metrics
// ============================================================================

/// Record a finished flush
pub fn record_flush(table: &str, rows: u64, duration_ms: f64) {
    counter!("packdb_flush_total", "table" => table.to_string()).increment(1);
    counter!("packdb_flushed_rows_total", "table" => table.to_string()).increment(rows);
    histogram!("packdb_flush_duration_ms", "table" => table.to_string()).record(duration_ms);
}

/// Record a pack split during flush
pub fn record_split(table: &str) {
    counter!("packdb_pack_splits_total", "table" => table.to_string()).increment(1);
}

/// Record a compaction run
pub fn record_compaction(table: &str, packs_moved: u64, duration_ms: f64) {
    counter!("packdb_compaction_total", "table" => table.to_string()).increment(1);
    counter!("packdb_compaction_packs_total", "table" => table.to_string()).increment(packs_moved);
    histogram!("packdb_compaction_duration_ms").record(duration_ms);
}

// ============================================================================
// Storage Metrics
// ============================================================================

/// Record bytes written to storage
pub fn record_pack_store(bytes: u64) {
    counter!("packdb_packs_stored_total").increment(1);
    counter!("packdb_storage_bytes_written_total").increment(bytes);
}

/// Record bytes read from storage
pub fn record_pack_load(bytes: u64) {
    counter!("packdb_packs_loaded_total").increment(1);
    counter!("packdb_storage_bytes_read_total").increment(bytes);
}

/// Record block cache hit/miss
pub fn record_cache_access(hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    counter!("packdb_cache_accesses_total", "result" => result).increment(1);
}

// ============================================================================
// Query Metrics
// ============================================================================

/// Record query executed
pub fn record_query(kind: &str, success: bool) {
    let status = if success { "success" } else { "error" };
    counter!("packdb_queries_total",
        "kind" => kind.to_string(),
        "status" => status
    )
    .increment(1);
}

/// Record rows scanned
pub fn record_rows_scanned(count: u64) {
    counter!("packdb_rows_scanned_total").increment(count);
}

//! Block cache
//!
//! Decoded column blocks keyed by `(pack_key << 32) | column_index`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;

use packdb_common::metrics;

use crate::block::Block;

/// Cache key of column `col` of pack `key`
#[must_use]
pub fn block_key(pack: u32, col: usize) -> u64 {
    (u64::from(pack) << 32) | (col as u64 & 0xffff_ffff)
}

/// Pack key part of a cache key
#[must_use]
pub fn pack_of(key: u64) -> u32 {
    (key >> 32) as u32
}

/// LFU-evicting cache of shared column blocks
pub struct BlockCache {
    /// Cache storage
    cache: DashMap<u64, CacheEntry>,
    /// Maximum size in bytes
    max_size: usize,
    /// Current size in bytes
    current_size: AtomicUsize,
    /// Hit count
    hits: AtomicUsize,
    /// Miss count
    misses: AtomicUsize,
    /// Evicted entries
    evictions: AtomicUsize,
}

struct CacheEntry {
    block: Arc<Block>,
    size: usize,
    access_count: AtomicUsize,
}

impl BlockCache {
    /// Create a new block cache; a zero capacity disables caching
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        Self {
            cache: DashMap::new(),
            max_size,
            current_size: AtomicUsize::new(0),
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
            evictions: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.max_size > 0
    }

    /// Get a block, counting the access
    pub fn get(&self, key: u64) -> Option<Arc<Block>> {
        if let Some(entry) = self.cache.get(&key) {
            entry.access_count.fetch_add(1, Ordering::Relaxed);
            self.hits.fetch_add(1, Ordering::Relaxed);
            metrics::record_cache_access(true);
            return Some(Arc::clone(&entry.block));
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        metrics::record_cache_access(false);
        None
    }

    /// Get a block without touching statistics
    pub fn peek(&self, key: u64) -> Option<Arc<Block>> {
        self.cache.get(&key).map(|e| Arc::clone(&e.block))
    }

    #[must_use]
    pub fn contains(&self, key: u64) -> bool {
        self.cache.contains_key(&key)
    }

    /// Put a block into the cache
    pub fn add(&self, key: u64, block: Arc<Block>) {
        let size = block.heap_size().max(1);
        if size > self.max_size {
            return;
        }

        // Check if we need to evict
        while self.current_size.load(Ordering::Relaxed) + size > self.max_size {
            if !self.evict_one() {
                break;
            }
        }

        let entry = CacheEntry {
            block,
            size,
            access_count: AtomicUsize::new(1),
        };

        if let Some(old) = self.cache.insert(key, entry) {
            self.current_size.fetch_sub(old.size, Ordering::Relaxed);
        }

        self.current_size.fetch_add(size, Ordering::Relaxed);
    }

    /// Remove a block from the cache
    pub fn remove(&self, key: u64) {
        if let Some((_, entry)) = self.cache.remove(&key) {
            self.current_size.fetch_sub(entry.size, Ordering::Relaxed);
        }
    }

    /// Remove every block of pack `pack`
    pub fn remove_pack(&self, pack: u32) {
        for key in self.keys() {
            if pack_of(key) == pack {
                self.remove(key);
            }
        }
    }

    /// Evict one entry (LFU-like); false when the cache is empty
    fn evict_one(&self) -> bool {
        let mut min_access = usize::MAX;
        let mut min_key = None;

        // Find least frequently used
        for entry in &self.cache {
            let access = entry.value().access_count.load(Ordering::Relaxed);
            if access < min_access {
                min_access = access;
                min_key = Some(*entry.key());
            }
        }

        match min_key {
            Some(key) => {
                self.remove(key);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Cached keys
    #[must_use]
    pub fn keys(&self) -> Vec<u64> {
        self.cache.iter().map(|e| *e.key()).collect()
    }

    /// Get cache statistics
    #[allow(clippy::cast_precision_loss)]
    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;

        CacheStats {
            size: self.current_size.load(Ordering::Relaxed),
            max_size: self.max_size,
            entries: self.cache.len(),
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            hit_rate: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
        }
    }

    /// Clear the cache
    pub fn purge(&self) {
        self.cache.clear();
        self.current_size.store(0, Ordering::Relaxed);
    }
}

/// Cache statistics
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub max_size: usize,
    pub entries: usize,
    pub hits: usize,
    pub misses: usize,
    pub evictions: usize,
    pub hit_rate: f64,
}

//! Pack directory with pk-ordered placement
//!
//! [`PackIndex`] keeps every [`PackInfo`] sorted by pack key together with a
//! permutation of pack positions sorted by their minimum primary key. Flush
//! uses it to place journal entries, iterators use it to walk packs in pk
//! order, and header persistence consumes its removal worklist.

use crate::info::PackInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Pair {
    min: u64,
    pos: usize,
}

/// Result of a placement lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Placement {
    /// Directory position; equals `len()` when a new pack must be created
    pub pos: usize,
    pub min: u64,
    pub max: u64,
    /// Min pk of the following pack in pk order, 0 when there is none
    pub next_min: u64,
    pub is_full: bool,
}

/// In-memory directory of stored packs
#[derive(Debug, Clone)]
pub struct PackIndex {
    infos: Vec<PackInfo>,
    pairs: Vec<Pair>,
    minpks: Vec<u64>,
    maxpks: Vec<u64>,
    removed: Vec<u32>,
    pk_index: usize,
    pack_size: usize,
}

impl PackIndex {
    #[must_use]
    pub fn new(mut infos: Vec<PackInfo>, pk_index: usize, pack_size: usize) -> Self {
        infos.sort_by_key(|i| i.key);
        let mut idx = Self {
            infos,
            pairs: Vec::new(),
            minpks: Vec::new(),
            maxpks: Vec::new(),
            removed: Vec::new(),
            pk_index,
            pack_size,
        };
        idx.rebuild();
        idx
    }

    fn rebuild(&mut self) {
        self.minpks.clear();
        self.maxpks.clear();
        self.pairs.clear();
        for (pos, info) in self.infos.iter().enumerate() {
            let (min, max) = info.pk_range(self.pk_index);
            self.minpks.push(min);
            self.maxpks.push(max);
            self.pairs.push(Pair { min, pos });
        }
        self.sort_pairs();
    }

    fn sort_pairs(&mut self) {
        self.pairs.sort_by(|a, b| a.min.cmp(&b.min).then(a.pos.cmp(&b.pos)));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.infos.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    #[must_use]
    pub fn pack_size(&self) -> usize {
        self.pack_size
    }

    /// Infos in pack key order
    #[must_use]
    pub fn infos(&self) -> &[PackInfo] {
        &self.infos
    }

    /// Info at directory position `pos` (key order)
    #[must_use]
    pub fn get(&self, pos: usize) -> &PackInfo {
        &self.infos[pos]
    }

    /// Directory position of pack `key`
    #[must_use]
    pub fn position(&self, key: u32) -> Option<usize> {
        self.infos.binary_search_by_key(&key, |i| i.key).ok()
    }

    /// Min/max pk of the pack at directory position `pos`
    #[must_use]
    pub fn min_max(&self, pos: usize) -> (u64, u64) {
        (self.minpks[pos], self.maxpks[pos])
    }

    /// Directory position of the i-th pack in pk order
    #[must_use]
    pub fn sorted_pos(&self, i: usize) -> usize {
        self.pairs[i].pos
    }

    /// Info of the i-th pack in pk order
    #[must_use]
    pub fn get_sorted(&self, i: usize) -> &PackInfo {
        &self.infos[self.pairs[i].pos]
    }

    /// Min/max pk of the i-th pack in pk order
    #[must_use]
    pub fn min_max_sorted(&self, i: usize) -> (u64, u64) {
        self.min_max(self.pairs[i].pos)
    }

    /// Index in pk order of the first pack whose min exceeds `pk`
    #[must_use]
    pub fn first_sorted_above(&self, pk: u64) -> usize {
        self.pairs.partition_point(|p| p.min <= pk)
    }

    /// Smallest min and largest max pk over all packs, (0, 0) when empty
    #[must_use]
    pub fn global_min_max(&self) -> (u64, u64) {
        let min = self.pairs.first().map_or(0, |p| p.min);
        let max = self.maxpks.iter().copied().max().unwrap_or(0);
        (min, max)
    }

    /// Total rows over all packs
    #[must_use]
    pub fn count(&self) -> usize {
        self.infos.iter().map(|i| i.n_values).sum()
    }

    /// Total stored bytes over all packs
    #[must_use]
    pub fn table_size(&self) -> usize {
        self.infos.iter().map(|i| i.packed_size).sum()
    }

    /// Key for a newly created pack
    #[must_use]
    pub fn next_key(&self) -> u32 {
        self.infos.last().map_or(0, |i| i.key.saturating_add(1))
    }

    fn placement_at(&self, sorted: usize) -> Placement {
        let pos = self.pairs[sorted].pos;
        let next_min = self.pairs.get(sorted + 1).map_or(0, |p| p.min);
        Placement {
            pos,
            min: self.minpks[pos],
            max: self.maxpks[pos],
            next_min,
            is_full: self.infos[pos].n_values >= self.pack_size,
        }
    }

    /// Candidate pack for `pk`: the pack with the largest min not above
    /// `pk`, or the first pack when `pk` precedes all packs. An empty
    /// directory yields position 0, which equals `len()`.
    #[must_use]
    pub fn best(&self, pk: u64) -> Placement {
        if self.pairs.is_empty() {
            return Placement::default();
        }
        let i = self.pairs.partition_point(|p| p.min <= pk);
        self.placement_at(i.saturating_sub(1))
    }

    /// Successor in pk order of the pack at directory position `pos`.
    /// Returns a zeroed placement at `len()` when there is none.
    #[must_use]
    pub fn next(&self, pos: usize) -> Placement {
        let none = Placement {
            pos: self.len(),
            ..Placement::default()
        };
        let Some(sorted) = self.sorted_index_of(pos) else {
            return none;
        };
        if sorted + 1 >= self.pairs.len() {
            return none;
        }
        self.placement_at(sorted + 1)
    }

    fn sorted_index_of(&self, pos: usize) -> Option<usize> {
        let min = *self.minpks.get(pos)?;
        let start = self.pairs.partition_point(|p| p.min < min);
        self.pairs[start..]
            .iter()
            .take_while(|p| p.min == min)
            .position(|p| p.pos == pos)
            .map(|i| start + i)
    }

    /// Insert or replace the info for `info.key` and mark it dirty.
    pub fn add_or_update(&mut self, mut info: PackInfo) {
        info.dirty = true;
        self.removed.retain(|&k| k != info.key);
        let (newmin, newmax) = info.pk_range(self.pk_index);

        match self.infos.binary_search_by_key(&info.key, |i| i.key) {
            Ok(pos) => {
                let oldmin = self.minpks[pos];
                self.infos[pos] = info;
                self.minpks[pos] = newmin;
                self.maxpks[pos] = newmax;
                if oldmin != newmin {
                    if let Some(sorted) = self.pairs.iter().position(|p| p.pos == pos) {
                        self.pairs[sorted].min = newmin;
                    }
                    self.sort_pairs();
                }
            }
            Err(pos) if pos == self.infos.len() => {
                let needsort = self.pairs.last().is_some_and(|p| newmin < p.min);
                self.infos.push(info);
                self.minpks.push(newmin);
                self.maxpks.push(newmax);
                self.pairs.push(Pair { min: newmin, pos });
                if needsort {
                    self.sort_pairs();
                }
            }
            Err(pos) => {
                // positions after `pos` shift right
                self.infos.insert(pos, info);
                self.rebuild();
            }
        }
    }

    /// Drop the info for `key` and queue its persisted record for deletion.
    pub fn remove(&mut self, key: u32) {
        if let Ok(pos) = self.infos.binary_search_by_key(&key, |i| i.key) {
            self.infos.remove(pos);
            self.rebuild();
            if !self.removed.contains(&key) {
                self.removed.push(key);
            }
        }
    }

    /// Keys removed since the last header persistence
    pub fn take_removed(&mut self) -> Vec<u32> {
        std::mem::take(&mut self.removed)
    }

    /// Infos changed since the last header persistence
    pub fn dirty_infos(&self) -> impl Iterator<Item = &PackInfo> {
        self.infos.iter().filter(|i| i.dirty)
    }

    pub fn clear_dirty(&mut self) {
        for info in &mut self.infos {
            info.dirty = false;
        }
    }

    /// True when keys are dense `0..n` and every pack but the last is full
    #[must_use]
    pub fn is_compact(&self) -> bool {
        let n = self.infos.len();
        self.infos.iter().enumerate().all(|(i, info)| {
            info.key as usize == i && (i + 1 == n || info.n_values >= self.pack_size)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::info::BlockInfo;
    use packdb_common::types::{FieldType, Value};

    fn info(key: u32, min: u64, max: u64, n: usize) -> PackInfo {
        PackInfo {
            key,
            n_values: n,
            packed_size: n * 8,
            blocks: vec![BlockInfo {
                typ: FieldType::Uint64,
                min: Value::Uint64(min),
                max: Value::Uint64(max),
                null_count: 0,
            }],
            dirty: false,
        }
    }

    #[test]
    fn test_empty_best_is_append() {
        let idx = PackIndex::new(vec![], 0, 4);
        let p = idx.best(10);
        assert_eq!(p.pos, 0);
        assert_eq!(p.pos, idx.len());
        assert_eq!(idx.global_min_max(), (0, 0));
        assert_eq!(idx.next_key(), 0);
    }

    #[test]
    fn test_best_and_next() {
        let idx = PackIndex::new(
            vec![info(0, 1, 4, 4), info(1, 10, 12, 3), info(2, 5, 8, 4)],
            0,
            4,
        );
        // pk order: key 0 [1..4], key 2 [5..8], key 1 [10..12]
        let p = idx.best(6);
        assert_eq!((p.pos, p.min, p.max, p.next_min, p.is_full), (2, 5, 8, 10, true));
        let p = idx.best(0);
        assert_eq!(p.pos, 0);
        let p = idx.best(100);
        assert_eq!((p.pos, p.next_min, p.is_full), (1, 0, false));

        let n = idx.next(0);
        assert_eq!((n.pos, n.min, n.max), (2, 5, 8));
        let n = idx.next(1);
        assert_eq!(n.pos, idx.len());
        assert_eq!(idx.global_min_max(), (1, 12));
        assert_eq!(idx.get_sorted(1).key, 2);

        assert_eq!(idx.first_sorted_above(0), 0);
        assert_eq!(idx.first_sorted_above(4), 1);
        assert_eq!(idx.first_sorted_above(5), 2);
        assert_eq!(idx.first_sorted_above(12), 3);
    }

    #[test]
    fn test_add_update_remove() {
        let mut idx = PackIndex::new(vec![], 0, 4);
        idx.add_or_update(info(0, 1, 4, 4));
        idx.add_or_update(info(1, 5, 6, 2));
        assert_eq!(idx.len(), 2);
        assert_eq!(idx.next_key(), 2);
        assert_eq!(idx.dirty_infos().count(), 2);

        idx.add_or_update(info(1, 7, 9, 3));
        assert_eq!(idx.min_max(1), (7, 9));
        assert_eq!(idx.count(), 7);

        idx.remove(0);
        assert_eq!(idx.len(), 1);
        assert_eq!(idx.take_removed(), vec![0]);
        assert!(idx.take_removed().is_empty());
        assert_eq!(idx.best(1).pos, 0);
    }

    #[test]
    fn test_is_compact() {
        let idx = PackIndex::new(vec![info(0, 1, 4, 4), info(1, 5, 6, 2)], 0, 4);
        assert!(idx.is_compact());
        let gap = PackIndex::new(vec![info(0, 1, 4, 4), info(2, 5, 6, 2)], 0, 4);
        assert!(!gap.is_compact());
        let underfull = PackIndex::new(vec![info(0, 1, 3, 3), info(1, 5, 6, 2)], 0, 4);
        assert!(!underfull.is_compact());
    }
}

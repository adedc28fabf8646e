//! Fixed-length row bitmaps backed by roaring

use roaring::RoaringBitmap;

/// A bitmap over `len` row positions.
///
/// Match results, journal delete flags and OR masks all use this type.
/// Positions at or beyond `len` are never set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bitset {
    bits: RoaringBitmap,
    len: usize,
}

impl Bitset {
    /// All-zero bitmap
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            bits: RoaringBitmap::new(),
            len,
        }
    }

    /// All-ones bitmap
    #[must_use]
    pub fn ones(len: usize) -> Self {
        let mut bits = RoaringBitmap::new();
        bits.insert_range(0..to_u32(len));
        Self { bits, len }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_set(&self, i: usize) -> bool {
        i < self.len && self.bits.contains(to_u32(i))
    }

    pub fn set(&mut self, i: usize) {
        if i < self.len {
            self.bits.insert(to_u32(i));
        }
    }

    pub fn clear(&mut self, i: usize) {
        self.bits.remove(to_u32(i));
    }

    /// Number of set bits
    #[must_use]
    pub fn count(&self) -> usize {
        usize::try_from(self.bits.len()).unwrap_or(usize::MAX)
    }

    /// True when no bit is set
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// True when all `len` bits are set
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.count() == self.len
    }

    /// Grow or shrink, clearing bits beyond the new length.
    pub fn resize(&mut self, len: usize) {
        if len < self.len {
            self.bits.remove_range(to_u32(len)..);
        }
        self.len = len;
    }

    pub fn reset(&mut self) {
        self.bits.clear();
        self.len = 0;
    }

    /// In-place intersection
    pub fn and(&mut self, other: &Bitset) {
        self.bits &= &other.bits;
    }

    /// In-place union
    pub fn or(&mut self, other: &Bitset) {
        self.bits |= &other.bits;
        if other.len > self.len {
            self.len = other.len;
        }
    }

    /// In-place `self & !other`
    pub fn and_not(&mut self, other: &Bitset) {
        self.bits -= &other.bits;
    }

    /// Complement within `len`
    #[must_use]
    pub fn negated(&self) -> Bitset {
        let mut out = Bitset::ones(self.len);
        out.bits -= &self.bits;
        out
    }

    /// Iterate set positions in ascending order
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits.iter().map(|i| i as usize)
    }

    /// Set positions in ascending order
    #[must_use]
    pub fn indexes(&self) -> Vec<usize> {
        self.iter().collect()
    }

    /// Set positions as u32, the format iterators hand out
    #[must_use]
    pub fn indexes_u32(&self) -> Vec<u32> {
        self.bits.iter().collect()
    }
}

fn to_u32(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

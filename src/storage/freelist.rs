//! # Freelist Management
//!
//! Tracks free blocks of the store file so deallocated space is reused before
//! the file grows.
//!
//! ## Design Overview
//!
//! Every block in the store carries an 8-byte prefix with its payload capacity
//! and a state word (live or free). Deallocation flips the state word on disk
//! and hands the block to the `Freelist`. The freelist itself is purely in
//! memory: on open, `FileBlockStore` rebuilds it by walking the block prefixes
//! from the end of the file header to the end offset.
//!
//! ```text
//! capacity -> [offsets of free blocks with that capacity]
//!
//!   16 -> [4240, 9120]
//!   64 -> [2048]
//!  528 -> [512, 12800, 13344]
//! ```
//!
//! ## Allocation Strategy
//!
//! Best fit: the smallest capacity that is at least the requested size. The
//! caller decides whether the chosen block is large enough to split.
//!
//! ## Thread Safety
//!
//! Not thread-safe on its own; the owning block store is used from behind the
//! hash table's mutation lock.

use std::collections::BTreeMap;

#[derive(Debug, Default)]
pub struct Freelist {
    by_capacity: BTreeMap<u32, Vec<u64>>,
    free_count: u64,
    free_bytes: u64,
}

impl Freelist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn free_count(&self) -> u64 {
        self.free_count
    }

    pub fn free_bytes(&self) -> u64 {
        self.free_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.free_count == 0
    }

    /// Adds the block at `offset` (payload offset) with `capacity` bytes.
    pub fn release(&mut self, offset: u64, capacity: u32) {
        self.by_capacity.entry(capacity).or_default().push(offset);
        self.free_count += 1;
        self.free_bytes += capacity as u64;
    }

    /// Removes and returns the best-fitting block for `size` bytes as
    /// `(offset, capacity)`.
    pub fn take(&mut self, size: u32) -> Option<(u64, u32)> {
        let capacity = *self.by_capacity.range(size..).next()?.0;
        let offsets = self.by_capacity.get_mut(&capacity)?;
        let offset = offsets.pop()?;
        if offsets.is_empty() {
            self.by_capacity.remove(&capacity);
        }

        self.free_count -= 1;
        self.free_bytes -= capacity as u64;
        Some((offset, capacity))
    }

    pub fn clear(&mut self) {
        self.by_capacity.clear();
        self.free_count = 0;
        self.free_bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::Freelist;

    #[test]
    fn freelist_new_creates_empty_freelist() {
        let freelist = Freelist::new();

        assert!(freelist.is_empty());
        assert_eq!(freelist.free_count(), 0);
        assert_eq!(freelist.free_bytes(), 0);
    }

    #[test]
    fn freelist_take_from_empty_returns_none() {
        let mut freelist = Freelist::new();
        assert_eq!(freelist.take(16), None);
    }

    #[test]
    fn freelist_take_picks_best_fit() {
        let mut freelist = Freelist::new();
        freelist.release(1000, 512);
        freelist.release(2000, 64);
        freelist.release(3000, 128);

        assert_eq!(freelist.take(100), Some((3000, 128)));
        assert_eq!(freelist.take(100), Some((1000, 512)));
        assert_eq!(freelist.take(100), None);
        assert_eq!(freelist.free_count(), 1);
        assert_eq!(freelist.free_bytes(), 64);
    }

    #[test]
    fn freelist_exact_fit_is_preferred() {
        let mut freelist = Freelist::new();
        freelist.release(1000, 80);
        freelist.release(2000, 64);

        assert_eq!(freelist.take(64), Some((2000, 64)));
    }

    #[test]
    fn freelist_clear_forgets_everything() {
        let mut freelist = Freelist::new();
        freelist.release(1000, 80);
        freelist.clear();

        assert!(freelist.is_empty());
        assert_eq!(freelist.take(16), None);
    }
}

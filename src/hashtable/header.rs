//! # Table Header
//!
//! One 64-byte block per table instance. Its offset is the instance id; the
//! default instance's offset is the block store root.
//!
//! ## Header Layout
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  ------------------------------------------------
//! 0       4     magic (TABLE_MAGIC)
//! 4       4     current_table: 0 or 1
//! 8       8     object_count (0 = unknown, recount at open)
//! 16      4     load_factor (1-100)
//! 20      4     reserved
//! 24      8     rehash_marker
//! 32      8     table_sizes[2]
//! 40      16    table_locations[2]
//! 56      8     reserved
//! ```
//!
//! ## Rehash Marker
//!
//! | Value | Meaning                                                  |
//! |-------|----------------------------------------------------------|
//! | 0     | idle, exactly one slot is populated                      |
//! | 1     | doubling running, no pointer fixup pending               |
//! | other | doubling running, value is a parked chain head pointer   |
//!
//! ## Lazy Object Count
//!
//! The in-memory count is authoritative. The first mutation after open
//! persists a count of 0 and marks the header dirty. Every header write while
//! dirty keeps the count at 0, including the writes of a doubling; only
//! `close` persists the real count. A table that was not closed therefore
//! opens with a count of 0 and is recounted.

use std::mem::offset_of;

use eyre::Result;
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{BUCKET_POINTER_SIZE, REHASH_IDLE, REHASH_RUNNING, TABLE_MAGIC};
use crate::error::StructuralError;
use crate::storage::BlockStore;

pub const TABLE_HEADER_SIZE: usize = 64;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct TableHeader {
    magic: U32,
    current_table: U32,
    object_count: U64,
    load_factor: U32,
    reserved0: U32,
    rehash_marker: U64,
    table_sizes: [U32; 2],
    table_locations: [U64; 2],
    reserved: [u8; 8],
}

const _: () = assert!(std::mem::size_of::<TableHeader>() == TABLE_HEADER_SIZE);

const OBJECT_COUNT_OFFSET: u64 = offset_of!(TableHeader, object_count) as u64;
const REHASH_MARKER_OFFSET: u64 = offset_of!(TableHeader, rehash_marker) as u64;

impl TableHeader {
    pub fn new(table_size: u32, table_location: u64, load_factor: u32) -> Self {
        Self {
            magic: U32::new(TABLE_MAGIC),
            current_table: U32::new(0),
            object_count: U64::new(0),
            load_factor: U32::new(load_factor),
            reserved0: U32::new(0),
            rehash_marker: U64::new(REHASH_IDLE),
            table_sizes: [U32::new(table_size), U32::new(0)],
            table_locations: [U64::new(table_location), U64::new(0)],
            reserved: [0u8; 8],
        }
    }

    zerocopy_accessors! {
        magic: u32,
        current_table: u32,
        object_count: u64,
        load_factor: u32,
        rehash_marker: u64,
    }

    pub fn table_size(&self, table: usize) -> u32 {
        self.table_sizes[table].get()
    }

    pub fn table_location(&self, table: usize) -> u64 {
        self.table_locations[table].get()
    }

    pub fn set_slot(&mut self, table: usize, size: u32, location: u64) {
        self.table_sizes[table] = U32::new(size);
        self.table_locations[table] = U64::new(location);
    }
}

/// In-memory view of a table header plus the values derived from it.
#[derive(Debug, Clone)]
pub(crate) struct HeaderState {
    disk: TableHeader,
    location: u64,
    count: u64,
    dirty: bool,
    threshold: u64,
    requested_size: u32,
}

impl HeaderState {
    /// Allocates a header and a zeroed bucket array of `table_size` buckets.
    pub(crate) fn create(
        store: &mut dyn BlockStore,
        table_size: u32,
        load_factor: u32,
    ) -> Result<Self> {
        let buckets = store.allocate_and_clear(table_size as usize * BUCKET_POINTER_SIZE)?;
        let location = store.allocate_and_clear(TABLE_HEADER_SIZE)?;

        let mut state = Self {
            disk: TableHeader::new(table_size, buckets, load_factor),
            location,
            count: 0,
            dirty: false,
            threshold: 0,
            requested_size: 0,
        };
        state.recompute_threshold();
        state.write(store)?;
        Ok(state)
    }

    pub(crate) fn read(store: &dyn BlockStore, location: u64) -> Result<Self> {
        let mut raw = [0u8; TABLE_HEADER_SIZE];
        store.read_at(location, &mut raw)?;
        let disk = TableHeader::read_from_bytes(&raw[..])
            .map_err(|e| eyre::eyre!("failed to parse TableHeader: {:?}", e))?;

        if disk.magic() != TABLE_MAGIC {
            return Err(eyre::Report::new(StructuralError::BadMagic {
                location,
                found: disk.magic(),
            }));
        }
        if disk.current_table() > 1 {
            return Err(eyre::Report::new(StructuralError::Unrecoverable {
                reason: format!("current table id {} out of range", disk.current_table()),
            }));
        }

        let mut state = Self {
            disk,
            location,
            count: disk.object_count(),
            dirty: false,
            threshold: 0,
            requested_size: 0,
        };
        state.recompute_threshold();
        Ok(state)
    }

    /// Persists the whole header. The count field stays 0 while the header is
    /// dirty. No-op on a read-only store.
    pub(crate) fn write(&mut self, store: &mut dyn BlockStore) -> Result<()> {
        if store.is_read_only() {
            return Ok(());
        }
        let persisted = if self.dirty { 0 } else { self.count };
        self.disk.set_object_count(persisted);
        store.write_at(self.location, self.disk.as_bytes())
    }

    /// Persists the true count and clears the dirty flag.
    pub(crate) fn write_clean(&mut self, store: &mut dyn BlockStore) -> Result<()> {
        let was_dirty = std::mem::replace(&mut self.dirty, false);
        if let Err(e) = self.write(store) {
            self.dirty = was_dirty;
            return Err(e);
        }
        Ok(())
    }

    pub(crate) fn location(&self) -> u64 {
        self.location
    }

    pub(crate) fn current(&self) -> usize {
        self.disk.current_table() as usize
    }

    pub(crate) fn alternate(&self) -> usize {
        1 - self.current()
    }

    pub(crate) fn table_size(&self, table: usize) -> u32 {
        self.disk.table_size(table)
    }

    pub(crate) fn table_location(&self, table: usize) -> u64 {
        self.disk.table_location(table)
    }

    pub(crate) fn load_factor(&self) -> u32 {
        self.disk.load_factor()
    }

    /// Bucket index of `hash` in `table`, or 0 when the slot is empty.
    pub(crate) fn ht_index(&self, hash: u32, table: usize) -> u32 {
        let size = self.table_size(table);
        if size == 0 {
            return 0;
        }
        (hash & 0x7FFF_FFFF) % size
    }

    /// Disk address of bucket pointer `index` in `table`, or 0 when the slot
    /// is empty.
    pub(crate) fn calc_offset(&self, index: u32, table: usize) -> u64 {
        let location = self.table_location(table);
        if location == 0 {
            return 0;
        }
        location + index as u64 * BUCKET_POINTER_SIZE as u64
    }

    /// Slot that receives new entries: the growing table while a doubling
    /// runs, the current table otherwise.
    pub(crate) fn table_for_new_entry(&self) -> usize {
        if self.is_rehashing() && self.table_location(self.alternate()) != 0 {
            self.alternate()
        } else {
            self.current()
        }
    }

    pub(crate) fn is_rehashing(&self) -> bool {
        self.rehash_marker() != REHASH_IDLE
    }

    pub(crate) fn object_count(&self) -> u64 {
        self.count
    }

    pub(crate) fn set_object_count(&mut self, count: u64) {
        self.count = count;
    }

    /// True when the persisted count cannot be trusted.
    pub(crate) fn needs_recount(&self) -> bool {
        self.disk.object_count() == 0
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn increment_object_count(&mut self, store: &mut dyn BlockStore) -> Result<()> {
        self.mark_dirty(store)?;
        self.count += 1;
        Ok(())
    }

    pub(crate) fn decrement_object_count(&mut self, store: &mut dyn BlockStore) -> Result<()> {
        self.mark_dirty(store)?;
        self.count = self.count.saturating_sub(1);
        Ok(())
    }

    fn mark_dirty(&mut self, store: &mut dyn BlockStore) -> Result<()> {
        if !self.dirty {
            store.write_u64(self.location + OBJECT_COUNT_OFFSET, 0)?;
            self.disk.set_object_count(0);
            self.dirty = true;
        }
        Ok(())
    }

    pub(crate) fn rehash_marker(&self) -> u64 {
        self.disk.rehash_marker()
    }

    /// Sets the marker in memory and on disk.
    pub(crate) fn set_rehash_marker(&mut self, store: &mut dyn BlockStore, value: u64) -> Result<()> {
        store.write_u64(self.location + REHASH_MARKER_OFFSET, value)?;
        self.disk.set_rehash_marker(value);
        Ok(())
    }

    /// Records the growing table in the non-current slot and sets the marker
    /// to running, in one header write. Memory is left unchanged if the write
    /// fails.
    pub(crate) fn init_new_table(
        &mut self,
        store: &mut dyn BlockStore,
        size: u32,
        location: u64,
    ) -> Result<()> {
        let previous = self.disk;
        let slot = self.alternate();
        self.disk.set_rehash_marker(REHASH_RUNNING);
        self.disk.set_slot(slot, size, location);
        if let Err(e) = self.write(store) {
            self.disk = previous;
            return Err(e);
        }
        Ok(())
    }

    /// Makes the growing table current and frees the old bucket array. This
    /// is the single write that commits a doubling.
    pub(crate) fn swap_tables(&mut self, store: &mut dyn BlockStore) -> Result<()> {
        let old = self.current();
        let old_location = self.table_location(old);

        self.disk.set_rehash_marker(REHASH_IDLE);
        self.disk.set_current_table(self.alternate() as u32);
        self.disk.set_slot(old, 0, 0);
        self.write(store)?;

        if old_location != 0 {
            store.deallocate(old_location)?;
        }
        self.recompute_threshold();
        Ok(())
    }

    /// Empties `table` in memory only. Callers persist with `write`.
    pub(crate) fn clear_slot(&mut self, table: usize) {
        self.disk.set_slot(table, 0, 0);
    }

    pub(crate) fn threshold(&self) -> u64 {
        self.threshold
    }

    pub(crate) fn recompute_threshold(&mut self) {
        let size = self.table_size(self.current()) as u64;
        self.threshold = self.load_factor() as u64 * size / 100;
    }

    pub(crate) fn requested_size(&self) -> u32 {
        self.requested_size
    }

    pub(crate) fn set_requested_size(&mut self, size: u32) {
        self.requested_size = size;
    }

    /// Size of the next doubling: `2 * size + 1`, or the explicit request if
    /// that is larger.
    pub(crate) fn next_table_size(&self) -> Result<u32> {
        let doubled = self
            .table_size(self.current())
            .checked_mul(2)
            .and_then(|s| s.checked_add(1))
            .ok_or_else(|| eyre::eyre!("table size overflow while doubling"))?;
        Ok(doubled.max(self.requested_size))
    }
}

//! # Chain Walks
//!
//! Read-side operations on `TableCore`: key lookup, eviction-key lookup,
//! whole-bucket collection for walks, table membership tests for recovery
//! and pointer-only counting.
//!
//! ## Lookup Order
//!
//! ```text
//! find_entry(key)
//!   ├── current table:   bucket (hash & 0x7FFFFFFF) % size[current]
//!   └── growing table:   bucket (hash & 0x7FFFFFFF) % size[alternate]
//!                        (only while the rehash marker is set)
//! ```
//!
//! Each chain is walked comparing the stored hash first; the key bytes are
//! read only on a hash hit. Keys are compared in serialized form.

use eyre::Result;

use crate::codec::record::{read_body, read_key, read_link, RecordMeta, RetrieveMode};
use crate::memory::ObjectPool;

use super::entry::{EvictionKey, HashtableEntry, PooledEntry};
use super::table::TableCore;

impl TableCore {
    /// Looks up `key` and fills `entry` on a match.
    ///
    /// With `check_expired`, an expired match is still reported but only its
    /// key is read. `hops` is increased by the number of records passed over.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn find_entry<K, V>(
        &self,
        key: &[u8],
        hash: u32,
        mode: RetrieveMode,
        check_expired: bool,
        now_ms: i64,
        entry: &mut HashtableEntry<K, V>,
        hops: &mut u64,
    ) -> Result<bool> {
        let store = self.store()?;

        for table in self.lookup_tables() {
            let index = self.header.ht_index(hash, table);
            let mut previous = 0;
            let mut location = self.bucket(table, index);

            while location != 0 {
                let meta = RecordMeta::read(store, location)?;
                if meta.hash == hash && meta.key_size as usize == key.len() {
                    read_key(store, location, &meta, &mut entry.serialized_key)?;
                    if entry.serialized_key == key {
                        let mode = if check_expired && meta.is_expired(now_ms) {
                            RetrieveMode::Key
                        } else {
                            mode
                        };
                        entry.load_meta(location, &meta);
                        entry.previous = previous;
                        entry.index = index;
                        entry.table_id = table;
                        self.read_value_into(location, &meta, mode, entry)?;
                        return Ok(true);
                    }
                }
                *hops += 1;
                previous = location;
                location = meta.next;
            }
        }

        entry.serialized_key.clear();
        Ok(false)
    }

    /// Looks up a record by its eviction bookkeeping triple. Fills the key
    /// and chain position of `entry` on a match.
    pub(crate) fn find_by_eviction_key<K, V>(
        &self,
        eviction: &EvictionKey,
        entry: &mut HashtableEntry<K, V>,
    ) -> Result<bool> {
        let store = self.store()?;

        for table in self.lookup_tables() {
            let index = self.header.ht_index(eviction.hash, table);
            let mut previous = 0;
            let mut location = self.bucket(table, index);

            while location != 0 {
                let meta = RecordMeta::read(store, location)?;
                if eviction.matches(&meta) {
                    read_key(store, location, &meta, &mut entry.serialized_key)?;
                    entry.load_meta(location, &meta);
                    entry.previous = previous;
                    entry.index = index;
                    entry.table_id = table;
                    entry.mode = RetrieveMode::Key;
                    return Ok(true);
                }
                previous = location;
                location = meta.next;
            }
        }
        Ok(false)
    }

    /// Reads every record of bucket `index` in `table` into pooled shells.
    pub(crate) fn collect_bucket<K, V>(
        &self,
        table: usize,
        index: u32,
        mode: RetrieveMode,
        pool: &ObjectPool<HashtableEntry<K, V>>,
    ) -> Result<Vec<PooledEntry<K, V>>> {
        let store = self.store()?;
        let mut entries = Vec::new();
        let mut previous = 0;
        let mut location = self.bucket(table, index);

        while location != 0 {
            let meta = RecordMeta::read(store, location)?;
            let mut entry = pool.acquire();
            read_key(store, location, &meta, &mut entry.serialized_key)?;
            entry.load_meta(location, &meta);
            entry.previous = previous;
            entry.index = index;
            entry.table_id = table;
            self.read_value_into(location, &meta, mode, &mut *entry)?;
            entries.push(entry);

            previous = location;
            location = meta.next;
        }
        Ok(entries)
    }

    fn read_value_into<K, V>(
        &self,
        location: u64,
        meta: &RecordMeta,
        mode: RetrieveMode,
        entry: &mut HashtableEntry<K, V>,
    ) -> Result<()> {
        entry.mode = mode;
        if mode == RetrieveMode::Key {
            return Ok(());
        }
        let body = read_body(self.store()?, location, meta, mode, self.cache_values)?;
        entry.raw_value = Some(body.value);
        entry.cache_value_size = body.cache_value_size;
        entry.cache_value = body.cache_value;
        Ok(())
    }

    /// True if the record at `location` is linked into `table`'s chain for
    /// its hash.
    pub(crate) fn in_table(&self, table: usize, location: u64) -> Result<bool> {
        if self.header.table_location(table) == 0 {
            return Ok(false);
        }
        let store = self.store()?;
        let (_, hash) = read_link(store, location)?;
        let index = self.header.ht_index(hash, table);

        let mut current = self.bucket(table, index);
        while current != 0 {
            if current == location {
                return Ok(true);
            }
            let (next, _) = read_link(store, current)?;
            current = next;
        }
        Ok(false)
    }

    /// Number of records reachable from the populated tables, following
    /// pointers only. A record linked from both tables counts once.
    pub(crate) fn count_objects(&self) -> Result<u64> {
        let store = self.store()?;
        let current = self.header.current();
        let mut count = 0;

        for table in self.populated_tables() {
            for index in 0..self.header.table_size(table) {
                let mut location = self.bucket(table, index);
                while location != 0 {
                    if table == current || !self.in_table(current, location)? {
                        count += 1;
                    }
                    let (next, _) = read_link(store, location)?;
                    location = next;
                }
            }
        }
        Ok(count)
    }
}

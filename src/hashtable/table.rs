//! # Table Core
//!
//! `TableCore` is everything the mutation lock protects: the block store, the
//! header and the in-memory copies of both bucket arrays. All pointer writes
//! go through this type so the cached arrays never disagree with disk.
//!
//! The point operations, the doubling steps and recovery are implemented as
//! further `impl TableCore` blocks in `lookup`, `mutate`, `rehash` and
//! `recovery`.

use eyre::Result;
use tracing::debug;

use crate::codec::record::NEXT_OFFSET;
use crate::config::BUCKET_POINTER_SIZE;
use crate::error::StructuralError;
use crate::memory::{ArrayPool, PooledArray};
use crate::storage::BlockStore;

use super::header::HeaderState;

pub(crate) struct TableCore {
    store: Option<Box<dyn BlockStore>>,
    pub(crate) header: HeaderState,
    buckets: [Option<PooledArray>; 2],
    arrays: ArrayPool,
    pub(crate) auto_rehash: bool,
    pub(crate) cache_values: bool,
    pub(crate) scratch: Vec<u8>,
}

impl TableCore {
    /// Wraps an opened store and loads the bucket caches of every populated
    /// slot.
    pub(crate) fn new(
        store: Box<dyn BlockStore>,
        header: HeaderState,
        arrays: ArrayPool,
        auto_rehash: bool,
        cache_values: bool,
    ) -> Result<Self> {
        let mut core = Self {
            store: Some(store),
            header,
            buckets: [None, None],
            arrays,
            auto_rehash,
            cache_values,
            scratch: Vec::new(),
        };
        for table in 0..2 {
            if core.header.table_location(table) != 0 {
                core.load_cache(table)?;
            }
        }
        Ok(core)
    }

    pub(crate) fn store(&self) -> Result<&(dyn BlockStore + 'static)> {
        match self.store.as_deref() {
            Some(store) => Ok(store),
            None => Err(eyre::Report::new(StructuralError::NoBlockStore)),
        }
    }

    pub(crate) fn store_mut(&mut self) -> Result<&mut (dyn BlockStore + 'static)> {
        match self.store.as_deref_mut() {
            Some(store) => Ok(store),
            None => Err(eyre::Report::new(StructuralError::NoBlockStore)),
        }
    }

    /// Split borrow of the header and the store.
    pub(crate) fn parts_mut(
        &mut self,
    ) -> Result<(&mut HeaderState, &mut (dyn BlockStore + 'static))> {
        match self.store.as_deref_mut() {
            Some(store) => Ok((&mut self.header, store)),
            None => Err(eyre::Report::new(StructuralError::NoBlockStore)),
        }
    }

    pub(crate) fn take_store(&mut self) -> Option<Box<dyn BlockStore>> {
        self.buckets = [None, None];
        self.store.take()
    }

    pub(crate) fn is_open(&self) -> bool {
        self.store.is_some()
    }

    pub(crate) fn is_read_only(&self) -> Result<bool> {
        Ok(self.store()?.is_read_only())
    }

    pub(crate) fn ensure_writable(&self) -> Result<()> {
        if self.is_read_only()? {
            return Err(eyre::Report::new(StructuralError::ReadOnly));
        }
        Ok(())
    }

    pub(crate) fn flush(&mut self) -> Result<()> {
        self.store_mut()?.flush()
    }

    /// Reads the bucket array of `table` from disk into its cache.
    pub(crate) fn load_cache(&mut self, table: usize) -> Result<()> {
        let size = self.header.table_size(table) as usize;
        let location = self.header.table_location(table);

        let mut raw = vec![0u8; size * BUCKET_POINTER_SIZE];
        self.store()?.read_at(location, &mut raw)?;

        let mut cache = self.arrays.acquire(size);
        for (slot, chunk) in cache.iter_mut().zip(raw.chunks_exact(BUCKET_POINTER_SIZE)) {
            let mut bytes = [0u8; BUCKET_POINTER_SIZE];
            bytes.copy_from_slice(chunk);
            *slot = u64::from_le_bytes(bytes);
        }
        self.buckets[table] = Some(cache);

        debug!(table, size, location, "loaded bucket array");
        Ok(())
    }

    /// Installs an all-zero cache for a freshly cleared bucket array.
    pub(crate) fn install_empty_cache(&mut self, table: usize) {
        let size = self.header.table_size(table) as usize;
        self.buckets[table] = Some(self.arrays.acquire(size));
    }

    pub(crate) fn drop_cache(&mut self, table: usize) {
        self.buckets[table] = None;
    }

    /// Chain head of bucket `index` in `table`; 0 for an empty slot.
    pub(crate) fn bucket(&self, table: usize, index: u32) -> u64 {
        self.buckets[table]
            .as_ref()
            .and_then(|cache| cache.get(index as usize).copied())
            .unwrap_or(0)
    }

    /// Writes a bucket pointer to disk and to the cache.
    pub(crate) fn write_bucket(&mut self, table: usize, index: u32, pointer: u64) -> Result<()> {
        let offset = self.header.calc_offset(index, table);
        if offset == 0 {
            return Err(eyre::Report::new(StructuralError::NullPointer {
                context: "bucket write into an empty table slot",
            }));
        }
        self.store_mut()?.write_u64(offset, pointer)?;

        if let Some(slot) = self.buckets[table]
            .as_mut()
            .and_then(|cache| cache.get_mut(index as usize))
        {
            *slot = pointer;
        }
        Ok(())
    }

    /// Rewrites the `next` pointer of the record at `location`.
    pub(crate) fn set_next(&mut self, location: u64, next: u64) -> Result<()> {
        if location == 0 {
            return Err(eyre::Report::new(StructuralError::NullPointer {
                context: "next pointer write to record 0",
            }));
        }
        self.store_mut()?.write_u64(location + NEXT_OFFSET, next)
    }

    pub(crate) fn set_rehash_marker(&mut self, value: u64) -> Result<()> {
        let (header, store) = self.parts_mut()?;
        header.set_rehash_marker(store, value)
    }

    /// Both populated slots, current first.
    pub(crate) fn populated_tables(&self) -> impl Iterator<Item = usize> {
        let current = self.header.current();
        let tables = [current, 1 - current];
        let populated = tables.map(|table| self.header.table_location(table) != 0);
        tables
            .into_iter()
            .zip(populated)
            .filter_map(|(table, populated)| populated.then_some(table))
    }

    /// Tables a lookup probes: the current one, plus the growing one while a
    /// doubling runs.
    pub(crate) fn lookup_tables(&self) -> impl Iterator<Item = usize> {
        let rehashing = self.header.is_rehashing();
        self.populated_tables()
            .enumerate()
            .filter(move |&(i, _)| i == 0 || rehashing)
            .map(|(_, table)| table)
    }
}

impl std::fmt::Debug for TableCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableCore")
            .field("open", &self.is_open())
            .field("header", &self.header)
            .field("auto_rehash", &self.auto_rehash)
            .field("cache_values", &self.cache_values)
            .finish()
    }
}

//! # Mutations
//!
//! Insert, replace and unlink on `TableCore`. Every mutation keeps one rule:
//! a new record is fully written before any pointer names it, and an old
//! record is freed only after no pointer names it any more.
//!
//! ## Replace Paths
//!
//! ```text
//! chain head (previous == 0)        inside a chain
//! ──────────────────────────        ─────────────────────────────
//! write new record, next = old.next write new record, next = old.next
//! bucket[index] = new               previous.next = new
//! free old                          free old
//! ```

use eyre::Result;

use crate::codec::record::{
    encode_record, RecordFields, RetrieveMode, ValuePayload, NEXT_OFFSET,
    VALIDATOR_EXPIRATION_OFFSET,
};

use super::entry::{HashtableEntry, PutOptions};
use super::table::TableCore;

/// Everything needed to write one record.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RecordWrite<'a> {
    pub key: &'a [u8],
    pub hash: u32,
    pub value: ValuePayload<'a>,
    pub options: &'a PutOptions,
}

/// Result of `put_record`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PutOutcome {
    Inserted { bytes: usize },
    /// The key exists and the new value was null.
    Unchanged,
    Replaced {
        size: u32,
        expiration: i64,
        bytes: usize,
    },
}

impl TableCore {
    /// Inserts or replaces a record. `probe` is scratch space for the lookup.
    pub(crate) fn put_record<K, V>(
        &mut self,
        write: &RecordWrite<'_>,
        now_ms: i64,
        probe: &mut HashtableEntry<K, V>,
        hops: &mut u64,
    ) -> Result<PutOutcome> {
        self.ensure_writable()?;

        let found = self.find_entry(
            write.key,
            write.hash,
            RetrieveMode::Key,
            false,
            now_ms,
            probe,
            hops,
        )?;

        if !found {
            let table = self.header.table_for_new_entry();
            let index = self.header.ht_index(write.hash, table);
            let fields = RecordFields {
                next: self.bucket(table, index),
                hash: write.hash,
                validator_expiration: write.options.validator_expiration,
                cache_value_hashcode: write.options.cache_value_hashcode,
                first_created: now_ms,
                expiration: write.options.expiration,
                alias: write.options.alias,
            };
            let (location, bytes) = self.write_record(&fields, write)?;
            self.write_bucket(table, index, location)?;

            let (header, store) = self.parts_mut()?;
            header.increment_object_count(store)?;
            self.flush()?;
            return Ok(PutOutcome::Inserted { bytes });
        }

        if matches!(write.value, ValuePayload::Null) {
            return Ok(PutOutcome::Unchanged);
        }

        let old_location = probe.location;
        let fields = RecordFields {
            next: probe.next,
            hash: write.hash,
            validator_expiration: write.options.validator_expiration,
            cache_value_hashcode: write.options.cache_value_hashcode,
            first_created: probe.first_created,
            expiration: write.options.expiration,
            alias: write.options.alias,
        };
        let (location, bytes) = self.write_record(&fields, write)?;
        if probe.previous == 0 {
            self.write_bucket(probe.table_id, probe.index, location)?;
        } else {
            self.set_next(probe.previous, location)?;
        }
        self.store_mut()?.deallocate(old_location)?;
        self.flush()?;

        Ok(PutOutcome::Replaced {
            size: probe.size,
            expiration: probe.expiration,
            bytes,
        })
    }

    /// Encodes and writes a record into a new block. Returns its location and
    /// encoded length.
    fn write_record(
        &mut self,
        fields: &RecordFields,
        write: &RecordWrite<'_>,
    ) -> Result<(u64, usize)> {
        let mut buf = std::mem::take(&mut self.scratch);
        buf.clear();

        let result = encode_record(
            &mut buf,
            fields,
            write.key,
            write.value,
            write.options.cache_value.as_deref(),
            self.cache_values,
        )
        .and_then(|_| {
            let store = self.store_mut()?;
            let location = store.allocate(buf.len())?;
            store.write_at(location, &buf)?;
            Ok((location, buf.len()))
        });

        self.scratch = buf;
        result
    }

    /// Removes the record `probe` was filled from by the last lookup.
    pub(crate) fn remove_found<K, V>(&mut self, probe: &HashtableEntry<K, V>) -> Result<()> {
        self.unlink(probe.table_id, probe.index, probe.previous, probe.next)?;

        let (header, store) = self.parts_mut()?;
        header.decrement_object_count(store)?;
        store.deallocate(probe.location)?;
        self.flush()
    }

    /// Removes `key`. Returns false when it was absent.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn remove_record<K, V>(
        &mut self,
        key: &[u8],
        hash: u32,
        mode: RetrieveMode,
        now_ms: i64,
        probe: &mut HashtableEntry<K, V>,
        hops: &mut u64,
    ) -> Result<bool> {
        self.ensure_writable()?;

        if !self.find_entry(key, hash, mode, false, now_ms, probe, hops)? {
            return Ok(false);
        }
        self.remove_found(probe)?;
        Ok(true)
    }

    /// Points whatever names the record at `next` instead.
    fn unlink(&mut self, table: usize, index: u32, previous: u64, next: u64) -> Result<()> {
        if previous == 0 {
            self.write_bucket(table, index, next)
        } else {
            self.set_next(previous, next)
        }
    }

    /// Rewrites only the validator-expiration slot of `key`'s record.
    pub(crate) fn update_validator_expiration<K, V>(
        &mut self,
        key: &[u8],
        hash: u32,
        validator_expiration: i64,
        now_ms: i64,
        probe: &mut HashtableEntry<K, V>,
    ) -> Result<bool> {
        self.ensure_writable()?;

        let mut hops = 0;
        if !self.find_entry(key, hash, RetrieveMode::Key, false, now_ms, probe, &mut hops)? {
            return Ok(false);
        }
        let offset = probe.location + VALIDATOR_EXPIRATION_OFFSET;
        let store = self.store_mut()?;
        store.write_at(offset, &validator_expiration.to_le_bytes())?;
        store.flush()?;
        Ok(true)
    }

    /// Frees every record of bucket `index` in `table` and empties the
    /// bucket. Returns the number of records freed.
    pub(crate) fn free_bucket(&mut self, table: usize, index: u32) -> Result<u64> {
        let mut location = self.bucket(table, index);
        self.write_bucket(table, index, 0)?;

        let store = self.store_mut()?;
        let mut freed = 0;
        while location != 0 {
            let next = store.read_u64(location + NEXT_OFFSET)?;
            store.deallocate(location)?;
            freed += 1;
            location = next;
        }
        Ok(freed)
    }
}

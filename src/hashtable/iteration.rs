//! # Walks and Clear
//!
//! Operations that visit the whole table. They hold the structural lock for
//! their full duration, so they never overlap each other, a doubling,
//! recovery or `close`. The mutation lock is taken once per bucket; point
//! operations interleave between buckets and their effects on buckets not
//! yet visited may or may not be observed.
//!
//! ## Paging
//!
//! ```text
//! walk_hash(mode, start = 0,  limit = Some(100))  -> Some(37)
//! walk_hash(mode, start = 37, limit = Some(100))  -> Some(80)
//! walk_hash(mode, start = 80, limit = Some(100))  -> None      (done)
//! ```
//!
//! A page always ends on a bucket boundary, so `limit` may be exceeded by
//! the length of the last chain. A walk stopped by its action resumes after
//! the bucket it stopped in.

use eyre::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::codec::record::RetrieveMode;
use crate::codec::Codec;

use super::entry::{HashtableEntry, Value};
use super::DiskHashtable;

impl<K, V, C> DiskHashtable<K, V, C>
where
    K: Serialize + DeserializeOwned + Send + 'static,
    V: Serialize + DeserializeOwned + Send + 'static,
    C: Codec,
{
    /// Visits the entries of the table from bucket `start`.
    ///
    /// `action` returns `false` to stop. `limit` caps the number of entries
    /// visited, rounded up to a bucket boundary. Returns the bucket to resume
    /// from, or `None` once the last bucket was visited.
    pub fn walk_hash<F>(
        &self,
        mode: RetrieveMode,
        start: u32,
        limit: Option<usize>,
        mut action: F,
    ) -> Result<Option<u32>>
    where
        F: FnMut(&mut HashtableEntry<K, V>) -> Result<bool>,
    {
        let _permit = self.shared.structural.acquire();
        self.walk_locked(mode, start, limit, &mut action)
    }

    /// Calls `action` with every key.
    pub fn iterate_keys<F>(&self, mut action: F) -> Result<()>
    where
        F: FnMut(&K) -> Result<bool>,
    {
        self.walk_hash(RetrieveMode::Key, 0, None, |entry| match entry.key() {
            Some(key) => action(key),
            None => Ok(true),
        })?;
        Ok(())
    }

    /// Calls `action` with every key and value.
    pub fn iterate_objects<F>(&self, mut action: F) -> Result<()>
    where
        F: FnMut(&K, &Value<V>) -> Result<bool>,
    {
        self.walk_hash(RetrieveMode::KeyValue, 0, None, |entry| {
            match (entry.key(), entry.value()) {
                (Some(key), Some(value)) => action(key, value),
                _ => Ok(true),
            }
        })?;
        Ok(())
    }

    /// Walk body. The caller holds the structural lock.
    ///
    /// Bucket numbers run through the current table and then, while an
    /// interrupted doubling is visible (read-only opens), through the growing
    /// table. A record still linked from its old bucket is reported there
    /// only.
    pub(crate) fn walk_locked(
        &self,
        mode: RetrieveMode,
        start: u32,
        limit: Option<usize>,
        action: &mut dyn FnMut(&mut HashtableEntry<K, V>) -> Result<bool>,
    ) -> Result<Option<u32>> {
        let tables: Vec<(usize, u32)> = {
            let core = self.shared.core.lock();
            let tables = core
                .lookup_tables()
                .map(|table| (table, core.header.table_size(table)))
                .collect();
            tables
        };
        let total = tables
            .iter()
            .try_fold(0u32, |sum, &(_, size)| sum.checked_add(size))
            .ok_or_else(|| eyre::eyre!("bucket count overflow while walking"))?;

        let mut visited = 0usize;
        let mut base = 0u32;
        for (position, &(table, size)) in tables.iter().enumerate() {
            let first = start.saturating_sub(base).min(size);
            for index in first..size {
                let global = base + index;
                let mut entries = {
                    let core = self.shared.core.lock();
                    let mut entries = core.collect_bucket(table, index, mode, &self.entries)?;
                    if position > 0 {
                        let old = tables[0].0;
                        let mut kept = Vec::with_capacity(entries.len());
                        for entry in entries {
                            if !core.in_table(old, entry.location)? {
                                kept.push(entry);
                            }
                        }
                        entries = kept;
                    }
                    entries
                };

                for entry in entries.iter_mut() {
                    let decoded = entry.materialize(&self.codec)?;
                    self.shared.stats.record_deserialized(decoded);
                    visited += 1;
                    if !action(entry)? {
                        debug!(instance = self.instance, table, index, visited, "walk stopped by action");
                        return Ok(Self::resume_point(global + 1, total));
                    }
                }

                if limit.is_some_and(|limit| visited >= limit) {
                    return Ok(Self::resume_point(global + 1, total));
                }
            }
            base += size;
        }
        Ok(None)
    }

    fn resume_point(next: u32, total: u32) -> Option<u32> {
        (next < total).then_some(next)
    }

    /// Frees every record and empties every bucket.
    pub fn clear(&self) -> Result<()> {
        let _permit = self.shared.structural.acquire();
        let mut core = self.shared.core.lock();
        core.ensure_writable()?;

        let mut freed = 0;
        let tables: Vec<usize> = core.populated_tables().collect();
        for table in tables {
            for index in 0..core.header.table_size(table) {
                freed += core.free_bucket(table, index)?;
            }
        }

        core.header.set_object_count(0);
        let (header, store) = core.parts_mut()?;
        header.write(store)?;
        core.flush()?;
        drop(core);

        self.shared.stats.record_clear();
        debug!(instance = self.instance, freed, "table cleared");
        Ok(())
    }
}

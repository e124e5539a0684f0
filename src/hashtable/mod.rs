//! # Disk Hash Table
//!
//! A chained hash table stored directly in a [`BlockStore`]. Records live in
//! individually allocated blocks; each bucket of the on-disk bucket array
//! points at the head of a singly linked chain of records.
//!
//! ## Architecture
//!
//! ```text
//! DiskHashtable<K, V, C>         typed API, key/value codec, entry pool
//!   │
//!   └── Arc<Shared>
//!         ├── Mutex<TableCore>   store, header, bucket caches
//!         ├── StructuralLock     clear, close, walks, recovery, doubling
//!         ├── RehashSignal       completion of the doubling worker
//!         └── HashtableStats
//! ```
//!
//! ## On-Disk Structure
//!
//! ```text
//! TableHeader ──┬── slot 0: [size, location] ──> bucket array (8-byte heads)
//!               └── slot 1: [size, location] ──> bucket array while doubling
//!
//! bucket[i] ──> record ──next──> record ──next──> 0
//! ```
//!
//! ## Durability
//!
//! Every mutation writes the new record before linking it and flushes before
//! returning. A doubling moves one pointer at a time and leaves a breadcrumb
//! in the header so the next open can repair an interrupted move. The object
//! count is written only by `close`; after a crash it is recomputed.
//!
//! ## Usage
//!
//! ```ignore
//! let table = DiskHashtable::<String, String>::builder()
//!     .path("./cache.htod")
//!     .open()?;
//!
//! table.put(&"a".to_string(), "1".to_string())?;
//! assert_eq!(table.get(&"a".to_string())?, Some(Value::Object("1".to_string())));
//! table.close()?;
//! ```

mod builder;
mod entry;
mod header;
mod instance;
mod iteration;
mod lookup;
mod mutate;
mod recovery;
mod rehash;
mod stats;
mod sync;
mod table;

pub use builder::{HashtableBuilder, RecountCallback};
pub use entry::{
    EntryPool, EvictionKey, HashtableEntry, PooledEntry, PutOptions, ReplacedEntry, Value,
};
pub use header::{TableHeader, TABLE_HEADER_SIZE};
pub use instance::{create_instance, destroy_instance};
pub use stats::{HashtableStats, StatsSnapshot};

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use eyre::Result;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::codec::record::{RetrieveMode, ValuePayload};
use crate::codec::{key_hash, Codec, JsonCodec};
use crate::error::StructuralError;

use mutate::{PutOutcome, RecordWrite};
use recovery::Recovery;
use rehash::spawn_rehash_worker;
use sync::{RehashSignal, StructuralLock};
use table::TableCore;

/// State shared between a table handle and its rehash worker.
pub(crate) struct Shared {
    pub(crate) core: Mutex<TableCore>,
    pub(crate) structural: Arc<StructuralLock>,
    pub(crate) rehash: RehashSignal,
    pub(crate) stats: HashtableStats,
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// A persistent hash table of `K` to [`Value<V>`].
///
/// Keys and object values are serialized with `C`; byte values are stored
/// as they are. All methods take `&self`; the table can be shared between
/// threads behind an `Arc`.
pub struct DiskHashtable<K, V, C = JsonCodec> {
    shared: Arc<Shared>,
    codec: C,
    entries: EntryPool<K, V>,
    instance: u64,
}

impl<K, V> DiskHashtable<K, V, JsonCodec>
where
    K: Serialize + DeserializeOwned + Send + 'static,
    V: Serialize + DeserializeOwned + Send + 'static,
{
    pub fn builder() -> HashtableBuilder<K, V, JsonCodec> {
        HashtableBuilder::new()
    }

    /// Opens the default table in the store file at `path`, creating both if
    /// needed.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::builder().path(path).open()
    }
}

impl<K, V, C> DiskHashtable<K, V, C>
where
    K: Serialize + DeserializeOwned + Send + 'static,
    V: Serialize + DeserializeOwned + Send + 'static,
    C: Codec,
{
    pub(crate) fn from_parts(
        core: TableCore,
        codec: C,
        entries: EntryPool<K, V>,
        on_recount: Option<RecountCallback<K, V>>,
    ) -> Result<Self> {
        let instance = core.header.location();
        let table = Self {
            shared: Arc::new(Shared {
                core: Mutex::new(core),
                structural: StructuralLock::new(),
                rehash: RehashSignal::default(),
                stats: HashtableStats::default(),
            }),
            codec,
            entries,
            instance,
        };
        table.startup(on_recount)?;
        Ok(table)
    }

    /// Recovery and recount, under the structural lock.
    fn startup(&self, on_recount: Option<RecountCallback<K, V>>) -> Result<()> {
        let mut permit = self.shared.structural.acquire();

        let recovery = {
            let mut core = self.shared.core.lock();
            if core.is_read_only()? {
                if core.header.is_rehashing() {
                    warn!(
                        instance = self.instance,
                        "read-only table has an interrupted doubling, lookups probe both tables"
                    );
                }
                Recovery::Clean
            } else {
                core.recover()?
            }
        };

        if let Recovery::Resume { repaired } = recovery {
            info!(instance = self.instance, repaired, "resuming interrupted doubling");
            spawn_rehash_worker(Arc::clone(&self.shared), permit)?;
            self.shared.rehash.wait()?;
            permit = self.shared.structural.acquire();
        }

        let needs_recount =
            recovery != Recovery::Clean || self.shared.core.lock().header.needs_recount();
        if needs_recount {
            self.recount_locked(on_recount)?;
        }

        drop(permit);
        Ok(())
    }

    /// Recomputes the object count. Caller holds the structural lock.
    fn recount_locked(&self, on_recount: Option<RecountCallback<K, V>>) -> Result<()> {
        let count = match on_recount {
            None => self.shared.core.lock().count_objects()?,
            Some(mut callback) => {
                let mut count = 0u64;
                self.walk_locked(RetrieveMode::KeyValue, 0, None, &mut |entry| {
                    if let (Some(key), Some(value)) = (entry.key(), entry.value()) {
                        callback(key, value)?;
                    }
                    count += 1;
                    Ok(true)
                })?;
                count
            }
        };

        let mut core = self.shared.core.lock();
        core.header.set_object_count(count);
        let (header, store) = core.parts_mut()?;
        header.write_clean(store)?;
        core.flush()?;

        if count > 0 {
            warn!(instance = self.instance, count, "object count recomputed after unclean shutdown");
        }
        Ok(())
    }

    fn encode_key(&self, key: &K) -> Result<(Vec<u8>, u32)> {
        let mut bytes = Vec::new();
        self.codec.serialize(key, &mut bytes)?;
        let hash = key_hash(&bytes);
        Ok((bytes, hash))
    }

    /// Looks up `key` and returns its entry, read according to `mode`.
    ///
    /// With `check_expired`, an expired entry is still returned but only its
    /// key is read (`entry.mode() == RetrieveMode::Key`), so callers can
    /// account for it.
    pub fn get_entry(
        &self,
        key: &K,
        mode: RetrieveMode,
        check_expired: bool,
    ) -> Result<Option<PooledEntry<K, V>>> {
        let (bytes, hash) = self.encode_key(key)?;
        let mut entry = self.entries.acquire();
        let mut hops = 0;

        let found = {
            let core = self.shared.core.lock();
            core.find_entry(&bytes, hash, mode, check_expired, now_ms(), &mut *entry, &mut hops)?
        };
        self.shared.stats.record_collisions(hops);
        if !found {
            self.shared.stats.record_read(false);
            return Ok(None);
        }

        self.shared.stats.record_read(entry.mode() == mode);
        let decoded = entry.materialize(&self.codec)?;
        self.shared.stats.record_deserialized(decoded);
        Ok(Some(entry))
    }

    /// Returns the value of `key`, or `None` if it is absent or expired.
    pub fn get(&self, key: &K) -> Result<Option<Value<V>>> {
        let Some(mut entry) = self.get_entry(key, RetrieveMode::KeyValue, true)? else {
            return Ok(None);
        };
        if entry.mode() == RetrieveMode::Key {
            return Ok(None);
        }
        Ok(entry.take_value())
    }

    /// Reports whether `key` is stored. With `check_expired`, an expired
    /// entry counts as absent.
    pub fn contains_key(&self, key: &K, check_expired: bool) -> Result<bool> {
        let Some(entry) = self.get_entry(key, RetrieveMode::Key, check_expired)? else {
            return Ok(false);
        };
        Ok(!(check_expired && entry.is_expired(now_ms())))
    }

    /// Stores `value` under `key`. Returns a snapshot of the replaced entry.
    pub fn put(&self, key: &K, value: V) -> Result<Option<ReplacedEntry<K>>> {
        self.put_with_options(key, &Value::Object(value), &PutOptions::new())
    }

    /// Stores a null value. A null put over an existing key changes nothing.
    pub fn put_null(&self, key: &K) -> Result<Option<ReplacedEntry<K>>> {
        self.put_payload(key, ValuePayload::Null, &PutOptions::new())
    }

    /// Stores the first `len` bytes of `value` without serialization.
    pub fn put_bytes(&self, key: &K, value: &[u8], len: usize) -> Result<Option<ReplacedEntry<K>>> {
        let len = len.min(value.len());
        self.put_payload(key, ValuePayload::Bytes(&value[..len]), &PutOptions::new())
    }

    pub fn put_with_options(
        &self,
        key: &K,
        value: &Value<V>,
        options: &PutOptions,
    ) -> Result<Option<ReplacedEntry<K>>> {
        match value {
            Value::Null => self.put_payload(key, ValuePayload::Null, options),
            Value::Bytes(bytes) => self.put_payload(key, ValuePayload::Bytes(bytes), options),
            Value::Object(object) => {
                let mut bytes = Vec::new();
                self.codec.serialize(object, &mut bytes)?;
                self.put_payload(key, ValuePayload::Object(&bytes), options)
            }
        }
    }

    fn put_payload(
        &self,
        key: &K,
        value: ValuePayload<'_>,
        options: &PutOptions,
    ) -> Result<Option<ReplacedEntry<K>>> {
        let (key_bytes, hash) = self.encode_key(key)?;
        let write = RecordWrite {
            key: &key_bytes,
            hash,
            value,
            options,
        };
        let mut probe = self.entries.acquire();
        let mut hops = 0;

        let outcome = {
            let mut core = self.shared.core.lock();
            self.maybe_start_doubling(&mut core)?;
            core.put_record(&write, now_ms(), &mut *probe, &mut hops)?
        };
        self.shared.stats.record_collisions(hops);

        match outcome {
            PutOutcome::Inserted { bytes } => {
                self.shared.stats.record_write(false, bytes);
                Ok(None)
            }
            PutOutcome::Unchanged => {
                self.shared.stats.record_write(false, 0);
                Ok(None)
            }
            PutOutcome::Replaced {
                size,
                expiration,
                bytes,
            } => {
                self.shared.stats.record_write(true, bytes);
                Ok(Some(ReplacedEntry {
                    key: self.codec.deserialize(&key_bytes)?,
                    size,
                    expiration,
                }))
            }
        }
    }

    /// Starts a doubling from inside a put when the table is over its
    /// threshold. Deferred when the structural lock is busy.
    fn maybe_start_doubling(&self, core: &mut TableCore) -> Result<()> {
        if !core.auto_rehash || core.header.is_rehashing() || core.is_read_only()? {
            return Ok(());
        }
        if core.header.object_count() + 1 <= core.header.threshold() {
            return Ok(());
        }
        let Some(permit) = self.shared.structural.try_acquire() else {
            debug!(
                instance = self.instance,
                count = core.header.object_count(),
                "doubling deferred, structural lock busy"
            );
            return Ok(());
        };

        let new_size = core.header.next_table_size()?;
        core.begin_doubling(new_size)?;
        spawn_rehash_worker(Arc::clone(&self.shared), permit)
    }

    /// Removes `key`. Returns false if it was absent.
    pub fn remove(&self, key: &K) -> Result<bool> {
        let (bytes, hash) = self.encode_key(key)?;
        let mut probe = self.entries.acquire();
        let mut hops = 0;

        let removed = {
            let mut core = self.shared.core.lock();
            core.remove_record(&bytes, hash, RetrieveMode::Key, now_ms(), &mut *probe, &mut hops)?
        };
        self.shared.stats.record_collisions(hops);
        if removed {
            self.shared.stats.record_remove();
        }
        Ok(removed)
    }

    /// Removes `key` and returns the removed entry with its value, and with
    /// its cache value when `with_cache_value` is set.
    pub fn get_and_remove(
        &self,
        key: &K,
        with_cache_value: bool,
    ) -> Result<Option<PooledEntry<K, V>>> {
        let (bytes, hash) = self.encode_key(key)?;
        let mode = if with_cache_value {
            RetrieveMode::All
        } else {
            RetrieveMode::KeyValue
        };
        let mut entry = self.entries.acquire();
        let mut hops = 0;

        let removed = {
            let mut core = self.shared.core.lock();
            core.remove_record(&bytes, hash, mode, now_ms(), &mut *entry, &mut hops)?
        };
        self.shared.stats.record_collisions(hops);
        if !removed {
            return Ok(None);
        }
        self.shared.stats.record_remove();
        let decoded = entry.materialize(&self.codec)?;
        self.shared.stats.record_deserialized(decoded);
        Ok(Some(entry))
    }

    /// Removes `key` and returns its value.
    pub fn take(&self, key: &K) -> Result<Option<Value<V>>> {
        Ok(self
            .get_and_remove(key, false)?
            .and_then(|mut entry| entry.take_value()))
    }

    /// Rewrites the validator expiration of `key` in place. The record's
    /// `expiration` and `first_created` are left untouched; use a put to
    /// change them. Returns false if the key is absent.
    pub fn update_expiration_in_header(&self, key: &K, validator_expiration: i64) -> Result<bool> {
        let (bytes, hash) = self.encode_key(key)?;
        let mut probe = self.entries.acquire();
        let mut core = self.shared.core.lock();
        core.update_validator_expiration(&bytes, hash, validator_expiration, now_ms(), &mut *probe)
    }

    /// Returns the key of the record matching an eviction triple.
    pub fn key_for_eviction(&self, eviction: &EvictionKey) -> Result<Option<K>> {
        let mut entry = self.entries.acquire();
        let found = {
            let core = self.shared.core.lock();
            core.find_by_eviction_key(eviction, &mut *entry)?
        };
        if !found {
            return Ok(None);
        }
        entry.materialize(&self.codec)?;
        Ok(entry.take_key())
    }

    /// Removes the record matching an eviction triple and returns its key.
    pub fn remove_for_eviction(&self, eviction: &EvictionKey) -> Result<Option<K>> {
        let mut entry = self.entries.acquire();
        let found = {
            let mut core = self.shared.core.lock();
            core.ensure_writable()?;
            let found = core.find_by_eviction_key(eviction, &mut *entry)?;
            if found {
                core.remove_found(&*entry)?;
            }
            found
        };
        if !found {
            return Ok(None);
        }
        self.shared.stats.record_remove();
        entry.materialize(&self.codec)?;
        Ok(entry.take_key())
    }

    /// Sets the minimum size of the next doubling.
    pub fn request_table_size(&self, size: u32) {
        self.shared.core.lock().header.set_requested_size(size);
    }

    /// Starts a doubling to at least `size` buckets now. Returns false if a
    /// doubling is already running.
    pub fn start_rehash(&self, size: u32) -> Result<bool> {
        if self.shared.rehash.is_running() {
            return Ok(false);
        }
        let permit = self.shared.structural.acquire();
        {
            let mut core = self.shared.core.lock();
            if core.header.is_rehashing() {
                return Ok(false);
            }
            let requested = core.header.requested_size().max(size);
            core.header.set_requested_size(requested);
            let new_size = core.header.next_table_size()?;
            core.begin_doubling(new_size)?;
        }
        spawn_rehash_worker(Arc::clone(&self.shared), permit)?;
        Ok(true)
    }

    /// Blocks until no doubling is running. Reports a failed worker.
    pub fn wait_for_rehash(&self) -> Result<()> {
        self.shared.rehash.wait()
    }

    pub fn is_rehashing(&self) -> bool {
        self.shared.rehash.is_running() || self.shared.core.lock().header.is_rehashing()
    }

    /// Number of stored entries.
    pub fn size(&self) -> u64 {
        self.shared.core.lock().header.object_count()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Bucket count of the current table.
    pub fn table_size(&self) -> u32 {
        let core = self.shared.core.lock();
        core.header.table_size(core.header.current())
    }

    /// Header location of this table; pass it to the builder's `instance` to
    /// reopen the table.
    pub fn instance(&self) -> u64 {
        self.instance
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn reset_stats(&self) {
        self.shared.stats.reset();
    }

    pub fn describe(&self) -> TableDescription {
        let core = self.shared.core.lock();
        let header = &core.header;
        TableDescription {
            instance: self.instance,
            current_table: header.current(),
            table_sizes: [header.table_size(0), header.table_size(1)],
            table_locations: [header.table_location(0), header.table_location(1)],
            rehash_marker: header.rehash_marker(),
            object_count: header.object_count(),
            threshold: header.threshold(),
            load_factor: header.load_factor(),
            dirty: header.is_dirty(),
            structural_busy: self.shared.structural.is_held(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.shared.core.lock().is_open()
    }

    /// Waits for a running doubling, persists the header with the true
    /// object count, flushes and releases the store. Every later call fails
    /// with `StructuralError::NoBlockStore`.
    pub fn close(&self) -> Result<()> {
        let _permit = self.shared.structural.acquire();
        if let Err(e) = self.shared.rehash.wait() {
            warn!(instance = self.instance, error = %e, "closing after failed doubling");
        }

        let mut core = self.shared.core.lock();
        if !core.is_open() {
            return Err(eyre::Report::new(StructuralError::NoBlockStore));
        }
        if !core.is_read_only()? {
            let (header, store) = core.parts_mut()?;
            header.write_clean(store)?;
            core.flush()?;
        }
        let count = core.header.object_count();
        drop(core.take_store());

        info!(instance = self.instance, count, "table closed");
        Ok(())
    }
}

/// Dropping without `close` leaves the header marked dirty, so the next open
/// recounts. A running doubling is waited for so no worker outlives the
/// handle.
impl<K, V, C> Drop for DiskHashtable<K, V, C> {
    fn drop(&mut self) {
        if let Err(e) = self.shared.rehash.wait() {
            warn!(instance = self.instance, error = %e, "doubling failed before drop");
        }
    }
}

impl<K, V, C> fmt::Debug for DiskHashtable<K, V, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskHashtable")
            .field("instance", &self.instance)
            .field("core", &*self.shared.core.lock())
            .finish()
    }
}

/// Summary of a table header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableDescription {
    pub instance: u64,
    pub current_table: usize,
    pub table_sizes: [u32; 2],
    pub table_locations: [u64; 2],
    pub rehash_marker: u64,
    pub object_count: u64,
    pub threshold: u64,
    pub load_factor: u32,
    /// A mutation happened since the last clean header write.
    pub dirty: bool,
    /// A walk, clear or doubling holds the structural lock.
    pub structural_busy: bool,
}

impl fmt::Display for TableDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "instance {} current={} sizes={:?} locations={:?} marker={:#x} \
             objects={} threshold={} load_factor={}% dirty={} busy={}",
            self.instance,
            self.current_table,
            self.table_sizes,
            self.table_locations,
            self.rehash_marker,
            self.object_count,
            self.threshold,
            self.load_factor,
            self.dirty,
            self.structural_busy
        )
    }
}

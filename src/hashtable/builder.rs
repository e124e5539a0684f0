//! # Hashtable Builder
//!
//! `HashtableBuilder` configures and opens a [`DiskHashtable`]. Settings are
//! chained and applied by `open()` (file-backed) or `open_with_store()` (any
//! [`BlockStore`]).
//!
//! ## Configuration Options
//!
//! | Option        | Default   | Description                                   |
//! |---------------|-----------|-----------------------------------------------|
//! | table_size    | 4093      | Initial bucket count of a new table           |
//! | load_factor   | 75        | Percent of buckets filled before doubling     |
//! | auto_rehash   | true      | Start doublings from `put`                    |
//! | cache_values  | false     | Store side-channel cache values on disk       |
//! | read_only     | false     | Open the store file read-only                 |
//! | instance      | root      | Header location of the table to open          |
//! | array_pool    | private   | Pool of cached bucket arrays                  |
//! | entry_pool    | private   | Pool of entry shells                          |
//! | on_recount    | none      | Called per entry when the count is recomputed |
//!
//! `table_size` and `load_factor` apply only when a table is created. An
//! existing table keeps the values stored in its header.
//!
//! ## Instances
//!
//! A store file can hold several tables. Without `instance`, the builder
//! opens the table named by the store's root pointer and creates it when the
//! root is unset. With `instance`, it opens the table whose header lives at
//! that location (see [`create_instance`](super::create_instance)).
//!
//! ## Usage
//!
//! ```ignore
//! let table = DiskHashtable::<String, Session>::builder()
//!     .path("./sessions.htod")
//!     .table_size(1021)
//!     .load_factor(80)
//!     .open()?;
//! ```

use std::path::{Path, PathBuf};

use eyre::{bail, eyre, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::info;

use crate::codec::{Codec, JsonCodec};
use crate::config::{ARRAY_POOL_CAPACITY, DEFAULT_LOAD_FACTOR, DEFAULT_TABLE_SIZE, ENTRY_POOL_CAPACITY};
use crate::error::StructuralError;
use crate::memory::ArrayPool;
use crate::storage::{BlockStore, FileBlockStore};

use super::entry::{EntryPool, Value};
use super::header::HeaderState;
use super::instance::create_instance;
use super::table::TableCore;
use super::DiskHashtable;

/// Called for every entry while the object count is recomputed after an
/// unclean shutdown. An error aborts the open.
pub type RecountCallback<K, V> = Box<dyn FnMut(&K, &Value<V>) -> Result<()> + Send>;

/// Builder for configuring and opening a [`DiskHashtable`].
pub struct HashtableBuilder<K, V, C = JsonCodec> {
    path: Option<PathBuf>,
    table_size: u32,
    load_factor: u32,
    auto_rehash: bool,
    cache_values: bool,
    read_only: bool,
    instance: Option<u64>,
    array_pool: Option<ArrayPool>,
    entry_pool: Option<EntryPool<K, V>>,
    on_recount: Option<RecountCallback<K, V>>,
    codec: C,
}

impl<K, V> Default for HashtableBuilder<K, V, JsonCodec> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> HashtableBuilder<K, V, JsonCodec> {
    pub fn new() -> Self {
        Self {
            path: None,
            table_size: DEFAULT_TABLE_SIZE,
            load_factor: DEFAULT_LOAD_FACTOR,
            auto_rehash: true,
            cache_values: false,
            read_only: false,
            instance: None,
            array_pool: None,
            entry_pool: None,
            on_recount: None,
            codec: JsonCodec,
        }
    }
}

impl<K, V, C> HashtableBuilder<K, V, C> {
    /// Store file to open. Created with a fresh table if it does not exist.
    pub fn path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn table_size(mut self, buckets: u32) -> Self {
        self.table_size = buckets;
        self
    }

    /// Percent of the bucket count the table may hold before it doubles.
    /// Must be in `1..=100`.
    pub fn load_factor(mut self, percent: u32) -> Self {
        self.load_factor = percent;
        self
    }

    pub fn auto_rehash(mut self, enabled: bool) -> Self {
        self.auto_rehash = enabled;
        self
    }

    /// Persist side-channel cache values. When disabled they are accepted
    /// and dropped.
    pub fn cache_values(mut self, enabled: bool) -> Self {
        self.cache_values = enabled;
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Opens the table whose header lives at `location` instead of the root
    /// table.
    pub fn instance(mut self, location: u64) -> Self {
        self.instance = Some(location);
        self
    }

    /// Shares a bucket-array pool between tables.
    pub fn array_pool(mut self, pool: ArrayPool) -> Self {
        self.array_pool = Some(pool);
        self
    }

    /// Shares an entry-shell pool between tables of the same types.
    pub fn entry_pool(mut self, pool: EntryPool<K, V>) -> Self {
        self.entry_pool = Some(pool);
        self
    }

    pub fn on_recount<F>(mut self, callback: F) -> Self
    where
        F: FnMut(&K, &Value<V>) -> Result<()> + Send + 'static,
    {
        self.on_recount = Some(Box::new(callback));
        self
    }

    /// Replaces the key and value codec.
    pub fn codec<C2: Codec>(self, codec: C2) -> HashtableBuilder<K, V, C2> {
        HashtableBuilder {
            path: self.path,
            table_size: self.table_size,
            load_factor: self.load_factor,
            auto_rehash: self.auto_rehash,
            cache_values: self.cache_values,
            read_only: self.read_only,
            instance: self.instance,
            array_pool: self.array_pool,
            entry_pool: self.entry_pool,
            on_recount: self.on_recount,
            codec,
        }
    }
}

impl<K, V, C> HashtableBuilder<K, V, C>
where
    K: Serialize + DeserializeOwned + Send + 'static,
    V: Serialize + DeserializeOwned + Send + 'static,
    C: Codec,
{
    /// Opens or creates the store file set with `path`.
    pub fn open(self) -> Result<DiskHashtable<K, V, C>> {
        let path = self
            .path
            .clone()
            .ok_or_else(|| eyre!("no path specified, use .path() to set the store file"))?;
        self.validate()?;

        let store = if self.read_only {
            FileBlockStore::open_read_only(&path)?
        } else if FileBlockStore::exists(&path) {
            FileBlockStore::open(&path)?
        } else {
            FileBlockStore::create(&path)?
        };
        self.open_with_store(Box::new(store))
    }

    /// Opens a table in an already opened block store. The table owns the
    /// store from here on and releases it on `close`.
    pub fn open_with_store(self, mut store: Box<dyn BlockStore>) -> Result<DiskHashtable<K, V, C>> {
        self.validate()?;

        let location = match self.instance {
            Some(0) => return Err(eyre::Report::new(StructuralError::ZeroInstance)),
            Some(location) => location,
            None => match store.root()? {
                0 if store.is_read_only() => {
                    return Err(eyre::Report::new(StructuralError::ReadOnly));
                }
                0 => {
                    let location = create_instance(store.as_mut(), self.table_size, self.load_factor)?;
                    store.set_root(location)?;
                    store.flush()?;
                    location
                }
                root => root,
            },
        };

        let header = HeaderState::read(store.as_ref(), location)?;
        info!(
            instance = location,
            table_size = header.table_size(header.current()),
            count = header.object_count(),
            read_only = store.is_read_only(),
            "opening hashtable"
        );

        let arrays = self
            .array_pool
            .unwrap_or_else(|| ArrayPool::new(ARRAY_POOL_CAPACITY));
        let entries = self
            .entry_pool
            .unwrap_or_else(|| EntryPool::new(ENTRY_POOL_CAPACITY));
        let core = TableCore::new(store, header, arrays, self.auto_rehash, self.cache_values)?;

        DiskHashtable::from_parts(core, self.codec, entries, self.on_recount)
    }

    fn validate(&self) -> Result<()> {
        if self.table_size == 0 {
            bail!("table_size must be at least 1");
        }
        if !(1..=100).contains(&self.load_factor) {
            bail!("load_factor must be in 1..=100, got {}", self.load_factor);
        }
        Ok(())
    }
}

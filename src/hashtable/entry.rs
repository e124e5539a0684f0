//! # Entries
//!
//! [`HashtableEntry`] is the in-memory shell of one record. Lookups fill it in
//! two stages: the raw stage (serialized key, raw value bytes, header fields)
//! is filled while the mutation lock is held; the typed stage (`key`,
//! `value`) is decoded by [`HashtableEntry::materialize`] only when an entry
//! is handed to a caller.
//!
//! Shells are pooled. A [`PooledEntry`] returns its shell to the pool on drop
//! and the shell is reset before it is reused.

use eyre::Result;
use serde::de::DeserializeOwned;

use crate::codec::record::{RawValue, RecordMeta, RetrieveMode};
use crate::codec::Codec;
use crate::memory::{ObjectPool, Pooled, Reset};

/// A stored value. `Null` is a legal value distinct from an absent key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value<V> {
    Null,
    /// Raw bytes stored without serialization.
    Bytes(Vec<u8>),
    Object(V),
}

impl<V> Value<V> {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_object(&self) -> Option<&V> {
        match self {
            Value::Object(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn into_object(self) -> Option<V> {
        match self {
            Value::Object(v) => Some(v),
            _ => None,
        }
    }
}

pub type EntryPool<K, V> = ObjectPool<HashtableEntry<K, V>>;
pub type PooledEntry<K, V> = Pooled<HashtableEntry<K, V>>;

#[derive(Debug)]
pub struct HashtableEntry<K, V> {
    pub(crate) key: Option<K>,
    pub(crate) value: Option<Value<V>>,
    pub(crate) serialized_key: Vec<u8>,
    pub(crate) raw_value: Option<RawValue>,
    pub(crate) cache_value: Option<Vec<u8>>,
    pub(crate) cache_value_size: i32,
    pub(crate) cache_value_hashcode: Option<i32>,
    pub(crate) next: u64,
    pub(crate) previous: u64,
    pub(crate) location: u64,
    pub(crate) hash: u32,
    pub(crate) index: u32,
    pub(crate) table_id: usize,
    pub(crate) expiration: i64,
    pub(crate) validator_expiration: i64,
    pub(crate) first_created: i64,
    pub(crate) size: u32,
    pub(crate) alias: bool,
    pub(crate) mode: RetrieveMode,
}

impl<K, V> Default for HashtableEntry<K, V> {
    fn default() -> Self {
        Self {
            key: None,
            value: None,
            serialized_key: Vec::new(),
            raw_value: None,
            cache_value: None,
            cache_value_size: -1,
            cache_value_hashcode: None,
            next: 0,
            previous: 0,
            location: 0,
            hash: 0,
            index: 0,
            table_id: 0,
            expiration: -1,
            validator_expiration: -1,
            first_created: 0,
            size: 0,
            alias: false,
            mode: RetrieveMode::Key,
        }
    }
}

impl<K, V> Reset for HashtableEntry<K, V> {
    fn reset(&mut self) {
        let mut serialized_key = std::mem::take(&mut self.serialized_key);
        serialized_key.clear();
        *self = Self {
            serialized_key,
            ..Self::default()
        };
    }
}

impl<K, V> HashtableEntry<K, V> {
    /// Copies the fixed record fields into the shell.
    pub(crate) fn load_meta(&mut self, location: u64, meta: &RecordMeta) {
        self.location = location;
        self.next = meta.next;
        self.hash = meta.hash;
        self.validator_expiration = meta.validator_expiration;
        self.cache_value_hashcode = meta.hashcode_valid.then_some(meta.cache_value_hashcode);
        self.first_created = meta.first_created;
        self.expiration = meta.expiration;
        self.size = meta.data_size;
        self.alias = meta.alias;
    }

    /// Decodes the typed key and, if it was read, the typed value.
    pub(crate) fn materialize<C: Codec>(&mut self, codec: &C) -> Result<usize>
    where
        K: DeserializeOwned,
        V: DeserializeOwned,
    {
        let mut decoded = 0;
        if self.key.is_none() && !self.serialized_key.is_empty() {
            self.key = Some(codec.deserialize(&self.serialized_key)?);
            decoded += self.serialized_key.len();
        }
        if let Some(raw) = self.raw_value.take() {
            self.value = Some(match raw {
                RawValue::Null => Value::Null,
                RawValue::Bytes(bytes) => {
                    decoded += bytes.len();
                    Value::Bytes(bytes)
                }
                RawValue::Object(bytes) => {
                    decoded += bytes.len();
                    Value::Object(codec.deserialize(&bytes)?)
                }
            });
        }
        Ok(decoded)
    }

    pub fn key(&self) -> Option<&K> {
        self.key.as_ref()
    }

    pub fn take_key(&mut self) -> Option<K> {
        self.key.take()
    }

    /// Serialized key bytes as stored on disk.
    pub fn serialized_key(&self) -> &[u8] {
        &self.serialized_key
    }

    /// The value, if the retrieval mode read it.
    pub fn value(&self) -> Option<&Value<V>> {
        self.value.as_ref()
    }

    pub fn take_value(&mut self) -> Option<Value<V>> {
        self.value.take()
    }

    /// Side-channel cache value, read only in `RetrieveMode::All`.
    pub fn cache_value(&self) -> Option<&[u8]> {
        self.cache_value.as_deref()
    }

    /// Length of the cache value on disk, -1 when absent.
    pub fn cache_value_size(&self) -> i32 {
        self.cache_value_size
    }

    pub fn cache_value_hashcode(&self) -> Option<i32> {
        self.cache_value_hashcode
    }

    pub fn location(&self) -> u64 {
        self.location
    }

    pub fn next(&self) -> u64 {
        self.next
    }

    pub fn previous(&self) -> u64 {
        self.previous
    }

    pub fn hash(&self) -> u32 {
        self.hash
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn table_id(&self) -> usize {
        self.table_id
    }

    pub fn expiration(&self) -> i64 {
        self.expiration
    }

    pub fn validator_expiration(&self) -> i64 {
        self.validator_expiration
    }

    pub fn first_created(&self) -> i64 {
        self.first_created
    }

    /// Logical record size, a multiple of 512.
    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn is_alias(&self) -> bool {
        self.alias
    }

    /// How much of the record was read.
    pub fn mode(&self) -> RetrieveMode {
        self.mode
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expiration > 0 && now_ms >= self.expiration
    }

    /// Eviction bookkeeping triple of this entry.
    pub fn eviction_key(&self) -> EvictionKey {
        EvictionKey {
            hash: self.hash,
            expiration: self.expiration,
            size: self.size,
        }
    }
}

/// Snapshot of an entry that `put` replaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplacedEntry<K> {
    pub key: K,
    pub size: u32,
    pub expiration: i64,
}

/// Record metadata used by an external eviction policy to name a record
/// without holding its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EvictionKey {
    pub hash: u32,
    /// Non-positive means "never expires".
    pub expiration: i64,
    pub size: u32,
}

impl EvictionKey {
    pub(crate) fn matches(&self, meta: &RecordMeta) -> bool {
        let expiration_matches = if self.expiration <= 0 {
            meta.expiration <= 0
        } else {
            meta.expiration == self.expiration
        };
        meta.hash == self.hash && meta.data_size == self.size && expiration_matches
    }
}

/// Per-write record attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PutOptions {
    /// Absolute expiration time in ms since the epoch; non-positive means
    /// never.
    pub expiration: i64,
    pub validator_expiration: i64,
    pub alias: bool,
    /// Side-channel cache value stored beside the value.
    pub cache_value: Option<Vec<u8>>,
    pub cache_value_hashcode: Option<i32>,
}

impl PutOptions {
    pub fn new() -> Self {
        Self {
            expiration: -1,
            validator_expiration: -1,
            ..Default::default()
        }
    }

    pub fn expiration(mut self, expiration: i64) -> Self {
        self.expiration = expiration;
        self
    }

    pub fn validator_expiration(mut self, validator_expiration: i64) -> Self {
        self.validator_expiration = validator_expiration;
        self
    }

    pub fn alias(mut self, alias: bool) -> Self {
        self.alias = alias;
        self
    }

    pub fn cache_value(mut self, bytes: Vec<u8>, hashcode: Option<i32>) -> Self {
        self.cache_value = Some(bytes);
        self.cache_value_hashcode = hashcode;
        self
    }
}

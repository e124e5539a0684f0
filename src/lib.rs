//! # htod - Hash Table On Disk
//!
//! A persistent, crash-recoverable chained hash table stored in a
//! block-structured file. Every mutation is durable when it returns, the
//! table grows online by doubling its bucket array while readers and writers
//! keep going, and an interrupted doubling is repaired the next time the
//! table is opened.
//!
//! ## Quick Start
//!
//! ```ignore
//! use htod::{DiskHashtable, Value};
//!
//! let table = DiskHashtable::<String, String>::builder()
//!     .path("./cache.htod")
//!     .table_size(1021)
//!     .open()?;
//!
//! table.put(&"user:1".to_string(), "alice".to_string())?;
//! assert_eq!(
//!     table.get(&"user:1".to_string())?,
//!     Some(Value::Object("alice".to_string()))
//! );
//! table.close()?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │   DiskHashtable (typed API)          │
//! ├─────────────────────────────────────┤
//! │   Header │ Lookup/Mutate │ Doubling  │
//! │          │  Recovery     │ Walks     │
//! ├─────────────────────────────────────┤
//! │   Record codec │ Key/value Codec     │
//! ├─────────────────────────────────────┤
//! │   BlockStore (FileBlockStore, mmap)  │
//! └─────────────────────────────────────┘
//! ```
//!
//! ## Module Overview
//!
//! - [`hashtable`]: the table, its builder, instances, walks and statistics
//! - [`codec`]: key/value serialization and the on-disk record format
//! - [`storage`]: the block store trait and the memory-mapped file store
//! - [`memory`]: pools of entry shells and bucket-array buffers
//! - [`config`]: on-disk and default constants
//! - [`error`]: structural errors carried inside `eyre` reports
//!
//! ## Logging
//!
//! The crate logs through `tracing` and never installs a subscriber.

#[macro_use]
mod macros;

pub mod codec;
pub mod config;
pub mod error;
pub mod hashtable;
pub mod memory;
pub mod storage;

pub use codec::record::RetrieveMode;
pub use codec::{Codec, JsonCodec};
pub use error::StructuralError;
pub use hashtable::{
    create_instance, destroy_instance, DiskHashtable, EvictionKey, HashtableBuilder,
    HashtableEntry, PooledEntry, PutOptions, ReplacedEntry, StatsSnapshot, TableDescription,
    Value,
};
pub use storage::{BlockStore, FileBlockStore};

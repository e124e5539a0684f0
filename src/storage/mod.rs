//! # Storage Module
//!
//! The block store the hash table lives in. The table only talks to the
//! [`BlockStore`] trait: positional reads and writes, allocation of
//! variable-sized blocks, a root pointer and `flush`. This crate ships one
//! implementation, [`FileBlockStore`], a memory-mapped file with a best-fit
//! free list.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │   DiskHashtable (header, chains)     │
//! ├─────────────────────────────────────┤
//! │   BlockStore trait                   │
//! ├─────────────────────────────────────┤
//! │   FileBlockStore                     │
//! │     ├── StoreFileHeader (128 bytes)  │
//! │     ├── Freelist (rebuilt at open)   │
//! │     └── MmapStorage (mapped file)    │
//! └─────────────────────────────────────┘
//! ```
//!
//! ## Store File Layout
//!
//! ```text
//! Offset 0:    StoreFileHeader (128 bytes)
//! Offset 128:  [capacity u32][state u32][payload ... capacity bytes]
//!              [capacity u32][state u32][payload ...]
//!              ...
//! end_offset:  unused space up to the file length (multiple of PAGE_SIZE)
//! ```
//!
//! Offsets returned by `allocate` point at the payload, never at the prefix.
//! Offset 0 therefore never names a block and is used as the null pointer by
//! the hash table.
//!
//! ## Positional I/O
//!
//! The classic block-store interface is `seek` followed by `read`/`write`.
//! Here the two are fused into `read_at`/`write_at`, which removes the hidden
//! cursor and lets reads take `&self`.
//!
//! ## Durability
//!
//! Writes land in the mapping immediately and become durable when `flush`
//! returns. A process crash without `flush` still keeps every completed write
//! because the mapping is shared with the OS page cache.
//!
//! ## Thread Safety
//!
//! `BlockStore` requires `Send`; synchronization is the caller's job. The hash
//! table keeps its store behind its mutation lock.

mod block_store;
mod freelist;
mod headers;
mod mmap;

pub use block_store::FileBlockStore;
pub use freelist::Freelist;
pub use headers::{StoreFileHeader, STORE_MAGIC};
pub use mmap::MmapStorage;

use eyre::Result;

/// Contract between the hash table and its backing storage.
pub trait BlockStore: Send {
    /// Fills `buf` from the bytes starting at `offset`.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Writes `data` starting at `offset`.
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()>;

    fn read_u32(&self, offset: u64) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_at(offset, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_u64(&self, offset: u64) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_at(offset, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn write_u32(&mut self, offset: u64, value: u32) -> Result<()> {
        self.write_at(offset, &value.to_le_bytes())
    }

    fn write_u64(&mut self, offset: u64, value: u64) -> Result<()> {
        self.write_at(offset, &value.to_le_bytes())
    }

    /// Allocates a block of at least `size` bytes and returns its offset.
    /// The contents are unspecified.
    fn allocate(&mut self, size: usize) -> Result<u64>;

    /// Allocates a block of at least `size` bytes with the first `size`
    /// bytes zeroed.
    fn allocate_and_clear(&mut self, size: usize) -> Result<u64>;

    /// Returns the block at `offset` to the store.
    fn deallocate(&mut self, offset: u64) -> Result<()>;

    /// Makes every completed write durable.
    fn flush(&mut self) -> Result<()>;

    fn is_read_only(&self) -> bool;

    /// Persisted root pointer: header location of the default table instance.
    fn root(&self) -> Result<u64>;

    fn set_root(&mut self, root: u64) -> Result<()>;
}

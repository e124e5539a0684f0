//! # File Block Store
//!
//! `FileBlockStore` implements [`BlockStore`] over a memory-mapped file.
//!
//! ## Block Prefix
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -----------------------------------------
//! -8      4     capacity: payload bytes of this block
//! -4      4     state: BLOCK_LIVE or BLOCK_FREE
//! 0       cap   payload (offset returned by allocate)
//! ```
//!
//! Prefix plus payload is always a multiple of `BLOCK_GRAIN`, so blocks tile
//! the file from `FILE_HEADER_SIZE` to the header's `end_offset` and can be
//! walked front to back. That walk is how the free list is rebuilt at open.
//!
//! ## Crash Ordering
//!
//! A fresh block's prefix is written before `end_offset` is advanced, and a
//! split writes the remainder's prefix before shrinking the original, so a
//! walk over a crashed file never lands inside a payload.
//!
//! ## Read-Only Mode
//!
//! `open_read_only` maps the file copy-on-write. Reads work normally; every
//! mutating call fails with `StructuralError::ReadOnly`.

use std::path::{Path, PathBuf};

use eyre::{bail, ensure, Result, WrapErr};
use tracing::debug;

use super::freelist::Freelist;
use super::headers::StoreFileHeader;
use super::mmap::MmapStorage;
use super::BlockStore;
use crate::config::{
    BLOCK_GRAIN, BLOCK_PREFIX_SIZE, FILE_HEADER_SIZE, MIN_BLOCK_CAPACITY, MIN_GROWTH_PAGES,
    MIN_SPLIT_REMAINDER, PAGE_SIZE,
};
use crate::error::StructuralError;

const BLOCK_LIVE: u32 = u32::from_le_bytes(*b"LIVE");
const BLOCK_FREE: u32 = u32::from_le_bytes(*b"FREE");

#[derive(Debug)]
pub struct FileBlockStore {
    path: PathBuf,
    storage: MmapStorage,
    freelist: Freelist,
    read_only: bool,
}

impl FileBlockStore {
    /// Creates (or truncates) a store file at `path`.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut storage = MmapStorage::create(path, MIN_GROWTH_PAGES)?;

        let header = StoreFileHeader::new();
        storage
            .bytes_mut(0, FILE_HEADER_SIZE)?
            .copy_from_slice(zerocopy::IntoBytes::as_bytes(&header));
        storage.sync()?;

        Ok(Self {
            path: path.to_path_buf(),
            storage,
            freelist: Freelist::new(),
            read_only: false,
        })
    }

    /// Opens an existing store file for reading and writing.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let storage = MmapStorage::open(path)?;
        Self::from_storage(path, storage, false)
    }

    /// Opens an existing store file without ever writing to it.
    pub fn open_read_only<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let storage = MmapStorage::open_copy_on_write(path)?;
        Self::from_storage(path, storage, true)
    }

    /// Returns true if `path` holds a file that starts with a store header.
    pub fn exists<P: AsRef<Path>>(path: P) -> bool {
        let Ok(storage) = MmapStorage::open_copy_on_write(path.as_ref()) else {
            return false;
        };
        storage
            .bytes(0, FILE_HEADER_SIZE)
            .and_then(StoreFileHeader::from_bytes)
            .is_ok()
    }

    fn from_storage(path: &Path, storage: MmapStorage, read_only: bool) -> Result<Self> {
        let mut store = Self {
            path: path.to_path_buf(),
            storage,
            freelist: Freelist::new(),
            read_only,
        };

        store
            .rebuild_freelist()
            .wrap_err_with(|| format!("failed to scan blocks of '{}'", path.display()))?;

        Ok(store)
    }

    fn header(&self) -> Result<&StoreFileHeader> {
        StoreFileHeader::from_bytes(self.storage.bytes(0, FILE_HEADER_SIZE)?)
    }

    fn header_mut(&mut self) -> Result<&mut StoreFileHeader> {
        StoreFileHeader::from_bytes_mut(self.storage.bytes_mut(0, FILE_HEADER_SIZE)?)
    }

    fn rebuild_freelist(&mut self) -> Result<()> {
        let end = self.header()?.end_offset();
        ensure!(
            end <= self.storage.file_size(),
            "end offset {} exceeds file size {}",
            end,
            self.storage.file_size()
        );

        self.freelist.clear();
        let mut prefix = FILE_HEADER_SIZE as u64;
        while prefix < end {
            let (capacity, state) = self.read_prefix(prefix)?;
            let payload = prefix + BLOCK_PREFIX_SIZE as u64;
            ensure!(
                capacity > 0 && payload + capacity as u64 <= end,
                "block at {} has impossible capacity {}",
                payload,
                capacity
            );
            match state {
                BLOCK_LIVE => {}
                BLOCK_FREE => self.freelist.release(payload, capacity),
                other => bail!("block at {} has unknown state {:#010x}", payload, other),
            }
            prefix = payload + capacity as u64;
        }

        debug!(
            path = %self.path.display(),
            end_offset = end,
            free_blocks = self.freelist.free_count(),
            free_bytes = self.freelist.free_bytes(),
            "rebuilt block store freelist"
        );
        Ok(())
    }

    fn read_prefix(&self, prefix: u64) -> Result<(u32, u32)> {
        let bytes = self.storage.bytes(prefix, BLOCK_PREFIX_SIZE)?;
        let capacity = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let state = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        Ok((capacity, state))
    }

    fn write_prefix(&mut self, prefix: u64, capacity: u32, state: u32) -> Result<()> {
        let bytes = self.storage.bytes_mut(prefix, BLOCK_PREFIX_SIZE)?;
        bytes[..4].copy_from_slice(&capacity.to_le_bytes());
        bytes[4..].copy_from_slice(&state.to_le_bytes());
        Ok(())
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(eyre::Report::new(StructuralError::ReadOnly));
        }
        Ok(())
    }

    /// Payload capacity handed out for a request of `size` bytes.
    fn block_capacity_for(size: usize) -> Result<u32> {
        let payload = size.max(MIN_BLOCK_CAPACITY);
        let total = (payload + BLOCK_PREFIX_SIZE).div_ceil(BLOCK_GRAIN) * BLOCK_GRAIN;
        u32::try_from(total - BLOCK_PREFIX_SIZE)
            .map_err(|_| eyre::eyre!("allocation of {} bytes is too large", size))
    }

    fn ensure_file_len(&mut self, end: u64) -> Result<()> {
        if end <= self.storage.file_size() {
            return Ok(());
        }

        let current = self.storage.page_count();
        let needed = end.div_ceil(PAGE_SIZE as u64);
        let new_pages = needed.max(current * 2).max(current + MIN_GROWTH_PAGES);

        debug!(
            path = %self.path.display(),
            from_pages = current,
            to_pages = new_pages,
            "growing block store"
        );
        self.storage
            .grow(new_pages)
            .wrap_err_with(|| format!("failed to grow '{}'", self.path.display()))
    }

    /// Capacity of the live block at `offset`.
    pub fn block_capacity(&self, offset: u64) -> Result<u32> {
        let prefix = self.prefix_of(offset)?;
        let (capacity, state) = self.read_prefix(prefix)?;
        if state != BLOCK_LIVE {
            return Err(eyre::Report::new(StructuralError::InvalidBlock {
                offset,
                reason: "not a live block",
            }));
        }
        Ok(capacity)
    }

    fn prefix_of(&self, offset: u64) -> Result<u64> {
        let min = (FILE_HEADER_SIZE + BLOCK_PREFIX_SIZE) as u64;
        if offset < min || (offset - BLOCK_PREFIX_SIZE as u64) % BLOCK_GRAIN as u64 != 0 {
            return Err(eyre::Report::new(StructuralError::InvalidBlock {
                offset,
                reason: "not a block payload offset",
            }));
        }
        Ok(offset - BLOCK_PREFIX_SIZE as u64)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_size(&self) -> u64 {
        self.storage.file_size()
    }

    pub fn free_blocks(&self) -> u64 {
        self.freelist.free_count()
    }

    pub fn live_blocks(&self) -> Result<u64> {
        Ok(self.header()?.live_blocks())
    }

    pub fn live_bytes(&self) -> Result<u64> {
        Ok(self.header()?.live_bytes())
    }
}

impl BlockStore for FileBlockStore {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        buf.copy_from_slice(self.storage.bytes(offset, buf.len())?);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.ensure_writable()?;
        ensure!(
            offset >= FILE_HEADER_SIZE as u64,
            "write at {} would overwrite the store header",
            offset
        );
        self.storage
            .bytes_mut(offset, data.len())?
            .copy_from_slice(data);
        Ok(())
    }

    fn allocate(&mut self, size: usize) -> Result<u64> {
        self.ensure_writable()?;
        let wanted = Self::block_capacity_for(size)?;

        if let Some((offset, capacity)) = self.freelist.take(wanted) {
            let prefix = offset - BLOCK_PREFIX_SIZE as u64;
            let spare = (capacity - wanted) as usize;
            let capacity = if spare >= MIN_SPLIT_REMAINDER {
                let rest_payload = offset + wanted as u64 + BLOCK_PREFIX_SIZE as u64;
                let rest_capacity = (spare - BLOCK_PREFIX_SIZE) as u32;
                self.write_prefix(
                    rest_payload - BLOCK_PREFIX_SIZE as u64,
                    rest_capacity,
                    BLOCK_FREE,
                )?;
                self.write_prefix(prefix, wanted, BLOCK_LIVE)?;
                self.freelist.release(rest_payload, rest_capacity);
                wanted
            } else {
                self.write_prefix(prefix, capacity, BLOCK_LIVE)?;
                capacity
            };
            self.header_mut()?.record_allocation(capacity as u64);
            return Ok(offset);
        }

        let prefix = self.header()?.end_offset();
        let end = prefix + BLOCK_PREFIX_SIZE as u64 + wanted as u64;
        self.ensure_file_len(end)?;
        self.write_prefix(prefix, wanted, BLOCK_LIVE)?;

        let header = self.header_mut()?;
        header.set_end_offset(end);
        header.record_allocation(wanted as u64);

        Ok(prefix + BLOCK_PREFIX_SIZE as u64)
    }

    fn allocate_and_clear(&mut self, size: usize) -> Result<u64> {
        let offset = self.allocate(size)?;
        self.storage.bytes_mut(offset, size)?.fill(0);
        Ok(offset)
    }

    fn deallocate(&mut self, offset: u64) -> Result<()> {
        self.ensure_writable()?;
        let capacity = self.block_capacity(offset)?;
        self.write_prefix(offset - BLOCK_PREFIX_SIZE as u64, capacity, BLOCK_FREE)?;
        self.freelist.release(offset, capacity);
        self.header_mut()?.record_release(capacity as u64);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.storage
            .sync()
            .wrap_err_with(|| format!("failed to flush '{}'", self.path.display()))
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn root(&self) -> Result<u64> {
        Ok(self.header()?.root())
    }

    fn set_root(&mut self, root: u64) -> Result<()> {
        self.ensure_writable()?;
        self.header_mut()?.set_root(root);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_writes_valid_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.htod");

        let store = FileBlockStore::create(&path).unwrap();

        assert_eq!(store.root().unwrap(), 0);
        assert_eq!(store.live_blocks().unwrap(), 0);
        assert!(FileBlockStore::exists(&path));
        assert!(!FileBlockStore::exists(dir.path().join("missing.htod")));
    }

    #[test]
    fn allocate_returns_distinct_aligned_offsets() {
        let dir = tempdir().unwrap();
        let mut store = FileBlockStore::create(dir.path().join("store.htod")).unwrap();

        let a = store.allocate(10).unwrap();
        let b = store.allocate(100).unwrap();
        let c = store.allocate(1).unwrap();

        for offset in [a, b, c] {
            assert_eq!((offset - BLOCK_PREFIX_SIZE as u64) % BLOCK_GRAIN as u64, 0);
            assert!(offset >= (FILE_HEADER_SIZE + BLOCK_PREFIX_SIZE) as u64);
        }
        assert!(b >= a + 10);
        assert!(c >= b + 100);
        assert_eq!(store.live_blocks().unwrap(), 3);
    }

    #[test]
    fn read_write_roundtrip() {
        let dir = tempdir().unwrap();
        let mut store = FileBlockStore::create(dir.path().join("store.htod")).unwrap();

        let offset = store.allocate(16).unwrap();
        store.write_u64(offset, 0xDEAD_BEEF_0000_0001).unwrap();
        store.write_u32(offset + 8, 42).unwrap();

        assert_eq!(store.read_u64(offset).unwrap(), 0xDEAD_BEEF_0000_0001);
        assert_eq!(store.read_u32(offset + 8).unwrap(), 42);
    }

    #[test]
    fn write_into_store_header_is_rejected() {
        let dir = tempdir().unwrap();
        let mut store = FileBlockStore::create(dir.path().join("store.htod")).unwrap();

        assert!(store.write_u64(0, 1).is_err());
    }

    #[test]
    fn deallocated_block_is_reused() {
        let dir = tempdir().unwrap();
        let mut store = FileBlockStore::create(dir.path().join("store.htod")).unwrap();

        let a = store.allocate(200).unwrap();
        let _b = store.allocate(200).unwrap();
        store.deallocate(a).unwrap();
        assert_eq!(store.free_blocks(), 1);

        let c = store.allocate(150).unwrap();
        assert_eq!(c, a, "best-fit allocation SHOULD reuse the freed block");
        assert_eq!(store.free_blocks(), 0);
    }

    #[test]
    fn large_free_block_is_split() {
        let dir = tempdir().unwrap();
        let mut store = FileBlockStore::create(dir.path().join("store.htod")).unwrap();

        let big = store.allocate(1024).unwrap();
        let _guard = store.allocate(16).unwrap();
        store.deallocate(big).unwrap();

        let small = store.allocate(16).unwrap();
        assert_eq!(small, big);
        assert_eq!(store.free_blocks(), 1, "remainder SHOULD stay on the freelist");

        let rest = store.allocate(512).unwrap();
        assert!(rest > small && rest < big + 1024);
    }

    #[test]
    fn double_free_is_structural_error() {
        let dir = tempdir().unwrap();
        let mut store = FileBlockStore::create(dir.path().join("store.htod")).unwrap();

        let a = store.allocate(32).unwrap();
        store.deallocate(a).unwrap();
        let err = store.deallocate(a).unwrap_err();

        assert!(StructuralError::is_structural(&err));
    }

    #[test]
    fn allocate_and_clear_zeroes_reused_space() {
        let dir = tempdir().unwrap();
        let mut store = FileBlockStore::create(dir.path().join("store.htod")).unwrap();

        let a = store.allocate(64).unwrap();
        store.write_at(a, &[0xFF; 64]).unwrap();
        store.deallocate(a).unwrap();

        let b = store.allocate_and_clear(64).unwrap();
        let mut buf = [0xAAu8; 64];
        store.read_at(b, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 64]);
    }

    #[test]
    fn store_grows_past_initial_size() {
        let dir = tempdir().unwrap();
        let mut store = FileBlockStore::create(dir.path().join("store.htod")).unwrap();
        let initial = store.file_size();

        let offset = store.allocate(initial as usize).unwrap();
        store.write_u64(offset + initial - 8, 7).unwrap();

        assert!(store.file_size() > initial);
        assert_eq!(store.read_u64(offset + initial - 8).unwrap(), 7);
    }

    #[test]
    fn reopen_rebuilds_freelist_and_root() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.htod");

        let (a, b) = {
            let mut store = FileBlockStore::create(&path).unwrap();
            let a = store.allocate(48).unwrap();
            let b = store.allocate(48).unwrap();
            store.write_u64(b, 99).unwrap();
            store.deallocate(a).unwrap();
            store.set_root(b).unwrap();
            store.flush().unwrap();
            (a, b)
        };

        let mut store = FileBlockStore::open(&path).unwrap();
        assert_eq!(store.root().unwrap(), b);
        assert_eq!(store.read_u64(b).unwrap(), 99);
        assert_eq!(store.free_blocks(), 1);
        assert_eq!(store.allocate(48).unwrap(), a);
    }

    #[test]
    fn read_only_store_rejects_mutation() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.htod");

        let offset = {
            let mut store = FileBlockStore::create(&path).unwrap();
            let offset = store.allocate(8).unwrap();
            store.write_u64(offset, 5).unwrap();
            store.flush().unwrap();
            offset
        };

        let mut store = FileBlockStore::open_read_only(&path).unwrap();
        assert!(store.is_read_only());
        assert_eq!(store.read_u64(offset).unwrap(), 5);

        let err = store.write_u64(offset, 6).unwrap_err();
        assert_eq!(
            err.downcast_ref::<StructuralError>(),
            Some(&StructuralError::ReadOnly)
        );
        assert!(store.allocate(8).is_err());
        assert!(store.deallocate(offset).is_err());
    }
}

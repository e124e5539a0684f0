//! # Memory-Mapped File Storage
//!
//! `MmapStorage` maps the whole store file into the address space and exposes
//! bounds-checked byte ranges of it. `FileBlockStore` builds block allocation
//! on top; the hash table never sees `MmapStorage` directly.
//!
//! ## Safety Considerations
//!
//! A mapped region becomes invalid when the file is grown and remapped.
//! Instead of guards or epochs, the borrow checker enforces this:
//!
//! ```text
//! bytes(&self, ..) -> &[u8]          // Immutable borrow of self
//! bytes_mut(&mut self, ..) -> &mut [u8]
//! grow(&mut self)                    // Exclusive borrow
//! ```
//!
//! No slice handed out can outlive a `grow()`.
//!
//! ## File Format
//!
//! The file length is always a multiple of `PAGE_SIZE`. Offsets are plain byte
//! offsets from the start of the file; the store header occupies the first
//! `FILE_HEADER_SIZE` bytes.
//!
//! ## Read-Only Mapping
//!
//! `open_copy_on_write` maps the file privately. Writes through the mapping
//! are visible to this process only and never reach the file, which is how a
//! read-only store can still run its in-memory bookkeeping.
//!
//! ## Error Handling
//!
//! All fallible operations return `eyre::Result` with the file path or the
//! offending range in the message.

use std::fs::{File, OpenOptions};
use std::path::Path;

use eyre::{ensure, Result, WrapErr};
use memmap2::{MmapMut, MmapOptions};

use crate::config::PAGE_SIZE;

#[derive(Debug)]
pub struct MmapStorage {
    file: File,
    mmap: MmapMut,
    page_count: u64,
    copy_on_write: bool,
}

impl MmapStorage {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open store file '{}'", path.display()))?;

        let page_count = Self::checked_page_count(&file, path)?;

        // SAFETY: MmapMut::map_mut is unsafe because the file may be modified
        // externally while mapped. The store file is owned by this process for
        // the lifetime of MmapStorage, and every access goes through
        // bytes()/bytes_mut() which bounds-check against the mapped length.
        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        Ok(Self {
            file,
            mmap,
            page_count,
            copy_on_write: false,
        })
    }

    pub fn open_copy_on_write<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open store file '{}'", path.display()))?;

        let page_count = Self::checked_page_count(&file, path)?;

        // SAFETY: a private copy-on-write mapping never writes back to the
        // file. The same external-modification caveat as open() applies and
        // all access is bounds-checked.
        let mmap = unsafe {
            MmapOptions::new()
                .map_copy(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        Ok(Self {
            file,
            mmap,
            page_count,
            copy_on_write: true,
        })
    }

    pub fn create<P: AsRef<Path>>(path: P, initial_page_count: u64) -> Result<Self> {
        let path = path.as_ref();

        ensure!(
            initial_page_count > 0,
            "initial page count must be at least 1"
        );

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create store file '{}'", path.display()))?;

        let file_size = initial_page_count * PAGE_SIZE as u64;

        file.set_len(file_size)
            .wrap_err_with(|| format!("failed to set file size to {} bytes", file_size))?;

        // SAFETY: the file was just created and truncated by this process and
        // its size is a non-zero multiple of PAGE_SIZE.
        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        Ok(Self {
            file,
            mmap,
            page_count: initial_page_count,
            copy_on_write: false,
        })
    }

    fn checked_page_count(file: &File, path: &Path) -> Result<u64> {
        let file_size = file
            .metadata()
            .wrap_err_with(|| format!("failed to get metadata for '{}'", path.display()))?
            .len();

        ensure!(
            file_size > 0,
            "cannot open empty store file '{}'",
            path.display()
        );

        ensure!(
            file_size % PAGE_SIZE as u64 == 0,
            "store file '{}' size {} is not a multiple of page size {}",
            path.display(),
            file_size,
            PAGE_SIZE
        );

        Ok(file_size / PAGE_SIZE as u64)
    }

    fn check_range(&self, offset: u64, len: usize) -> Result<usize> {
        let end = offset.checked_add(len as u64);
        ensure!(
            matches!(end, Some(end) if end <= self.file_size()),
            "range {}+{} out of bounds (file_size={})",
            offset,
            len,
            self.file_size()
        );
        Ok(offset as usize)
    }

    pub fn bytes(&self, offset: u64, len: usize) -> Result<&[u8]> {
        let start = self.check_range(offset, len)?;
        Ok(&self.mmap[start..start + len])
    }

    pub fn bytes_mut(&mut self, offset: u64, len: usize) -> Result<&mut [u8]> {
        let start = self.check_range(offset, len)?;
        Ok(&mut self.mmap[start..start + len])
    }

    pub fn grow(&mut self, new_page_count: u64) -> Result<()> {
        if new_page_count <= self.page_count {
            return Ok(());
        }

        ensure!(
            !self.copy_on_write,
            "cannot grow a copy-on-write mapping"
        );

        self.mmap
            .flush()
            .wrap_err("failed to flush mmap before grow")?;

        let new_size = new_page_count * PAGE_SIZE as u64;

        self.file
            .set_len(new_size)
            .wrap_err_with(|| format!("failed to extend file to {} bytes", new_size))?;

        // SAFETY: grow() takes &mut self so no slice into the old mapping can
        // be alive. The old mapping was flushed above and the file already has
        // its new length; the old mapping is dropped by the assignment.
        self.mmap =
            unsafe { MmapMut::map_mut(&self.file).wrap_err("failed to remap file after grow")? };

        self.page_count = new_page_count;

        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        if self.copy_on_write {
            return Ok(());
        }
        self.mmap.flush().wrap_err("failed to sync mmap to disk")
    }

    pub fn page_count(&self) -> u64 {
        self.page_count
    }

    pub fn file_size(&self) -> u64 {
        self.page_count * PAGE_SIZE as u64
    }

    pub fn is_copy_on_write(&self) -> bool {
        self.copy_on_write
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_new_store() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.htod");

        let storage = MmapStorage::create(&path, 10).unwrap();

        assert_eq!(storage.page_count(), 10);
        assert_eq!(storage.file_size(), 10 * PAGE_SIZE as u64);
    }

    #[test]
    fn create_fails_with_zero_pages() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.htod");

        let result = MmapStorage::create(&path, 0);

        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("initial page count must be at least 1"));
    }

    #[test]
    fn open_existing_store() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.htod");

        {
            let mut storage = MmapStorage::create(&path, 5).unwrap();
            storage.bytes_mut(100, 1).unwrap()[0] = 0xAB;
            storage.sync().unwrap();
        }

        let storage = MmapStorage::open(&path).unwrap();

        assert_eq!(storage.page_count(), 5);
        assert_eq!(storage.bytes(100, 1).unwrap()[0], 0xAB);
    }

    #[test]
    fn open_fails_for_nonexistent_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nonexistent.htod");

        assert!(MmapStorage::open(&path).is_err());
    }

    #[test]
    fn range_out_of_bounds() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.htod");

        let storage = MmapStorage::create(&path, 1).unwrap();

        assert!(storage.bytes(0, PAGE_SIZE).is_ok());
        assert!(storage.bytes(1, PAGE_SIZE).is_err());
        assert!(storage.bytes(u64::MAX, 1).is_err());
    }

    #[test]
    fn grow_preserves_existing_data() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.htod");

        let mut storage = MmapStorage::create(&path, 1).unwrap();
        storage.bytes_mut(10, 2).unwrap().copy_from_slice(&[0xCA, 0xFE]);

        storage.grow(4).unwrap();

        assert_eq!(storage.page_count(), 4);
        assert_eq!(storage.bytes(10, 2).unwrap(), &[0xCA, 0xFE]);
        assert!(storage.bytes(3 * PAGE_SIZE as u64, PAGE_SIZE).is_ok());
    }

    #[test]
    fn grow_with_same_size_is_noop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.htod");

        let mut storage = MmapStorage::create(&path, 5).unwrap();

        storage.grow(5).unwrap();
        storage.grow(3).unwrap();

        assert_eq!(storage.page_count(), 5);
    }

    #[test]
    fn copy_on_write_does_not_reach_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.htod");

        {
            let mut storage = MmapStorage::create(&path, 1).unwrap();
            storage.bytes_mut(0, 1).unwrap()[0] = 1;
            storage.sync().unwrap();
        }

        {
            let mut storage = MmapStorage::open_copy_on_write(&path).unwrap();
            assert!(storage.is_copy_on_write());
            storage.bytes_mut(0, 1).unwrap()[0] = 2;
            assert_eq!(storage.bytes(0, 1).unwrap()[0], 2);
            assert!(storage.grow(2).is_err());
        }

        let storage = MmapStorage::open(&path).unwrap();
        assert_eq!(storage.bytes(0, 1).unwrap()[0], 1);
    }
}

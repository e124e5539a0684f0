//! # Store File Header
//!
//! The first 128 bytes of every store file hold a zerocopy `StoreFileHeader`.
//! It records where the allocated region ends, the root pointer (the header
//! location of the default hash table instance) and live allocation counters.
//!
//! ## Header Layout
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  ------------------------------------------
//! 0       16    magic ("HTOD Store v1")
//! 16      4     version
//! 20      4     flags
//! 24      8     end_offset: first byte past the last block
//! 32      8     root: header offset of the default instance (0 = none)
//! 40      8     live_blocks
//! 48      8     live_bytes (payload capacity of live blocks)
//! 56      72    reserved
//! ```
//!
//! The header is rewritten in place on every allocation change. Because the
//! file is memory-mapped this is a memory write; it reaches disk on `flush`.
//!
//! ## Zerocopy Safety
//!
//! The struct derives `FromBytes`, `IntoBytes`, `Immutable`, `KnownLayout` and
//! `Unaligned`, so it can be viewed directly inside the mapped file.
//!
//! ## Endianness
//!
//! All multi-byte fields are little-endian.

use eyre::{ensure, Result};
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::FILE_HEADER_SIZE;

pub const STORE_MAGIC: &[u8; 16] = b"HTOD Store v1\x00\x00\x00";

pub const CURRENT_VERSION: u32 = 1;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct StoreFileHeader {
    magic: [u8; 16],
    version: U32,
    flags: U32,
    end_offset: U64,
    root: U64,
    live_blocks: U64,
    live_bytes: U64,
    reserved: [u8; 72],
}

const _: () = assert!(std::mem::size_of::<StoreFileHeader>() == FILE_HEADER_SIZE);

impl StoreFileHeader {
    pub fn new() -> Self {
        Self {
            magic: *STORE_MAGIC,
            version: U32::new(CURRENT_VERSION),
            flags: U32::new(0),
            end_offset: U64::new(FILE_HEADER_SIZE as u64),
            root: U64::new(0),
            live_blocks: U64::new(0),
            live_bytes: U64::new(0),
            reserved: [0u8; 72],
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        ensure!(
            bytes.len() >= FILE_HEADER_SIZE,
            "buffer too small for StoreFileHeader: {} < {}",
            bytes.len(),
            FILE_HEADER_SIZE
        );

        let header = Self::ref_from_bytes(&bytes[..FILE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse StoreFileHeader: {:?}", e))?;

        header.validate()?;
        Ok(header)
    }

    pub fn from_bytes_mut(bytes: &mut [u8]) -> Result<&mut Self> {
        ensure!(
            bytes.len() >= FILE_HEADER_SIZE,
            "buffer too small for StoreFileHeader: {} < {}",
            bytes.len(),
            FILE_HEADER_SIZE
        );

        let header = Self::mut_from_bytes(&mut bytes[..FILE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse StoreFileHeader: {:?}", e))?;

        header.validate()?;
        Ok(header)
    }

    fn validate(&self) -> Result<()> {
        ensure!(&self.magic == STORE_MAGIC, "invalid magic bytes in store file");
        ensure!(
            self.version.get() == CURRENT_VERSION,
            "unsupported store version: {} (expected {})",
            self.version.get(),
            CURRENT_VERSION
        );
        ensure!(
            self.end_offset.get() >= FILE_HEADER_SIZE as u64,
            "store end offset {} lies inside the file header",
            self.end_offset.get()
        );
        Ok(())
    }

    zerocopy_accessors! {
        version: u32,
        flags: u32,
        end_offset: u64,
        root: u64,
        live_blocks: u64,
        live_bytes: u64,
    }

    pub fn record_allocation(&mut self, capacity: u64) {
        self.live_blocks = U64::new(self.live_blocks.get() + 1);
        self.live_bytes = U64::new(self.live_bytes.get() + capacity);
    }

    pub fn record_release(&mut self, capacity: u64) {
        self.live_blocks = U64::new(self.live_blocks.get().saturating_sub(1));
        self.live_bytes = U64::new(self.live_bytes.get().saturating_sub(capacity));
    }
}

impl Default for StoreFileHeader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_header_size_is_128() {
        assert_eq!(std::mem::size_of::<StoreFileHeader>(), 128);
    }

    #[test]
    fn store_header_roundtrip() {
        let mut header = StoreFileHeader::new();
        header.set_root(4096);
        header.set_end_offset(8192);
        header.record_allocation(512);

        let bytes = header.as_bytes();
        let parsed = StoreFileHeader::from_bytes(bytes).unwrap();

        assert_eq!(parsed.version(), CURRENT_VERSION);
        assert_eq!(parsed.root(), 4096);
        assert_eq!(parsed.end_offset(), 8192);
        assert_eq!(parsed.live_blocks(), 1);
        assert_eq!(parsed.live_bytes(), 512);
    }

    #[test]
    fn store_header_rejects_invalid_magic() {
        let mut bytes = [0u8; 128];
        bytes[..16].copy_from_slice(b"NOT HTOD AT ALL!");

        let result = StoreFileHeader::from_bytes(&bytes);

        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("invalid magic bytes"));
    }

    #[test]
    fn store_header_rejects_short_buffer() {
        let bytes = [0u8; 64];
        assert!(StoreFileHeader::from_bytes(&bytes).is_err());
    }

    #[test]
    fn store_header_mutable_access() {
        let header = StoreFileHeader::new();
        let mut bytes = header.as_bytes().to_vec();

        {
            let header = StoreFileHeader::from_bytes_mut(&mut bytes).unwrap();
            header.record_allocation(64);
            header.record_allocation(32);
            header.record_release(64);
        }

        let header = StoreFileHeader::from_bytes(&bytes).unwrap();
        assert_eq!(header.live_blocks(), 1);
        assert_eq!(header.live_bytes(), 32);
    }
}

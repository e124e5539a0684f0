//! # HTOD Configuration Constants
//!
//! This module centralizes the numeric constants of the block store and the
//! hash table, grouping interdependent values together. Values that must agree
//! with each other are checked by compile-time assertions at the bottom.
//!
//! ## Dependency Graph
//!
//! ```text
//! PAGE_SIZE (16384 bytes)
//!       │
//!       ├─> FILE_HEADER_SIZE (128 bytes, start of the store file)
//!       │
//!       └─> MIN_GROWTH_PAGES (file grows by at least this many pages)
//!
//! BLOCK_GRAIN (16 bytes)
//!       │
//!       ├─> BLOCK_PREFIX_SIZE (8 bytes: capacity + state)
//!       │     Payload offsets are FILE_HEADER_SIZE + k * BLOCK_GRAIN + prefix
//!       │
//!       └─> MIN_SPLIT_REMAINDER (a free block is only split when the
//!             leftover can hold a prefix plus a useful payload)
//!
//! RECORD_SIZE_UNIT (512 bytes)
//!       │
//!       └─> logical dataSize stored in every record is a multiple of this
//!
//! DEFAULT_LOAD_FACTOR (75 percent)
//!       │
//!       └─> threshold = DEFAULT_LOAD_FACTOR * table_size / 100
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use crate::config::{PAGE_SIZE, RECORD_SIZE_UNIT};
//! ```

// ============================================================================
// Store File Layout
// ============================================================================

/// Growth granularity of the store file in bytes.
pub const PAGE_SIZE: usize = 16384;

/// Size of the store file header at offset 0.
pub const FILE_HEADER_SIZE: usize = 128;

/// Minimum number of pages added when the store file grows.
pub const MIN_GROWTH_PAGES: u64 = 4;

// ============================================================================
// Block Allocation
// ============================================================================

/// Allocation granularity. Every block payload is a multiple of this.
pub const BLOCK_GRAIN: usize = 16;

/// Bytes in front of every block payload: capacity (u32) + state (u32).
pub const BLOCK_PREFIX_SIZE: usize = 8;

/// Smallest payload capacity handed out.
pub const MIN_BLOCK_CAPACITY: usize = BLOCK_GRAIN;

/// Smallest leftover (prefix included) worth splitting off a reused block.
pub const MIN_SPLIT_REMAINDER: usize = 64;

// ============================================================================
// Hash Table
// ============================================================================

/// Bucket count of a freshly created table.
pub const DEFAULT_TABLE_SIZE: u32 = 4093;

/// Percentage fill at which a doubling is started.
pub const DEFAULT_LOAD_FACTOR: u32 = 75;

/// Size of one bucket pointer in a bucket array.
pub const BUCKET_POINTER_SIZE: usize = 8;

/// Unit the logical record size is rounded up to.
pub const RECORD_SIZE_UNIT: u32 = 512;

/// Magic number identifying a table header.
pub const TABLE_MAGIC: u32 = 0x4854_4F44;

/// Rehash marker value: no doubling in progress.
pub const REHASH_IDLE: u64 = 0;

/// Rehash marker value: doubling in progress, no pointer fixup pending.
pub const REHASH_RUNNING: u64 = 1;

// ============================================================================
// Pools
// ============================================================================

/// Upper bound on entry shells kept by an `EntryPool`.
pub const ENTRY_POOL_CAPACITY: usize = 64;

/// Upper bound on bucket buffers kept by an `ArrayPool`.
pub const ARRAY_POOL_CAPACITY: usize = 4;

// ============================================================================
// Compile-Time Assertions
// ============================================================================

const _: () = assert!(PAGE_SIZE % BLOCK_GRAIN == 0);
const _: () = assert!(FILE_HEADER_SIZE % BLOCK_GRAIN == 0);
const _: () = assert!(FILE_HEADER_SIZE < PAGE_SIZE);
const _: () = assert!(BLOCK_PREFIX_SIZE < BLOCK_GRAIN);
const _: () = assert!(MIN_SPLIT_REMAINDER >= BLOCK_PREFIX_SIZE + MIN_BLOCK_CAPACITY);
const _: () = assert!(DEFAULT_LOAD_FACTOR >= 1 && DEFAULT_LOAD_FACTOR <= 100);
const _: () = assert!(RECORD_SIZE_UNIT.is_power_of_two());

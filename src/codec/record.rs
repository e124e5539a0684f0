//! # Record Codec
//!
//! Binary layout of one hash table entry. Every record is a single block in
//! the store; its offset is the entry's `location`.
//!
//! ## Record Layout
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  ----------------------------------------------------
//! 0       8     next: offset of the next record in the chain (0 = end)
//! 8       4     hash: key hash
//! 12      8     validator_expiration (ms, -1 = none)
//! 20      4     cache_value_hashcode
//! 24      8     first_created (ms)
//! 32      8     expiration (ms, <= 0 = never)
//! 40      8     packed: tag | version | flags | data_size
//! 48      4     key_size
//! 52      k     key bytes
//! ..      1     value kind (0 = null, 1 = raw bytes, 2 = serialized object)
//! ..      4     value_size
//! ..      v     value bytes
//! ..      4     cache_value_size (-1 = absent)    } only when the table carries
//! ..      c     cache value bytes                 } cache values and !alias
//! ```
//!
//! ## Packed Word
//!
//! ```text
//! 63            48 47     40 39     32 31                     0
//! +---------------+---------+---------+------------------------+
//! |  tag 0x1268   | version |  flags  |       data_size        |
//! +---------------+---------+---------+------------------------+
//! ```
//!
//! `data_size` is the logical size reported for eviction bookkeeping: key,
//! value and cache-value bytes rounded up to a multiple of `RECORD_SIZE_UNIT`.
//! The block actually allocated is exactly the encoded length.
//!
//! ## Retrieval Modes
//!
//! Decoding is staged so lookups pay only for what they use: the fixed header
//! (hash comparison), then the key (identity), then the value, and only in
//! [`RetrieveMode::All`] the cache-value bytes.

use std::mem::offset_of;

use eyre::{ensure, Result};
use zerocopy::little_endian::{I32, I64, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::RECORD_SIZE_UNIT;
use crate::error::StructuralError;
use crate::storage::BlockStore;

pub mod flags {
    pub const TAG: u64 = 0x1268 << 48;
    pub const TAG_MASK: u64 = 0xFFFF << 48;
    pub const VERSION_SHIFT: u32 = 40;
    pub const VERSION_MASK: u64 = 0xFF << VERSION_SHIFT;
    pub const VERSION: u64 = 2;
    pub const ALIAS: u64 = 1 << 32;
    pub const HASHCODE_VALID: u64 = 1 << 33;
    pub const DATA_SIZE_MASK: u64 = 0xFFFF_FFFF;
}

pub mod value_kind {
    pub const NULL: u8 = 0;
    pub const BYTES: u8 = 1;
    pub const OBJECT: u8 = 2;
}

/// How much of a record a read decodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RetrieveMode {
    /// Fixed header and key.
    Key,
    /// Key and value; the cache-value length is reported but not read.
    KeyValue,
    /// Everything, including the cache-value bytes.
    All,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct RecordHeader {
    next: U64,
    hash: U32,
    validator_expiration: I64,
    cache_value_hashcode: I32,
    first_created: I64,
    expiration: I64,
    packed: U64,
    key_size: U32,
}

pub const RECORD_HEADER_SIZE: usize = 52;

const _: () = assert!(std::mem::size_of::<RecordHeader>() == RECORD_HEADER_SIZE);

/// Offset of the `next` pointer inside a record.
pub const NEXT_OFFSET: u64 = offset_of!(RecordHeader, next) as u64;

/// Offset of the validator-expiration slot inside a record.
pub const VALIDATOR_EXPIRATION_OFFSET: u64 = offset_of!(RecordHeader, validator_expiration) as u64;

const VALUE_PREFIX_SIZE: usize = 5;
const CACHE_PREFIX_SIZE: usize = 4;

/// Rounds `bytes` up to the logical record size unit.
pub fn logical_data_size(bytes: u64) -> Result<u32> {
    let unit = RECORD_SIZE_UNIT as u64;
    let rounded = bytes.div_ceil(unit) * unit;
    u32::try_from(rounded).map_err(|_| eyre::eyre!("record payload of {} bytes is too large", bytes))
}

/// Positional byte reader used by the decoder.
pub trait ByteSource {
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;
}

impl<S: BlockStore + ?Sized> ByteSource for S {
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.read_at(offset, buf)
    }
}

impl ByteSource for [u8] {
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let start = usize::try_from(offset)?;
        let end = start.checked_add(buf.len());
        ensure!(
            matches!(end, Some(end) if end <= self.len()),
            "read {}+{} past end of {} byte buffer",
            offset,
            buf.len(),
            self.len()
        );
        buf.copy_from_slice(&self[start..start + buf.len()]);
        Ok(())
    }
}

/// Value section of a record as stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValuePayload<'a> {
    Null,
    Bytes(&'a [u8]),
    Object(&'a [u8]),
}

impl ValuePayload<'_> {
    fn kind(&self) -> u8 {
        match self {
            ValuePayload::Null => value_kind::NULL,
            ValuePayload::Bytes(_) => value_kind::BYTES,
            ValuePayload::Object(_) => value_kind::OBJECT,
        }
    }

    fn bytes(&self) -> &[u8] {
        match self {
            ValuePayload::Null => &[],
            ValuePayload::Bytes(b) | ValuePayload::Object(b) => b,
        }
    }
}

/// Fixed fields written with every record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordFields {
    pub next: u64,
    pub hash: u32,
    pub validator_expiration: i64,
    pub cache_value_hashcode: Option<i32>,
    pub first_created: i64,
    pub expiration: i64,
    pub alias: bool,
}

/// Appends the encoded record to `out` and returns its logical `data_size`.
///
/// The cache-value section is written when `carry_cache_section` is set and
/// the record is not an alias; `cache_value` of `None` is then encoded as
/// absent.
pub fn encode_record(
    out: &mut Vec<u8>,
    fields: &RecordFields,
    key: &[u8],
    value: ValuePayload<'_>,
    cache_value: Option<&[u8]>,
    carry_cache_section: bool,
) -> Result<u32> {
    let with_cache = carry_cache_section && !fields.alias;
    let cache_len = if with_cache {
        cache_value.map_or(0, <[u8]>::len)
    } else {
        0
    };
    let payload = key.len() as u64 + value.bytes().len() as u64 + cache_len as u64;
    let data_size = logical_data_size(payload)?;

    let key_size = u32::try_from(key.len())?;
    let value_size = u32::try_from(value.bytes().len())?;

    let mut packed = flags::TAG | (flags::VERSION << flags::VERSION_SHIFT) | data_size as u64;
    if fields.alias {
        packed |= flags::ALIAS;
    }
    if fields.cache_value_hashcode.is_some() {
        packed |= flags::HASHCODE_VALID;
    }

    let header = RecordHeader {
        next: U64::new(fields.next),
        hash: U32::new(fields.hash),
        validator_expiration: I64::new(fields.validator_expiration),
        cache_value_hashcode: I32::new(fields.cache_value_hashcode.unwrap_or(0)),
        first_created: I64::new(fields.first_created),
        expiration: I64::new(fields.expiration),
        packed: U64::new(packed),
        key_size: U32::new(key_size),
    };

    out.reserve(RECORD_HEADER_SIZE + key.len() + VALUE_PREFIX_SIZE + value.bytes().len());
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(key);
    out.push(value.kind());
    out.extend_from_slice(&value_size.to_le_bytes());
    out.extend_from_slice(value.bytes());

    if with_cache {
        match cache_value {
            Some(bytes) => {
                let len = i32::try_from(bytes.len())?;
                out.extend_from_slice(&len.to_le_bytes());
                out.extend_from_slice(bytes);
            }
            None => out.extend_from_slice(&(-1i32).to_le_bytes()),
        }
    }

    Ok(data_size)
}

/// Decoded fixed portion of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordMeta {
    pub next: u64,
    pub hash: u32,
    pub validator_expiration: i64,
    pub cache_value_hashcode: i32,
    pub hashcode_valid: bool,
    pub first_created: i64,
    pub expiration: i64,
    pub alias: bool,
    pub data_size: u32,
    pub key_size: u32,
}

impl RecordMeta {
    /// Reads and validates the fixed header of the record at `location`.
    pub fn read<S: ByteSource + ?Sized>(source: &S, location: u64) -> Result<Self> {
        let mut raw = [0u8; RECORD_HEADER_SIZE];
        source.read_exact_at(location, &mut raw)?;
        Self::parse(location, &raw)
    }

    pub fn parse(location: u64, raw: &[u8; RECORD_HEADER_SIZE]) -> Result<Self> {
        let header = RecordHeader::ref_from_bytes(&raw[..])
            .map_err(|e| eyre::eyre!("failed to parse RecordHeader: {:?}", e))?;

        let packed = header.packed.get();
        let version = (packed & flags::VERSION_MASK) >> flags::VERSION_SHIFT;
        if packed & flags::TAG_MASK != flags::TAG || version != flags::VERSION {
            return Err(eyre::Report::new(StructuralError::CorruptRecord {
                location,
                tag: packed,
            }));
        }

        let data_size = (packed & flags::DATA_SIZE_MASK) as u32;
        let key_size = header.key_size.get();
        ensure!(
            key_size <= data_size,
            "record at {} claims key of {} bytes in {} logical bytes",
            location,
            key_size,
            data_size
        );

        Ok(Self {
            next: header.next.get(),
            hash: header.hash.get(),
            validator_expiration: header.validator_expiration.get(),
            cache_value_hashcode: header.cache_value_hashcode.get(),
            hashcode_valid: packed & flags::HASHCODE_VALID != 0,
            first_created: header.first_created.get(),
            expiration: header.expiration.get(),
            alias: packed & flags::ALIAS != 0,
            data_size,
            key_size,
        })
    }

    /// True when the record has a positive expiration at or before `now_ms`.
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expiration > 0 && now_ms >= self.expiration
    }

    fn body_offset(&self, location: u64) -> u64 {
        location + RECORD_HEADER_SIZE as u64 + self.key_size as u64
    }
}

/// Reads the key bytes of the record at `location` into `buf`.
pub fn read_key<S: ByteSource + ?Sized>(
    source: &S,
    location: u64,
    meta: &RecordMeta,
    buf: &mut Vec<u8>,
) -> Result<()> {
    buf.clear();
    buf.resize(meta.key_size as usize, 0);
    source.read_exact_at(location + RECORD_HEADER_SIZE as u64, buf)
}

/// Value section of a decoded record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawValue {
    Null,
    Bytes(Vec<u8>),
    Object(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordBody {
    pub value: RawValue,
    /// Length of the cache value, -1 when absent or not carried.
    pub cache_value_size: i32,
    /// Cache-value bytes, read only in `RetrieveMode::All`.
    pub cache_value: Option<Vec<u8>>,
}

/// Reads the value (and, for `RetrieveMode::All`, the cache value) of the
/// record at `location`.
pub fn read_body<S: ByteSource + ?Sized>(
    source: &S,
    location: u64,
    meta: &RecordMeta,
    mode: RetrieveMode,
    carry_cache_section: bool,
) -> Result<RecordBody> {
    let mut offset = meta.body_offset(location);

    let mut prefix = [0u8; VALUE_PREFIX_SIZE];
    source.read_exact_at(offset, &mut prefix)?;
    offset += VALUE_PREFIX_SIZE as u64;

    let kind = prefix[0];
    let value_size = u32::from_le_bytes([prefix[1], prefix[2], prefix[3], prefix[4]]);
    ensure!(
        value_size <= meta.data_size,
        "record at {} claims value of {} bytes in {} logical bytes",
        location,
        value_size,
        meta.data_size
    );

    let read_value = |len: u32| -> Result<Vec<u8>> {
        let mut bytes = vec![0u8; len as usize];
        source.read_exact_at(offset, &mut bytes)?;
        Ok(bytes)
    };
    let value = match kind {
        value_kind::NULL => RawValue::Null,
        value_kind::BYTES => RawValue::Bytes(read_value(value_size)?),
        value_kind::OBJECT => RawValue::Object(read_value(value_size)?),
        other => {
            return Err(eyre::Report::new(StructuralError::CorruptRecord {
                location,
                tag: other as u64,
            }))
        }
    };
    offset += value_size as u64;

    let mut body = RecordBody {
        value,
        cache_value_size: -1,
        cache_value: None,
    };

    if !carry_cache_section || meta.alias {
        return Ok(body);
    }

    let mut size = [0u8; CACHE_PREFIX_SIZE];
    source.read_exact_at(offset, &mut size)?;
    offset += CACHE_PREFIX_SIZE as u64;
    body.cache_value_size = i32::from_le_bytes(size);

    if mode == RetrieveMode::All && body.cache_value_size >= 0 {
        ensure!(
            body.cache_value_size as u32 <= meta.data_size,
            "record at {} claims cache value of {} bytes in {} logical bytes",
            location,
            body.cache_value_size,
            meta.data_size
        );
        let mut bytes = vec![0u8; body.cache_value_size as usize];
        source.read_exact_at(offset, &mut bytes)?;
        body.cache_value = Some(bytes);
    }

    Ok(body)
}

/// Reads the `next` pointer and hash of the record at `location` without
/// validating the rest of the header.
pub fn read_link<S: ByteSource + ?Sized>(source: &S, location: u64) -> Result<(u64, u32)> {
    let mut raw = [0u8; 12];
    source.read_exact_at(location + NEXT_OFFSET, &mut raw)?;
    let next = u64::from_le_bytes([
        raw[0], raw[1], raw[2], raw[3], raw[4], raw[5], raw[6], raw[7],
    ]);
    let hash = u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]);
    Ok((next, hash))
}

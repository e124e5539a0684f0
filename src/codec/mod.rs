//! # Codecs
//!
//! Two layers turn keys and values into bytes:
//!
//! - [`Codec`]: generic object serialization for keys and non-byte values.
//!   [`JsonCodec`] (serde_json) is the default; any serde format can be
//!   plugged in by implementing the trait.
//! - [`record`]: the binary layout of one table entry on disk.
//!
//! ## Key Hash
//!
//! The hash stored in every record and used to pick buckets must not change
//! between processes or compiler versions, so `std::hash` is not an option.
//! [`key_hash`] is CRC-32C over the serialized key bytes.

pub mod record;

use crc::{Crc, CRC_32_ISCSI};
use eyre::{Result, WrapErr};
use serde::de::DeserializeOwned;
use serde::Serialize;

const KEY_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Stable hash of a serialized key.
pub fn key_hash(serialized_key: &[u8]) -> u32 {
    KEY_CRC.checksum(serialized_key)
}

/// Generic serializer used for keys and object values.
pub trait Codec: Send + Sync + 'static {
    /// Appends the encoding of `value` to `out`.
    fn serialize<T: Serialize + ?Sized>(&self, value: &T, out: &mut Vec<u8>) -> Result<()>;

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T>;
}

/// `Codec` backed by serde_json.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn serialize<T: Serialize + ?Sized>(&self, value: &T, out: &mut Vec<u8>) -> Result<()> {
        serde_json::to_writer(out, value).wrap_err("failed to serialize value as JSON")
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes).wrap_err("failed to deserialize JSON payload")
    }
}

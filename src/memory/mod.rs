//! # Memory Management
//!
//! Pools of reusable scratch objects: entry shells handed to callers and
//! bucket-array buffers cached per open table slot.
//!
//! ## Module Organization
//!
//! - [`pool`]: `ObjectPool`/`Pooled` for typed objects, `ArrayPool`/`PooledArray`
//!   for `u64` bucket buffers

pub mod pool;

pub use pool::{ArrayPool, ObjectPool, Pooled, PooledArray, Reset};

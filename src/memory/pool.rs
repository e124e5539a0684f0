//! # Object Pools
//!
//! Reusable scratch objects for the hash table's hot paths.
//!
//! ## Purpose
//!
//! Every lookup produces an entry shell and every open table slot caches a
//! bucket array. Both are recycled through pools instead of being allocated
//! per call. Pools are a performance layer only: an empty pool allocates, a
//! full pool drops what is returned to it.
//!
//! ## Borrow/Return Contract
//!
//! ```ignore
//! let pool = ArrayPool::new(4);
//!
//! let mut buckets = pool.acquire(1024); // zeroed, len() == 1024
//! buckets[7] = 4096;
//!
//! drop(buckets); // returned to the pool
//! ```
//!
//! Guards return their object on drop. Objects are reset before they are
//! handed out again and carry no identity across borrow/return cycles.
//! Pools are cheap to clone and clones share storage, so several tables can
//! draw from one pool.
//!
//! ## Design
//!
//! Guards hold `ManuallyDrop` rather than `Option` so a guard can never be
//! observed empty.

use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::Mutex;

/// Types that can be returned to an `ObjectPool`.
pub trait Reset {
    /// Clears every field back to its freshly constructed state.
    fn reset(&mut self);
}

/// A pool of boxed objects of type `T`.
pub struct ObjectPool<T: Reset> {
    inner: Arc<ObjectPoolInner<T>>,
}

struct ObjectPoolInner<T> {
    free: Mutex<Vec<Box<T>>>,
    capacity: usize,
}

impl<T: Reset + Default> ObjectPool<T> {
    /// Creates an empty pool that retains at most `capacity` idle objects.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(ObjectPoolInner {
                free: Mutex::new(Vec::with_capacity(capacity)),
                capacity,
            }),
        }
    }

    /// Takes an object from the pool, or a new default one if the pool is
    /// empty.
    pub fn acquire(&self) -> Pooled<T> {
        let item = self
            .inner
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| Box::new(T::default()));

        Pooled {
            item: ManuallyDrop::new(item),
            pool: Arc::clone(&self.inner),
        }
    }
}

impl<T: Reset> ObjectPool<T> {
    /// Number of idle objects in the pool.
    pub fn available(&self) -> usize {
        self.inner.free.lock().len()
    }
}

impl<T: Reset> Clone for ObjectPool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Reset> std::fmt::Debug for ObjectPool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectPool")
            .field("available", &self.available())
            .field("capacity", &self.inner.capacity)
            .finish()
    }
}

/// An object borrowed from an `ObjectPool`; returned and reset on drop.
pub struct Pooled<T: Reset> {
    item: ManuallyDrop<Box<T>>,
    pool: Arc<ObjectPoolInner<T>>,
}

impl<T: Reset> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.item
    }
}

impl<T: Reset> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.item
    }
}

impl<T: Reset + std::fmt::Debug> std::fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&**self.item, f)
    }
}

impl<T: Reset> Drop for Pooled<T> {
    fn drop(&mut self) {
        // SAFETY: drop runs once and `item` is not touched afterwards.
        let mut item = unsafe { ManuallyDrop::take(&mut self.item) };
        item.reset();
        let mut free = self.pool.free.lock();
        if free.len() < self.pool.capacity {
            free.push(item);
        }
    }
}

/// A pool of `u64` buffers used for cached bucket arrays.
#[derive(Clone)]
pub struct ArrayPool {
    inner: Arc<ArrayPoolInner>,
}

struct ArrayPoolInner {
    free: Mutex<Vec<Vec<u64>>>,
    capacity: usize,
}

impl ArrayPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(ArrayPoolInner {
                free: Mutex::new(Vec::with_capacity(capacity)),
                capacity,
            }),
        }
    }

    /// Returns a zeroed buffer of exactly `len` elements, reusing the
    /// smallest idle buffer that is large enough.
    pub fn acquire(&self, len: usize) -> PooledArray {
        let reused = {
            let mut free = self.inner.free.lock();
            let best = free
                .iter()
                .enumerate()
                .filter(|(_, buf)| buf.capacity() >= len)
                .min_by_key(|(_, buf)| buf.capacity())
                .map(|(i, _)| i);
            best.map(|i| free.swap_remove(i))
        };

        let mut buffer = reused.unwrap_or_default();
        buffer.clear();
        buffer.resize(len, 0);

        PooledArray {
            buffer: ManuallyDrop::new(buffer),
            pool: Arc::clone(&self.inner),
        }
    }

    pub fn available(&self) -> usize {
        self.inner.free.lock().len()
    }
}

impl std::fmt::Debug for ArrayPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArrayPool")
            .field("available", &self.available())
            .field("capacity", &self.inner.capacity)
            .finish()
    }
}

/// A bucket buffer borrowed from an `ArrayPool`.
pub struct PooledArray {
    buffer: ManuallyDrop<Vec<u64>>,
    pool: Arc<ArrayPoolInner>,
}

impl Deref for PooledArray {
    type Target = [u64];

    fn deref(&self) -> &[u64] {
        &self.buffer
    }
}

impl DerefMut for PooledArray {
    fn deref_mut(&mut self) -> &mut [u64] {
        &mut self.buffer
    }
}

impl std::fmt::Debug for PooledArray {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledArray")
            .field("len", &self.buffer.len())
            .finish()
    }
}

impl Drop for PooledArray {
    fn drop(&mut self) {
        // SAFETY: drop runs once and `buffer` is not touched afterwards.
        let buffer = unsafe { ManuallyDrop::take(&mut self.buffer) };
        let mut free = self.pool.free.lock();
        if free.len() < self.pool.capacity {
            free.push(buffer);
        }
    }
}

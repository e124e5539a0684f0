//! # Table Synchronization
//!
//! Two lock tiers protect a table:
//!
//! ```text
//! StructuralLock (binary semaphore)        Mutex<TableCore>
//! ─────────────────────────────────        ─────────────────────────
//! clear, close, walks, recovery,           every get/put/remove,
//! an in-flight doubling                    one bucket of rehash work
//! ```
//!
//! Lock order is structural first, then the mutation lock. A thread holding
//! the mutation lock may only `try_acquire` the structural lock.
//!
//! ## Why a Semaphore
//!
//! A doubling acquires the structural lock in the thread that triggers it
//! and releases it from the worker thread when the swap is done. A mutex
//! guard cannot cross threads that way, so the lock is a `Mutex<bool>` plus a
//! `Condvar` and the permit is an owned guard that can be moved into the
//! worker.
//!
//! ## Completion Signal
//!
//! `RehashSignal` lets callers wait for a running doubling and observe the
//! worker's failure, if any.

use std::sync::Arc;

use eyre::Result;
use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
pub(crate) struct StructuralLock {
    held: Mutex<bool>,
    released: Condvar,
}

impl StructuralLock {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Blocks until the lock is free, then takes it.
    pub(crate) fn acquire(self: &Arc<Self>) -> StructuralPermit {
        let mut held = self.held.lock();
        while *held {
            self.released.wait(&mut held);
        }
        *held = true;
        StructuralPermit {
            lock: Arc::clone(self),
        }
    }

    /// Takes the lock if it is free.
    pub(crate) fn try_acquire(self: &Arc<Self>) -> Option<StructuralPermit> {
        let mut held = self.held.lock();
        if *held {
            return None;
        }
        *held = true;
        Some(StructuralPermit {
            lock: Arc::clone(self),
        })
    }

    pub(crate) fn is_held(&self) -> bool {
        *self.held.lock()
    }
}

/// Ownership of the structural lock. Released on drop, in whatever thread
/// holds it at that point.
#[derive(Debug)]
pub(crate) struct StructuralPermit {
    lock: Arc<StructuralLock>,
}

impl Drop for StructuralPermit {
    fn drop(&mut self) {
        *self.lock.held.lock() = false;
        self.lock.released.notify_one();
    }
}

#[derive(Debug, Default)]
struct RehashState {
    running: bool,
    failure: Option<String>,
}

/// Completion signal of the background doubling worker.
#[derive(Debug, Default)]
pub(crate) struct RehashSignal {
    state: Mutex<RehashState>,
    done: Condvar,
}

impl RehashSignal {
    pub(crate) fn start(&self) {
        let mut state = self.state.lock();
        state.running = true;
        state.failure = None;
    }

    pub(crate) fn finish(&self, failure: Option<String>) {
        let mut state = self.state.lock();
        state.running = false;
        state.failure = failure;
        self.done.notify_all();
    }

    pub(crate) fn is_running(&self) -> bool {
        self.state.lock().running
    }

    /// Blocks until no doubling is running. Reports the failure of the last
    /// worker once.
    pub(crate) fn wait(&self) -> Result<()> {
        let mut state = self.state.lock();
        while state.running {
            self.done.wait(&mut state);
        }
        match state.failure.take() {
            Some(message) => Err(eyre::eyre!("background rehash failed: {}", message)),
            None => Ok(()),
        }
    }
}

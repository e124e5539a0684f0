//! # Online Doubling
//!
//! A doubling moves every record from the current bucket array into a new
//! array of `2 * size + 1` buckets (or the requested size) while the table
//! stays online.
//!
//! ## Protocol
//!
//! ```text
//! begin_doubling        allocate zeroed array, then one header write that
//!                       records it in the alternate slot with marker := 1
//! migrate_bucket(i)     for each record at the head of old bucket i:
//!   1. if the new bucket has a head, park it:   marker := head
//!   2. new bucket := record
//!   3. old bucket := record.next
//!   4. record.next := parked head (or 0)
//!   5. marker := 1
//! finish_doubling       swap slots (marker := 0), free the old array
//! ```
//!
//! Each step rewrites exactly one persisted pointer, so after a crash at most
//! one pointer is stale and the marker says which chain it belongs to. See
//! `recovery` for the repair.
//!
//! A crash after the array is allocated but before the header write leaves
//! the array unreferenced, like a record allocated but not yet linked. The
//! marker is still clear in that case, so the next open sees a clean table.
//!
//! ## Threads
//!
//! `begin_doubling` runs in the thread that triggered the doubling, under the
//! mutation lock. The migration runs in a spawned worker that takes the
//! mutation lock once per bucket and holds the structural permit until the
//! swap, so walks, `clear` and `close` wait for it while point operations
//! interleave with it.

use std::sync::Arc;
use std::thread;

use eyre::{bail, Result, WrapErr};
use tracing::{debug, error, info};

use crate::codec::record::read_link;
use crate::config::{BUCKET_POINTER_SIZE, REHASH_RUNNING};

use super::sync::StructuralPermit;
use super::table::TableCore;
use super::Shared;

impl TableCore {
    /// Persists the marker and the new bucket array.
    pub(crate) fn begin_doubling(&mut self, new_size: u32) -> Result<()> {
        self.ensure_writable()?;
        if self.header.is_rehashing() {
            bail!("a doubling is already in progress");
        }

        let old_size = self.header.table_size(self.header.current());
        let bytes = (new_size as usize)
            .checked_mul(BUCKET_POINTER_SIZE)
            .ok_or_else(|| eyre::eyre!("bucket array of {} entries is too large", new_size))?;
        let (header, store) = self.parts_mut()?;
        let location = store.allocate_and_clear(bytes)?;
        if let Err(e) = header.init_new_table(store, new_size, location) {
            store.deallocate(location)?;
            return Err(e);
        }

        let alternate = self.header.alternate();
        self.install_empty_cache(alternate);
        self.flush()?;

        info!(old_size, new_size, location, "table doubling started");
        Ok(())
    }

    /// Moves every record of old bucket `index` into the growing table.
    /// Returns the number of records moved.
    pub(crate) fn migrate_bucket(&mut self, index: u32) -> Result<u64> {
        let old = self.header.current();
        let new = self.header.alternate();
        let mut moved = 0;

        loop {
            let location = self.bucket(old, index);
            if location == 0 {
                break;
            }

            let (next, hash) = read_link(self.store()?, location)?;
            let new_index = self.header.ht_index(hash, new);
            let displaced = self.bucket(new, new_index);

            if displaced != 0 {
                self.set_rehash_marker(displaced)?;
            }
            self.write_bucket(new, new_index, location)?;
            self.write_bucket(old, index, next)?;
            self.set_next(location, displaced)?;
            if displaced != 0 {
                self.set_rehash_marker(REHASH_RUNNING)?;
            }
            moved += 1;
        }
        Ok(moved)
    }

    /// Commits the doubling and drops the old cache.
    pub(crate) fn finish_doubling(&mut self) -> Result<()> {
        let old = self.header.current();
        let (header, store) = self.parts_mut()?;
        header.swap_tables(store)?;
        self.drop_cache(old);
        self.flush()
    }
}

/// Runs the migration to completion, one bucket per lock acquisition.
pub(crate) fn run_doubling(shared: &Shared) -> Result<()> {
    let old_size = {
        let core = shared.core.lock();
        if !core.header.is_rehashing() {
            bail!("no doubling to run");
        }
        core.header.table_size(core.header.current())
    };

    let mut moved = 0;
    for index in 0..old_size {
        let mut core = shared.core.lock();
        moved += core.migrate_bucket(index)?;
    }

    let mut core = shared.core.lock();
    core.finish_doubling()?;
    let new_size = core.header.table_size(core.header.current());
    drop(core);

    shared.stats.record_doubling();
    info!(old_size, new_size, moved, "table doubling finished");
    Ok(())
}

/// Starts the migration worker. The worker owns `permit` and releases it
/// when the doubling is committed or has failed.
pub(crate) fn spawn_rehash_worker(shared: Arc<Shared>, permit: StructuralPermit) -> Result<()> {
    shared.rehash.start();

    let worker = Arc::clone(&shared);
    let spawned = thread::Builder::new()
        .name("htod-rehash".to_string())
        .spawn(move || {
            let result = run_doubling(&worker);
            drop(permit);

            let failure = match result {
                Ok(()) => None,
                Err(e) => {
                    error!(error = %e, "table doubling failed");
                    Some(format!("{:#}", e))
                }
            };
            worker.rehash.finish(failure);
        });

    match spawned {
        Ok(_) => {
            debug!("rehash worker spawned");
            Ok(())
        }
        Err(e) => {
            shared.rehash.finish(Some(e.to_string()));
            Err(e).wrap_err("failed to spawn rehash worker")
        }
    }
}

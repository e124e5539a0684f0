//! # Crash Recovery
//!
//! Runs at open when the rehash marker is set, under the structural lock.
//!
//! ## Slot States
//!
//! | current | alternate | Action                                           |
//! |---------|-----------|--------------------------------------------------|
//! | set     | empty     | marker without a recorded array: clear the       |
//! |         |           | marker, recount                                  |
//! | set     | set       | repair at most one pointer, resume the doubling  |
//! | other   |           | unrecoverable                                    |
//!
//! ## Pointer Repair
//!
//! A migration step rewrites one pointer at a time (see `rehash`). Walking the
//! heads of the new table finds the step that was cut short:
//!
//! ```text
//! head == marker                  step 1 done, nothing moved yet
//!                                 -> marker := 1
//! head still linked in old table  step 2 done, old bucket not yet advanced
//!                                 -> new bucket := parked head (or 0)
//! head.next linked in old table   step 3 done, next not yet rewritten
//!                                 -> head.next := parked head (or 0)
//! head.next == 0, marker parks    step 3 done on a chain tail
//! this bucket                     -> head.next := parked head
//! ```
//!
//! Only the bucket of the parked head can be in the first or last state, so
//! the parked bucket index is derived from the hash of the parked record.
//! When nothing matches the crash fell between steps 4 and 5 and the marker
//! is simply reset.

use eyre::Result;
use tracing::{info, warn};

use crate::codec::record::read_link;
use crate::config::{REHASH_IDLE, REHASH_RUNNING};
use crate::error::StructuralError;

use super::table::TableCore;

/// What recovery did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Recovery {
    /// The marker was clear; nothing to do.
    Clean,
    /// The doubling never got a second table; the marker was cleared.
    RolledBack,
    /// Both tables are consistent and the doubling must be resumed.
    Resume { repaired: bool },
}

impl TableCore {
    pub(crate) fn recover(&mut self) -> Result<Recovery> {
        let marker = self.header.rehash_marker();
        if marker == REHASH_IDLE {
            return Ok(Recovery::Clean);
        }
        self.ensure_writable()?;

        let current = self.header.current();
        let alternate = self.header.alternate();
        let current_set = self.header.table_location(current) != 0;
        let alternate_set = self.header.table_location(alternate) != 0;

        match (current_set, alternate_set) {
            (true, false) => {
                warn!(marker, "doubling interrupted before its table was recorded, rolling back");
                let (header, store) = self.parts_mut()?;
                header.clear_slot(alternate);
                header.set_rehash_marker(store, REHASH_IDLE)?;
                header.set_object_count(0);
                header.write(store)?;
                self.drop_cache(alternate);
                self.flush()?;
                Ok(Recovery::RolledBack)
            }
            (true, true) => {
                let repaired = self.repair_pointer(marker)?;
                self.set_rehash_marker(REHASH_RUNNING)?;
                self.flush()?;
                info!(marker, repaired, "interrupted doubling will be resumed");
                Ok(Recovery::Resume { repaired })
            }
            _ => Err(eyre::Report::new(StructuralError::Unrecoverable {
                reason: format!(
                    "rehash marker {:#x} set with slot locations {} / {}",
                    marker,
                    self.header.table_location(0),
                    self.header.table_location(1)
                ),
            })),
        }
    }

    /// Finds and fixes the single stale pointer left by a crash inside a
    /// migration step. Returns true when a pointer was rewritten.
    fn repair_pointer(&mut self, marker: u64) -> Result<bool> {
        let old = self.header.current();
        let new = self.header.alternate();
        let parked = (marker != REHASH_RUNNING).then_some(marker);
        let restore = parked.unwrap_or(0);

        let parked_bucket = match parked {
            Some(location) => {
                let (_, hash) = read_link(self.store()?, location)?;
                Some(self.header.ht_index(hash, new))
            }
            None => None,
        };

        for index in 0..self.header.table_size(new) {
            let head = self.bucket(new, index);
            if head == 0 {
                continue;
            }

            if Some(head) == parked {
                return Ok(false);
            }

            if self.in_table(old, head)? {
                warn!(index, head, restore, "rolling back half-moved bucket head");
                self.write_bucket(new, index, restore)?;
                return Ok(true);
            }

            let (next, _) = read_link(self.store()?, head)?;
            if next != 0 && self.in_table(old, next)? {
                warn!(index, head, restore, "relinking moved record into its new chain");
                self.set_next(head, restore)?;
                return Ok(true);
            }

            if next == 0 && parked.is_some() && parked_bucket == Some(index) {
                warn!(index, head, restore, "relinking moved chain tail to parked head");
                self.set_next(head, restore)?;
                return Ok(true);
            }
        }
        Ok(false)
    }
}

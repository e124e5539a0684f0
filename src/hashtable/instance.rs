//! Creating and destroying table instances inside a shared block store.
//!
//! An instance is named by the location of its header. Destroying one frees
//! every record of both slots, the bucket arrays and the header, and clears
//! the store root if it pointed at the instance. The instance must not be
//! open while it is destroyed.

use eyre::Result;
use tracing::info;

use crate::codec::record::NEXT_OFFSET;
use crate::config::BUCKET_POINTER_SIZE;
use crate::error::StructuralError;
use crate::storage::BlockStore;

use super::header::HeaderState;

/// Allocates a new empty table and returns its instance id.
pub fn create_instance(store: &mut dyn BlockStore, table_size: u32, load_factor: u32) -> Result<u64> {
    if store.is_read_only() {
        return Err(eyre::Report::new(StructuralError::ReadOnly));
    }
    let header = HeaderState::create(store, table_size, load_factor)?;
    store.flush()?;
    info!(instance = header.location(), table_size, load_factor, "table instance created");
    Ok(header.location())
}

/// Frees every block owned by the instance at `instance`.
pub fn destroy_instance(store: &mut dyn BlockStore, instance: u64) -> Result<()> {
    if instance == 0 {
        return Err(eyre::Report::new(StructuralError::ZeroInstance));
    }
    if store.is_read_only() {
        return Err(eyre::Report::new(StructuralError::ReadOnly));
    }
    let header = HeaderState::read(store, instance)?;

    let mut freed = 0u64;
    for table in 0..2 {
        let location = header.table_location(table);
        if location == 0 {
            continue;
        }
        for index in 0..header.table_size(table) {
            let mut record = store.read_u64(location + index as u64 * BUCKET_POINTER_SIZE as u64)?;
            while record != 0 {
                let next = store.read_u64(record + NEXT_OFFSET)?;
                store.deallocate(record)?;
                freed += 1;
                record = next;
            }
        }
        store.deallocate(location)?;
    }

    store.write_u32(instance, 0)?;
    store.deallocate(instance)?;
    if store.root()? == instance {
        store.set_root(0)?;
    }
    store.flush()?;

    info!(instance, freed, "table instance destroyed");
    Ok(())
}

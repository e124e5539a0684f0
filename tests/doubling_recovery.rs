//! # Doubling and Crash Recovery Test Suite
//!
//! Online growth of the bucket array and reopening after unclean shutdowns.
//!
//! ## Crash Simulation
//!
//! A table dropped without `close` leaves the on-disk object count at 0,
//! exactly as a killed process would. Interrupted doublings are simulated by
//! writing the rehash marker into a closed table's header through the block
//! store. Crashes inside individual pointer moves, and reopening such files,
//! are covered by the unit tests of the recovery module.
//!
//! ## Usage
//!
//! ```sh
//! cargo test --test doubling_recovery --release
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use htod::{BlockStore, DiskHashtable, FileBlockStore, Value};
use tempfile::tempdir;

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

type Table = DiskHashtable<String, String>;

/// Header offset of the rehash marker.
const REHASH_MARKER_OFFSET: u64 = 24;

fn open_small(path: &std::path::Path, size: u32) -> Table {
    Table::builder()
        .path(path)
        .table_size(size)
        .load_factor(75)
        .open()
        .expect("failed to open table")
}

fn fill(table: &Table, range: std::ops::Range<usize>) {
    for i in range {
        table.put(&format!("key-{i}"), format!("value-{i}")).unwrap();
    }
}

fn assert_all_present(table: &Table, range: std::ops::Range<usize>) {
    for i in range {
        assert_eq!(
            table.get(&format!("key-{i}")).unwrap(),
            Some(Value::Object(format!("value-{i}"))),
            "key-{i} SHOULD map to its last written value"
        );
    }
}

// ============================================================================
// DOUBLING
// ============================================================================

mod doubling_tests {
    use super::*;

    #[test]
    fn ten_thousand_keys_grow_the_table() {
        let dir = tempdir().unwrap();
        let table = open_small(&dir.path().join("grow.htod"), 11);

        fill(&table, 0..10_000);
        table.wait_for_rehash().unwrap();

        assert!(
            table.table_size() > 11,
            "table SHOULD have doubled, size is {}",
            table.table_size()
        );
        assert!(table.stats().doublings >= 1);
        assert_eq!(table.size(), 10_000);
        assert_all_present(&table, 0..10_000);
    }

    #[test]
    fn overwrites_during_growth_keep_last_value() {
        let dir = tempdir().unwrap();
        let table = open_small(&dir.path().join("overwrite.htod"), 5);

        for round in 0..3 {
            for i in 0..500 {
                table.put(&format!("key-{i}"), format!("round-{round}-{i}")).unwrap();
            }
        }
        table.wait_for_rehash().unwrap();

        assert_eq!(table.size(), 500);
        for i in 0..500 {
            assert_eq!(
                table.get(&format!("key-{i}")).unwrap(),
                Some(Value::Object(format!("round-2-{i}")))
            );
        }
    }

    #[test]
    fn explicit_rehash_uses_doubled_or_requested_size() {
        let dir = tempdir().unwrap();
        let table = Table::builder()
            .path(dir.path().join("explicit.htod"))
            .table_size(7)
            .auto_rehash(false)
            .open()
            .unwrap();
        fill(&table, 0..100);
        assert_eq!(table.table_size(), 7);

        assert!(table.start_rehash(0).unwrap());
        table.wait_for_rehash().unwrap();
        assert_eq!(table.table_size(), 15, "doubling SHOULD produce 2 * size + 1");

        table.request_table_size(200);
        assert!(table.start_rehash(0).unwrap());
        table.wait_for_rehash().unwrap();
        assert_eq!(table.table_size(), 200, "requested size SHOULD win when larger");

        assert!(!table.is_rehashing());
        assert_all_present(&table, 0..100);
    }

    #[test]
    fn removes_during_growth_are_not_lost() {
        let dir = tempdir().unwrap();
        let table = open_small(&dir.path().join("removes.htod"), 3);

        fill(&table, 0..1000);
        for i in (0..1000).step_by(2) {
            assert!(table.remove(&format!("key-{i}")).unwrap());
        }
        table.wait_for_rehash().unwrap();

        assert_eq!(table.size(), 500);
        for i in 0..1000 {
            let present = table.contains_key(&format!("key-{i}"), true).unwrap();
            assert_eq!(present, i % 2 == 1, "key-{i} presence SHOULD match removals");
        }
    }

    #[test]
    fn grown_table_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("grown.htod");
        let grown_size = {
            let table = open_small(&path, 7);
            fill(&table, 0..2000);
            table.close().unwrap();
            table.table_size()
        };

        let table = open_small(&path, 7);
        assert!(grown_size > 7);
        assert_eq!(table.table_size(), grown_size, "reopen SHOULD keep the grown size");
        assert_eq!(table.size(), 2000);
        assert_all_present(&table, 0..2000);
    }
}

// ============================================================================
// CRASH RECOVERY
// ============================================================================

mod crash_tests {
    use super::*;

    #[test]
    fn count_is_recomputed_after_drop_without_close() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("crash.htod");
        {
            let table = open_small(&path, 31);
            fill(&table, 0..300);
            table.wait_for_rehash().unwrap();
            // Dropped without close.
        }

        let table = open_small(&path, 31);
        assert_eq!(table.size(), 300, "recount SHOULD restore the object count");
        assert_all_present(&table, 0..300);
    }

    #[test]
    fn puts_after_a_finished_doubling_are_recounted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("after-doubling.htod");
        {
            let table = open_small(&path, 11);
            fill(&table, 0..9);
            table.wait_for_rehash().unwrap();
            assert_eq!(table.table_size(), 23, "the ninth put SHOULD double the table");

            fill(&table, 9..14);
            assert_eq!(table.size(), 14);
            // Dropped without close, after the last table swap.
        }

        let table = open_small(&path, 11);
        let mut walked = 0u64;
        table
            .iterate_keys(|_| {
                walked += 1;
                Ok(true)
            })
            .unwrap();
        assert_eq!(walked, 14);
        assert_eq!(table.size(), walked, "count SHOULD match the stored keys after a crash");
        assert_all_present(&table, 0..14);
    }

    #[test]
    fn removals_before_crash_are_counted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("crash-remove.htod");
        {
            let table = open_small(&path, 31);
            fill(&table, 0..100);
            table.close().unwrap();
        }
        {
            let table = open_small(&path, 31);
            for i in 0..30 {
                table.remove(&format!("key-{i}")).unwrap();
            }
        }

        let table = open_small(&path, 31);
        assert_eq!(table.size(), 70);
        assert_all_present(&table, 30..100);
    }

    #[test]
    fn recount_callback_sees_every_entry() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("callback.htod");
        {
            let table = open_small(&path, 31);
            fill(&table, 0..50);
        }

        let seen = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&seen);
        let table = Table::builder()
            .path(&path)
            .on_recount(move |key: &String, value: &Value<String>| {
                assert!(key.starts_with("key-"));
                assert!(value.as_object().is_some());
                counter.fetch_add(1, Ordering::Relaxed);
                Ok(())
            })
            .open()
            .unwrap();

        assert_eq!(seen.load(Ordering::Relaxed), 50);
        assert_eq!(table.size(), 50);
    }

    #[test]
    fn clean_close_skips_recount() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("clean.htod");
        {
            let table = open_small(&path, 31);
            fill(&table, 0..10);
            table.close().unwrap();
        }

        let seen = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&seen);
        let table = Table::builder()
            .path(&path)
            .on_recount(move |_: &String, _: &Value<String>| {
                counter.fetch_add(1, Ordering::Relaxed);
                Ok(())
            })
            .open()
            .unwrap();

        assert_eq!(seen.load(Ordering::Relaxed), 0, "clean close SHOULD NOT trigger a recount");
        assert_eq!(table.size(), 10);
    }

    #[test]
    fn marker_without_second_table_is_rolled_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rollback.htod");
        let instance = {
            let table = open_small(&path, 31);
            fill(&table, 0..20);
            let instance = table.instance();
            table.close().unwrap();
            instance
        };
        {
            // A marker with no second table recorded next to it.
            let mut store = FileBlockStore::open(&path).unwrap();
            store.write_u64(instance + REHASH_MARKER_OFFSET, 1).unwrap();
            store.flush().unwrap();
        }

        let table = open_small(&path, 31);
        let description = table.describe();
        assert_eq!(description.rehash_marker, 0, "recovery SHOULD clear the marker");
        assert_eq!(description.table_sizes[description.current_table], 31);
        assert_eq!(table.size(), 20);
        assert_all_present(&table, 0..20);

        fill(&table, 20..200);
        table.wait_for_rehash().unwrap();
        assert_all_present(&table, 0..200);
    }

    #[test]
    fn corrupt_header_magic_is_structural() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("magic.htod");
        let instance = {
            let table = open_small(&path, 7);
            let instance = table.instance();
            table.close().unwrap();
            instance
        };
        {
            let mut store = FileBlockStore::open(&path).unwrap();
            store.write_u32(instance, 0xDEAD_BEEF).unwrap();
            store.flush().unwrap();
        }

        let err = Table::builder().path(&path).open().unwrap_err();
        assert!(htod::StructuralError::is_structural(&err));
    }
}

//! # Hashtable Operations Test Suite
//!
//! Point operations through the public API.
//!
//! ## Test Categories
//!
//! 1. **Basic**: put, get, remove, contains_key
//! 2. **Values**: null values, raw bytes, typed objects
//! 3. **Expiration**: expired entries and header-only updates
//! 4. **Removal variants**: get_and_remove, take, eviction keys
//! 5. **Lifecycle**: reopen, close, stats and describe
//!
//! ## Usage
//!
//! ```sh
//! cargo test --test hashtable_operations
//! ```

use std::time::{SystemTime, UNIX_EPOCH};

use htod::{
    DiskHashtable, EvictionKey, PutOptions, RetrieveMode, StructuralError, Value,
};
use serde::{Deserialize, Serialize};
use tempfile::tempdir;

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

type StringTable = DiskHashtable<String, String>;

fn open_table(dir: &tempfile::TempDir) -> StringTable {
    StringTable::builder()
        .path(dir.path().join("ops.htod"))
        .table_size(31)
        .open()
        .expect("failed to open table")
}

fn key(s: &str) -> String {
    s.to_string()
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64
}

// ============================================================================
// BASIC OPERATIONS
// ============================================================================

mod basic_tests {
    use super::*;

    #[test]
    fn put_get_remove_round_trip() {
        let dir = tempdir().unwrap();
        let table = open_table(&dir);

        table.put(&key("a"), "1".to_string()).unwrap();
        assert_eq!(
            table.get(&key("a")).unwrap(),
            Some(Value::Object("1".to_string())),
            "get SHOULD return the value just put"
        );

        assert!(table.remove(&key("a")).unwrap());
        assert_eq!(table.get(&key("a")).unwrap(), None, "removed key SHOULD be absent");
        assert!(!table.contains_key(&key("a"), true).unwrap());
        assert!(table.is_empty());
    }

    #[test]
    fn remove_missing_key_returns_false() {
        let dir = tempdir().unwrap();
        let table = open_table(&dir);

        assert!(!table.remove(&key("nope")).unwrap());
        assert_eq!(table.size(), 0);
    }

    #[test]
    fn put_replaces_and_reports_previous_entry() {
        let dir = tempdir().unwrap();
        let table = open_table(&dir);

        assert!(table.put(&key("k"), "first".to_string()).unwrap().is_none());
        let replaced = table
            .put(&key("k"), "second".to_string())
            .unwrap()
            .expect("replacing put SHOULD report the old entry");

        assert_eq!(replaced.key, "k");
        assert_eq!(replaced.size, 512);
        assert_eq!(replaced.expiration, -1);
        assert_eq!(table.size(), 1, "replacement SHOULD NOT change the count");
        assert_eq!(
            table.get(&key("k")).unwrap(),
            Some(Value::Object("second".to_string()))
        );
    }

    #[test]
    fn replacement_keeps_first_created() {
        let dir = tempdir().unwrap();
        let table = open_table(&dir);

        table.put(&key("k"), "v1".to_string()).unwrap();
        let created = table
            .get_entry(&key("k"), RetrieveMode::Key, false)
            .unwrap()
            .unwrap()
            .first_created();

        table.put(&key("k"), "v2".to_string()).unwrap();
        let entry = table.get_entry(&key("k"), RetrieveMode::Key, false).unwrap().unwrap();

        assert_eq!(entry.first_created(), created);
    }

    #[test]
    fn many_keys_in_small_table() {
        let dir = tempdir().unwrap();
        let table = StringTable::builder()
            .path(dir.path().join("small.htod"))
            .table_size(3)
            .auto_rehash(false)
            .open()
            .unwrap();

        for i in 0..200 {
            table.put(&format!("k{i}"), format!("v{i}")).unwrap();
        }
        assert_eq!(table.size(), 200);
        assert_eq!(table.table_size(), 3, "auto_rehash(false) SHOULD keep the size");

        for i in 0..200 {
            assert_eq!(
                table.get(&format!("k{i}")).unwrap(),
                Some(Value::Object(format!("v{i}"))),
                "key k{i} SHOULD be found in a long chain"
            );
        }
        assert!(table.stats().collisions > 0);
    }
}

// ============================================================================
// VALUE KINDS
// ============================================================================

mod value_tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Session {
        user: String,
        hits: u32,
        tags: Vec<String>,
    }

    #[test]
    fn byte_values_are_stored_raw() {
        let dir = tempdir().unwrap();
        let table = open_table(&dir);

        table.put_bytes(&key("b"), &[1, 2, 3], 3).unwrap();

        let value = table.get(&key("b")).unwrap().unwrap();
        assert_eq!(value.as_bytes(), Some(&[1u8, 2, 3][..]));
    }

    #[test]
    fn byte_values_honor_length() {
        let dir = tempdir().unwrap();
        let table = open_table(&dir);

        table.put_bytes(&key("b"), &[9, 8, 7, 6], 2).unwrap();

        assert_eq!(table.get(&key("b")).unwrap(), Some(Value::Bytes(vec![9, 8])));
    }

    #[test]
    fn null_is_a_value() {
        let dir = tempdir().unwrap();
        let table = open_table(&dir);

        table.put_null(&key("n")).unwrap();

        assert_eq!(table.get(&key("n")).unwrap(), Some(Value::Null));
        assert!(table.contains_key(&key("n"), true).unwrap());
        assert_eq!(table.size(), 1);
    }

    #[test]
    fn null_put_over_existing_key_is_ignored() {
        let dir = tempdir().unwrap();
        let table = open_table(&dir);

        table.put(&key("k"), "kept".to_string()).unwrap();
        assert!(table.put_null(&key("k")).unwrap().is_none());

        assert_eq!(
            table.get(&key("k")).unwrap(),
            Some(Value::Object("kept".to_string())),
            "null put SHOULD NOT overwrite an existing value"
        );
    }

    #[test]
    fn struct_values_round_trip() {
        let dir = tempdir().unwrap();
        let table: DiskHashtable<u64, Session> =
            DiskHashtable::open(dir.path().join("sessions.htod")).unwrap();
        let session = Session {
            user: "alice".into(),
            hits: 3,
            tags: vec!["admin".into(), "beta".into()],
        };

        table.put(&42, session.clone()).unwrap();

        assert_eq!(table.get(&42).unwrap(), Some(Value::Object(session)));
        assert_eq!(table.get(&43).unwrap(), None);
    }

    #[test]
    fn large_value_spans_several_units() {
        let dir = tempdir().unwrap();
        let table = open_table(&dir);
        let big = "x".repeat(5000);

        table.put(&key("big"), big.clone()).unwrap();

        let entry = table.get_entry(&key("big"), RetrieveMode::KeyValue, true).unwrap().unwrap();
        assert_eq!(entry.size() % 512, 0);
        assert!(entry.size() > 5000);
        assert_eq!(entry.value(), Some(&Value::Object(big)));
    }

    #[test]
    fn cache_value_is_returned_in_full_mode() {
        let dir = tempdir().unwrap();
        let table = StringTable::builder()
            .path(dir.path().join("cache.htod"))
            .cache_values(true)
            .open()
            .unwrap();
        let options = PutOptions::new().cache_value(vec![5, 6, 7], Some(99));

        table
            .put_with_options(&key("c"), &Value::Object("v".to_string()), &options)
            .unwrap();

        let entry = table.get_entry(&key("c"), RetrieveMode::All, false).unwrap().unwrap();
        assert_eq!(entry.cache_value(), Some(&[5u8, 6, 7][..]));
        assert_eq!(entry.cache_value_hashcode(), Some(99));

        let entry = table.get_entry(&key("c"), RetrieveMode::KeyValue, false).unwrap().unwrap();
        assert_eq!(entry.cache_value(), None, "KeyValue mode SHOULD skip the cache value");
    }

    #[test]
    fn alias_records_carry_no_cache_value() {
        let dir = tempdir().unwrap();
        let table = StringTable::builder()
            .path(dir.path().join("alias.htod"))
            .cache_values(true)
            .open()
            .unwrap();
        let options = PutOptions::new().alias(true).cache_value(vec![1, 2], None);

        table
            .put_with_options(&key("a"), &Value::Object("target".to_string()), &options)
            .unwrap();

        let entry = table.get_entry(&key("a"), RetrieveMode::All, false).unwrap().unwrap();
        assert!(entry.is_alias());
        assert_eq!(entry.cache_value(), None);
    }
}

// ============================================================================
// EXPIRATION
// ============================================================================

mod expiration_tests {
    use super::*;

    #[test]
    fn expired_entry_is_hidden_from_get() {
        let dir = tempdir().unwrap();
        let table = open_table(&dir);
        let options = PutOptions::new().expiration(now_ms() - 1000);

        table
            .put_with_options(&key("c"), &Value::Object("v".to_string()), &options)
            .unwrap();

        assert_eq!(table.get(&key("c")).unwrap(), None, "expired entry SHOULD be hidden");
        assert!(
            table.contains_key(&key("c"), false).unwrap(),
            "contains_key without expiry check SHOULD still see it"
        );
        assert!(!table.contains_key(&key("c"), true).unwrap());
    }

    #[test]
    fn expired_entry_lookup_reads_key_only() {
        let dir = tempdir().unwrap();
        let table = open_table(&dir);
        let options = PutOptions::new().expiration(now_ms() - 1);

        table
            .put_with_options(&key("c"), &Value::Object("v".to_string()), &options)
            .unwrap();

        let entry = table.get_entry(&key("c"), RetrieveMode::KeyValue, true).unwrap().unwrap();
        assert_eq!(entry.mode(), RetrieveMode::Key);
        assert!(entry.value().is_none());

        let entry = table.get_entry(&key("c"), RetrieveMode::KeyValue, false).unwrap().unwrap();
        assert_eq!(entry.mode(), RetrieveMode::KeyValue);
    }

    #[test]
    fn future_expiration_is_visible() {
        let dir = tempdir().unwrap();
        let table = open_table(&dir);
        let options = PutOptions::new().expiration(now_ms() + 3_600_000);

        table
            .put_with_options(&key("c"), &Value::Object("v".to_string()), &options)
            .unwrap();

        assert!(table.get(&key("c")).unwrap().is_some());
    }

    #[test]
    fn header_update_touches_only_validator_expiration() {
        let dir = tempdir().unwrap();
        let table = open_table(&dir);
        let expiration = now_ms() + 60_000;
        let options = PutOptions::new().expiration(expiration).validator_expiration(10);

        table
            .put_with_options(&key("h"), &Value::Object("v".to_string()), &options)
            .unwrap();
        assert!(table.update_expiration_in_header(&key("h"), 777).unwrap());

        let entry = table.get_entry(&key("h"), RetrieveMode::KeyValue, false).unwrap().unwrap();
        assert_eq!(entry.validator_expiration(), 777);
        assert_eq!(entry.expiration(), expiration, "expiration SHOULD be unchanged");
        assert_eq!(entry.value(), Some(&Value::Object("v".to_string())));

        assert!(!table.update_expiration_in_header(&key("missing"), 1).unwrap());
    }
}

// ============================================================================
// REMOVAL VARIANTS
// ============================================================================

mod removal_tests {
    use super::*;

    #[test]
    fn get_and_remove_returns_removed_entry() {
        let dir = tempdir().unwrap();
        let table = open_table(&dir);
        table.put(&key("g"), "value".to_string()).unwrap();

        let entry = table.get_and_remove(&key("g"), false).unwrap().unwrap();

        assert_eq!(entry.key(), Some(&key("g")));
        assert_eq!(entry.value(), Some(&Value::Object("value".to_string())));
        assert!(table.get(&key("g")).unwrap().is_none());
        assert!(table.get_and_remove(&key("g"), false).unwrap().is_none());
    }

    #[test]
    fn take_returns_value() {
        let dir = tempdir().unwrap();
        let table = open_table(&dir);
        table.put(&key("t"), "taken".to_string()).unwrap();

        assert_eq!(table.take(&key("t")).unwrap(), Some(Value::Object("taken".to_string())));
        assert_eq!(table.size(), 0);
    }

    #[test]
    fn eviction_key_finds_and_removes_record() {
        let dir = tempdir().unwrap();
        let table = open_table(&dir);
        table.put(&key("e1"), "one".to_string()).unwrap();
        table.put(&key("e2"), "two".to_string()).unwrap();

        let eviction: EvictionKey = table
            .get_entry(&key("e1"), RetrieveMode::Key, false)
            .unwrap()
            .unwrap()
            .eviction_key();

        assert_eq!(table.key_for_eviction(&eviction).unwrap(), Some(key("e1")));
        assert_eq!(table.remove_for_eviction(&eviction).unwrap(), Some(key("e1")));
        assert_eq!(table.remove_for_eviction(&eviction).unwrap(), None);
        assert!(table.get(&key("e2")).unwrap().is_some());
        assert_eq!(table.size(), 1);
    }

    #[test]
    fn clear_empties_table() {
        let dir = tempdir().unwrap();
        let table = open_table(&dir);
        for i in 0..50 {
            table.put(&format!("k{i}"), "v".to_string()).unwrap();
        }

        table.clear().unwrap();

        assert_eq!(table.size(), 0);
        for i in 0..50 {
            assert!(table.get(&format!("k{i}")).unwrap().is_none());
        }
        table.put(&key("after"), "clear".to_string()).unwrap();
        assert_eq!(table.size(), 1);
        assert_eq!(table.stats().clears, 1);
    }
}

// ============================================================================
// LIFECYCLE
// ============================================================================

mod lifecycle_tests {
    use super::*;

    #[test]
    fn data_survives_close_and_reopen() {
        let dir = tempdir().unwrap();
        {
            let table = open_table(&dir);
            for i in 0..100 {
                table.put(&format!("k{i}"), format!("v{i}")).unwrap();
            }
            table.close().unwrap();
        }

        let table = open_table(&dir);
        assert_eq!(table.size(), 100, "count SHOULD be persisted by close");
        for i in 0..100 {
            assert_eq!(
                table.get(&format!("k{i}")).unwrap(),
                Some(Value::Object(format!("v{i}")))
            );
        }
    }

    #[test]
    fn operations_after_close_fail_structurally() {
        let dir = tempdir().unwrap();
        let table = open_table(&dir);
        table.put(&key("a"), "1".to_string()).unwrap();
        table.close().unwrap();

        assert!(!table.is_open());
        let err = table.get(&key("a")).unwrap_err();
        assert_eq!(
            err.downcast_ref::<StructuralError>(),
            Some(&StructuralError::NoBlockStore)
        );
        let err = table.close().unwrap_err();
        assert!(StructuralError::is_structural(&err));
    }

    #[test]
    fn stats_track_reads_and_writes() {
        let dir = tempdir().unwrap();
        let table = open_table(&dir);

        table.put(&key("a"), "1".to_string()).unwrap();
        table.put(&key("a"), "2".to_string()).unwrap();
        table.get(&key("a")).unwrap();
        table.get(&key("missing")).unwrap();
        table.remove(&key("a")).unwrap();

        let stats = table.stats();
        assert_eq!(stats.write_requests, 2);
        assert_eq!(stats.write_replacements, 1);
        assert_eq!(stats.read_requests, 2);
        assert_eq!(stats.read_hits, 1);
        assert_eq!(stats.removes, 1);
        assert!(stats.bytes_serialized > 0);

        table.reset_stats();
        assert_eq!(table.stats().read_requests, 0);
    }

    #[test]
    fn describe_reports_header() {
        let dir = tempdir().unwrap();
        let table = open_table(&dir);
        table.put(&key("a"), "1".to_string()).unwrap();

        let description = table.describe();
        assert_eq!(description.table_sizes[description.current_table], 31);
        assert_eq!(description.rehash_marker, 0);
        assert_eq!(description.object_count, 1);
        assert_eq!(description.threshold, 31 * 75 / 100);
        assert!(description.dirty, "a put SHOULD mark the header dirty until close");
        assert!(!description.structural_busy);
        assert!(description.to_string().contains("objects=1"));
    }
}

//! Operation counters for a table instance.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters, updated with relaxed atomics from any thread.
#[derive(Debug, Default)]
pub struct HashtableStats {
    /// get / contains_key / get_entry calls
    pub read_requests: AtomicU64,
    /// Reads that found a live entry
    pub read_hits: AtomicU64,
    pub write_requests: AtomicU64,
    /// Writes that replaced an existing entry
    pub write_replacements: AtomicU64,
    pub removes: AtomicU64,
    pub clears: AtomicU64,
    /// Chain hops past the first record during lookups
    pub collisions: AtomicU64,
    /// Completed doublings
    pub doublings: AtomicU64,
    pub bytes_serialized: AtomicU64,
    pub bytes_deserialized: AtomicU64,
}

impl HashtableStats {
    pub fn record_read(&self, hit: bool) {
        self.read_requests.fetch_add(1, Ordering::Relaxed);
        if hit {
            self.read_hits.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_write(&self, replaced: bool, bytes: usize) {
        self.write_requests.fetch_add(1, Ordering::Relaxed);
        if replaced {
            self.write_replacements.fetch_add(1, Ordering::Relaxed);
        }
        self.bytes_serialized
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_remove(&self) {
        self.removes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_clear(&self) {
        self.clears.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_collisions(&self, hops: u64) {
        if hops > 0 {
            self.collisions.fetch_add(hops, Ordering::Relaxed);
        }
    }

    pub fn record_doubling(&self) {
        self.doublings.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_deserialized(&self, bytes: usize) {
        self.bytes_deserialized
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            read_requests: self.read_requests.load(Ordering::Relaxed),
            read_hits: self.read_hits.load(Ordering::Relaxed),
            write_requests: self.write_requests.load(Ordering::Relaxed),
            write_replacements: self.write_replacements.load(Ordering::Relaxed),
            removes: self.removes.load(Ordering::Relaxed),
            clears: self.clears.load(Ordering::Relaxed),
            collisions: self.collisions.load(Ordering::Relaxed),
            doublings: self.doublings.load(Ordering::Relaxed),
            bytes_serialized: self.bytes_serialized.load(Ordering::Relaxed),
            bytes_deserialized: self.bytes_deserialized.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.read_requests,
            &self.read_hits,
            &self.write_requests,
            &self.write_replacements,
            &self.removes,
            &self.clears,
            &self.collisions,
            &self.doublings,
            &self.bytes_serialized,
            &self.bytes_deserialized,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Point-in-time copy of [`HashtableStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub read_requests: u64,
    pub read_hits: u64,
    pub write_requests: u64,
    pub write_replacements: u64,
    pub removes: u64,
    pub clears: u64,
    pub collisions: u64,
    pub doublings: u64,
    pub bytes_serialized: u64,
    pub bytes_deserialized: u64,
}

impl StatsSnapshot {
    pub fn hit_ratio(&self) -> f64 {
        if self.read_requests == 0 {
            0.0
        } else {
            self.read_hits as f64 / self.read_requests as f64
        }
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "reads={} hits={} ({:.1}%) writes={} replaced={} removes={} clears={} \
             collisions={} doublings={} serialized={}B deserialized={}B",
            self.read_requests,
            self.read_hits,
            self.hit_ratio() * 100.0,
            self.write_requests,
            self.write_replacements,
            self.removes,
            self.clears,
            self.collisions,
            self.doublings,
            self.bytes_serialized,
            self.bytes_deserialized
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_and_reset() {
        let stats = HashtableStats::default();
        stats.record_read(true);
        stats.record_read(false);
        stats.record_write(true, 100);
        stats.record_collisions(0);
        stats.record_collisions(3);

        let snap = stats.snapshot();
        assert_eq!(snap.read_requests, 2);
        assert_eq!(snap.read_hits, 1);
        assert_eq!(snap.write_replacements, 1);
        assert_eq!(snap.bytes_serialized, 100);
        assert_eq!(snap.collisions, 3);
        assert!((snap.hit_ratio() - 0.5).abs() < f64::EPSILON);

        stats.reset();
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn display_mentions_every_counter() {
        let text = StatsSnapshot::default().to_string();
        assert!(text.contains("reads=0"));
        assert!(text.contains("doublings=0"));
    }
}

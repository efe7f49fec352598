use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::snapshot::SessionSnapshot;

/// A fixed-capacity circular buffer of session snapshots (spec §4.4),
/// O(1) insertion, oldest entry dropped once the buffer is full. Entries
/// arrive in non-decreasing `sample_time` order (one sampler tick at a
/// time), so time-indexed lookup is a binary search rather than a scan.
pub struct SnapshotRingBuffer {
    inner: Mutex<VecDeque<SessionSnapshot>>,
    capacity: usize,
}

impl SnapshotRingBuffer {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be positive");
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inserts one snapshot, dropping the oldest if the buffer is full.
    pub fn push(&self, snapshot: SessionSnapshot) {
        let mut inner = self.inner.lock();
        if inner.len() == self.capacity {
            inner.pop_front();
        }
        inner.push_back(snapshot);
    }

    /// Returns every snapshot with `sample_time` in `[from, to]`, oldest
    /// first.
    pub fn range(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<SessionSnapshot> {
        let inner = self.inner.lock();
        let start = inner.partition_point(|s| s.sample_time < from);
        inner
            .iter()
            .skip(start)
            .take_while(|s| s.sample_time <= to)
            .cloned()
            .collect()
    }

    /// Returns every currently buffered snapshot, oldest first. Intended
    /// for aggregation sweeps and diagnostics, not hot paths.
    pub fn snapshot_all(&self) -> Vec<SessionSnapshot> {
        self.inner.lock().iter().cloned().collect()
    }
}

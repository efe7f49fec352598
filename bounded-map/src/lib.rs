//! A capacity-bounded, optionally-TTL'd key/value map. Every long-lived
//! map in the collector (correlator indices, the adaptive sampler's
//! decision cache, the circuit breaker's per-database state, the plan
//! extractor's history) is one of these so cardinality explosions cannot
//! turn into memory exhaustion (spec §4.1).
//!
//! Concurrency is a single `parking_lot::Mutex` around an `IndexMap`: every
//! call is linearizable, and `IndexMap`'s preserved insertion order gives
//! us both eviction policies for free — `OldestInsert` never reorders,
//! `Lru` moves an entry to the back on every read or write.

use std::time::{Duration, Instant};

use indexmap::IndexMap;
use parking_lot::Mutex;

/// Which entry is evicted when `put` would exceed capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    /// Evict the entry least recently read or written.
    Lru,
    /// Evict the entry inserted longest ago, regardless of reads.
    OldestInsert,
}

struct Entry<V> {
    value: V,
    inserted_at: Instant,
}

struct Inner<V> {
    map: IndexMap<String, Entry<V>>,
}

pub struct BoundedMap<V> {
    inner: Mutex<Inner<V>>,
    cap: usize,
    policy: EvictionPolicy,
    ttl: Option<Duration>,
}

impl<V: Clone> BoundedMap<V> {
    /// `cap` must be positive; a `Validate()` at the config layer rejects
    /// non-positive bounded-map caps before this is ever constructed.
    pub fn new(cap: usize, policy: EvictionPolicy, ttl: Option<Duration>) -> Self {
        assert!(cap > 0, "BoundedMap capacity must be positive");
        Self {
            inner: Mutex::new(Inner {
                map: IndexMap::with_capacity(cap),
            }),
            cap,
            policy,
            ttl,
        }
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }

    /// Inserts `value` at `key`. If the map is already at capacity and
    /// `key` is new, evicts exactly one existing entry per the declared
    /// policy first. Returns the key evicted to make room, if any.
    pub fn put(&self, key: impl Into<String>, value: V) -> Option<String> {
        let key = key.into();
        let mut inner = self.inner.lock();
        let now = Instant::now();

        if let Some(idx) = inner.map.get_index_of(&key) {
            inner.map[idx] = Entry {
                value,
                inserted_at: now,
            };
            if self.policy == EvictionPolicy::Lru {
                let last = inner.map.len() - 1;
                inner.map.move_index(idx, last);
            }
            return None;
        }

        let evicted = if inner.map.len() >= self.cap {
            // Both policies evict the front entry: `OldestInsert` never
            // reorders, and `Lru` moves accessed entries to the back, so
            // index 0 is always the oldest by the relevant ordering.
            inner.map.shift_remove_index(0).map(|(k, _)| k)
        } else {
            None
        };

        inner.map.insert(
            key,
            Entry {
                value,
                inserted_at: now,
            },
        );
        evicted
    }

    /// Returns a clone of the value at `key`, if present and not expired.
    /// Under the `Lru` policy this counts as a use and moves the entry to
    /// the back.
    pub fn get(&self, key: &str) -> Option<V> {
        let mut inner = self.inner.lock();
        let idx = inner.map.get_index_of(key)?;

        if let Some(ttl) = self.ttl {
            if inner.map[idx].inserted_at.elapsed() > ttl {
                inner.map.shift_remove_index(idx);
                return None;
            }
        }

        let value = inner.map[idx].value.clone();
        if self.policy == EvictionPolicy::Lru {
            let last = inner.map.len() - 1;
            inner.map.move_index(idx, last);
        }
        Some(value)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.lock().map.contains_key(key)
    }

    pub fn remove(&self, key: &str) -> Option<V> {
        self.inner
            .lock()
            .map
            .shift_remove(key)
            .map(|entry| entry.value)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every entry inserted more than `max_age` ago, regardless of
    /// the configured TTL (used by periodic sweeps, e.g. the correlator's
    /// index retention). Returns the number removed.
    pub fn cleanup_older_than(&self, max_age: Duration) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.map.len();
        inner.map.retain(|_, entry| entry.inserted_at.elapsed() <= max_age);
        before - inner.map.len()
    }

    /// Snapshot of all live keys, in current map order. Intended for
    /// diagnostics/tests, not hot paths.
    pub fn keys(&self) -> Vec<String> {
        self.inner.lock().map.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_oldest_insert_at_capacity() {
        let m: BoundedMap<i32> = BoundedMap::new(3, EvictionPolicy::OldestInsert, None);
        m.put("q1", 1);
        m.put("q2", 2);
        m.put("q3", 3);
        let evicted = m.put("q4", 4);
        assert_eq!(evicted.as_deref(), Some("q1"));
        assert_eq!(m.len(), 3);
        assert_eq!(m.get("q1"), None);
        assert_eq!(m.get("q2"), Some(2));
        assert_eq!(m.get("q3"), Some(3));
        assert_eq!(m.get("q4"), Some(4));
        assert_eq!(m.keys(), vec!["q2", "q3", "q4"]);
    }

    #[test]
    fn lru_eviction_spares_recently_read_entries() {
        let m: BoundedMap<i32> = BoundedMap::new(2, EvictionPolicy::Lru, None);
        m.put("a", 1);
        m.put("b", 2);
        // touch "a" so "b" becomes the LRU victim
        assert_eq!(m.get("a"), Some(1));
        let evicted = m.put("c", 3);
        assert_eq!(evicted.as_deref(), Some("b"));
        assert_eq!(m.get("a"), Some(1));
        assert_eq!(m.get("c"), Some(3));
    }

    #[test]
    fn never_exceeds_capacity() {
        let m: BoundedMap<i32> = BoundedMap::new(4, EvictionPolicy::Lru, None);
        for i in 0..100 {
            m.put(format!("k{i}"), i);
            assert!(m.len() <= m.capacity());
        }
    }

    #[test]
    fn ttl_expiry_on_read() {
        let m: BoundedMap<i32> = BoundedMap::new(4, EvictionPolicy::Lru, Some(Duration::from_millis(1)));
        m.put("a", 1);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(m.get("a"), None);
        assert_eq!(m.len(), 0);
    }

    #[test]
    fn cleanup_older_than_removes_aged_entries() {
        let m: BoundedMap<i32> = BoundedMap::new(8, EvictionPolicy::OldestInsert, None);
        m.put("a", 1);
        std::thread::sleep(Duration::from_millis(5));
        m.put("b", 2);
        let removed = m.cleanup_older_than(Duration::from_millis(2));
        assert_eq!(removed, 1);
        assert_eq!(m.len(), 1);
        assert_eq!(m.get("b"), Some(2));
    }
}

//! Bounded most-recently-used cache.
//!
//! Holds decoded nodes for the file store so that re-activating a ghost after
//! [`Tree::release`](crate::btree::Tree::release) does not always hit the disk.
//! Entries are stamped with a monotonically increasing counter on every access;
//! the entry with the oldest stamp is evicted when the cache is over capacity.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

/// Cache hit/miss/eviction counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// A fixed-capacity map that evicts its least recently used entry.
#[derive(Debug)]
pub struct MruCache<K, V> {
    capacity: usize,
    entries: HashMap<K, (V, u64)>,
    /// Access stamp -> key, oldest first
    order: BTreeMap<u64, K>,
    clock: u64,
    stats: CacheStats,
}

impl<K: Hash + Eq + Copy, V> MruCache<K, V> {
    /// Create a cache holding at most `capacity` entries. A capacity of zero
    /// disables caching.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::with_capacity(capacity.min(4096)),
            order: BTreeMap::new(),
            clock: 0,
            stats: CacheStats::default(),
        }
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub const fn stats(&self) -> CacheStats {
        self.stats
    }

    const fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Look up an entry and mark it most recently used.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let stamp = self.tick();
        let Some((value, old_stamp)) = self.entries.get_mut(key) else {
            self.stats.misses += 1;
            return None;
        };
        self.order.remove(old_stamp);
        self.order.insert(stamp, *key);
        *old_stamp = stamp;
        self.stats.hits += 1;
        Some(value)
    }

    /// Insert or replace an entry, evicting the least recently used one if
    /// the cache is over capacity.
    pub fn insert(&mut self, key: K, value: V) {
        if self.capacity == 0 {
            return;
        }
        let stamp = self.tick();
        if let Some((_, old_stamp)) = self.entries.insert(key, (value, stamp)) {
            self.order.remove(&old_stamp);
        }
        self.order.insert(stamp, key);

        while self.entries.len() > self.capacity {
            if self.pop().is_none() {
                break;
            }
        }
    }

    /// Evict and return the least recently used entry.
    pub fn pop(&mut self) -> Option<(K, V)> {
        let (_, key) = self.order.pop_first()?;
        let (value, _) = self.entries.remove(&key)?;
        self.stats.evictions += 1;
        Some((key, value))
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let (value, stamp) = self.entries.remove(key)?;
        self.order.remove(&stamp);
        Some(value)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    /// Keys from most to least recently used.
    #[must_use]
    pub fn keys(&self) -> Vec<K> {
        self.order.values().rev().copied().collect()
    }
}

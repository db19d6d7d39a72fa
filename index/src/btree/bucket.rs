//! Leaf buckets.
//!
//! A bucket holds a dense run of entries sorted by key. Buckets are the only
//! place values live; internal nodes only carry separators.

use crate::btree::value::{TreeKey, TreeValue};

/// A key-value entry in a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry<K, V> {
    pub key: K,
    pub value: V,
}

/// Outcome of [`Bucket::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insertion<V> {
    /// The key was absent and has been added.
    Inserted,
    /// The key was present; its previous value is returned.
    Replaced(V),
    /// The key was present and `replace` was false. Nothing changed.
    Conflict,
}

/// A leaf node.
///
/// Invariant: `entries` is strictly increasing by key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bucket<K, V> {
    pub(crate) entries: Vec<Entry<K, V>>,
}

impl<K: TreeKey, V: TreeValue> Bucket<K, V> {
    /// Create a new empty bucket.
    #[must_use]
    #[allow(clippy::missing_const_for_fn)] // Vec::new() is not const-stable
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Create a bucket from entries that are already strictly increasing.
    #[must_use]
    pub(crate) const fn from_sorted(entries: Vec<Entry<K, V>>) -> Self {
        Self { entries }
    }

    /// Number of entries.
    #[must_use]
    #[allow(clippy::missing_const_for_fn)] // Vec::len() is not const-stable
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The entries in key order.
    #[must_use]
    pub fn entries(&self) -> &[Entry<K, V>] {
        &self.entries
    }

    /// Find the index where a key should be inserted (or exists).
    pub fn find_index(&self, key: &K) -> Result<usize, usize> {
        self.entries.binary_search_by(|e| e.key.cmp(key))
    }

    /// Get a value by key.
    #[must_use]
    pub fn get(&self, key: &K) -> Option<V> {
        self.find_index(key).ok().map(|i| self.entries[i].value)
    }

    /// Insert an entry, replacing an existing value only if `replace` is set.
    pub fn insert(&mut self, key: K, value: V, replace: bool) -> Insertion<V> {
        match self.find_index(&key) {
            Ok(i) if replace => {
                let old = std::mem::replace(&mut self.entries[i].value, value);
                Insertion::Replaced(old)
            }
            Ok(_) => Insertion::Conflict,
            Err(i) => {
                self.entries.insert(i, Entry { key, value });
                Insertion::Inserted
            }
        }
    }

    /// Remove an entry by key, returning its value if found.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.find_index(key)
            .ok()
            .map(|i| self.entries.remove(i).value)
    }

    /// Smallest key, if any.
    #[must_use]
    pub fn min_key(&self) -> Option<K> {
        self.entries.first().map(|e| e.key)
    }

    /// Largest key, if any.
    #[must_use]
    pub fn max_key(&self) -> Option<K> {
        self.entries.last().map(|e| e.key)
    }

    /// Smallest key `>= lower`.
    #[must_use]
    pub fn first_at_least(&self, lower: &K) -> Option<K> {
        let i = self.find_index(lower).unwrap_or_else(|i| i);
        self.entries.get(i).map(|e| e.key)
    }

    /// Largest key `<= upper`.
    #[must_use]
    pub fn last_at_most(&self, upper: &K) -> Option<K> {
        let end = match self.find_index(upper) {
            Ok(i) => i + 1,
            Err(i) => i,
        };
        end.checked_sub(1).map(|i| self.entries[i].key)
    }

    /// Split the bucket at its midpoint, returning the separator and the new
    /// right bucket. The separator is the first key of the right bucket.
    ///
    /// Must only be called on a bucket with at least two entries.
    #[must_use]
    pub fn split(&mut self) -> (K, Self) {
        let mid = self.entries.len() / 2;

        let right_entries: Vec<Entry<K, V>> = self.entries.drain(mid..).collect();
        let split_key = right_entries[0].key;

        (split_key, Self::from_sorted(right_entries))
    }

    /// Absorb the right-hand sibling. Every key in `right` must exceed every
    /// key in `self`.
    pub fn merge_with(&mut self, mut right: Self) {
        self.entries.append(&mut right.entries);
    }

    /// Even out entries with the right-hand sibling and return the new
    /// separator between them (the first key of `right`).
    pub fn rebalance_with(&mut self, right: &mut Self) -> Option<K> {
        let total = self.entries.len() + right.entries.len();
        let target_left = total / 2;

        if self.entries.len() < target_left {
            let moved = target_left - self.entries.len();
            self.entries.extend(right.entries.drain(..moved));
        } else if self.entries.len() > target_left {
            let mut moved: Vec<Entry<K, V>> = self.entries.drain(target_left..).collect();
            moved.append(&mut right.entries);
            right.entries = moved;
        }

        right.min_key()
    }
}

impl<K: TreeKey, V: TreeValue> Default for Bucket<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bucket_with(keys: impl IntoIterator<Item = i32>) -> Bucket<i32, i64> {
        let mut bucket = Bucket::new();
        for k in keys {
            bucket.insert(k, i64::from(k) * 10, true);
        }
        bucket
    }

    #[test]
    fn test_bucket_insert_update() {
        let mut bucket: Bucket<i32, i64> = Bucket::new();

        assert_eq!(bucket.insert(1, 100, false), Insertion::Inserted);
        assert_eq!(bucket.len(), 1);

        assert_eq!(bucket.insert(1, 200, false), Insertion::Conflict);
        assert_eq!(bucket.get(&1), Some(100));

        assert_eq!(bucket.insert(1, 200, true), Insertion::Replaced(100));
        assert_eq!(bucket.get(&1), Some(200));
        assert_eq!(bucket.len(), 1);
    }

    #[test]
    fn test_bucket_keeps_keys_sorted() {
        let bucket = bucket_with([5, 3, 7, 1, 9, 2]);
        let keys: Vec<i32> = bucket.entries().iter().map(|e| e.key).collect();
        assert_eq!(keys, vec![1, 2, 3, 5, 7, 9]);
        assert_eq!(bucket.min_key(), Some(1));
        assert_eq!(bucket.max_key(), Some(9));
    }

    #[test]
    fn test_bucket_remove() {
        let mut bucket = bucket_with([1, 2]);

        assert_eq!(bucket.remove(&1), Some(10));
        assert_eq!(bucket.len(), 1);
        assert!(bucket.get(&1).is_none());
        assert_eq!(bucket.remove(&1), None);
    }

    #[test]
    fn test_bucket_bounded_lookups() {
        let bucket = bucket_with([10, 20, 30]);

        assert_eq!(bucket.first_at_least(&15), Some(20));
        assert_eq!(bucket.first_at_least(&20), Some(20));
        assert_eq!(bucket.first_at_least(&31), None);

        assert_eq!(bucket.last_at_most(&25), Some(20));
        assert_eq!(bucket.last_at_most(&30), Some(30));
        assert_eq!(bucket.last_at_most(&9), None);
    }

    #[test]
    fn test_bucket_split() {
        let mut bucket = bucket_with(0..121);

        let (split_key, right) = bucket.split();

        assert_eq!(bucket.len(), 60);
        assert_eq!(right.len(), 61);
        assert_eq!(split_key, 60);
        assert_eq!(right.min_key(), Some(split_key));
        assert_eq!(bucket.max_key(), Some(59));
    }

    #[test]
    fn test_bucket_merge() {
        let mut left = bucket_with(0..5);
        let right = bucket_with(5..9);

        left.merge_with(right);

        assert_eq!(left.len(), 9);
        let keys: Vec<i32> = left.entries().iter().map(|e| e.key).collect();
        assert_eq!(keys, (0..9).collect::<Vec<_>>());
    }

    #[test]
    fn test_bucket_rebalance_moves_from_right() {
        let mut left = bucket_with(0..2);
        let mut right = bucket_with(2..10);

        let separator = left.rebalance_with(&mut right);

        assert_eq!(left.len(), 5);
        assert_eq!(right.len(), 5);
        assert_eq!(separator, Some(5));
    }

    #[test]
    fn test_bucket_rebalance_moves_from_left() {
        let mut left = bucket_with(0..9);
        let mut right = bucket_with(9..10);

        let separator = left.rebalance_with(&mut right);

        assert_eq!(left.len(), 5);
        assert_eq!(right.len(), 5);
        assert_eq!(separator, Some(5));
        assert_eq!(right.min_key(), Some(5));
    }
}

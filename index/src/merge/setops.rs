//! Union, intersection and difference over trees and key sets.

use crate::btree::{Tree, TreeError, TreeKey, TreeValue};
use crate::merge::weighted::Combine;
use crate::merge::{Side, merge_join};
use crate::storage::NodeStore;

/// An ordered set of bare keys.
///
/// Invariant: `keys` is strictly increasing.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KeySet<K> {
    keys: Vec<K>,
}

impl<K: TreeKey> KeySet<K> {
    #[must_use]
    pub const fn new() -> Self {
        Self { keys: Vec::new() }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        self.keys.binary_search(key).is_ok()
    }

    /// Keys in ascending order.
    #[must_use]
    pub fn keys(&self) -> &[K] {
        &self.keys
    }

    /// Add a key. Returns false if it was already present.
    pub fn insert(&mut self, key: K) -> bool {
        match self.keys.binary_search(&key) {
            Ok(_) => false,
            Err(i) => {
                self.keys.insert(i, key);
                true
            }
        }
    }

    fn joinable(&self) -> impl Iterator<Item = Result<(K, ()), TreeError<K>>> + '_ {
        self.keys.iter().map(|key| Ok((*key, ())))
    }

    fn join(&self, other: &Self, keep: impl Fn(&Side<(), ()>) -> bool) -> Self {
        let (mut left, mut right) = (self.keys.iter().peekable(), other.keys.iter().peekable());
        let mut keys = Vec::new();
        loop {
            let (key, side) = match (left.peek(), right.peek()) {
                (None, None) => break,
                (Some(&&l), Some(&&r)) if l == r => {
                    left.next();
                    right.next();
                    (l, Side::Both((), ()))
                }
                (Some(&&l), Some(&&r)) if l < r => {
                    left.next();
                    (l, Side::Left(()))
                }
                (Some(&&l), None) => {
                    left.next();
                    (l, Side::Left(()))
                }
                (_, Some(&&r)) => {
                    right.next();
                    (r, Side::Right(()))
                }
            };
            if keep(&side) {
                keys.push(key);
            }
        }
        Self { keys }
    }

    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        self.join(other, |_| true)
    }

    #[must_use]
    pub fn intersection(&self, other: &Self) -> Self {
        self.join(other, |side| matches!(side, Side::Both(..)))
    }

    #[must_use]
    pub fn difference(&self, other: &Self) -> Self {
        self.join(other, |side| matches!(side, Side::Left(_)))
    }

    /// Union of any number of sets.
    pub fn multiunion<'a>(sets: impl IntoIterator<Item = &'a Self>) -> Self {
        let mut keys: Vec<K> = sets.into_iter().flat_map(|set| set.keys.iter().copied()).collect();
        keys.sort_unstable();
        keys.dedup();
        Self { keys }
    }
}

impl<K: TreeKey> FromIterator<K> for KeySet<K> {
    fn from_iter<I: IntoIterator<Item = K>>(iter: I) -> Self {
        let mut keys: Vec<K> = iter.into_iter().collect();
        keys.sort_unstable();
        keys.dedup();
        Self { keys }
    }
}

impl<K: TreeKey, V: TreeValue, S: NodeStore<K, V>> Tree<K, V, S> {
    /// The keys of this tree.
    pub fn key_set(&self) -> Result<KeySet<K>, TreeError<K>> {
        Ok(KeySet {
            keys: self.keys().collect::<Result<_, _>>()?,
        })
    }

    fn join_with<B: Copy>(
        &self,
        other: impl IntoIterator<Item = Result<(K, B), TreeError<K>>>,
        mut pick: impl FnMut(Side<V, B>) -> Option<V>,
    ) -> Result<Vec<(K, V)>, TreeError<K>> {
        let mut entries = Vec::new();
        merge_join(self.iter(), other, |key, side| {
            if let Some(value) = pick(side) {
                entries.push((key, value));
            }
            Ok(())
        })?;
        Ok(entries)
    }

    /// Every key of either tree. Where both have a key, this tree's value wins.
    pub fn union<S2: NodeStore<K, V>>(&self, other: &Tree<K, V, S2>) -> Result<Self, TreeError<K>> {
        let entries = self.join_with(other.iter(), |side| match side {
            Side::Left(v) | Side::Right(v) | Side::Both(v, _) => Some(v),
        })?;
        tracing::debug!(left = self.len(), right = other.len(), result = entries.len(), "union");
        Ok(self.build_like(entries))
    }

    /// Keys present in both trees, with this tree's values.
    pub fn intersection<S2: NodeStore<K, V>>(&self, other: &Tree<K, V, S2>) -> Result<Self, TreeError<K>> {
        let entries = self.join_with(other.iter(), |side| match side {
            Side::Both(v, _) => Some(v),
            Side::Left(_) | Side::Right(_) => None,
        })?;
        tracing::debug!(left = self.len(), right = other.len(), result = entries.len(), "intersection");
        Ok(self.build_like(entries))
    }

    /// Entries of this tree whose keys are absent from `other`.
    pub fn difference<S2: NodeStore<K, V>>(&self, other: &Tree<K, V, S2>) -> Result<Self, TreeError<K>> {
        let entries = self.join_with(other.iter(), |side| match side {
            Side::Left(v) => Some(v),
            Side::Right(_) | Side::Both(..) => None,
        })?;
        tracing::debug!(left = self.len(), right = other.len(), result = entries.len(), "difference");
        Ok(self.build_like(entries))
    }

    /// Entries of this tree whose keys are in `keys`.
    pub fn intersection_keys(&self, keys: &KeySet<K>) -> Result<Self, TreeError<K>> {
        let entries = self.join_with(keys.joinable(), |side| match side {
            Side::Both(v, ()) => Some(v),
            Side::Left(_) | Side::Right(()) => None,
        })?;
        Ok(self.build_like(entries))
    }

    /// Entries of this tree whose keys are not in `keys`.
    pub fn difference_keys(&self, keys: &KeySet<K>) -> Result<Self, TreeError<K>> {
        let entries = self.join_with(keys.joinable(), |side| match side {
            Side::Left(v) => Some(v),
            Side::Right(()) | Side::Both(..) => None,
        })?;
        Ok(self.build_like(entries))
    }
}

impl<K: TreeKey, V: Combine, S: NodeStore<K, V>> Tree<K, V, S> {
    /// This tree plus every key of `keys`; keys new to the tree get
    /// [`MERGE_DEFAULT`](crate::merge::MERGE_DEFAULT).
    pub fn union_keys(&self, keys: &KeySet<K>) -> Result<Self, TreeError<K>> {
        let entries = self.join_with(keys.joinable(), |side| match side {
            Side::Left(v) | Side::Both(v, ()) => Some(v),
            Side::Right(()) => Some(V::merge_default()),
        })?;
        Ok(self.build_like(entries))
    }
}

//! Weighted merge arithmetic.
//!
//! Every value taking part in a merge is a [`Contribution`]: the pair
//! `(Σ vᵢ·wᵢ, Σ wᵢ)`. Combining two contributions adds both components, which
//! is commutative and associative, so a merged result never depends on the
//! order in which sources were folded. Normalization (`value / weight`, only
//! when `weight > 0`) runs once at the end, so its truncation never feeds back
//! into a later combine.
//!
//! Arithmetic is carried out in `i128` with overflow checks and narrowed to the
//! value type when resolved.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::btree::{Tree, TreeConfig, TreeError, TreeKey, TreeValue};
use crate::storage::NodeStore;

/// Weights are signed. Zero and negative weights are allowed.
pub type Weight = i64;

/// Value given to keys introduced from a bare key set.
pub const MERGE_DEFAULT: i64 = 1;

/// Values that support weighted arithmetic.
pub trait Combine: TreeValue {
    fn to_wide(self) -> i128;

    /// Narrow back to `Self`, or `None` if the result does not fit.
    fn from_wide(wide: i128) -> Option<Self>;

    /// Value assigned to a key that only appears in a key set.
    fn merge_default() -> Self;
}

macro_rules! impl_combine {
    ($($ty:ty),*) => {$(
        impl Combine for $ty {
            fn to_wide(self) -> i128 {
                i128::from(self)
            }

            fn from_wide(wide: i128) -> Option<Self> {
                Self::try_from(wide).ok()
            }

            fn merge_default() -> Self {
                1
            }
        }
    )*};
}

impl_combine!(i32, i64, u32, u64);

/// An accumulated `(Σ v·w, Σ w)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Contribution {
    pub value: i128,
    pub weight: i128,
}

impl Contribution {
    pub const ZERO: Self = Self { value: 0, weight: 0 };

    /// `value` scaled by `weight`.
    #[must_use]
    pub fn of<V: Combine>(value: V, weight: Weight) -> Option<Self> {
        Some(Self {
            value: value.to_wide().checked_mul(i128::from(weight))?,
            weight: i128::from(weight),
        })
    }

    /// Component-wise sum.
    #[must_use]
    pub const fn combine(self, other: Self) -> Option<Self> {
        let Some(value) = self.value.checked_add(other.value) else {
            return None;
        };
        let Some(weight) = self.weight.checked_add(other.weight) else {
            return None;
        };
        Some(Self { value, weight })
    }

    /// `value / weight` when `weight > 0`, otherwise `value`. Division
    /// truncates toward zero.
    #[must_use]
    pub const fn normalized(self) -> i128 {
        if self.weight > 0 {
            self.value / self.weight
        } else {
            self.value
        }
    }

    /// Narrow to the value type, normalizing first if requested.
    #[must_use]
    pub fn resolve<V: Combine>(self, normalize: bool) -> Option<V> {
        V::from_wide(if normalize { self.normalized() } else { self.value })
    }
}

/// `v1 * w1 + v2 * w2`, or `None` on overflow.
#[must_use]
pub fn merge<V: Combine>(v1: V, w1: Weight, v2: V, w2: Weight) -> Option<V> {
    Contribution::of(v1, w1)?
        .combine(Contribution::of(v2, w2)?)?
        .resolve(false)
}

/// `v * w`, or `None` on overflow.
#[must_use]
pub fn merge_weight<V: Combine>(value: V, weight: Weight) -> Option<V> {
    Contribution::of(value, weight)?.resolve(false)
}

/// `v / w` when `w > 0`, otherwise `v`.
#[must_use]
pub fn normalize<V: Combine>(value: V, weight: Weight) -> Option<V> {
    Contribution {
        value: value.to_wide(),
        weight: i128::from(weight),
    }
    .resolve(true)
}

fn overflow<K: TreeKey>(key: K) -> TreeError<K> {
    TreeError::ValueOutOfRange(format!("weighted merge overflowed at key {key:?}"))
}

/// Folds any number of weighted trees into per-key contributions.
///
/// ```
/// use ilindex::btree::IntTree;
/// use ilindex::merge::Accumulator;
///
/// let mut a = IntTree::in_memory();
/// a.set(1, 10).unwrap();
/// let mut b = IntTree::in_memory();
/// b.set(1, 20).unwrap();
///
/// let mut acc = Accumulator::new();
/// acc.add(&a, 1).unwrap();
/// acc.add(&b, 3).unwrap();
/// assert_eq!(acc.get(1).map(|c| c.value), Some(70));
/// assert_eq!(acc.get(1).map(|c| c.normalized()), Some(17));
/// ```
#[derive(Debug, Clone)]
pub struct Accumulator<K> {
    sums: BTreeMap<K, Contribution>,
}

impl<K: TreeKey> Accumulator<K> {
    #[must_use]
    pub const fn new() -> Self {
        Self { sums: BTreeMap::new() }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sums.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sums.is_empty()
    }

    /// Accumulated contribution for `key`.
    #[must_use]
    pub fn get(&self, key: K) -> Option<Contribution> {
        self.sums.get(&key).copied()
    }

    /// Add a single weighted value.
    pub fn add_value<V: Combine>(&mut self, key: K, value: V, weight: Weight) -> Result<(), TreeError<K>> {
        let contribution = Contribution::of(value, weight).ok_or_else(|| overflow(key))?;
        let slot = self.sums.entry(key).or_default();
        *slot = slot.combine(contribution).ok_or_else(|| overflow(key))?;
        Ok(())
    }

    /// Add every entry of `tree` scaled by `weight`.
    pub fn add<V: Combine, S: NodeStore<K, V>>(&mut self, tree: &Tree<K, V, S>, weight: Weight) -> Result<(), TreeError<K>> {
        for entry in tree.iter() {
            let (key, value) = entry?;
            self.add_value(key, value, weight)?;
        }
        Ok(())
    }

    /// Build the merged tree, dividing each key's value by its accumulated
    /// weight when `normalize` is set.
    pub fn into_tree<V: Combine, S: NodeStore<K, V>>(
        self,
        store: Arc<S>,
        config: TreeConfig,
        normalize: bool,
    ) -> Result<Tree<K, V, S>, TreeError<K>> {
        let entries = self
            .sums
            .into_iter()
            .map(|(key, contribution)| {
                contribution
                    .resolve(normalize)
                    .map(|value| (key, value))
                    .ok_or_else(|| overflow(key))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Tree::from_entries(store, config, entries))
    }
}

impl<K: TreeKey> Default for Accumulator<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: TreeKey, V: Combine, S: NodeStore<K, V>> Tree<K, V, S> {
    /// Keys from either tree; values are `v1*w1 + v2*w2`, with a missing side
    /// contributing nothing.
    pub fn weighted_union<S2: NodeStore<K, V>>(
        &self,
        w1: Weight,
        other: &Tree<K, V, S2>,
        w2: Weight,
    ) -> Result<Self, TreeError<K>> {
        let mut entries = Vec::new();
        super::merge_join(self.iter(), other.iter(), |key, side| {
            let sum = match side {
                super::Side::Left(v1) => Contribution::of(v1, w1),
                super::Side::Right(v2) => Contribution::of(v2, w2),
                super::Side::Both(v1, v2) => {
                    Contribution::of(v1, w1).and_then(|c| c.combine(Contribution::of(v2, w2)?))
                }
            };
            let value = sum.and_then(|c| c.resolve(false)).ok_or_else(|| overflow(key))?;
            entries.push((key, value));
            Ok(())
        })?;

        tracing::debug!(left = self.len(), right = other.len(), result = entries.len(), "weighted union");
        Ok(self.build_like(entries))
    }

    /// Keys present in both trees, with values `v1*w1 + v2*w2`.
    pub fn weighted_intersection<S2: NodeStore<K, V>>(
        &self,
        w1: Weight,
        other: &Tree<K, V, S2>,
        w2: Weight,
    ) -> Result<Self, TreeError<K>> {
        let mut entries = Vec::new();
        super::merge_join(self.iter(), other.iter(), |key, side| {
            if let super::Side::Both(v1, v2) = side {
                entries.push((key, merge(v1, w1, v2, w2).ok_or_else(|| overflow(key))?));
            }
            Ok(())
        })?;

        tracing::debug!(left = self.len(), right = other.len(), result = entries.len(), "weighted intersection");
        Ok(self.build_like(entries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::IntTree;
    use crate::storage::MemoryStore;

    fn tree(entries: &[(i32, i64)]) -> IntTree {
        let mut tree = IntTree::in_memory_with(TreeConfig::new(4, 4).expect("valid limits"));
        tree.update(entries.iter().copied()).expect("update");
        tree
    }

    fn entries(tree: &IntTree) -> Vec<(i32, i64)> {
        tree.iter().collect::<Result<_, _>>().expect("iterate")
    }

    #[test]
    fn test_merge_rules() {
        assert_eq!(merge(10i64, 1, 20, 3), Some(70));
        assert_eq!(merge_weight(7i64, -2), Some(-14));
        assert_eq!(normalize(70i64, 4), Some(17));
        assert_eq!(normalize(-70i64, 4), Some(-17));
        assert_eq!(normalize(70i64, 0), Some(70));
        assert_eq!(normalize(70i64, -4), Some(70));
    }

    #[test]
    fn test_merge_overflow() {
        assert_eq!(merge(i64::MAX, 2, 0, 0), None);
        assert_eq!(merge_weight(i32::MAX, 2), None);
        assert_eq!(merge(i64::MAX, 1, i64::MIN, 1), Some(-1));
    }

    #[test]
    fn test_combine_is_commutative_and_associative() {
        let weights = [-3i64, -1, 0, 1, 2, 7];
        let values = [-50i64, -1, 0, 3, 1000];

        for &w1 in &weights {
            for &w2 in &weights {
                for &w3 in &weights {
                    for &v in &values {
                        let a = Contribution::of(v, w1).expect("a");
                        let b = Contribution::of(v + 1, w2).expect("b");
                        let c = Contribution::of(v * 2, w3).expect("c");

                        assert_eq!(a.combine(b), b.combine(a));
                        let left = a.combine(b).and_then(|ab| ab.combine(c));
                        let right = b.combine(c).and_then(|bc| a.combine(bc));
                        assert_eq!(left, right);
                        assert_eq!(
                            left.map(Contribution::normalized),
                            right.map(Contribution::normalized)
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn test_weighted_union() {
        let a = tree(&[(1, 10), (2, 5)]);
        let b = tree(&[(1, 20), (3, 4)]);

        let merged = a.weighted_union(1, &b, 3).expect("union");
        assert_eq!(entries(&merged), vec![(1, 70), (2, 5), (3, 12)]);

        let swapped = b.weighted_union(3, &a, 1).expect("union");
        assert_eq!(entries(&swapped), entries(&merged));
        merged.check().expect("check");
    }

    #[test]
    fn test_weighted_intersection() {
        let a = tree(&[(1, 10), (2, 5)]);
        let b = tree(&[(1, 20), (3, 4)]);

        let merged = a.weighted_intersection(2, &b, -1).expect("intersection");
        assert_eq!(entries(&merged), vec![(1, 0)]);
    }

    #[test]
    fn test_weighted_union_overflow_is_value_error() {
        let a = tree(&[(1, i64::MAX)]);
        let b = tree(&[(1, 1)]);

        assert!(matches!(a.weighted_union(1, &b, 1), Err(TreeError::ValueOutOfRange(_))));
    }

    #[test]
    fn test_accumulator_normalizes_per_key() {
        let a = tree(&[(1, 10), (2, -10)]);
        let b = tree(&[(1, 20), (2, -60)]);

        let mut acc = Accumulator::new();
        acc.add(&a, 1).expect("add");
        acc.add(&b, 3).expect("add");
        assert_eq!(acc.len(), 2);

        let raw: IntTree = acc
            .clone()
            .into_tree(Arc::new(MemoryStore::new()), TreeConfig::default(), false)
            .expect("raw");
        assert_eq!(entries(&raw), vec![(1, 70), (2, -190)]);

        let averaged: IntTree = acc
            .into_tree(Arc::new(MemoryStore::new()), TreeConfig::default(), true)
            .expect("normalized");
        assert_eq!(entries(&averaged), vec![(1, 17), (2, -47)]);
    }

    #[test]
    fn test_accumulator_skips_normalization_for_non_positive_weight() {
        let mut acc: Accumulator<i32> = Accumulator::new();
        acc.add_value(1, 10i64, 2).expect("add");
        acc.add_value(1, 5i64, -2).expect("add");

        let contribution = acc.get(1).expect("present");
        assert_eq!(contribution, Contribution { value: 10, weight: 0 });
        assert_eq!(contribution.normalized(), 10);
    }

    #[test]
    fn test_accumulator_order_independent() {
        let sources = [
            (tree(&[(1, 3), (2, 9)]), 2),
            (tree(&[(1, -4)]), 5),
            (tree(&[(2, 1), (3, 8)]), -1),
        ];

        let mut forward = Accumulator::new();
        for (source, weight) in &sources {
            forward.add(source, *weight).expect("add");
        }
        let mut backward = Accumulator::new();
        for (source, weight) in sources.iter().rev() {
            backward.add(source, *weight).expect("add");
        }

        for key in 1..=3 {
            assert_eq!(forward.get(key), backward.get(key));
        }
    }
}

//! Weighted merges across several file-backed and in-memory trees.

use std::sync::Arc;

use tempfile::tempdir;

use super::helpers::{contents, create_file_tree, small_config};
use crate::btree::{IntTree, TreeConfig};
use crate::merge::{Accumulator, Contribution};
use crate::storage::MemoryStore;

fn tree_of(entries: &[(i32, i64)]) -> IntTree {
    let mut tree = IntTree::in_memory_with(small_config());
    tree.update(entries.iter().copied()).expect("update");
    tree
}

#[test]
fn test_two_source_weighted_average() {
    let a = tree_of(&[(1, 10)]);
    let b = tree_of(&[(1, 20)]);

    let merged = a.weighted_union(1, &b, 3).expect("weighted union");
    assert_eq!(merged.get(1).expect("get"), 70);

    let mut acc = Accumulator::new();
    acc.add(&a, 1).expect("add");
    acc.add(&b, 3).expect("add");
    let averaged: IntTree = acc
        .into_tree(Arc::new(MemoryStore::new()), TreeConfig::default(), true)
        .expect("into tree");
    assert_eq!(averaged.get(1).expect("get"), 17);

    // Truncation is toward zero for negative sums
    let neg = Contribution::of(-10i64, 1)
        .and_then(|c| c.combine(Contribution::of(-20i64, 3)?))
        .expect("no overflow");
    assert_eq!(neg.value, -70);
    assert_eq!(neg.normalized(), -17);
}

#[test]
fn test_many_sources_into_file_store() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("index.db");
    let target = create_file_tree(&path, 16);

    let sources: Vec<(IntTree, i64)> = (1..=4)
        .map(|w| {
            let entries: Vec<(i32, i64)> = (0..200).filter(|k| k % w == 0).map(|k| (k, i64::from(k * w))).collect();
            (tree_of(&entries), i64::from(w))
        })
        .collect();

    let mut acc = Accumulator::new();
    for (tree, weight) in &sources {
        acc.add(tree, *weight).expect("add");
    }
    let merged = acc
        .into_tree(Arc::clone(target.store()), small_config(), false)
        .expect("into tree");
    merged.check().expect("check");
    assert_eq!(merged.len(), 200);

    // Key 12 appears in every source: 12*1*1 + 12*2*2 + 12*3*3 + 12*4*4
    assert_eq!(merged.get(12).expect("get"), 12 * 30);
    // Key 1 only in the first
    assert_eq!(merged.get(1).expect("get"), 1);

    let snapshot = merged.commit().expect("commit");
    assert_eq!(snapshot.len, 200);
}

#[test]
fn test_weighted_intersection_and_zero_weight() {
    let a = tree_of(&[(1, 5), (2, 6), (3, 7)]);
    let b = tree_of(&[(2, 100), (3, -100), (4, 1)]);

    let both = a.weighted_intersection(2, &b, 1).expect("intersection");
    assert_eq!(contents(&both), vec![(2, 112), (3, -86)]);

    // Zero weight keeps keys but drops their contribution
    let only_left = a.weighted_union(1, &b, 0).expect("union");
    assert_eq!(contents(&only_left), vec![(1, 5), (2, 6), (3, 7), (4, 0)]);

    let c = Contribution::of(9i64, 0).expect("no overflow");
    assert_eq!(c.normalized(), 0);
    assert_eq!(c.resolve::<i64>(true), Some(0));
}

#[test]
fn test_weighted_overflow_is_value_out_of_range() {
    let a = tree_of(&[(1, i64::MAX)]);
    let b = tree_of(&[(1, i64::MAX)]);
    assert!(matches!(
        a.weighted_union(1, &b, 1),
        Err(crate::btree::TreeError::ValueOutOfRange(_))
    ));
}

//! Two branches forked from one committed version are reconciled.

use tempfile::tempdir;

use super::helpers::{Model, assert_matches_model, contents, create_file_tree};
use crate::btree::TreeError;
use crate::merge::reconcile;

#[test]
fn test_reconcile_divergent_branches() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("index.db");

    let mut base = create_file_tree(&path, 64);
    base.update((0..100).map(|k| (k, 100))).expect("update");
    base.commit().expect("commit");

    let mut mine = base.clone();
    let mut theirs = base.clone();

    // Disjoint edits
    mine.set(1, 150).expect("set");
    theirs.set(2, 80).expect("set");
    // Same edit on both sides
    mine.set(3, 7).expect("set");
    theirs.set(3, 7).expect("set");
    // Concurrent edits of one counter combine their deltas
    mine.set(4, 110).expect("set");
    theirs.set(4, 130).expect("set");
    // Deleted on one side only
    mine.delete(5).expect("delete");
    // Deleted on both
    mine.delete(6).expect("delete");
    theirs.delete(6).expect("delete");
    // Added on both with different values
    mine.set(500, 3).expect("set");
    theirs.set(500, 4).expect("set");
    theirs.set(600, 9).expect("set");

    let merged = reconcile(&base, &mine, &theirs).expect("reconcile");

    let mut expected: Model = (0..100).map(|k| (k, 100)).collect();
    expected.insert(1, 150);
    expected.insert(2, 80);
    expected.insert(3, 7);
    expected.insert(4, 140);
    expected.remove(&5);
    expected.remove(&6);
    expected.insert(500, 7);
    expected.insert(600, 9);
    assert_matches_model(&merged, &expected);

    // Inputs are untouched
    let base_model: Model = (0..100).map(|k| (k, 100)).collect();
    assert_matches_model(&base, &base_model);
    assert_eq!(mine.get(4).expect("get"), 110);
    assert_eq!(theirs.find(5).expect("find"), Some(100));

    merged.commit().expect("commit");
}

#[test]
fn test_delete_against_modify_conflicts() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("index.db");

    let mut base = create_file_tree(&path, 64);
    base.update((0..20).map(|k| (k, 1))).expect("update");
    base.commit().expect("commit");

    let mut mine = base.clone();
    let mut theirs = base.clone();
    mine.delete(9).expect("delete");
    theirs.set(9, 2).expect("set");

    assert!(matches!(reconcile(&base, &mine, &theirs), Err(TreeError::Conflict(9))));
    assert!(matches!(reconcile(&base, &theirs, &mine), Err(TreeError::Conflict(9))));

    // Without the racing modification the delete goes through
    let merged = reconcile(&base, &mine, &base).expect("reconcile");
    assert_eq!(merged.len(), 19);
    assert_eq!(contents(&merged).first(), Some(&(0, 1)));
}

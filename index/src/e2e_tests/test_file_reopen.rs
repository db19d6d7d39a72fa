//! A file-backed tree survives reopen at every commit point, and uncommitted
//! work is discarded.

use tempfile::tempdir;

use super::helpers::{Model, apply, assert_matches_model, create_file_tree, random_ops, reopen_file_tree};

#[test]
fn test_reopen_after_each_commit() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("index.db");

    let mut tree = create_file_tree(&path, 32);
    let mut model = Model::new();

    for (round, chunk) in random_ops(11, 1200, 400).chunks(150).enumerate() {
        for op in chunk {
            apply(&mut tree, &mut model, *op).expect("op");
        }
        tree.commit().expect("commit");

        // Uncommitted work after the last commit must not survive
        tree.set(-1, i64::try_from(round).expect("small")).expect("set");

        drop(tree);
        tree = reopen_file_tree(&path, 32);
        assert_matches_model(&tree, &model);
    }
}

#[test]
fn test_released_nodes_reload_from_disk() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("index.db");

    let mut tree = create_file_tree(&path, 0);
    let mut model = Model::new();
    for key in 0..500 {
        tree.set(key, i64::from(key) * 3).expect("set");
        model.insert(key, i64::from(key) * 3);
    }
    tree.commit().expect("commit");

    assert!(tree.release() > 0);
    let reads_before = tree.store().stats().pages_read;
    assert_matches_model(&tree, &model);
    assert!(tree.store().stats().pages_read > reads_before);
}

#[test]
fn test_snapshot_survives_later_commits() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("index.db");

    let mut tree = create_file_tree(&path, 16);
    tree.update((0..300).map(|k| (k, 1))).expect("update");
    tree.commit().expect("commit");
    let snapshot = tree.clone();

    for key in (0..300).step_by(2) {
        tree.delete(key).expect("delete");
    }
    tree.set(1000, 2).expect("set");
    tree.commit().expect("commit");

    // Committed pages are never rewritten, so the old version stays readable
    let old: Model = (0..300).map(|k| (k, 1)).collect();
    assert_matches_model(&snapshot, &old);
    assert_eq!(tree.len(), 151);

    drop(snapshot);
    drop(tree);
    let reopened = reopen_file_tree(&path, 16);
    assert_eq!(reopened.len(), 151);
    assert_eq!(reopened.find(0).expect("find"), None);
    assert_eq!(reopened.get(1000).expect("get"), 2);
}

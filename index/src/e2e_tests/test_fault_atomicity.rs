//! Injected store failures never leave a tree half-modified.

use std::sync::Arc;

use super::helpers::{Model, apply, assert_matches_model, random_ops, small_config};
use crate::btree::{Tree, TreeError};
use crate::storage::{FaultConfig, FaultyStore, MemoryStore, NodeStore, StoreError};

type FaultyTree = Tree<i32, i64, FaultyStore<MemoryStore<i32, i64>>>;

fn committed_tree(seed: u64, keys: i32) -> (FaultyTree, Model) {
    let store = Arc::new(FaultyStore::new(MemoryStore::new(), seed));
    let mut tree = Tree::new(Arc::clone(&store), small_config());
    let mut model = Model::new();
    for key in 0..keys {
        tree.set(key * 2, i64::from(key)).expect("set");
        model.insert(key * 2, i64::from(key));
    }
    let snapshot = tree.commit().expect("commit");

    // Reopen so that everything below the root is a ghost
    let tree = Tree::open(store, snapshot, small_config()).expect("open");
    (tree, model)
}

#[test]
fn test_failed_loads_leave_tree_unchanged() {
    let (mut tree, mut model) = committed_tree(3, 300);
    let store = Arc::clone(tree.store());
    let faults = FaultConfig {
        load_error_rate: 0.3,
        ..FaultConfig::default()
    };

    let mut failures = 0;
    for op in random_ops(5, 400, 700) {
        store.set_fault_config(faults);
        match apply(&mut tree, &mut model, op) {
            Ok(()) => {}
            Err(TreeError::Adapter(StoreError::InjectedFault(_))) => {
                failures += 1;
                store.set_fault_config(FaultConfig::no_faults());
                assert_matches_model(&tree, &model);
                let _ = tree.release();
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    assert!(failures > 0);
    store.set_fault_config(FaultConfig::no_faults());
    assert_matches_model(&tree, &model);
}

#[test]
fn test_failed_commit_can_be_retried() {
    let (mut tree, mut model) = committed_tree(8, 200);
    let store = Arc::clone(tree.store());
    let before = NodeStore::<i32, i64>::last_commit(&*store);

    for op in random_ops(9, 200, 500) {
        apply(&mut tree, &mut model, op).expect("op");
    }

    store.set_fault_config(FaultConfig {
        save_error_rate: 0.2,
        ..FaultConfig::default()
    });
    let mut attempts = 0;
    let snapshot = loop {
        attempts += 1;
        match tree.commit() {
            Ok(snapshot) => break snapshot,
            Err(TreeError::Adapter(StoreError::InjectedFault(_))) => {
                assert_eq!(NodeStore::<i32, i64>::last_commit(&*store), before);
                assert!(attempts < 1000, "commit never succeeded");
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
    };

    store.set_fault_config(FaultConfig::no_faults());
    let reopened: FaultyTree = Tree::open(store, snapshot, small_config()).expect("open");
    assert_matches_model(&reopened, &model);
}

#[test]
fn test_failed_open_reports_adapter_error() {
    let (tree, _) = committed_tree(1, 50);
    let store = Arc::clone(tree.store());
    let snapshot = tree.commit().expect("commit");
    drop(tree);

    store.set_fault_config(FaultConfig::failing_loads());
    let result: Result<FaultyTree, _> = Tree::open(store, snapshot, small_config());
    assert!(matches!(result, Err(TreeError::Adapter(StoreError::InjectedFault(_)))));
}

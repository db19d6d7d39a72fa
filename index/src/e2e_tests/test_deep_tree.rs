//! Growing a tree many levels deep and shrinking it back to a single bucket.

use std::sync::Arc;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use super::helpers::{Model, assert_matches_model, small_config};
use crate::btree::{IntTree, Scalar, Tree, TreeConfig, TreeError};
use crate::storage::MemoryStore;

#[test]
fn test_ascending_inserts_grow_one_level_at_bucket_limit() {
    let mut tree = IntTree::in_memory_with(TreeConfig::default());
    for key in 1..=500 {
        tree.insert(key, i64::from(key)).expect("insert");
        if key == 120 {
            assert_eq!(tree.height().expect("height"), 1);
        }
        if key == 121 {
            assert_eq!(tree.height().expect("height"), 2);
        }
    }

    let keys: Vec<i32> = tree.keys().collect::<Result<_, _>>().expect("keys");
    assert_eq!(keys, (1..=500).collect::<Vec<_>>());
    tree.check().expect("check");
}

#[test]
fn test_shuffled_grow_and_shrink() {
    let mut rng = StdRng::seed_from_u64(21);
    let mut keys: Vec<i32> = (0..5000).collect();
    keys.shuffle(&mut rng);

    let mut tree = IntTree::in_memory_with(small_config());
    let mut model = Model::new();
    for key in &keys {
        tree.insert(*key, i64::from(*key) - 2500).expect("insert");
        model.insert(*key, i64::from(*key) - 2500);
    }
    assert!(tree.height().expect("height") >= 6);
    assert_matches_model(&tree, &model);

    keys.shuffle(&mut rng);
    for (i, key) in keys.iter().enumerate() {
        assert_eq!(tree.delete(*key).expect("delete"), i64::from(*key) - 2500);
        model.remove(key);
        if i % 500 == 0 {
            assert_matches_model(&tree, &model);
        }
    }

    assert!(tree.is_empty());
    assert_eq!(tree.height().expect("height"), 1);
    assert_eq!(tree.min_key().expect("min"), None);
    tree.check().expect("check");
}

#[test]
fn test_bulk_built_tree_accepts_mutations() {
    let mut tree: IntTree = Tree::from_entries(Arc::new(MemoryStore::new()), small_config(), (0..2000).map(|k| (k * 3, i64::from(k))));
    let mut model: Model = (0..2000).map(|k| (k * 3, i64::from(k))).collect();
    tree.check().expect("check");

    for key in (0..6000).step_by(7) {
        if model.remove(&key).is_some() {
            tree.delete(key).expect("delete");
        } else {
            tree.insert(key, -1).expect("insert");
            model.insert(key, -1);
        }
    }
    assert_matches_model(&tree, &model);
    assert_eq!(tree.min_key_from(1).expect("min_key_from"), model.range(1..).next().map(|(k, _)| *k));
    assert_eq!(tree.max_key_to(5000).expect("max_key_to"), model.range(..=5000).next_back().map(|(k, _)| *k));
}

#[test]
fn test_scalar_rejections_change_nothing() {
    let mut tree = IntTree::in_memory_with(small_config());
    tree.update((0..50).map(|k| (k, 0))).expect("update");

    let bad = [
        (Scalar::Int(i128::from(i32::MAX) + 1), Scalar::Int(1)),
        (Scalar::Int(1), Scalar::Float(1.5)),
        (Scalar::Text("x".to_string()), Scalar::Int(1)),
        (Scalar::Int(1), Scalar::Int(i128::from(i64::MIN) - 1)),
    ];
    for (key, value) in &bad {
        let result = tree.set_scalar(key, value);
        assert!(matches!(
            result,
            Err(TreeError::KeyOutOfRange(_) | TreeError::ValueOutOfRange(_))
        ));
    }

    assert_eq!(tree.len(), 50);
    assert_eq!(tree.get(1).expect("get"), 0);
    tree.check().expect("check");
}

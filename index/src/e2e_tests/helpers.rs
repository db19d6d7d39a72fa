use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::btree::{Tree, TreeConfig, TreeError};
use crate::storage::{FileStore, NodeStore};

pub type Model = BTreeMap<i32, i64>;

/// Limits small enough that a few hundred keys build several levels.
pub fn small_config() -> TreeConfig {
    TreeConfig::new(4, 4).expect("valid limits")
}

pub fn create_file_tree(path: &Path, cache_nodes: usize) -> Tree<i32, i64, FileStore<i32, i64>> {
    let store = FileStore::create(path, small_config(), cache_nodes).expect("create file store");
    Tree::new(Arc::new(store), small_config())
}

pub fn reopen_file_tree(path: &Path, cache_nodes: usize) -> Tree<i32, i64, FileStore<i32, i64>> {
    let store = Arc::new(FileStore::open(path, cache_nodes).expect("open file store"));
    let config = store.config();
    Tree::open_latest(store, config).expect("open tree")
}

/// Collect the full contents of a tree.
pub fn contents<S: NodeStore<i32, i64>>(tree: &Tree<i32, i64, S>) -> Vec<(i32, i64)> {
    tree.iter().collect::<Result<_, _>>().expect("iterate")
}

pub fn assert_matches_model<S: NodeStore<i32, i64>>(tree: &Tree<i32, i64, S>, model: &Model) {
    tree.check().expect("tree invariants");
    assert_eq!(tree.len(), model.len());
    let expected: Vec<(i32, i64)> = model.iter().map(|(k, v)| (*k, *v)).collect();
    assert_eq!(contents(tree), expected);
}

/// One step of a random workload.
#[derive(Debug, Clone, Copy)]
pub enum Op {
    Set(i32, i64),
    Insert(i32, i64),
    Delete(i32),
}

pub fn random_ops(seed: u64, count: usize, key_space: i32) -> Vec<Op> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|_| {
            let key = rng.random_range(0..key_space);
            let value = rng.random_range(-1000..1000);
            match rng.random_range(0..10) {
                0..=4 => Op::Set(key, value),
                5..=6 => Op::Insert(key, value),
                _ => Op::Delete(key),
            }
        })
        .collect()
}

/// Apply `op` to the tree, and to the model only if the tree accepted it.
pub fn apply<S: NodeStore<i32, i64>>(
    tree: &mut Tree<i32, i64, S>,
    model: &mut Model,
    op: Op,
) -> Result<(), TreeError<i32>> {
    match op {
        Op::Set(key, value) => {
            tree.set(key, value)?;
            model.insert(key, value);
        }
        Op::Insert(key, value) => match tree.insert(key, value) {
            Ok(()) => {
                model.insert(key, value);
            }
            Err(TreeError::KeyExists(_)) => assert!(model.contains_key(&key)),
            Err(e) => return Err(e),
        },
        Op::Delete(key) => match tree.delete(key) {
            Ok(old) => assert_eq!(model.remove(&key), Some(old)),
            Err(TreeError::NotFound(_)) => assert!(!model.contains_key(&key)),
            Err(e) => return Err(e),
        },
    }
    Ok(())
}

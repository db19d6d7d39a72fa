//! Bottom-up bulk loading from sorted entries, and node-for-node copies of a
//! tree into another store.
//!
//! Used by set algebra and merges, which produce their output in key order.
//! Entries are packed into evenly sized buckets, then each level of internal
//! nodes is packed the same way until a single root remains. Even chunking
//! keeps every non-root node at or above its minimum occupancy.

use std::sync::Arc;

use crate::btree::bucket::{Bucket, Entry};
use crate::btree::error::TreeError;
use crate::btree::node::{Contents, Node, NodeRef};
use crate::btree::tree::{Tree, TreeConfig};
use crate::btree::value::{TreeKey, TreeValue};
use crate::storage::{NodeId, NodeStore, Snapshot};

/// Sizes of `ceil(total / max)` chunks that differ by at most one.
fn chunk_sizes(total: usize, max: usize) -> impl Iterator<Item = usize> {
    let count = total.div_ceil(max).max(1);
    let base = total / count;
    let extra = total % count;
    (0..count).map(move |i| base + usize::from(i < extra))
}

/// Build a tree from entries that are strictly increasing by key.
pub(crate) fn bulk_load<K: TreeKey, V: TreeValue, S: NodeStore<K, V>>(
    store: Arc<S>,
    config: TreeConfig,
    entries: Vec<(K, V)>,
) -> Tree<K, V, S> {
    let len = entries.len();
    if len <= config.max_bucket_size() {
        let bucket = Bucket::from_sorted(
            entries
                .into_iter()
                .map(|(key, value)| Entry { key, value })
                .collect(),
        );
        let root = NodeRef::fresh(&*store, Contents::Bucket(bucket));
        return Tree::from_root(store, root, len, config);
    }

    // Leaf level: (first key, reference) per bucket
    let mut level: Vec<(K, NodeRef<K, V>)> = Vec::new();
    let mut entries = entries.into_iter();
    for size in chunk_sizes(len, config.max_bucket_size()) {
        let chunk: Vec<Entry<K, V>> = entries
            .by_ref()
            .take(size)
            .map(|(key, value)| Entry { key, value })
            .collect();
        let first = chunk[0].key;
        level.push((first, NodeRef::fresh(&*store, Contents::Bucket(Bucket::from_sorted(chunk)))));
    }
    let buckets = level.len();

    let mut height = 1;
    while level.len() > 1 {
        let mut parents = Vec::new();
        let mut children = level.into_iter();
        for size in chunk_sizes(children.len(), config.max_btree_size()) {
            let group: Vec<(K, NodeRef<K, V>)> = children.by_ref().take(size).collect();
            let first = group[0].0;
            let keys: Vec<K> = group[1..].iter().map(|(key, _)| *key).collect();
            let refs: Vec<NodeRef<K, V>> = group.into_iter().map(|(_, child)| child).collect();
            let node = Node::from_parts(keys, refs);
            parents.push((first, NodeRef::fresh(&*store, Contents::Node(node))));
        }
        level = parents;
        height += 1;
    }

    tracing::debug!(entries = len, buckets, height, "bulk loaded tree");
    let root = level.into_iter().next().map(|(_, root)| root);
    match root {
        Some(root) => Tree::from_root(store, root, len, config),
        None => Tree::new(store, config),
    }
}

impl<K: TreeKey, V: TreeValue, S: NodeStore<K, V>> Tree<K, V, S> {
    /// A new tree on this tree's store, built from strictly increasing entries.
    #[allow(clippy::disallowed_methods)] // Arc::clone is required for shared ownership
    pub(crate) fn build_like(&self, entries: Vec<(K, V)>) -> Self {
        bulk_load(Arc::clone(self.store()), self.config(), entries)
    }

    /// Copy this version of the tree into `store`, node for node.
    ///
    /// Every node is saved to `store` as it is copied, so the result has no
    /// dirty nodes; committing it only records the snapshot. Nodes this tree
    /// has not activated are read straight from its store and never cached in
    /// this tree, so memory use stays proportional to the tree's height.
    pub fn copy_into<S2: NodeStore<K, V>>(&self, store: Arc<S2>) -> Result<Tree<K, V, S2>, TreeError<K>> {
        let mut copied = 0usize;
        let root = copy_node(self.root(), &**self.store(), &*store, &mut copied)?;
        tracing::debug!(copied, root, "copied tree");

        let snapshot = Snapshot {
            root,
            len: self.len() as u64,
        };
        Tree::open(store, snapshot, self.config())
    }
}

fn copy_node<K: TreeKey, V: TreeValue, S: NodeStore<K, V> + ?Sized, S2: NodeStore<K, V> + ?Sized>(
    node_ref: &NodeRef<K, V>,
    from: &S,
    to: &S2,
    copied: &mut usize,
) -> Result<NodeId, TreeError<K>> {
    let loaded;
    let contents = if let Some(contents) = node_ref.contents() {
        contents
    } else {
        loaded = from.load(node_ref.id())?;
        &loaded
    };

    let copy = match contents {
        Contents::Bucket(bucket) => Contents::Bucket(bucket.clone()),
        Contents::Node(node) => {
            let children = node
                .children()
                .iter()
                .map(|child| copy_node(child, from, to, copied).map(NodeRef::unloaded))
                .collect::<Result<Vec<_>, _>>()?;
            Contents::Node(Node::from_parts(node.keys().to_vec(), children))
        }
    };

    let id = to.new_reference(&copy);
    to.save(id, &copy)?;
    *copied += 1;
    Ok(id)
}

//! B-tree implementation for the integer index.
//!
//! The tree stores fixed-width keys and values in leaf buckets under
//! bounded-fanout internal nodes. Nodes are activated lazily through a
//! [`NodeStore`] and copied on write, so a cloned tree is an independent
//! snapshot that shares every untouched node with its origin.
//!
//! # Mutation protocol
//!
//! Every mutating operation runs in two phases:
//! 1. Activate every node it may touch (the root-to-bucket path, plus the
//!    siblings of each path node for deletes) and validate the request.
//! 2. Copy-on-write down the path, apply the change to the bucket, then split
//!    or merge on the way back up.
//!
//! Store access can only fail in phase 1, so a failed operation leaves the
//! tree exactly as it was.

use std::sync::Arc;

use crate::btree::bucket::{Bucket, Insertion};
use crate::btree::build::bulk_load;
use crate::btree::error::TreeError;
use crate::btree::node::{Contents, Node, NodeRef};
use crate::btree::value::{Scalar, TreeKey, TreeValue};
use crate::storage::{MemoryStore, NodeId, NodeStore, Snapshot};

/// Default maximum number of entries in a bucket.
pub const MAX_BUCKET_SIZE: usize = 120;

/// Default maximum number of children of an internal node.
pub const MAX_BTREE_SIZE: usize = 500;

/// Node capacity limits.
///
/// # Invariants
/// - Both limits are >= [`TreeConfig::MIN_LIMIT`]
/// - Minimum occupancy of a non-root node is half its limit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeConfig {
    max_bucket_size: usize,
    max_btree_size: usize,
}

impl TreeConfig {
    /// Smallest accepted value for either limit.
    pub const MIN_LIMIT: usize = 4;

    /// Create a configuration, or `None` if either limit is below
    /// [`Self::MIN_LIMIT`].
    #[must_use]
    pub const fn new(max_bucket_size: usize, max_btree_size: usize) -> Option<Self> {
        if max_bucket_size < Self::MIN_LIMIT || max_btree_size < Self::MIN_LIMIT {
            return None;
        }
        Some(Self {
            max_bucket_size,
            max_btree_size,
        })
    }

    #[must_use]
    pub const fn max_bucket_size(&self) -> usize {
        self.max_bucket_size
    }

    #[must_use]
    pub const fn max_btree_size(&self) -> usize {
        self.max_btree_size
    }

    #[must_use]
    pub const fn min_bucket_size(&self) -> usize {
        self.max_bucket_size / 2
    }

    #[must_use]
    pub const fn min_btree_size(&self) -> usize {
        self.max_btree_size / 2
    }
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            max_bucket_size: MAX_BUCKET_SIZE,
            max_btree_size: MAX_BTREE_SIZE,
        }
    }
}

/// A separator and the new right sibling produced by a split.
type Split<K, V> = Option<(K, NodeRef<K, V>)>;

/// An ordered map from `K` to `V` backed by a node store.
///
/// Dropping a tree hands the ids of its uncommitted nodes back to the store,
/// except for nodes still shared with a clone.
pub struct Tree<K: TreeKey, V: TreeValue, S: NodeStore<K, V>> {
    store: Arc<S>,
    root: NodeRef<K, V>,
    len: usize,
    config: TreeConfig,
}

/// The default instantiation: `i32` keys, `i64` values, in memory.
pub type IntTree = Tree<i32, i64, MemoryStore<i32, i64>>;

impl<K: TreeKey, V: TreeValue> Tree<K, V, MemoryStore<K, V>> {
    /// Create an empty tree with its own in-memory store.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()), TreeConfig::default())
    }

    /// Create an empty in-memory tree with custom limits.
    #[must_use]
    pub fn in_memory_with(config: TreeConfig) -> Self {
        Self::new(Arc::new(MemoryStore::new()), config)
    }
}

impl<K: TreeKey, V: TreeValue, S: NodeStore<K, V>> Tree<K, V, S> {
    /// Create a new empty tree whose nodes live in `store`.
    #[must_use]
    pub fn new(store: Arc<S>, config: TreeConfig) -> Self {
        let root = NodeRef::fresh(&*store, Contents::Bucket(Bucket::new()));
        Self {
            store,
            root,
            len: 0,
            config,
        }
    }

    /// Open a committed version. Only the root is activated.
    pub fn open(store: Arc<S>, snapshot: Snapshot, config: TreeConfig) -> Result<Self, TreeError<K>> {
        let len = usize::try_from(snapshot.len)
            .map_err(|_| TreeError::invariant(format!("snapshot length {} overflows", snapshot.len)))?;
        let root = NodeRef::unloaded(snapshot.root);
        root.activate(&*store)?;

        tracing::info!(root = snapshot.root, len, "opened tree");
        Ok(Self {
            store,
            root,
            len,
            config,
        })
    }

    /// Open the store's latest committed version, or start an empty tree.
    pub fn open_latest(store: Arc<S>, config: TreeConfig) -> Result<Self, TreeError<K>> {
        match store.last_commit() {
            Some(snapshot) => Self::open(store, snapshot, config),
            None => Ok(Self::new(store, config)),
        }
    }

    /// Build a tree from arbitrary entries. Later duplicates win.
    #[must_use]
    pub fn from_entries(
        store: Arc<S>,
        config: TreeConfig,
        entries: impl IntoIterator<Item = (K, V)>,
    ) -> Self {
        let mut entries: Vec<(K, V)> = entries.into_iter().collect();
        entries.sort_by_key(|(k, _)| *k);

        let mut deduped: Vec<(K, V)> = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            match deduped.last_mut() {
                Some(last) if last.0 == key => last.1 = value,
                _ => deduped.push((key, value)),
            }
        }

        bulk_load(store, config, deduped)
    }

    pub(crate) const fn from_root(
        store: Arc<S>,
        root: NodeRef<K, V>,
        len: usize,
        config: TreeConfig,
    ) -> Self {
        Self {
            store,
            root,
            len,
            config,
        }
    }

    /// A new empty tree sharing this tree's store and limits.
    #[must_use]
    #[allow(clippy::disallowed_methods)] // Arc::clone is required for shared ownership
    pub fn empty_like(&self) -> Self {
        Self::new(Arc::clone(&self.store), self.config)
    }

    /// Number of entries.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub const fn config(&self) -> TreeConfig {
        self.config
    }

    #[must_use]
    pub const fn store(&self) -> &Arc<S> {
        &self.store
    }

    #[must_use]
    pub const fn root_id(&self) -> NodeId {
        self.root.id()
    }

    pub(crate) const fn root(&self) -> &NodeRef<K, V> {
        &self.root
    }

    /// Convert boundary input into a key.
    pub fn coerce_key(scalar: &Scalar) -> Result<K, TreeError<K>> {
        K::from_scalar(scalar).map_err(|e| TreeError::from_key_scalar(scalar, e))
    }

    /// Convert boundary input into a value.
    pub fn coerce_value(scalar: &Scalar) -> Result<V, TreeError<K>> {
        V::from_scalar(scalar).map_err(|e| TreeError::from_value_scalar(scalar, e))
    }

    // ========== Lookups ==========

    /// Find the bucket that covers `key`.
    fn find_bucket(&self, key: &K) -> Result<&Bucket<K, V>, TreeError<K>> {
        let store = &*self.store;
        let mut contents = self.root.activate(store)?;

        loop {
            match contents {
                Contents::Bucket(bucket) => return Ok(bucket),
                Contents::Node(node) => contents = node.child_for(key).activate(store)?,
            }
        }
    }

    /// Look up a value, returning `None` if the key is absent.
    pub fn find(&self, key: K) -> Result<Option<V>, TreeError<K>> {
        Ok(self.find_bucket(&key)?.get(&key))
    }

    /// Look up a value, failing with `NotFound` if the key is absent.
    pub fn get(&self, key: K) -> Result<V, TreeError<K>> {
        self.find(key)?.ok_or(TreeError::NotFound(key))
    }

    pub fn has_key(&self, key: K) -> Result<bool, TreeError<K>> {
        Ok(self.find(key)?.is_some())
    }

    /// Number of levels, counting the bucket level. An empty tree has height 1.
    pub fn height(&self) -> Result<usize, TreeError<K>> {
        let store = &*self.store;
        let mut height = 1;
        let mut contents = self.root.activate(store)?;

        while let Contents::Node(node) = contents {
            height += 1;
            contents = node.children[0].activate(store)?;
        }
        Ok(height)
    }

    /// Smallest key.
    pub fn min_key(&self) -> Result<Option<K>, TreeError<K>> {
        self.first_key(self.root.activate(&*self.store)?, None)
    }

    /// Largest key.
    pub fn max_key(&self) -> Result<Option<K>, TreeError<K>> {
        self.last_key(self.root.activate(&*self.store)?, None)
    }

    /// Smallest key `>= lower`.
    pub fn min_key_from(&self, lower: K) -> Result<Option<K>, TreeError<K>> {
        self.first_key(self.root.activate(&*self.store)?, Some(&lower))
    }

    /// Largest key `<= upper`.
    pub fn max_key_to(&self, upper: K) -> Result<Option<K>, TreeError<K>> {
        self.last_key(self.root.activate(&*self.store)?, Some(&upper))
    }

    fn first_key(&self, contents: &Contents<K, V>, lower: Option<&K>) -> Result<Option<K>, TreeError<K>> {
        match contents {
            Contents::Bucket(bucket) => Ok(lower.map_or_else(|| bucket.min_key(), |lo| bucket.first_at_least(lo))),
            Contents::Node(node) => {
                let start = lower.map_or(0, |lo| node.child_index(lo));
                for child in &node.children[start..] {
                    if let Some(key) = self.first_key(child.activate(&*self.store)?, lower)? {
                        return Ok(Some(key));
                    }
                }
                Ok(None)
            }
        }
    }

    fn last_key(&self, contents: &Contents<K, V>, upper: Option<&K>) -> Result<Option<K>, TreeError<K>> {
        match contents {
            Contents::Bucket(bucket) => Ok(upper.map_or_else(|| bucket.max_key(), |hi| bucket.last_at_most(hi))),
            Contents::Node(node) => {
                let end = upper.map_or(node.len() - 1, |hi| node.child_index(hi));
                for child in node.children[..=end].iter().rev() {
                    if let Some(key) = self.last_key(child.activate(&*self.store)?, upper)? {
                        return Ok(Some(key));
                    }
                }
                Ok(None)
            }
        }
    }

    // ========== Mutations ==========

    /// Activate every node on the path to `key`, and their adjacent siblings
    /// when `with_siblings` is set.
    fn activate_path(&self, key: &K, with_siblings: bool) -> Result<(), TreeError<K>> {
        let store = &*self.store;
        let mut contents = self.root.activate(store)?;

        while let Contents::Node(node) = contents {
            let idx = node.child_index(key);
            if with_siblings {
                if idx > 0 {
                    node.children[idx - 1].activate(store)?;
                }
                if let Some(right) = node.children.get(idx + 1) {
                    right.activate(store)?;
                }
            }
            contents = node.children[idx].activate(store)?;
        }
        Ok(())
    }

    /// Insert or replace. Returns the previous value, if any.
    ///
    /// Setting a key to the value it already has changes nothing.
    pub fn set(&mut self, key: K, value: V) -> Result<Option<V>, TreeError<K>> {
        self.activate_path(&key, false)?;
        let existing = self.find(key)?;
        if existing == Some(value) {
            return Ok(existing);
        }

        match self.insert_entry(key, value, true)? {
            Insertion::Replaced(old) => Ok(Some(old)),
            Insertion::Inserted => Ok(None),
            Insertion::Conflict => Err(TreeError::invariant("replacing insert reported a conflict")),
        }
    }

    /// Insert a new key, failing with `KeyExists` if it is present.
    pub fn insert(&mut self, key: K, value: V) -> Result<(), TreeError<K>> {
        self.activate_path(&key, false)?;
        if self.find(key)?.is_some() {
            return Err(TreeError::KeyExists(key));
        }

        match self.insert_entry(key, value, false)? {
            Insertion::Inserted => Ok(()),
            Insertion::Replaced(_) | Insertion::Conflict => {
                Err(TreeError::invariant("key appeared between validation and insert"))
            }
        }
    }

    /// Insert or replace from scalar input, validating both before any change.
    pub fn set_scalar(&mut self, key: &Scalar, value: &Scalar) -> Result<Option<V>, TreeError<K>> {
        let key = Self::coerce_key(key)?;
        let value = Self::coerce_value(value)?;
        self.set(key, value)
    }

    /// Set every entry in turn.
    pub fn update(&mut self, entries: impl IntoIterator<Item = (K, V)>) -> Result<(), TreeError<K>> {
        for (key, value) in entries {
            self.set(key, value)?;
        }
        Ok(())
    }

    fn insert_entry(&mut self, key: K, value: V, replace: bool) -> Result<Insertion<V>, TreeError<K>> {
        let store = &*self.store;
        let (outcome, split) = insert_into(&mut self.root, key, value, replace, store, &self.config)?;

        if let Some((separator, right)) = split {
            // Create a new root with the old root and its new sibling
            let left = std::mem::replace(&mut self.root, NodeRef::unloaded(0));
            let new_root = Node::with_children(left, separator, right);
            self.root = NodeRef::fresh(store, Contents::Node(new_root));
            tracing::debug!(root = self.root.id(), "root split, tree grew a level");
        }

        if matches!(outcome, Insertion::Inserted) {
            self.len += 1;
        }
        Ok(outcome)
    }

    /// Remove a key, returning its value. Fails with `NotFound` if absent.
    pub fn delete(&mut self, key: K) -> Result<V, TreeError<K>> {
        self.activate_path(&key, true)?;
        if self.find(key)?.is_none() {
            return Err(TreeError::NotFound(key));
        }

        let old = remove_from(&mut self.root, &key, &*self.store, &self.config)?;
        self.len -= 1;
        self.collapse_root();
        Ok(old)
    }

    /// Replace a root node that has a single child with that child.
    fn collapse_root(&mut self) {
        loop {
            let only_child = match self.root.contents() {
                Some(Contents::Node(node)) if node.len() == 1 => node.children[0].clone(),
                _ => return,
            };
            let mut old = std::mem::replace(&mut self.root, only_child);
            if self.store.is_dirty(old.id()) && old.contents_mut_if_unique().is_some() {
                self.store.discard(old.id());
            }
            tracing::debug!(root = self.root.id(), "root collapsed, tree shrank a level");
        }
    }

    // ========== Persistence ==========

    /// Save every dirty node (children before parents) and record the root.
    pub fn commit(&self) -> Result<Snapshot, TreeError<K>> {
        let store = &*self.store;
        let mut saved = 0usize;
        save_dirty(&self.root, store, &mut saved)?;

        let snapshot = Snapshot {
            root: self.root.id(),
            len: self.len as u64,
        };
        store.commit(snapshot)?;

        tracing::info!(root = snapshot.root, len = snapshot.len, saved, "committed tree");
        Ok(snapshot)
    }

    /// Turn clean loaded nodes below the root back into ghosts. Dirty nodes
    /// and nodes shared with another snapshot stay loaded. Returns the number
    /// of references released.
    pub fn release(&mut self) -> usize {
        let store = &*self.store;
        let mut released = 0;
        if let Some(Contents::Node(node)) = self.root.contents_mut_if_unique() {
            release_children(node, store, &mut released);
        }
        tracing::debug!(released, "released clean nodes");
        released
    }

    // ========== Verification ==========

    /// Walk the whole tree and verify ordering, separator bounds, occupancy,
    /// uniform leaf depth and the cached length.
    pub fn check(&self) -> Result<(), TreeError<K>> {
        let mut state = CheckState {
            count: 0,
            leaf_depth: None,
        };
        self.check_node(&self.root, None, None, 0, &mut state)?;

        if state.count != self.len {
            return Err(TreeError::invariant(format!(
                "cached length {} but {} entries found",
                self.len, state.count
            )));
        }
        Ok(())
    }

    fn check_node(
        &self,
        node_ref: &NodeRef<K, V>,
        lower: Option<K>,
        upper: Option<K>,
        depth: usize,
        state: &mut CheckState,
    ) -> Result<(), TreeError<K>> {
        let is_root = depth == 0;
        let id = node_ref.id();

        match node_ref.activate(&*self.store)? {
            Contents::Bucket(bucket) => {
                let len = bucket.len();
                if len > self.config.max_bucket_size || (!is_root && len < self.config.min_bucket_size()) {
                    return Err(TreeError::invariant(format!("bucket {id} has {len} entries")));
                }
                if bucket.entries.windows(2).any(|pair| pair[0].key >= pair[1].key) {
                    return Err(TreeError::invariant(format!("bucket {id} is not strictly increasing")));
                }
                check_bounds(id, bucket.min_key(), bucket.max_key(), lower, upper)?;

                match state.leaf_depth {
                    Some(expected) if expected != depth => {
                        return Err(TreeError::invariant(format!(
                            "bucket {id} at depth {depth}, expected {expected}"
                        )));
                    }
                    Some(_) => {}
                    None => state.leaf_depth = Some(depth),
                }
                state.count += len;
            }
            Contents::Node(node) => {
                let len = node.len();
                if node.keys.len() + 1 != len {
                    return Err(TreeError::invariant(format!(
                        "node {id} has {} separators for {len} children",
                        node.keys.len()
                    )));
                }
                let min = if is_root { 2 } else { self.config.min_btree_size() };
                if len < min || len > self.config.max_btree_size {
                    return Err(TreeError::invariant(format!("node {id} has {len} children")));
                }
                if node.keys.windows(2).any(|pair| pair[0] >= pair[1]) {
                    return Err(TreeError::invariant(format!("node {id} separators are not sorted")));
                }
                check_bounds(id, node.keys.first().copied(), node.keys.last().copied(), lower, upper)?;

                for (i, child) in node.children.iter().enumerate() {
                    let child_lower = if i == 0 { lower } else { Some(node.keys[i - 1]) };
                    let child_upper = node.keys.get(i).copied().or(upper);
                    self.check_node(child, child_lower, child_upper, depth + 1, state)?;
                }
            }
        }
        Ok(())
    }
}

impl<K: TreeKey, V: TreeValue, S: NodeStore<K, V>> Clone for Tree<K, V, S> {
    /// An O(1) snapshot. Both trees share nodes until one of them writes.
    #[allow(clippy::disallowed_methods)] // Arc::clone is required for shared ownership
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            root: self.root.clone(),
            len: self.len,
            config: self.config,
        }
    }
}

impl<K: TreeKey, V: TreeValue, S: NodeStore<K, V>> std::fmt::Debug for Tree<K, V, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tree")
            .field("root", &self.root.id())
            .field("len", &self.len)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<K: TreeKey, V: TreeValue, S: NodeStore<K, V>> Drop for Tree<K, V, S> {
    fn drop(&mut self) {
        let mut discarded = 0usize;
        discard_unshared(&mut self.root, &*self.store, &mut discarded);
        if discarded > 0 {
            tracing::trace!(discarded, "discarded uncommitted nodes");
        }
    }
}

struct CheckState {
    count: usize,
    leaf_depth: Option<usize>,
}

/// Verify that `[first, last]` lies within `[lower, upper)`.
fn check_bounds<K: TreeKey>(
    id: NodeId,
    first: Option<K>,
    last: Option<K>,
    lower: Option<K>,
    upper: Option<K>,
) -> Result<(), TreeError<K>> {
    if let (Some(first), Some(lower)) = (first, lower) {
        if first < lower {
            return Err(TreeError::invariant(format!(
                "node {id} holds {first:?} below its lower bound {lower:?}"
            )));
        }
    }
    if let (Some(last), Some(upper)) = (last, upper) {
        if last >= upper {
            return Err(TreeError::invariant(format!(
                "node {id} holds {last:?} at or above its upper bound {upper:?}"
            )));
        }
    }
    Ok(())
}

/// Insert below `node_ref`, splitting on the way back up.
fn insert_into<K: TreeKey, V: TreeValue, S: NodeStore<K, V> + ?Sized>(
    node_ref: &mut NodeRef<K, V>,
    key: K,
    value: V,
    replace: bool,
    store: &S,
    config: &TreeConfig,
) -> Result<(Insertion<V>, Split<K, V>), TreeError<K>> {
    match node_ref.make_mut(store)? {
        Contents::Bucket(bucket) => {
            let outcome = bucket.insert(key, value, replace);
            if bucket.len() > config.max_bucket_size {
                let (separator, right) = bucket.split();
                let right = NodeRef::fresh(store, Contents::Bucket(right));
                return Ok((outcome, Some((separator, right))));
            }
            Ok((outcome, None))
        }
        Contents::Node(node) => {
            let idx = node.child_index(&key);
            let (outcome, split) = insert_into(&mut node.children[idx], key, value, replace, store, config)?;

            if let Some((separator, right)) = split {
                node.insert_child(separator, right);
                if node.len() > config.max_btree_size {
                    let (median, right_node) = node.split();
                    let right_node = NodeRef::fresh(store, Contents::Node(right_node));
                    return Ok((outcome, Some((median, right_node))));
                }
            }
            Ok((outcome, None))
        }
    }
}

/// Remove `key` below `node_ref`, rebalancing underfull children on the way
/// back up.
fn remove_from<K: TreeKey, V: TreeValue, S: NodeStore<K, V> + ?Sized>(
    node_ref: &mut NodeRef<K, V>,
    key: &K,
    store: &S,
    config: &TreeConfig,
) -> Result<V, TreeError<K>> {
    match node_ref.make_mut(store)? {
        Contents::Bucket(bucket) => bucket.remove(key).ok_or(TreeError::NotFound(*key)),
        Contents::Node(node) => {
            let idx = node.child_index(key);
            let old = remove_from(&mut node.children[idx], key, store, config)?;

            let underfull = match node.children[idx].contents() {
                Some(Contents::Bucket(bucket)) => bucket.len() < config.min_bucket_size(),
                Some(Contents::Node(child)) => child.len() < config.min_btree_size(),
                None => return Err(TreeError::invariant("modified child is not loaded")),
            };
            if underfull {
                rebalance_child(node, idx, store, config)?;
            }
            Ok(old)
        }
    }
}

/// Fix an underfull child by borrowing from an adjacent sibling with spare
/// entries, left first, or merging with a sibling when both are at their
/// minimum.
fn rebalance_child<K: TreeKey, V: TreeValue, S: NodeStore<K, V> + ?Sized>(
    node: &mut Node<K, V>,
    idx: usize,
    store: &S,
    config: &TreeConfig,
) -> Result<(), TreeError<K>> {
    if node.len() < 2 {
        return Ok(());
    }
    let has_spare = |i: usize| match node.children.get(i).and_then(NodeRef::contents) {
        Some(Contents::Bucket(bucket)) => bucket.len() > config.min_bucket_size(),
        Some(Contents::Node(child)) => child.len() > config.min_btree_size(),
        None => false,
    };
    let sibling_idx = if idx > 0 && has_spare(idx - 1) {
        idx - 1
    } else if has_spare(idx + 1) {
        idx + 1
    } else if idx > 0 {
        idx - 1
    } else {
        idx + 1
    };
    let left_idx = idx.min(sibling_idx);
    let separator = node.keys[left_idx];

    let merged = {
        let (head, tail) = node.children.split_at_mut(left_idx + 1);
        let left = head[left_idx].make_mut(store)?;
        let right = tail[0].make_mut(store)?;
        let sibling_len = if sibling_idx < idx { left.len() } else { right.len() };

        match (left, right) {
            (Contents::Bucket(left), Contents::Bucket(right)) => {
                if sibling_len > config.min_bucket_size() {
                    node.keys[left_idx] = left
                        .rebalance_with(right)
                        .ok_or_else(|| TreeError::invariant("bucket redistribution emptied a sibling"))?;
                    false
                } else {
                    left.merge_with(std::mem::take(right));
                    true
                }
            }
            (Contents::Node(left), Contents::Node(right)) => {
                if sibling_len > config.min_btree_size() {
                    node.keys[left_idx] = left
                        .rebalance_with(separator, right)
                        .ok_or_else(|| TreeError::invariant("node redistribution emptied a sibling"))?;
                    false
                } else {
                    let right = std::mem::replace(right, Node::from_parts(Vec::new(), Vec::new()));
                    left.merge_with(separator, right);
                    true
                }
            }
            _ => return Err(TreeError::invariant("siblings at different depths")),
        }
    };

    if merged {
        // Emptied by the merge and exclusively held since make_mut
        let emptied = node.remove_child(left_idx + 1);
        store.discard(emptied.id());
    }
    Ok(())
}

/// Discard the dirty nodes that only `node_ref` holds, children first.
/// Clean nodes only have clean children, so the walk stops at them.
fn discard_unshared<K: TreeKey, V: TreeValue, S: NodeStore<K, V> + ?Sized>(
    node_ref: &mut NodeRef<K, V>,
    store: &S,
    discarded: &mut usize,
) {
    let id = node_ref.id();
    if !store.is_dirty(id) {
        return;
    }
    let Some(contents) = node_ref.contents_mut_if_unique() else {
        return;
    };
    if let Contents::Node(node) = contents {
        for child in &mut node.children {
            discard_unshared(child, store, discarded);
        }
    }
    store.discard(id);
    *discarded += 1;
}

fn save_dirty<K: TreeKey, V: TreeValue, S: NodeStore<K, V> + ?Sized>(
    node_ref: &NodeRef<K, V>,
    store: &S,
    saved: &mut usize,
) -> Result<(), TreeError<K>> {
    if !store.is_dirty(node_ref.id()) {
        return Ok(());
    }
    let Some(contents) = node_ref.contents() else {
        return Err(TreeError::invariant(format!(
            "dirty node {} is not loaded",
            node_ref.id()
        )));
    };

    if let Contents::Node(node) = contents {
        for child in &node.children {
            save_dirty(child, store, saved)?;
        }
    }
    store.save(node_ref.id(), contents)?;
    *saved += 1;
    Ok(())
}

fn release_children<K: TreeKey, V: TreeValue, S: NodeStore<K, V> + ?Sized>(
    node: &mut Node<K, V>,
    store: &S,
    released: &mut usize,
) {
    for child in &mut node.children {
        if !child.is_loaded() {
            continue;
        }
        if store.is_dirty(child.id()) {
            if let Some(Contents::Node(grandchild)) = child.contents_mut_if_unique() {
                release_children(grandchild, store, released);
            }
        } else if child.deactivate() {
            *released += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;
    use crate::storage::StoreError;

    fn small_config() -> TreeConfig {
        TreeConfig::new(4, 4).expect("valid limits")
    }

    fn collect(tree: &IntTree) -> Vec<(i32, i64)> {
        tree.iter().collect::<Result<Vec<_>, _>>().expect("iterate")
    }

    #[test]
    fn test_config_limits() {
        assert!(TreeConfig::new(3, 500).is_none());
        assert!(TreeConfig::new(120, 3).is_none());

        let config = TreeConfig::default();
        assert_eq!(config.max_bucket_size(), 120);
        assert_eq!(config.max_btree_size(), 500);
        assert_eq!(config.min_bucket_size(), 60);
        assert_eq!(config.min_btree_size(), 250);
    }

    #[test]
    fn test_tree_basic_operations() {
        let mut tree = IntTree::in_memory();

        tree.insert(1, 10).expect("insert 1");
        tree.insert(2, 20).expect("insert 2");
        tree.insert(3, 30).expect("insert 3");

        assert_eq!(tree.get(1).expect("get 1"), 10);
        assert_eq!(tree.get(2).expect("get 2"), 20);
        assert_eq!(tree.get(3).expect("get 3"), 30);
        assert!(tree.has_key(2).expect("has_key"));
        assert!(!tree.has_key(4).expect("has_key"));
        assert!(matches!(tree.get(4), Err(TreeError::NotFound(4))));
        assert_eq!(tree.len(), 3);
    }

    #[test]
    fn test_tree_set_returns_previous() {
        let mut tree = IntTree::in_memory();

        assert_eq!(tree.set(5, 50).expect("set"), None);
        assert_eq!(tree.set(5, 55).expect("set"), Some(50));
        assert_eq!(tree.get(5).expect("get"), 55);
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_tree_set_same_value_does_not_copy() {
        let mut tree = IntTree::in_memory();
        tree.set(1, 1).expect("set");
        tree.commit().expect("commit");
        let root = tree.root_id();

        assert_eq!(tree.set(1, 1).expect("set"), Some(1));
        assert_eq!(tree.root_id(), root);
    }

    #[test]
    fn test_tree_insert_existing_fails_without_change() {
        let mut tree = IntTree::in_memory();
        tree.insert(7, 70).expect("insert");

        assert!(matches!(tree.insert(7, 71), Err(TreeError::KeyExists(7))));
        assert_eq!(tree.get(7).expect("get"), 70);
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_tree_delete() {
        let mut tree = IntTree::in_memory();
        tree.insert(1, 10).expect("insert");

        assert_eq!(tree.delete(1).expect("delete"), 10);
        assert!(tree.is_empty());
        assert!(matches!(tree.delete(1), Err(TreeError::NotFound(1))));
    }

    #[test]
    fn test_tree_ascending_growth() {
        let mut tree = IntTree::in_memory();

        for key in 1..=120 {
            tree.insert(key, i64::from(key)).expect("insert");
        }
        assert_eq!(tree.height().expect("height"), 1);

        // The 121st entry overflows the root bucket.
        tree.insert(121, 121).expect("insert");
        assert_eq!(tree.height().expect("height"), 2);

        for key in 122..=500 {
            tree.insert(key, i64::from(key)).expect("insert");
        }
        assert_eq!(tree.height().expect("height"), 2);
        tree.check().expect("check");

        let expected: Vec<(i32, i64)> = (1..=500).map(|k| (k, i64::from(k))).collect();
        assert_eq!(collect(&tree), expected);
    }

    #[test]
    fn test_tree_deep_growth_and_shrink() {
        let mut tree = IntTree::in_memory_with(small_config());

        for key in 0..200 {
            tree.insert(key, i64::from(key)).expect("insert");
            tree.check().expect("check after insert");
        }
        assert!(tree.height().expect("height") >= 4);

        for key in 0..200 {
            tree.delete(key).expect("delete");
            tree.check().expect("check after delete");
        }
        assert!(tree.is_empty());
        assert_eq!(tree.height().expect("height"), 1);
    }

    #[test]
    fn test_tree_delete_after_insert_restores_count() {
        let mut tree = IntTree::in_memory_with(small_config());
        tree.update((0..50).map(|k| (k * 2, i64::from(k)))).expect("update");
        let before = collect(&tree);

        tree.insert(31, 31).expect("insert");
        assert_eq!(tree.len(), 51);
        tree.delete(31).expect("delete");

        assert_eq!(tree.len(), 50);
        assert_eq!(collect(&tree), before);
        tree.check().expect("check");
    }

    #[test]
    fn test_tree_matches_btreemap_under_random_operations() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut tree = IntTree::in_memory_with(TreeConfig::new(6, 5).expect("valid limits"));
        let mut model = BTreeMap::new();

        for step in 0..4000 {
            let key = rng.random_range(-300..300);
            if rng.random_bool(0.6) {
                let value = rng.random_range(-1000i64..1000);
                assert_eq!(tree.set(key, value).expect("set"), model.insert(key, value));
            } else {
                match model.remove(&key) {
                    Some(expected) => assert_eq!(tree.delete(key).expect("delete"), expected),
                    None => assert!(matches!(tree.delete(key), Err(TreeError::NotFound(_)))),
                }
            }
            if step % 97 == 0 {
                tree.check().expect("check");
            }
        }

        tree.check().expect("check");
        let expected: Vec<(i32, i64)> = model.into_iter().collect();
        assert_eq!(collect(&tree), expected);
    }

    #[test]
    fn test_tree_min_max_keys() {
        let mut tree = IntTree::in_memory_with(small_config());
        assert_eq!(tree.min_key().expect("min"), None);
        assert_eq!(tree.max_key().expect("max"), None);

        tree.update((0..40).map(|k| (k * 5, 0))).expect("update");

        assert_eq!(tree.min_key().expect("min"), Some(0));
        assert_eq!(tree.max_key().expect("max"), Some(195));
        assert_eq!(tree.min_key_from(12).expect("min from"), Some(15));
        assert_eq!(tree.min_key_from(15).expect("min from"), Some(15));
        assert_eq!(tree.min_key_from(196).expect("min from"), None);
        assert_eq!(tree.max_key_to(12).expect("max to"), Some(10));
        assert_eq!(tree.max_key_to(-1).expect("max to"), None);
        assert_eq!(tree.max_key_to(1000).expect("max to"), Some(195));
    }

    #[test]
    fn test_max_key_to_skips_emptied_child_range() {
        let mut tree = IntTree::in_memory_with(small_config());
        tree.update((0..40).map(|k| (k, 0))).expect("update");

        // Remove a run so a separator sits above every remaining key below it.
        for key in 20..30 {
            tree.delete(key).expect("delete");
        }
        assert_eq!(tree.max_key_to(25).expect("max to"), Some(19));
        assert_eq!(tree.min_key_from(25).expect("min from"), Some(30));
    }

    #[test]
    fn test_clone_is_isolated_snapshot() {
        let mut tree = IntTree::in_memory_with(small_config());
        tree.update((0..100).map(|k| (k, i64::from(k)))).expect("update");
        let snapshot = tree.clone();

        tree.set(10, -10).expect("set");
        tree.delete(50).expect("delete");
        tree.insert(1000, 1000).expect("insert");

        assert_eq!(snapshot.get(10).expect("get"), 10);
        assert_eq!(snapshot.get(50).expect("get"), 50);
        assert!(!snapshot.has_key(1000).expect("has_key"));
        assert_eq!(snapshot.len(), 100);
        snapshot.check().expect("snapshot check");
        tree.check().expect("tree check");
    }

    #[test]
    fn test_commit_and_reopen() {
        let store = Arc::new(MemoryStore::new());
        let snapshot = {
            let mut tree: IntTree = Tree::new(Arc::clone(&store), small_config());
            tree.update((0..60).map(|k| (k, i64::from(k) * 3))).expect("update");
            tree.commit().expect("commit")
        };
        assert_eq!(store.dirty_count(), 0);
        assert_eq!(store.last_commit(), Some(snapshot));

        let reopened: IntTree = Tree::open_latest(Arc::clone(&store), small_config()).expect("open");
        assert_eq!(reopened.len(), 60);
        assert_eq!(reopened.get(59).expect("get"), 177);
        reopened.check().expect("check");
    }

    #[test]
    fn test_mutation_after_commit_preserves_committed_version() {
        let store = Arc::new(MemoryStore::new());
        let mut tree: IntTree = Tree::new(Arc::clone(&store), small_config());
        tree.update((0..30).map(|k| (k, 1))).expect("update");
        let first = tree.commit().expect("commit");

        tree.set(5, 2).expect("set");
        tree.delete(6).expect("delete");

        let old: IntTree = Tree::open(Arc::clone(&store), first, small_config()).expect("open");
        assert_eq!(old.get(5).expect("get"), 1);
        assert_eq!(old.get(6).expect("get"), 1);
        assert_eq!(tree.get(5).expect("get"), 2);
    }

    #[test]
    fn test_release_and_reactivate() {
        let store = Arc::new(MemoryStore::new());
        let mut tree: IntTree = Tree::new(Arc::clone(&store), small_config());
        tree.update((0..100).map(|k| (k, i64::from(k)))).expect("update");

        // Dirty nodes are never released.
        assert_eq!(tree.release(), 0);

        tree.commit().expect("commit");
        assert!(tree.release() > 0);

        let loads_before = store.load_count();
        assert_eq!(tree.get(42).expect("get"), 42);
        assert!(store.load_count() > loads_before);
        tree.check().expect("check");
    }

    #[test]
    fn test_open_missing_root_fails() {
        let store = Arc::new(MemoryStore::new());
        let result: Result<IntTree, _> = Tree::open(store, Snapshot { root: 99, len: 0 }, TreeConfig::default());
        assert!(matches!(result, Err(TreeError::Adapter(StoreError::Missing(99)))));
    }

    #[test]
    fn test_set_scalar_validates_before_writing() {
        let mut tree = IntTree::in_memory();

        let too_big = Scalar::Int(i128::from(i32::MAX) + 1);
        assert!(matches!(
            tree.set_scalar(&too_big, &Scalar::Int(1)),
            Err(TreeError::KeyOutOfRange(_))
        ));
        assert!(matches!(
            tree.set_scalar(&Scalar::Int(1), &Scalar::Int(i128::from(i64::MAX) + 1)),
            Err(TreeError::ValueOutOfRange(_))
        ));
        assert!(matches!(
            tree.set_scalar(&Scalar::Int(1), &Scalar::Float(2.5)),
            Err(TreeError::ValueOutOfRange(_))
        ));
        assert!(tree.is_empty());

        tree.set_scalar(&Scalar::Int(1), &Scalar::Int(2)).expect("set");
        assert_eq!(tree.get(1).expect("get"), 2);
    }

    #[test]
    fn test_underfull_child_borrows_from_right_sibling() {
        // Three buckets of three: [0 1 2] [3 4 5] [6 7 8]
        let mut tree: IntTree =
            Tree::from_entries(Arc::new(MemoryStore::new()), small_config(), (0..9).map(|k| (k, 0)));
        tree.delete(0).expect("delete");
        tree.set(9, 0).expect("set");
        tree.delete(3).expect("delete");

        // Middle bucket underflows; the left sibling is at its minimum
        tree.delete(4).expect("delete");

        let Some(Contents::Node(root)) = tree.root().contents() else {
            panic!("expected an internal root");
        };
        assert_eq!(root.len(), 3);
        assert_eq!(collect(&tree), vec![(1, 0), (2, 0), (5, 0), (6, 0), (7, 0), (8, 0), (9, 0)]);
        tree.check().expect("check");
    }

    #[test]
    fn test_dropping_uncommitted_tree_releases_dirty_ids() {
        let store = Arc::new(MemoryStore::new());
        let mut tree: IntTree = Tree::new(Arc::clone(&store), small_config());
        tree.update((0..300).map(|k| (k, 0))).expect("update");
        tree.commit().expect("commit");
        assert_eq!(store.dirty_count(), 0);

        // Merges and root collapses drop nodes along the way
        let mut shrinking = tree.clone();
        for key in 0..290 {
            shrinking.delete(key).expect("delete");
        }
        shrinking.check().expect("check");
        let live = store.dirty_count();
        assert!(live > 0);
        drop(shrinking);
        assert_eq!(store.dirty_count(), 0);
        assert_eq!(tree.len(), 300);
        tree.check().expect("check");
    }

    #[test]
    fn test_dropped_clone_keeps_shared_dirty_nodes() {
        let store = Arc::new(MemoryStore::new());
        let mut tree: IntTree = Tree::new(Arc::clone(&store), small_config());
        tree.update((0..100).map(|k| (k, i64::from(k)))).expect("update");

        let mut fork = tree.clone();
        fork.set(5, -5).expect("set");
        fork.delete(50).expect("delete");
        drop(fork);
        assert!(store.dirty_count() > 0);

        let snapshot = tree.commit().expect("commit");
        assert_eq!(store.dirty_count(), 0);
        let reopened: IntTree = Tree::open(Arc::clone(&store), snapshot, small_config()).expect("open");
        assert_eq!(collect(&reopened), collect(&tree));
        assert_eq!(reopened.get(5).expect("get"), 5);
        reopened.check().expect("check");
    }

    #[test]
    fn test_from_entries_last_duplicate_wins() {
        let tree: IntTree = Tree::from_entries(
            Arc::new(MemoryStore::new()),
            small_config(),
            vec![(3, 1), (1, 1), (3, 2), (2, 1)],
        );

        assert_eq!(collect(&tree), vec![(1, 1), (2, 1), (3, 2)]);
    }

    #[test]
    fn test_generic_key_type() {
        let mut tree: Tree<u64, i32, MemoryStore<u64, i32>> = Tree::in_memory_with(small_config());
        for key in (0..50u64).rev() {
            tree.insert(key << 40, i32::try_from(key).expect("fits")).expect("insert");
        }
        tree.check().expect("check");
        assert_eq!(tree.min_key().expect("min"), Some(0));
        assert_eq!(tree.get(7 << 40).expect("get"), 7);
    }
}

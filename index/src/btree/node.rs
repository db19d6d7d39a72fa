//! Internal nodes and node references.
//!
//! An internal node stores N separator keys and N+1 child references:
//! - `child[0]` holds keys < `key[0]`
//! - `child[i]` holds keys >= `key[i-1]` and < `key[i]`
//! - the last child holds keys >= the last separator
//!
//! A [`NodeRef`] is either unloaded (an identity only) or loaded (identity plus
//! shared contents). Loading only happens through [`NodeRef::activate`], which
//! calls the store. Contents are shared between tree snapshots behind an `Arc`
//! and copied before mutation unless the reference is the only holder of a
//! node that has never been saved.

use std::sync::{Arc, OnceLock};

use crate::btree::bucket::Bucket;
use crate::btree::error::TreeError;
use crate::btree::value::{TreeKey, TreeValue};
use crate::storage::{NodeId, NodeStore, StoreError};

/// The payload of a node: either a leaf bucket or an internal node.
#[derive(Debug, Clone)]
pub enum Contents<K, V> {
    Bucket(Bucket<K, V>),
    Node(Node<K, V>),
}

impl<K: TreeKey, V: TreeValue> Contents<K, V> {
    /// Entries for a bucket, children for an internal node.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Bucket(bucket) => bucket.len(),
            Self::Node(node) => node.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Bucket(_) => "bucket",
            Self::Node(_) => "node",
        }
    }

    /// Copy with every child reference unloaded. This is the form stores keep.
    #[must_use]
    pub fn shallow_clone(&self) -> Self {
        match self {
            Self::Bucket(bucket) => Self::Bucket(bucket.clone()),
            Self::Node(node) => Self::Node(Node {
                keys: node.keys.clone(),
                children: node
                    .children
                    .iter()
                    .map(|c| NodeRef::unloaded(c.id))
                    .collect(),
            }),
        }
    }
}

/// A reference to a child node, loaded or not.
#[derive(Debug, Clone)]
pub struct NodeRef<K, V> {
    id: NodeId,
    slot: OnceLock<Arc<Contents<K, V>>>,
}

impl<K: TreeKey, V: TreeValue> NodeRef<K, V> {
    /// A ghost reference: identity only, contents fetched on first access.
    #[must_use]
    pub const fn unloaded(id: NodeId) -> Self {
        Self {
            id,
            slot: OnceLock::new(),
        }
    }

    /// A reference whose contents are already materialized.
    #[must_use]
    pub fn loaded(id: NodeId, contents: Contents<K, V>) -> Self {
        Self {
            id,
            slot: OnceLock::from(Arc::new(contents)),
        }
    }

    /// Register brand-new contents with the store and reference them.
    pub(crate) fn fresh<S: NodeStore<K, V> + ?Sized>(store: &S, contents: Contents<K, V>) -> Self {
        let id = store.new_reference(&contents);
        Self::loaded(id, contents)
    }

    #[must_use]
    pub const fn id(&self) -> NodeId {
        self.id
    }

    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.slot.get().is_some()
    }

    /// Contents if already activated.
    #[must_use]
    pub fn contents(&self) -> Option<&Contents<K, V>> {
        self.slot.get().map(AsRef::as_ref)
    }

    /// Materialize the contents through the store if needed.
    pub fn activate<S: NodeStore<K, V> + ?Sized>(&self, store: &S) -> Result<&Contents<K, V>, StoreError> {
        if let Some(contents) = self.slot.get() {
            return Ok(contents);
        }
        let contents = Arc::new(store.load(self.id)?);
        tracing::trace!(id = self.id, kind = contents.kind(), "activated node");
        Ok(self.slot.get_or_init(|| contents))
    }

    /// Exclusive access for mutation.
    ///
    /// Nodes that are shared with another snapshot or already saved are copied
    /// under a fresh identity first, so no other reference ever observes the
    /// change. The caller must also hold its parent mutably, since the id may
    /// change.
    pub(crate) fn make_mut<S: NodeStore<K, V> + ?Sized>(
        &mut self,
        store: &S,
    ) -> Result<&mut Contents<K, V>, TreeError<K>> {
        self.activate(store)?;

        let exclusive = store.is_dirty(self.id)
            && self
                .slot
                .get_mut()
                .is_some_and(|arc| Arc::get_mut(arc).is_some());

        if exclusive {
            store.mark_dirty(self.id);
        } else {
            let copy = self
                .contents()
                .cloned()
                .ok_or_else(|| TreeError::invariant(format!("node {} lost its contents", self.id)))?;
            *self = Self::fresh(store, copy);
        }

        let id = self.id;
        self.slot
            .get_mut()
            .and_then(Arc::get_mut)
            .ok_or_else(|| TreeError::invariant(format!("node {id} is not exclusively owned")))
    }

    /// Mutable contents without copying, if this reference is the sole holder.
    pub(crate) fn contents_mut_if_unique(&mut self) -> Option<&mut Contents<K, V>> {
        self.slot.get_mut().and_then(Arc::get_mut)
    }

    /// Drop the loaded contents, turning this back into a ghost.
    pub(crate) fn deactivate(&mut self) -> bool {
        self.slot.take().is_some()
    }
}

/// An internal (non-leaf) node.
#[derive(Debug, Clone)]
pub struct Node<K, V> {
    /// Separator keys in sorted order.
    pub(crate) keys: Vec<K>,
    /// Child references. `children.len()` == `keys.len()` + 1
    pub(crate) children: Vec<NodeRef<K, V>>,
}

impl<K: TreeKey, V: TreeValue> Node<K, V> {
    /// Create an internal node with two children, as after a root split.
    #[must_use]
    pub fn with_children(left_child: NodeRef<K, V>, key: K, right_child: NodeRef<K, V>) -> Self {
        Self {
            keys: vec![key],
            children: vec![left_child, right_child],
        }
    }

    /// Assemble a node from parts. `children.len()` must be `keys.len() + 1`.
    #[must_use]
    pub(crate) const fn from_parts(keys: Vec<K>, children: Vec<NodeRef<K, V>>) -> Self {
        Self { keys, children }
    }

    /// Number of children.
    #[must_use]
    #[allow(clippy::missing_const_for_fn)] // Vec::len() is not const-stable
    pub fn len(&self) -> usize {
        self.children.len()
    }

    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    #[must_use]
    pub fn keys(&self) -> &[K] {
        &self.keys
    }

    #[must_use]
    pub fn children(&self) -> &[NodeRef<K, V>] {
        &self.children
    }

    /// Find the child index for a given key: the last child whose separator
    /// is <= `key`.
    #[must_use]
    pub fn child_index(&self, key: &K) -> usize {
        match self.keys.binary_search(key) {
            Ok(i) => i + 1, // Exact match, go right
            Err(i) => i,
        }
    }

    /// The child that covers `key`.
    #[must_use]
    pub fn child_for(&self, key: &K) -> &NodeRef<K, V> {
        &self.children[self.child_index(key)]
    }

    /// Insert a separator and the child to its right.
    pub fn insert_child(&mut self, separator: K, right_child: NodeRef<K, V>) {
        let idx = self.child_index(&separator);
        self.keys.insert(idx, separator);
        self.children.insert(idx + 1, right_child);
    }

    /// Remove the child at `index` together with the separator bounding it on
    /// the left (or on the right, for the first child).
    pub fn remove_child(&mut self, index: usize) -> NodeRef<K, V> {
        let child = self.children.remove(index);
        if !self.keys.is_empty() {
            self.keys.remove(index.saturating_sub(1));
        }
        child
    }

    /// Split the node, returning the median key and the new right node.
    /// The median moves up to the parent and is kept by neither half.
    #[must_use]
    pub fn split(&mut self) -> (K, Self) {
        let mid = self.keys.len() / 2;
        let median_key = self.keys[mid];

        let right_keys: Vec<K> = self.keys.drain(mid + 1..).collect();
        let right_children: Vec<NodeRef<K, V>> = self.children.drain(mid + 1..).collect();

        // Remove median key from left node
        self.keys.pop();

        (median_key, Self::from_parts(right_keys, right_children))
    }

    /// Absorb the right-hand sibling, pulling the parent separator down.
    pub fn merge_with(&mut self, separator: K, mut right: Self) {
        self.keys.push(separator);
        self.keys.append(&mut right.keys);
        self.children.append(&mut right.children);
    }

    /// Even out children with the right-hand sibling by rotating through the
    /// parent separator. Returns the separator that now divides them.
    pub fn rebalance_with(&mut self, separator: K, right: &mut Self) -> Option<K> {
        let total = self.children.len() + right.children.len();
        let target_left = total / 2;

        if self.children.len() < target_left {
            let moved = target_left - self.children.len();
            self.keys.push(separator);
            self.keys.extend(right.keys.drain(..moved - 1));
            self.children.extend(right.children.drain(..moved));
            if right.keys.is_empty() {
                return None;
            }
            Some(right.keys.remove(0))
        } else if self.children.len() > target_left {
            let mut moved_keys: Vec<K> = self.keys.drain(target_left..).collect();
            let new_separator = self.keys.pop()?;
            moved_keys.push(separator);
            moved_keys.append(&mut right.keys);
            right.keys = moved_keys;

            let mut moved_children: Vec<NodeRef<K, V>> =
                self.children.drain(target_left..).collect();
            moved_children.append(&mut right.children);
            right.children = moved_children;

            Some(new_separator)
        } else {
            Some(separator)
        }
    }
}

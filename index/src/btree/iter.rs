//! Ordered range cursor.
//!
//! There are no sibling links between buckets. The cursor keeps the path from
//! the root to its current bucket and climbs back up to find the next one, so
//! nodes are only activated when the cursor reaches them.

use std::iter::FusedIterator;
use std::ops::{Bound, RangeBounds};

use crate::btree::bucket::Bucket;
use crate::btree::error::TreeError;
use crate::btree::node::{Contents, Node, NodeRef};
use crate::btree::tree::Tree;
use crate::btree::value::{TreeKey, TreeValue};
use crate::storage::NodeStore;

/// A lazy ascending cursor over the entries between two bounds.
///
/// A store failure is yielded once as an `Err`, after which the cursor is
/// exhausted. [`Range::restart`] rewinds it to the lower bound.
pub struct Range<'a, K: TreeKey, V: TreeValue, S: NodeStore<K, V>> {
    tree: &'a Tree<K, V, S>,
    lower: Bound<K>,
    upper: Bound<K>,
    /// Internal nodes on the current path with the index of the next child
    /// to visit.
    stack: Vec<(&'a Node<K, V>, usize)>,
    bucket: Option<(&'a Bucket<K, V>, usize)>,
    started: bool,
    done: bool,
}

impl<'a, K: TreeKey, V: TreeValue, S: NodeStore<K, V>> Range<'a, K, V, S> {
    fn new(tree: &'a Tree<K, V, S>, lower: Bound<K>, upper: Bound<K>) -> Self {
        Self {
            tree,
            lower,
            upper,
            stack: Vec::new(),
            bucket: None,
            started: false,
            done: false,
        }
    }

    /// Rewind to the first entry at or after the lower bound.
    pub fn restart(&mut self) {
        self.stack.clear();
        self.bucket = None;
        self.started = false;
        self.done = false;
    }

    fn below_upper(&self, key: &K) -> bool {
        match &self.upper {
            Bound::Included(upper) => key <= upper,
            Bound::Excluded(upper) => key < upper,
            Bound::Unbounded => true,
        }
    }

    fn activate(&self, node_ref: &'a NodeRef<K, V>) -> Result<&'a Contents<K, V>, TreeError<K>> {
        Ok(node_ref.activate(&**self.tree.store())?)
    }

    /// Descend from the root to the bucket holding the lower bound.
    fn seek(&mut self) -> Result<(), TreeError<K>> {
        let mut contents = self.activate(self.tree.root())?;

        loop {
            match contents {
                Contents::Node(node) => {
                    let idx = match &self.lower {
                        Bound::Included(lower) | Bound::Excluded(lower) => node.child_index(lower),
                        Bound::Unbounded => 0,
                    };
                    self.stack.push((node, idx + 1));
                    contents = self.activate(&node.children[idx])?;
                }
                Contents::Bucket(bucket) => {
                    let pos = match &self.lower {
                        Bound::Included(lower) => bucket.find_index(lower).unwrap_or_else(|i| i),
                        Bound::Excluded(lower) => match bucket.find_index(lower) {
                            Ok(i) => i + 1,
                            Err(i) => i,
                        },
                        Bound::Unbounded => 0,
                    };
                    self.bucket = Some((bucket, pos));
                    return Ok(());
                }
            }
        }
    }

    /// Move to the leftmost bucket of the next subtree. Returns false when
    /// no subtree that could hold keys below the upper bound remains.
    fn advance_bucket(&mut self) -> Result<bool, TreeError<K>> {
        let child = loop {
            let Some((node, next)) = self.stack.last_mut() else {
                return Ok(false);
            };
            if *next < node.len() {
                let node: &'a Node<K, V> = *node;
                let idx = *next;
                *next += 1;
                // Every key in this child is >= its left separator
                if !self.below_upper(&node.keys[idx - 1]) {
                    return Ok(false);
                }
                break &node.children[idx];
            }
            self.stack.pop();
        };

        let mut contents = self.activate(child)?;
        loop {
            match contents {
                Contents::Node(node) => {
                    self.stack.push((node, 1));
                    contents = self.activate(&node.children[0])?;
                }
                Contents::Bucket(bucket) => {
                    self.bucket = Some((bucket, 0));
                    return Ok(true);
                }
            }
        }
    }

    fn next_entry(&mut self) -> Result<Option<(K, V)>, TreeError<K>> {
        if !self.started {
            self.started = true;
            self.seek()?;
        }

        loop {
            if let Some((bucket, pos)) = &mut self.bucket {
                if let Some(entry) = bucket.entries.get(*pos).copied() {
                    *pos += 1;
                    if !self.below_upper(&entry.key) {
                        return Ok(None);
                    }
                    return Ok(Some((entry.key, entry.value)));
                }
            }
            if !self.advance_bucket()? {
                return Ok(None);
            }
        }
    }
}

impl<K: TreeKey, V: TreeValue, S: NodeStore<K, V>> Iterator for Range<'_, K, V, S> {
    type Item = Result<(K, V), TreeError<K>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_entry() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

impl<K: TreeKey, V: TreeValue, S: NodeStore<K, V>> FusedIterator for Range<'_, K, V, S> {}

impl<K: TreeKey, V: TreeValue, S: NodeStore<K, V>> Tree<K, V, S> {
    /// Entries with keys inside `bounds`, in ascending order.
    #[must_use]
    pub fn range(&self, bounds: impl RangeBounds<K>) -> Range<'_, K, V, S> {
        Range::new(self, bounds.start_bound().cloned(), bounds.end_bound().cloned())
    }

    /// All entries in ascending key order.
    #[must_use]
    pub fn iter(&self) -> Range<'_, K, V, S> {
        self.range(..)
    }

    #[must_use]
    pub fn keys(&self) -> impl Iterator<Item = Result<K, TreeError<K>>> + '_ {
        self.iter().map(|entry| entry.map(|(key, _)| key))
    }

    #[must_use]
    pub fn values(&self) -> impl Iterator<Item = Result<V, TreeError<K>>> + '_ {
        self.iter().map(|entry| entry.map(|(_, value)| value))
    }
}

//! In-memory node store.
//!
//! Keeps saved nodes in a map. Used for scratch trees (set-algebra results,
//! reconciliation output) and throughout the tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use crate::btree::{Contents, TreeKey, TreeValue};
use crate::storage::store::{NodeId, NodeStore, Snapshot, StoreError};

/// A node store that lives entirely in memory.
///
/// # Invariants
/// - Ids are never reused; id 0 is never handed out
/// - Saved records hold unloaded child references only
pub struct MemoryStore<K, V> {
    inner: Mutex<MemoryInner<K, V>>,
}

struct MemoryInner<K, V> {
    records: HashMap<NodeId, Contents<K, V>>,
    dirty: HashSet<NodeId>,
    next_id: NodeId,
    last_commit: Option<Snapshot>,
    loads: u64,
}

impl<K: TreeKey, V: TreeValue> MemoryStore<K, V> {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemoryInner {
                records: HashMap::new(),
                dirty: HashSet::new(),
                next_id: 1,
                last_commit: None,
                loads: 0,
            }),
        }
    }

    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    fn lock(&self) -> MutexGuard<'_, MemoryInner<K, V>> {
        self.inner.lock().expect("lock poisoned")
    }

    /// Number of saved records.
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.lock().records.len()
    }

    /// Number of nodes with unsaved changes.
    #[must_use]
    pub fn dirty_count(&self) -> usize {
        self.lock().dirty.len()
    }

    /// Number of successful loads served so far.
    #[must_use]
    pub fn load_count(&self) -> u64 {
        self.lock().loads
    }
}

impl<K: TreeKey, V: TreeValue> Default for MemoryStore<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: TreeKey, V: TreeValue> NodeStore<K, V> for MemoryStore<K, V> {
    fn load(&self, id: NodeId) -> Result<Contents<K, V>, StoreError> {
        let mut inner = self.lock();
        let contents = inner
            .records
            .get(&id)
            .map(Contents::shallow_clone)
            .ok_or(StoreError::Missing(id))?;
        inner.loads += 1;
        Ok(contents)
    }

    fn new_reference(&self, _contents: &Contents<K, V>) -> NodeId {
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.dirty.insert(id);
        id
    }

    fn mark_dirty(&self, id: NodeId) {
        self.lock().dirty.insert(id);
    }

    fn is_dirty(&self, id: NodeId) -> bool {
        self.lock().dirty.contains(&id)
    }

    fn discard(&self, id: NodeId) {
        self.lock().dirty.remove(&id);
    }

    fn save(&self, id: NodeId, contents: &Contents<K, V>) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.records.insert(id, contents.shallow_clone());
        inner.dirty.remove(&id);
        Ok(())
    }

    fn commit(&self, snapshot: Snapshot) -> Result<(), StoreError> {
        self.lock().last_commit = Some(snapshot);
        Ok(())
    }

    fn last_commit(&self) -> Option<Snapshot> {
        self.lock().last_commit
    }
}

//! Persistence adapter seam.
//!
//! The tree never reads or writes nodes itself. It activates unloaded
//! references through a [`NodeStore`], asks the store for fresh identities when
//! it copies a node, and hands dirty nodes back on commit. This keeps the
//! B-tree algorithms independent of where nodes live: memory for tests and
//! scratch trees, a page file for durable indices, or a fault-injecting wrapper
//! for failure testing.
//!
//! # Dirty tracking
//!
//! A node is dirty from the moment it receives an identity through
//! [`NodeStore::new_reference`] until it is written with [`NodeStore::save`].
//! The tree relies on this: only dirty nodes that are not shared with another
//! snapshot may be mutated in place. Everything else is copied first.

use crate::btree::Contents;

/// Identity of a stored node.
pub type NodeId = u64;

/// A committed tree version: its root and entry count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub root: NodeId,
    pub len: u64,
}

/// Errors that can occur inside a node store.
#[derive(Debug)]
pub enum StoreError {
    /// I/O error.
    Io(std::io::Error),
    /// No record exists for the node.
    Missing(NodeId),
    /// Stored bytes failed validation.
    Corruption(String),
    /// A node does not fit in a single record.
    RecordTooLarge { id: NodeId, size: usize, max: usize },
    /// The store was written with different key/value widths or limits.
    Incompatible(String),
    /// Injected fault for simulation.
    InjectedFault(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Missing(id) => write!(f, "node {id} not found in store"),
            Self::Corruption(msg) => write!(f, "corruption: {msg}"),
            Self::RecordTooLarge { id, size, max } => {
                write!(f, "node {id} needs {size} bytes (max {max})")
            }
            Self::Incompatible(msg) => write!(f, "incompatible store: {msg}"),
            Self::InjectedFault(msg) => write!(f, "injected fault: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Capability the tree uses to materialize and persist nodes.
///
/// # Implementation Notes
///
/// Implementations must ensure:
/// - `load` returns the contents last passed to `save` for that id, with every
///   child reference unloaded
/// - `new_reference` never returns an id that is already in use
/// - `new_reference` marks the new id dirty and `save` clears the flag
/// - all methods take `&self`; stores shared between trees synchronize
///   internally
pub trait NodeStore<K, V>: Send + Sync {
    /// Materialize a node's contents.
    fn load(&self, id: NodeId) -> Result<Contents<K, V>, StoreError>;

    /// Allocate an identity for a node that exists only in memory so far.
    fn new_reference(&self, contents: &Contents<K, V>) -> NodeId;

    /// Record that a node has unsaved changes.
    fn mark_dirty(&self, id: NodeId);

    /// Whether a node has unsaved changes.
    fn is_dirty(&self, id: NodeId) -> bool;

    /// Forget a dirty node that became unreachable before it was saved.
    /// Ids that are not dirty are left alone.
    fn discard(&self, id: NodeId);

    /// Persist a node and clear its dirty flag.
    fn save(&self, id: NodeId, contents: &Contents<K, V>) -> Result<(), StoreError>;

    /// Make all saved nodes durable and record `snapshot` as the latest version.
    fn commit(&self, snapshot: Snapshot) -> Result<(), StoreError>;

    /// The latest committed version, if any.
    fn last_commit(&self) -> Option<Snapshot>;
}

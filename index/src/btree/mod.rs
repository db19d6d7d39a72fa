//! Copy-on-write B-tree over lazily activated nodes.
//!
//! Leaves are [`Bucket`]s of sorted entries; internal levels are [`Node`]s of
//! separators and child references. Nodes are fetched through a
//! [`NodeStore`](crate::storage::NodeStore) on first access.

mod bucket;
mod build;
mod error;
mod iter;
mod node;
mod tree;
mod value;

pub use bucket::{Bucket, Entry, Insertion};
pub use error::TreeError;
pub use iter::Range;
pub use node::{Contents, Node, NodeRef};
pub use tree::{IntTree, MAX_BTREE_SIZE, MAX_BUCKET_SIZE, Tree, TreeConfig};
pub use value::{FixedWidth, Scalar, ScalarError, TreeKey, TreeValue};

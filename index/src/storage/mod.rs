//! Node storage.
//!
//! Trees reach their nodes through the [`NodeStore`] trait. Three stores are
//! provided:
//!
//! - [`MemoryStore`]: records in a map, for scratch trees and tests
//! - [`FileStore`]: a single page file with 8KB pages
//! - [`FaultyStore`]: wraps another store and injects failures
//!
//! # File Format
//!
//! - Page 0: Superblock (format, limits, committed root)
//! - Pages 1-N: one B-tree node per page, header plus checksum
//!
//! Files only grow; [`pack_file`] rewrites one down to its latest commit.
//!
//! # Usage
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! use ilindex::btree::{Tree, TreeConfig};
//! use ilindex::storage::FileStore;
//!
//! let config = TreeConfig::default();
//! let store = Arc::new(FileStore::<i32, i64>::open_or_create(Path::new("index.db"), config, 1024)?);
//! let mut tree = Tree::new(store, config);
//! tree.set(1, 10)?;
//! tree.commit()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod codec;
mod faulty;
mod file;
mod memory;
mod mru;
mod pack;
mod page;
mod store;
mod superblock;

pub use faulty::{FaultConfig, FaultStats, FaultyStore};
pub use file::{FileStats, FileStore};
pub use memory::MemoryStore;
pub use mru::{CacheStats, MruCache};
pub use pack::{PackStats, copy_to_file, pack_file};
pub use page::{PAGE_SIZE, Page, PageError, PageHeader, PageId, PageType};
pub use store::{NodeId, NodeStore, Snapshot, StoreError};
pub use superblock::{Superblock, SuperblockError};

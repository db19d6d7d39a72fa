//! Packing and point-in-time copies of index files.
//!
//! Committed pages are never rewritten, so every commit leaves the previous
//! path from the root behind and the file only grows. Packing copies the
//! nodes reachable from the latest commit into a fresh file next to the
//! original and renames it over the original.
//!
//! Any earlier [`Snapshot`](crate::storage::Snapshot) of a file that has not
//! been packed since is still readable with [`Tree::open`], and
//! [`copy_to_file`] turns it into a standalone file.

use std::ffi::OsString;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::btree::{Tree, TreeError, TreeKey, TreeValue};
use crate::storage::file::FileStore;
use crate::storage::store::{NodeStore, StoreError};

/// Outcome of [`pack_file`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackStats {
    /// Pages in the file before packing, including the superblock.
    pub pages_before: u64,
    /// Pages in the packed file, including the superblock.
    pub pages_after: u64,
    pub entries: u64,
}

/// Write `tree` as it is now into a new index file at `dest` and commit it.
///
/// Fails if `dest` already exists.
pub fn copy_to_file<K: TreeKey, V: TreeValue, S: NodeStore<K, V>>(
    tree: &Tree<K, V, S>,
    dest: &Path,
    cache_nodes: usize,
) -> Result<Tree<K, V, FileStore<K, V>>, TreeError<K>> {
    let store = Arc::new(FileStore::create(dest, tree.config(), cache_nodes)?);
    let copy = tree.copy_into(store)?;
    copy.commit()?;
    Ok(copy)
}

/// Rewrite the file at `path` so it holds only the latest committed version.
///
/// Uncommitted pages and every older version are dropped. A file with nothing
/// committed is left as it is.
pub fn pack_file<K: TreeKey, V: TreeValue>(path: &Path, cache_nodes: usize) -> Result<PackStats, TreeError<K>> {
    let source = Arc::new(FileStore::<K, V>::open(path, cache_nodes)?);
    let pages_before = source.stats().total_pages;
    if source.last_commit().is_none() {
        tracing::info!(path = %path.display(), "nothing committed, file left as is");
        return Ok(PackStats {
            pages_before,
            pages_after: pages_before,
            entries: 0,
        });
    }

    #[allow(clippy::disallowed_methods)] // Arc::clone is required for shared ownership
    let tree = Tree::open_latest(Arc::clone(&source), source.config())?;

    let packed_path = packed_path(path);
    if packed_path.exists() {
        tracing::warn!(path = %packed_path.display(), "removing leftover pack file");
        fs::remove_file(&packed_path).map_err(StoreError::from)?;
    }

    let packed = copy_to_file(&tree, &packed_path, cache_nodes).inspect_err(|e| {
        tracing::warn!(path = %packed_path.display(), error = %e, "pack failed");
        remove_partial(&packed_path);
    })?;
    let stats = PackStats {
        pages_before,
        pages_after: packed.store().stats().committed_pages,
        entries: packed.len() as u64,
    };

    drop(packed);
    drop(tree);
    drop(source);
    fs::rename(&packed_path, path).map_err(StoreError::from)?;
    sync_parent_dir(path);

    tracing::info!(
        path = %path.display(),
        pages_before = stats.pages_before,
        pages_after = stats.pages_after,
        entries = stats.entries,
        "packed index file"
    );
    Ok(stats)
}

/// Sibling path the packed copy is written to before the swap.
fn packed_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".pack");
    PathBuf::from(name)
}

/// Best effort: some platforms cannot open a directory for syncing.
fn sync_parent_dir(path: &Path) {
    let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) else {
        return;
    };
    if let Err(e) = File::open(parent).and_then(|dir| dir.sync_all()) {
        tracing::debug!(path = %parent.display(), error = %e, "directory sync skipped");
    }
}

fn remove_partial(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        tracing::warn!(path = %path.display(), error = %e, "could not remove partial pack file");
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::btree::TreeConfig;

    type IntFileStore = FileStore<i32, i64>;

    fn small_config() -> TreeConfig {
        TreeConfig::new(4, 4).expect("valid limits")
    }

    fn entries<S: NodeStore<i32, i64>>(tree: &Tree<i32, i64, S>) -> Vec<(i32, i64)> {
        tree.iter().collect::<Result<_, _>>().expect("iterate")
    }

    #[test]
    fn test_pack_shrinks_file_and_keeps_entries() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("index.db");

        let expected = {
            let store = Arc::new(IntFileStore::create(&path, small_config(), 16).expect("create"));
            let mut tree = Tree::new(Arc::clone(&store), small_config());
            tree.update((0..300).map(|k| (k, 0))).expect("update");
            tree.commit().expect("commit");
            // One commit per change, as the command line tool does
            for round in 1..=100 {
                tree.set(round * 3 % 300, i64::from(round)).expect("set");
                tree.commit().expect("commit");
            }
            entries(&tree)
        };
        let size_before = fs::metadata(&path).expect("metadata").len();

        let stats = pack_file::<i32, i64>(&path, 16).expect("pack");
        assert_eq!(stats.entries, 300);
        assert!(stats.pages_after < stats.pages_before);
        assert!(fs::metadata(&path).expect("metadata").len() < size_before);
        assert!(!packed_path(&path).exists());

        let store = Arc::new(IntFileStore::open(&path, 16).expect("reopen"));
        assert_eq!(store.config(), small_config());
        let tree = Tree::open_latest(Arc::clone(&store), store.config()).expect("open tree");
        assert_eq!(entries(&tree), expected);
        tree.check().expect("check");
    }

    #[test]
    fn test_pack_twice_is_stable() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("index.db");
        {
            let store = Arc::new(IntFileStore::create(&path, small_config(), 0).expect("create"));
            let mut tree = Tree::new(Arc::clone(&store), small_config());
            tree.update((0..50).map(|k| (k, i64::from(k)))).expect("update");
            tree.commit().expect("commit");
        }

        let first = pack_file::<i32, i64>(&path, 0).expect("pack");
        let second = pack_file::<i32, i64>(&path, 0).expect("pack again");
        assert_eq!(second.pages_before, first.pages_after);
        assert_eq!(second.pages_after, first.pages_after);
    }

    #[test]
    fn test_pack_without_commit_leaves_file_alone() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("index.db");
        drop(IntFileStore::create(&path, small_config(), 0).expect("create"));

        let stats = pack_file::<i32, i64>(&path, 0).expect("pack");
        assert_eq!(stats.pages_before, stats.pages_after);
        assert_eq!(stats.entries, 0);
        assert!(IntFileStore::open(&path, 0).expect("open").last_commit().is_none());
    }

    #[test]
    fn test_copy_older_snapshot_to_file() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("index.db");
        let store = Arc::new(IntFileStore::create(&path, small_config(), 8).expect("create"));

        let mut tree = Tree::new(Arc::clone(&store), small_config());
        tree.update((0..40).map(|k| (k, 1))).expect("update");
        let earlier = tree.commit().expect("commit");
        for key in 0..20 {
            tree.delete(key).expect("delete");
        }
        tree.commit().expect("commit");

        let old = Tree::open(Arc::clone(&store), earlier, small_config()).expect("open earlier");
        let dest = dir.path().join("earlier.db");
        let copy = copy_to_file(&old, &dest, 8).expect("copy");
        assert_eq!(copy.len(), 40);
        drop(copy);

        let copied_store = Arc::new(IntFileStore::open(&dest, 8).expect("open copy"));
        let copied = Tree::open_latest(Arc::clone(&copied_store), small_config()).expect("open tree");
        assert_eq!(entries(&copied), (0..40).map(|k| (k, 1)).collect::<Vec<_>>());
        assert_eq!(tree.len(), 20);

        assert!(matches!(copy_to_file(&old, &dest, 8), Err(TreeError::Adapter(StoreError::Io(_)))));
    }
}

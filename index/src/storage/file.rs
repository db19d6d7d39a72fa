//! Page file node store.
//!
//! One node per 8KB page; a node's id is its page number. Page 0 holds the
//! superblock. Saved pages are never rewritten because the tree copies every
//! saved node before changing it, so a commit only has to sync the data pages
//! and then swap in a new superblock. Pages written after the last commit are
//! not covered by the superblock and are reused after a reopen. Ids of nodes
//! discarded before their first save are handed out again right away.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::btree::{Contents, TreeConfig, TreeKey, TreeValue};
use crate::storage::codec;
use crate::storage::mru::{CacheStats, MruCache};
use crate::storage::page::{PAGE_SIZE_U64, Page, PageHeader, PageId};
use crate::storage::store::{NodeId, NodeStore, Snapshot, StoreError};
use crate::storage::superblock::{Superblock, SuperblockError};

/// A node store backed by a single page file.
pub struct FileStore<K, V> {
    path: PathBuf,
    inner: Mutex<FileInner<K, V>>,
    _marker: PhantomData<fn() -> (K, V)>,
}

struct FileInner<K, V> {
    file: File,
    superblock: Superblock,
    /// Next page id to hand out
    next_page: PageId,
    /// Ids discarded before they were ever written, handed out again first
    free: Vec<PageId>,
    dirty: HashSet<NodeId>,
    cache: MruCache<NodeId, Contents<K, V>>,
    pages_read: u64,
    pages_written: u64,
}

/// Counters reported by [`FileStore::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStats {
    pub total_pages: u64,
    pub committed_pages: u64,
    pub dirty_nodes: usize,
    pub pages_read: u64,
    pub pages_written: u64,
    pub cache_len: usize,
    pub cache: CacheStats,
}

impl<K: TreeKey, V: TreeValue> FileStore<K, V> {
    /// Create a new index file at the given path.
    ///
    /// Returns an error if the file already exists.
    pub fn create(path: &Path, config: TreeConfig, cache_nodes: usize) -> Result<Self, StoreError> {
        Self::check_limits(config)?;
        let superblock = Superblock::new(config, K::WIDTH, V::WIDTH).ok_or_else(|| {
            StoreError::Incompatible(format!(
                "limits {}/{} do not fit the superblock",
                config.max_bucket_size(),
                config.max_btree_size()
            ))
        })?;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;

        // Initialize with a fresh superblock
        file.write_all(superblock.to_page().as_bytes())?;
        file.sync_all()?;

        tracing::info!(path = %path.display(), "created index file");
        Ok(Self::from_parts(path, file, superblock, cache_nodes))
    }

    /// Check that a full bucket and a full node each fit in one page.
    pub fn check_limits(config: TreeConfig) -> Result<(), StoreError> {
        let size = codec::max_record_size::<K, V>(config);
        if size > PageHeader::USABLE_SPACE {
            return Err(StoreError::Incompatible(format!(
                "limits {}/{} need {size} bytes per page, at most {} available",
                config.max_bucket_size(),
                config.max_btree_size(),
                PageHeader::USABLE_SPACE
            )));
        }
        Ok(())
    }

    /// Open an existing index file.
    pub fn open(path: &Path, cache_nodes: usize) -> Result<Self, StoreError> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;

        // Read and validate the superblock
        let mut page = Page::new();
        file.read_exact(page.as_bytes_mut())?;
        let superblock = Superblock::from_page(&page).map_err(|e| {
            tracing::warn!(path = %path.display(), error = %e, "unreadable superblock");
            StoreError::from(e)
        })?;

        if usize::from(superblock.key_width) != K::WIDTH || usize::from(superblock.value_width) != V::WIDTH {
            return Err(StoreError::Incompatible(format!(
                "file stores {}-byte keys and {}-byte values, expected {} and {}",
                superblock.key_width,
                superblock.value_width,
                K::WIDTH,
                V::WIDTH
            )));
        }
        if superblock.config().is_none() {
            return Err(StoreError::Incompatible(format!(
                "invalid tree limits {}/{}",
                superblock.max_bucket_size, superblock.max_btree_size
            )));
        }

        tracing::info!(
            path = %path.display(),
            pages = superblock.total_page_count,
            root = superblock.root,
            "opened index file"
        );
        Ok(Self::from_parts(path, file, superblock, cache_nodes))
    }

    /// Open the file if it exists, otherwise create it. An existing file must
    /// have been created with the same limits.
    pub fn open_or_create(path: &Path, config: TreeConfig, cache_nodes: usize) -> Result<Self, StoreError> {
        if !path.exists() {
            return Self::create(path, config, cache_nodes);
        }

        let store = Self::open(path, cache_nodes)?;
        let stored = store.config();
        if stored != config {
            return Err(StoreError::Incompatible(format!(
                "file uses limits {}/{}, configured {}/{}",
                stored.max_bucket_size(),
                stored.max_btree_size(),
                config.max_bucket_size(),
                config.max_btree_size()
            )));
        }
        Ok(store)
    }

    fn from_parts(path: &Path, file: File, superblock: Superblock, cache_nodes: usize) -> Self {
        Self {
            path: path.to_path_buf(),
            inner: Mutex::new(FileInner {
                file,
                next_page: superblock.total_page_count.max(1),
                superblock,
                free: Vec::new(),
                dirty: HashSet::new(),
                cache: MruCache::new(cache_nodes),
                pages_read: 0,
                pages_written: 0,
            }),
            _marker: PhantomData,
        }
    }

    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    fn lock(&self) -> MutexGuard<'_, FileInner<K, V>> {
        self.inner.lock().expect("lock poisoned")
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Tree limits recorded in the superblock.
    #[must_use]
    pub fn config(&self) -> TreeConfig {
        self.lock().superblock.config().unwrap_or_default()
    }

    #[must_use]
    pub fn stats(&self) -> FileStats {
        let inner = self.lock();
        FileStats {
            total_pages: inner.next_page,
            committed_pages: inner.superblock.total_page_count,
            dirty_nodes: inner.dirty.len(),
            pages_read: inner.pages_read,
            pages_written: inner.pages_written,
            cache_len: inner.cache.len(),
            cache: inner.cache.stats(),
        }
    }
}

impl<K: TreeKey, V: TreeValue> FileInner<K, V> {
    fn read_page(&mut self, page_id: PageId) -> Result<Page, StoreError> {
        if page_id == 0 || page_id >= self.next_page {
            return Err(StoreError::Missing(page_id));
        }

        let mut page = Page::new();
        self.file.seek(SeekFrom::Start(page_id * PAGE_SIZE_U64))?;
        match self.file.read_exact(page.as_bytes_mut()) {
            Ok(()) => {}
            // Allocated but never written
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(StoreError::Missing(page_id));
            }
            Err(e) => return Err(e.into()),
        }
        self.pages_read += 1;
        Ok(page)
    }

    fn write_page(&mut self, page_id: PageId, page: &Page) -> Result<(), StoreError> {
        self.file.seek(SeekFrom::Start(page_id * PAGE_SIZE_U64))?;
        self.file.write_all(page.as_bytes())?;
        self.pages_written += 1;
        Ok(())
    }
}

impl<K: TreeKey, V: TreeValue> NodeStore<K, V> for FileStore<K, V> {
    fn load(&self, id: NodeId) -> Result<Contents<K, V>, StoreError> {
        let mut inner = self.lock();
        if let Some(contents) = inner.cache.get(&id) {
            return Ok(contents.shallow_clone());
        }

        let page = inner.read_page(id)?;
        if page.is_blank() {
            return Err(StoreError::Missing(id));
        }
        let contents = codec::decode(id, &page).inspect_err(|e| {
            tracing::warn!(id, error = %e, path = %self.path.display(), "corrupt node page");
        })?;

        inner.cache.insert(id, contents.shallow_clone());
        Ok(contents)
    }

    fn new_reference(&self, _contents: &Contents<K, V>) -> NodeId {
        let mut inner = self.lock();
        let id = inner.free.pop().unwrap_or_else(|| {
            let id = inner.next_page;
            inner.next_page += 1;
            id
        });
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
        let mut inner = self.lock();
        if inner.dirty.remove(&id) {
            inner.free.push(id);
        }
    }

    fn save(&self, id: NodeId, contents: &Contents<K, V>) -> Result<(), StoreError> {
        let page = codec::encode(id, contents)?;
        let mut inner = self.lock();
        if id == 0 || id >= inner.next_page {
            return Err(StoreError::Missing(id));
        }
        inner.write_page(id, &page)?;
        inner.cache.insert(id, contents.shallow_clone());
        inner.dirty.remove(&id);
        Ok(())
    }

    fn commit(&self, snapshot: Snapshot) -> Result<(), StoreError> {
        let mut inner = self.lock();

        // Data pages must be durable before the superblock points at them
        inner.file.sync_data()?;

        let mut superblock = inner.superblock;
        superblock.root = snapshot.root;
        superblock.len = snapshot.len;
        superblock.total_page_count = inner.next_page;

        let page = superblock.to_page();
        inner.write_page(0, &page)?;
        inner.file.sync_all()?;
        inner.superblock = superblock;

        tracing::debug!(
            root = snapshot.root,
            pages = superblock.total_page_count,
            file_size = superblock.total_page_count * PAGE_SIZE_U64,
            "wrote superblock"
        );
        Ok(())
    }

    fn last_commit(&self) -> Option<Snapshot> {
        self.lock().superblock.snapshot()
    }
}

impl From<SuperblockError> for StoreError {
    fn from(e: SuperblockError) -> Self {
        Self::Corruption(format!("superblock: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempfile::tempdir;

    use super::*;
    use crate::btree::{Bucket, Tree};

    type IntFileStore = FileStore<i32, i64>;

    fn small_config() -> TreeConfig {
        TreeConfig::new(4, 4).expect("valid limits")
    }

    #[test]
    fn test_create_and_reopen_file() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("index.db");

        {
            let store = IntFileStore::create(&path, TreeConfig::default(), 16).expect("create");
            assert_eq!(store.last_commit(), None);
            assert_eq!(store.stats().total_pages, 1);
        }

        let store = IntFileStore::open(&path, 16).expect("open");
        assert_eq!(store.config(), TreeConfig::default());
        assert_eq!(store.last_commit(), None);
    }

    #[test]
    fn test_create_existing_fails() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("index.db");

        let _store = IntFileStore::create(&path, TreeConfig::default(), 16).expect("create");
        assert!(matches!(
            IntFileStore::create(&path, TreeConfig::default(), 16),
            Err(StoreError::Io(_))
        ));
    }

    #[test]
    fn test_create_rejects_limits_larger_than_a_page() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("index.db");

        let oversized = TreeConfig::new(1000, 500).expect("valid limits");
        assert!(matches!(
            IntFileStore::create(&path, oversized, 0),
            Err(StoreError::Incompatible(_))
        ));
        assert!(matches!(
            IntFileStore::open_or_create(&path, oversized, 0),
            Err(StoreError::Incompatible(_))
        ));
        assert!(!path.exists());

        // The largest limits that fit still commit full pages
        let largest = TreeConfig::new(681, 682).expect("valid limits");
        let store = Arc::new(IntFileStore::create(&path, largest, 0).expect("create"));
        let mut tree = Tree::new(Arc::clone(&store), largest);
        tree.update((0..681).map(|k| (k, i64::from(k)))).expect("update");
        tree.commit().expect("full bucket fits");
        assert_eq!(tree.height().expect("height"), 1);
    }

    #[test]
    fn test_save_and_load_node() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("index.db");
        let store = IntFileStore::create(&path, TreeConfig::default(), 0).expect("create");

        let mut bucket = Bucket::new();
        bucket.insert(5, 50, true);
        let contents = Contents::Bucket(bucket);

        let id = store.new_reference(&contents);
        assert_eq!(id, 1);
        assert!(store.is_dirty(id));
        assert!(matches!(store.load(id), Err(StoreError::Missing(1))));

        store.save(id, &contents).expect("save");
        assert!(!store.is_dirty(id));

        let Contents::Bucket(loaded) = store.load(id).expect("load") else {
            panic!("expected bucket");
        };
        assert_eq!(loaded.get(&5), Some(50));
        assert_eq!(store.stats().pages_read, 1);
    }

    #[test]
    fn test_cache_serves_repeat_loads() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("index.db");
        let store = IntFileStore::create(&path, TreeConfig::default(), 8).expect("create");

        let contents = Contents::Bucket(Bucket::new());
        let id = store.new_reference(&contents);
        store.save(id, &contents).expect("save");

        store.load(id).expect("load");
        store.load(id).expect("load");
        let stats = store.stats();
        assert_eq!(stats.pages_read, 0);
        assert_eq!(stats.cache.hits, 2);
    }

    #[test]
    fn test_tree_roundtrip_through_file() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("index.db");

        {
            let store = Arc::new(IntFileStore::create(&path, small_config(), 4).expect("create"));
            let mut tree = Tree::new(Arc::clone(&store), small_config());
            tree.update((0..200).map(|k| (k, i64::from(k) * 7))).expect("update");
            tree.commit().expect("commit");
            // Uncommitted changes are lost on reopen
            tree.set(0, -1).expect("set");
            tree.delete(1).expect("delete");
        }

        let store = Arc::new(IntFileStore::open(&path, 4).expect("open"));
        let tree = Tree::open_latest(Arc::clone(&store), store.config()).expect("open tree");
        assert_eq!(tree.len(), 200);
        assert_eq!(tree.get(0).expect("get"), 0);
        assert_eq!(tree.get(199).expect("get"), 1393);
        tree.check().expect("check");
        assert!(store.stats().pages_read > 0);
    }

    #[test]
    fn test_pages_of_dropped_scratch_trees_are_reused() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("index.db");
        let store = Arc::new(IntFileStore::create(&path, small_config(), 16).expect("create"));

        let mut tree = Tree::new(Arc::clone(&store), small_config());
        tree.update((0..100).map(|k| (k, 1))).expect("update");
        tree.commit().expect("commit");
        let committed = store.stats().total_pages;

        drop(tree.union(&tree).expect("union"));
        let high_water = store.stats().total_pages;
        assert!(high_water > committed);
        assert_eq!(store.stats().dirty_nodes, 0);

        for _ in 0..5 {
            drop(tree.union(&tree).expect("union"));
        }
        assert_eq!(store.stats().total_pages, high_water);

        let copy = tree.union(&tree).expect("union");
        copy.commit().expect("commit");
        let reopened = Tree::open_latest(Arc::clone(&store), small_config()).expect("open");
        assert_eq!(reopened.len(), 100);
        reopened.check().expect("check");
    }

    #[test]
    fn test_open_rejects_width_mismatch() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("index.db");
        let _store = IntFileStore::create(&path, TreeConfig::default(), 0).expect("create");

        let result = FileStore::<u64, i64>::open(&path, 0);
        assert!(matches!(result, Err(StoreError::Incompatible(_))));
    }

    #[test]
    fn test_open_or_create_rejects_limit_mismatch() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("index.db");
        let _store = IntFileStore::open_or_create(&path, TreeConfig::default(), 0).expect("create");

        let result = IntFileStore::open_or_create(&path, small_config(), 0);
        assert!(matches!(result, Err(StoreError::Incompatible(_))));
    }

    #[test]
    fn test_corrupt_page_reported() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("index.db");
        let store = IntFileStore::create(&path, TreeConfig::default(), 0).expect("create");

        let mut bucket = Bucket::new();
        bucket.insert(1, 1, true);
        let contents = Contents::Bucket(bucket);
        let id = store.new_reference(&contents);
        store.save(id, &contents).expect("save");

        {
            let mut file = OpenOptions::new().write(true).open(&path).expect("open raw");
            file.seek(SeekFrom::Start(id * PAGE_SIZE_U64 + 100)).expect("seek");
            file.write_all(&[0xAB]).expect("write");
        }

        assert!(matches!(store.load(id), Err(StoreError::Corruption(_))));
    }
}

//! Node page encoding.
//!
//! Layout after the page header:
//! - `count`: 2 bytes (entries for a bucket, children for a node)
//! - bucket: `count` × (key, value)
//! - node: child 0 id (8 bytes), then `count - 1` × (separator key, child id)
//!
//! Keys and values use their fixed-width little-endian encoding.

use crate::btree::{Bucket, Contents, Entry, Node, NodeRef, TreeConfig, TreeKey, TreeValue};
use crate::storage::page::{Page, PageHeader, PageType};
use crate::storage::store::{NodeId, StoreError};

const COUNT_OFFSET: usize = PageHeader::SIZE;
const DATA_OFFSET: usize = COUNT_OFFSET + 2;
const CHILD_ID_SIZE: usize = 8;

/// Bytes needed to store `contents`, excluding the page header.
#[must_use]
pub fn encoded_size<K: TreeKey, V: TreeValue>(contents: &Contents<K, V>) -> usize {
    let count = contents.len();
    2 + match contents {
        Contents::Bucket(_) => count * (K::WIDTH + V::WIDTH),
        Contents::Node(_) => CHILD_ID_SIZE + count.saturating_sub(1) * (K::WIDTH + CHILD_ID_SIZE),
    }
}

/// Largest record a full bucket or full node can need under `config`,
/// excluding the page header.
#[must_use]
pub fn max_record_size<K: TreeKey, V: TreeValue>(config: TreeConfig) -> usize {
    let bucket = config.max_bucket_size().saturating_mul(K::WIDTH + V::WIDTH);
    let node = (config.max_btree_size() - 1).saturating_mul(K::WIDTH + CHILD_ID_SIZE);
    2 + bucket.max(CHILD_ID_SIZE.saturating_add(node))
}

/// Serialize a node into a sealed page.
pub fn encode<K: TreeKey, V: TreeValue>(id: NodeId, contents: &Contents<K, V>) -> Result<Page, StoreError> {
    let size = encoded_size(contents);
    let count = u16::try_from(contents.len()).ok().filter(|_| size <= PageHeader::USABLE_SPACE);
    let Some(count) = count else {
        return Err(StoreError::RecordTooLarge {
            id,
            size,
            max: PageHeader::USABLE_SPACE,
        });
    };

    let mut page = Page::new();
    page.write_u16(COUNT_OFFSET, count);
    let mut offset = DATA_OFFSET;
    let mut key_buf = vec![0u8; K::WIDTH];

    let page_type = match contents {
        Contents::Bucket(bucket) => {
            let mut value_buf = vec![0u8; V::WIDTH];
            for entry in bucket.entries() {
                entry.key.write_to(&mut key_buf);
                page.write_bytes(offset, &key_buf);
                offset += K::WIDTH;
                entry.value.write_to(&mut value_buf);
                page.write_bytes(offset, &value_buf);
                offset += V::WIDTH;
            }
            PageType::Bucket
        }
        Contents::Node(node) => {
            for (i, child) in node.children().iter().enumerate() {
                if i > 0 {
                    node.keys()[i - 1].write_to(&mut key_buf);
                    page.write_bytes(offset, &key_buf);
                    offset += K::WIDTH;
                }
                page.write_u64(offset, child.id());
                offset += CHILD_ID_SIZE;
            }
            PageType::Node
        }
    };

    page.seal(page_type);
    Ok(page)
}

/// Deserialize a verified page. Child references come back unloaded.
pub fn decode<K: TreeKey, V: TreeValue>(id: NodeId, page: &Page) -> Result<Contents<K, V>, StoreError> {
    let header = page
        .verify()
        .map_err(|e| StoreError::Corruption(format!("page {id}: {e}")))?;
    let count = usize::from(page.read_u16(COUNT_OFFSET));
    let size = 2 + match header.page_type {
        PageType::Bucket => count * (K::WIDTH + V::WIDTH),
        PageType::Node => CHILD_ID_SIZE + count.saturating_sub(1) * (K::WIDTH + CHILD_ID_SIZE),
        PageType::Superblock => 0,
    };
    if size > PageHeader::USABLE_SPACE {
        return Err(StoreError::Corruption(format!("page {id}: count {count} overruns the page")));
    }
    let mut offset = DATA_OFFSET;

    match header.page_type {
        PageType::Bucket => {
            let mut entries = Vec::with_capacity(count);
            for _ in 0..count {
                let key = K::read_from(page.read_bytes(offset, K::WIDTH));
                offset += K::WIDTH;
                let value = V::read_from(page.read_bytes(offset, V::WIDTH));
                offset += V::WIDTH;
                entries.push(Entry { key, value });
            }
            if entries.windows(2).any(|pair| pair[0].key >= pair[1].key) {
                return Err(StoreError::Corruption(format!("page {id}: bucket keys out of order")));
            }
            Ok(Contents::Bucket(Bucket::from_sorted(entries)))
        }
        PageType::Node => {
            if count == 0 {
                return Err(StoreError::Corruption(format!("page {id}: node without children")));
            }
            let mut keys = Vec::with_capacity(count - 1);
            let mut children = Vec::with_capacity(count);
            for i in 0..count {
                if i > 0 {
                    keys.push(K::read_from(page.read_bytes(offset, K::WIDTH)));
                    offset += K::WIDTH;
                }
                children.push(NodeRef::unloaded(page.read_u64(offset)));
                offset += CHILD_ID_SIZE;
            }
            if keys.windows(2).any(|pair| pair[0] >= pair[1]) {
                return Err(StoreError::Corruption(format!("page {id}: separators out of order")));
            }
            Ok(Contents::Node(Node::from_parts(keys, children)))
        }
        PageType::Superblock => Err(StoreError::Corruption(format!(
            "page {id}: superblock where a node was expected"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bucket(keys: impl IntoIterator<Item = i32>) -> Contents<i32, i64> {
        let mut bucket = Bucket::new();
        for key in keys {
            bucket.insert(key, i64::from(key) * -3, true);
        }
        Contents::Bucket(bucket)
    }

    #[test]
    fn test_bucket_page_layout() {
        let page = encode(1, &bucket([1, 2, 3])).expect("encode");
        assert_eq!(page.read_u16(COUNT_OFFSET), 3);
        assert_eq!(page.read_u32(DATA_OFFSET), 1);

        let Contents::Bucket(decoded) = decode::<i32, i64>(1, &page).expect("decode") else {
            panic!("expected bucket");
        };
        assert_eq!(decoded.get(&3), Some(-9));
        assert_eq!(decoded.len(), 3);
    }

    #[test]
    fn test_node_page_keeps_children_unloaded() {
        let node: Node<i32, i64> = Node::from_parts(
            vec![10, 20],
            vec![NodeRef::unloaded(4), NodeRef::unloaded(5), NodeRef::unloaded(6)],
        );
        let page = encode(2, &Contents::Node(node)).expect("encode");

        let Contents::Node(decoded) = decode::<i32, i64>(2, &page).expect("decode") else {
            panic!("expected node");
        };
        assert_eq!(decoded.keys(), &[10, 20]);
        let ids: Vec<NodeId> = decoded.children().iter().map(NodeRef::id).collect();
        assert_eq!(ids, vec![4, 5, 6]);
        assert!(decoded.children().iter().all(|c| !c.is_loaded()));
    }

    #[test]
    fn test_default_limits_fit_in_a_page() {
        let full_bucket = bucket(0..120);
        assert!(encode(1, &full_bucket).is_ok());

        let children = (0..500).map(NodeRef::unloaded).collect();
        let full_node: Contents<i32, i64> = Contents::Node(Node::from_parts((0..499).collect(), children));
        assert!(encode(1, &full_node).is_ok());
    }

    #[test]
    fn test_oversized_bucket_rejected() {
        let huge = bucket(0..1000);
        assert!(matches!(encode(9, &huge), Err(StoreError::RecordTooLarge { id: 9, .. })));
    }

    #[test]
    fn test_corrupted_page_detected() {
        let mut page = encode(1, &bucket([1, 2])).expect("encode");
        page.write_u8(DATA_OFFSET, 0x7F);

        assert!(matches!(decode::<i32, i64>(1, &page), Err(StoreError::Corruption(_))));
    }
}

//! Superblock structure and serialization.
//!
//! The superblock occupies page 0 and records the committed tree version
//! together with the parameters the file was created with.

use crate::btree::TreeConfig;
use crate::storage::page::{PAGE_SIZE, Page, PageId};
use crate::storage::store::Snapshot;

/// Magic number identifying an index file: "ILINDEX1"
pub const MAGIC: [u8; 8] = *b"ILINDEX1";

/// Current format version.
pub const FORMAT_VERSION: u32 = 1;

/// Page size as stored in the superblock.
const PAGE_SIZE_U32: u32 = 8192;
const _: () = assert!(PAGE_SIZE_U32 as usize == PAGE_SIZE);

/// Superblock field offsets.
mod offsets {
    pub const MAGIC: usize = 0;
    pub const FORMAT_VERSION: usize = 8;
    pub const PAGE_SIZE: usize = 12;
    pub const TOTAL_PAGE_COUNT: usize = 16;
    pub const ROOT: usize = 24;
    pub const LEN: usize = 32;
    pub const MAX_BUCKET_SIZE: usize = 40;
    pub const MAX_BTREE_SIZE: usize = 44;
    pub const KEY_WIDTH: usize = 48;
    pub const VALUE_WIDTH: usize = 49;
    /// CRC32 over bytes `0..CHECKSUM`
    pub const CHECKSUM: usize = 52;
    // 56-8191: reserved
}

/// File-level metadata.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Superblock {
    pub format_version: u32,
    /// Page size in bytes (should always be `PAGE_SIZE`).
    pub page_size: u32,
    /// Pages covered by the last commit, including page 0.
    pub total_page_count: u64,
    /// Root of the committed tree. 0 when nothing has been committed yet.
    pub root: PageId,
    /// Entry count of the committed tree.
    pub len: u64,
    pub max_bucket_size: u32,
    pub max_btree_size: u32,
    pub key_width: u8,
    pub value_width: u8,
}

impl Superblock {
    /// Create a superblock for a fresh file.
    ///
    /// Returns `None` if a limit or width does not fit its on-disk field.
    #[must_use]
    pub fn new(config: TreeConfig, key_width: usize, value_width: usize) -> Option<Self> {
        Some(Self {
            format_version: FORMAT_VERSION,
            page_size: PAGE_SIZE_U32,
            total_page_count: 1,
            root: 0,
            len: 0,
            max_bucket_size: u32::try_from(config.max_bucket_size()).ok()?,
            max_btree_size: u32::try_from(config.max_btree_size()).ok()?,
            key_width: u8::try_from(key_width).ok()?,
            value_width: u8::try_from(value_width).ok()?,
        })
    }

    /// The committed version, if any.
    #[must_use]
    pub const fn snapshot(&self) -> Option<Snapshot> {
        if self.root == 0 {
            return None;
        }
        Some(Snapshot {
            root: self.root,
            len: self.len,
        })
    }

    /// Tree limits the file was created with.
    #[must_use]
    pub fn config(&self) -> Option<TreeConfig> {
        TreeConfig::new(
            usize::try_from(self.max_bucket_size).ok()?,
            usize::try_from(self.max_btree_size).ok()?,
        )
    }

    /// Serialize the superblock to a page.
    #[must_use]
    pub fn to_page(&self) -> Page {
        let mut page = Page::new();

        page.write_bytes(offsets::MAGIC, &MAGIC);
        page.write_u32(offsets::FORMAT_VERSION, self.format_version);
        page.write_u32(offsets::PAGE_SIZE, self.page_size);
        page.write_u64(offsets::TOTAL_PAGE_COUNT, self.total_page_count);
        page.write_u64(offsets::ROOT, self.root);
        page.write_u64(offsets::LEN, self.len);
        page.write_u32(offsets::MAX_BUCKET_SIZE, self.max_bucket_size);
        page.write_u32(offsets::MAX_BTREE_SIZE, self.max_btree_size);
        page.write_u8(offsets::KEY_WIDTH, self.key_width);
        page.write_u8(offsets::VALUE_WIDTH, self.value_width);
        page.write_u32(offsets::CHECKSUM, checksum(&page));

        page
    }

    /// Deserialize a superblock from a page.
    pub fn from_page(page: &Page) -> Result<Self, SuperblockError> {
        // Validate magic number
        let mut magic = [0u8; 8];
        magic.copy_from_slice(page.read_bytes(offsets::MAGIC, 8));
        if magic != MAGIC {
            return Err(SuperblockError::InvalidMagic(magic));
        }

        let expected = page.read_u32(offsets::CHECKSUM);
        let actual = checksum(page);
        if expected != actual {
            return Err(SuperblockError::ChecksumMismatch { expected, actual });
        }

        let format_version = page.read_u32(offsets::FORMAT_VERSION);
        if format_version != FORMAT_VERSION {
            return Err(SuperblockError::UnsupportedVersion(format_version));
        }

        let page_size = page.read_u32(offsets::PAGE_SIZE);
        if page_size != PAGE_SIZE_U32 {
            return Err(SuperblockError::InvalidPageSize(page_size));
        }

        Ok(Self {
            format_version,
            page_size,
            total_page_count: page.read_u64(offsets::TOTAL_PAGE_COUNT),
            root: page.read_u64(offsets::ROOT),
            len: page.read_u64(offsets::LEN),
            max_bucket_size: page.read_u32(offsets::MAX_BUCKET_SIZE),
            max_btree_size: page.read_u32(offsets::MAX_BTREE_SIZE),
            key_width: page.read_u8(offsets::KEY_WIDTH),
            value_width: page.read_u8(offsets::VALUE_WIDTH),
        })
    }
}

fn checksum(page: &Page) -> u32 {
    crc32fast::hash(page.read_bytes(0, offsets::CHECKSUM))
}

/// Errors that can occur when reading a superblock.
#[derive(Debug)]
pub enum SuperblockError {
    /// Invalid magic number.
    InvalidMagic([u8; 8]),
    /// Unsupported format version.
    UnsupportedVersion(u32),
    /// Invalid page size.
    InvalidPageSize(u32),
    /// Stored checksum does not match the fields.
    ChecksumMismatch { expected: u32, actual: u32 },
}

impl std::fmt::Display for SuperblockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidMagic(magic) => {
                write!(
                    f,
                    "invalid magic number: {:?}",
                    String::from_utf8_lossy(magic)
                )
            }
            Self::UnsupportedVersion(v) => write!(f, "unsupported format version: {v}"),
            Self::InvalidPageSize(s) => write!(f, "invalid page size: {s}"),
            Self::ChecksumMismatch { expected, actual } => {
                write!(f, "superblock checksum mismatch: expected {expected}, got {actual}")
            }
        }
    }
}

impl std::error::Error for SuperblockError {}

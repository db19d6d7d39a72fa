//! Page types and constants for the file store.
//!
//! The file store uses 8KB pages as the fundamental unit of I/O. Page 0 holds
//! the superblock; every other page holds exactly one node.

/// Page size in bytes (8KB).
pub const PAGE_SIZE: usize = 8192;

/// Page size as u64 for offset calculations.
pub const PAGE_SIZE_U64: u64 = PAGE_SIZE as u64;

/// A page identifier (0-indexed page number).
pub type PageId = u64;

/// Page type identifiers stored in page headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageType {
    /// Superblock (page 0 only)
    Superblock = 0x01,
    /// B-tree internal node
    Node = 0x03,
    /// B-tree leaf bucket
    Bucket = 0x04,
}

impl TryFrom<u8> for PageType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Superblock),
            0x03 => Ok(Self::Node),
            0x04 => Ok(Self::Bucket),
            _ => Err(value),
        }
    }
}

/// Common page header present at the start of every node page.
///
/// Layout:
/// - `page_type`: 1 byte
/// - `flags`: 1 byte
/// - `checksum`: 4 bytes (CRC32)
/// - `reserved`: 2 bytes
///
/// Total: 8 bytes
#[derive(Debug, Copy, Clone)]
pub struct PageHeader {
    pub page_type: PageType,
    pub flags: u8,
    pub checksum: u32,
}

impl PageHeader {
    /// Size of the page header in bytes.
    pub const SIZE: usize = 8;

    /// Usable space in a page after the header.
    pub const USABLE_SPACE: usize = PAGE_SIZE - Self::SIZE;

    /// Serialize the header to bytes.
    #[must_use]
    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0] = self.page_type as u8;
        buf[1] = self.flags;
        buf[2..6].copy_from_slice(&self.checksum.to_le_bytes());
        // bytes 6-7 reserved
        buf
    }

    /// Deserialize a header from bytes.
    pub fn from_bytes(bytes: [u8; Self::SIZE]) -> Result<Self, PageError> {
        let page_type = PageType::try_from(bytes[0]).map_err(PageError::InvalidPageType)?;
        let flags = bytes[1];
        let checksum = u32::from_le_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);

        Ok(Self {
            page_type,
            flags,
            checksum,
        })
    }
}

/// A raw page buffer.
pub struct Page {
    data: Box<[u8; PAGE_SIZE]>,
}

impl Page {
    /// Create a new zeroed page.
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: Box::new([0u8; PAGE_SIZE]),
        }
    }

    /// Get the raw page data.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; PAGE_SIZE] {
        &self.data
    }

    /// Get mutable access to the raw page data.
    pub fn as_bytes_mut(&mut self) -> &mut [u8; PAGE_SIZE] {
        &mut self.data
    }

    /// Read bytes at a specific offset.
    #[must_use]
    pub fn read_bytes(&self, offset: usize, len: usize) -> &[u8] {
        &self.data[offset..offset + len]
    }

    /// Write bytes at a specific offset.
    pub fn write_bytes(&mut self, offset: usize, bytes: &[u8]) {
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    #[must_use]
    pub fn read_u8(&self, offset: usize) -> u8 {
        self.data[offset]
    }

    pub fn write_u8(&mut self, offset: usize, value: u8) {
        self.data[offset] = value;
    }

    #[must_use]
    pub fn read_u16(&self, offset: usize) -> u16 {
        u16::from_le_bytes([self.data[offset], self.data[offset + 1]])
    }

    pub fn write_u16(&mut self, offset: usize, value: u16) {
        self.data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    /// Read a u32 (little-endian) at the given offset.
    #[must_use]
    pub fn read_u32(&self, offset: usize) -> u32 {
        u32::from_le_bytes([
            self.data[offset],
            self.data[offset + 1],
            self.data[offset + 2],
            self.data[offset + 3],
        ])
    }

    /// Write a u32 (little-endian) at the given offset.
    pub fn write_u32(&mut self, offset: usize, value: u32) {
        self.data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Read a u64 (little-endian) at the given offset.
    #[must_use]
    pub fn read_u64(&self, offset: usize) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.data[offset..offset + 8]);
        u64::from_le_bytes(buf)
    }

    /// Write a u64 (little-endian) at the given offset.
    pub fn write_u64(&mut self, offset: usize, value: u64) {
        self.data[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    /// Whether the page was never written.
    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.data.iter().all(|b| *b == 0)
    }

    /// Compute CRC32 checksum of the page data (excluding the checksum field itself).
    /// Assumes checksum is stored at bytes 2-5 of the header.
    #[must_use]
    pub fn compute_checksum(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.data[0..2]); // page_type + flags
        hasher.update(&[0u8; 4]); // zero out checksum field
        hasher.update(&self.data[6..]); // rest of page
        hasher.finalize()
    }

    /// Stamp the header with `page_type` and the checksum of the contents.
    pub fn seal(&mut self, page_type: PageType) {
        self.data[0] = page_type as u8;
        self.data[1] = 0;
        let header = PageHeader {
            page_type,
            flags: 0,
            checksum: self.compute_checksum(),
        };
        self.data[..PageHeader::SIZE].copy_from_slice(&header.to_bytes());
    }

    /// Parse the header and verify the checksum.
    pub fn verify(&self) -> Result<PageHeader, PageError> {
        let mut bytes = [0u8; PageHeader::SIZE];
        bytes.copy_from_slice(&self.data[..PageHeader::SIZE]);
        let header = PageHeader::from_bytes(bytes)?;

        let actual = self.compute_checksum();
        if header.checksum != actual {
            return Err(PageError::ChecksumMismatch {
                expected: header.checksum,
                actual,
            });
        }
        Ok(header)
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("first_16_bytes", &&self.data[..16])
            .finish_non_exhaustive()
    }
}

/// Errors related to page operations.
#[derive(Debug)]
pub enum PageError {
    /// Invalid page type byte.
    InvalidPageType(u8),
    /// Checksum mismatch.
    ChecksumMismatch { expected: u32, actual: u32 },
}

impl std::fmt::Display for PageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidPageType(v) => write!(f, "invalid page type: 0x{v:02x}"),
            Self::ChecksumMismatch { expected, actual } => {
                write!(f, "checksum mismatch: expected {expected}, got {actual}")
            }
        }
    }
}

impl std::error::Error for PageError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_header_fields() {
        let header = PageHeader {
            page_type: PageType::Bucket,
            flags: 0x42,
            checksum: 0xDEAD_BEEF,
        };

        let restored = PageHeader::from_bytes(header.to_bytes()).expect("should parse");

        assert_eq!(restored.page_type, PageType::Bucket);
        assert_eq!(restored.flags, 0x42);
        assert_eq!(restored.checksum, 0xDEAD_BEEF);
    }

    #[test]
    fn test_page_read_write() {
        let mut page = Page::new();
        assert!(page.is_blank());

        page.write_u8(0, 0xFF);
        assert_eq!(page.read_u8(0), 0xFF);

        page.write_u16(50, 0xBEEF);
        assert_eq!(page.read_u16(50), 0xBEEF);

        page.write_u32(100, 0x1234_5678);
        assert_eq!(page.read_u32(100), 0x1234_5678);

        page.write_u64(200, 0x0102_0304_0506_0708);
        assert_eq!(page.read_u64(200), 0x0102_0304_0506_0708);

        page.write_bytes(500, b"hello");
        assert_eq!(page.read_bytes(500, 5), b"hello");
        assert!(!page.is_blank());
    }

    #[test]
    fn test_seal_and_verify() {
        let mut page = Page::new();
        page.write_u64(PageHeader::SIZE, 99);
        page.seal(PageType::Node);

        let header = page.verify().expect("valid page");
        assert_eq!(header.page_type, PageType::Node);

        page.write_u8(PAGE_SIZE - 1, 1);
        assert!(matches!(page.verify(), Err(PageError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_page_type_conversion() {
        assert_eq!(PageType::try_from(0x01), Ok(PageType::Superblock));
        assert_eq!(PageType::try_from(0x04), Ok(PageType::Bucket));
        assert!(PageType::try_from(0xFF).is_err());
    }
}

//! Page structures shared by heap and index files.

use serde::{Deserialize, Serialize};

/// Page size in bytes (16 KB).
pub const PAGE_SIZE: usize = 16 * 1024;

/// Sentinel page number meaning "no page".
pub const INVALID_PAGE_NUM: u32 = u32::MAX;

/// Identifies a page of an open file.
///
/// `file_id` is a handle handed out by the disk manager for the lifetime of
/// the process; only `page_num` is ever persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PageId {
    /// Open file handle.
    pub file_id: u32,
    /// Page number within the file (0-indexed).
    pub page_num: u32,
}

impl PageId {
    /// Creates a new PageId.
    pub fn new(file_id: u32, page_num: u32) -> Self {
        Self { file_id, page_num }
    }

    /// Byte offset of this page within its file.
    pub fn file_offset(&self) -> u64 {
        self.page_num as u64 * PAGE_SIZE as u64
    }
}

impl std::fmt::Display for PageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.file_id, self.page_num)
    }
}

/// Page types in Keystone files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum PageType {
    /// Unallocated/free page.
    Free = 0,
    /// File meta page (always page 0).
    Meta = 1,
    /// Heap data page containing records.
    Heap = 2,
    /// B+ tree leaf page.
    BTreeLeaf = 3,
    /// B+ tree internal page.
    BTreeInternal = 4,
}

impl PageType {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => PageType::Meta,
            2 => PageType::Heap,
            3 => PageType::BTreeLeaf,
            4 => PageType::BTreeInternal,
            _ => PageType::Free,
        }
    }
}

/// Header structure at the beginning of every page.
///
/// Layout (32 bytes total):
/// - page_num: 4 bytes
/// - page_type: 1 byte
/// - flags: 1 byte
/// - entry_count: 2 bytes
/// - checksum: 4 bytes (CRC-32 of the bytes after the header)
/// - reserved: 20 bytes
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PageHeader {
    /// Page number within its file.
    pub page_num: u32,
    /// Type of this page.
    pub page_type: PageType,
    /// Page flags.
    pub flags: PageFlags,
    /// Number of records/entries on this page.
    pub entry_count: u16,
    /// Checksum of the page body, filled in when the page is written out.
    pub checksum: u32,
}

impl PageHeader {
    /// Size of the page header in bytes.
    pub const SIZE: usize = 32;

    /// Byte range of the checksum field inside the header.
    pub const CHECKSUM_RANGE: std::ops::Range<usize> = 8..12;

    /// Creates a new page header.
    pub fn new(page_num: u32, page_type: PageType) -> Self {
        Self {
            page_num,
            page_type,
            flags: PageFlags::empty(),
            entry_count: 0,
            checksum: 0,
        }
    }

    /// Serializes the header to bytes.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.page_num.to_le_bytes());
        buf[4] = self.page_type as u8;
        buf[5] = self.flags.0;
        buf[6..8].copy_from_slice(&self.entry_count.to_le_bytes());
        buf[8..12].copy_from_slice(&self.checksum.to_le_bytes());
        // bytes 12-31 are reserved (already zeroed)
        buf
    }

    /// Deserializes the header from bytes.
    pub fn from_bytes(buf: &[u8]) -> Self {
        Self {
            page_num: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            page_type: PageType::from_u8(buf[4]),
            flags: PageFlags(buf[5]),
            entry_count: u16::from_le_bytes([buf[6], buf[7]]),
            checksum: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
        }
    }

    /// Reads only the page type from raw page data.
    #[inline]
    pub fn page_type_of(data: &[u8]) -> PageType {
        PageType::from_u8(data[4])
    }
}

/// Flags for page state.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PageFlags(u8);

impl PageFlags {
    /// No flags set.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Page has been rewritten by defragmentation.
    pub const COMPACTED: u8 = 0b0000_0001;

    /// Returns true if the compacted flag is set.
    pub fn is_compacted(&self) -> bool {
        self.0 & Self::COMPACTED != 0
    }

    /// Sets the compacted flag.
    pub fn set_compacted(&mut self, compacted: bool) {
        if compacted {
            self.0 |= Self::COMPACTED;
        } else {
            self.0 &= !Self::COMPACTED;
        }
    }
}

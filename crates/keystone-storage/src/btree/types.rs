//! Meta page and entry encoding shared by the B+ tree node types.

use super::constants::{BTREE_MAGIC, VALUE_SIZE};
use keystone_common::page::{PageHeader, PageType, PAGE_SIZE};
use keystone_common::{KeystoneError, Result};

/// Contents of the index meta page (page 0).
///
/// Meta block (16 bytes), placed after the 32-byte page header:
/// - magic: 4 bytes
/// - key_size: 2 bytes
/// - height: 2 bytes (1 = root is a leaf)
/// - root: 4 bytes (page number of the root node)
/// - count: 4 bytes (number of entries)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BTreeMeta {
    pub key_size: u16,
    pub height: u16,
    pub root: u32,
    pub count: u32,
}

impl BTreeMeta {
    /// Offset of the meta block in page 0.
    pub const OFFSET: usize = PageHeader::SIZE;

    /// Size of the meta block in bytes.
    pub const SIZE: usize = 16;

    /// Writes the meta block into a page.
    pub fn write_to(&self, page: &mut [u8; PAGE_SIZE]) {
        let o = Self::OFFSET;
        page[o..o + 4].copy_from_slice(&BTREE_MAGIC.to_le_bytes());
        page[o + 4..o + 6].copy_from_slice(&self.key_size.to_le_bytes());
        page[o + 6..o + 8].copy_from_slice(&self.height.to_le_bytes());
        page[o + 8..o + 12].copy_from_slice(&self.root.to_le_bytes());
        page[o + 12..o + 16].copy_from_slice(&self.count.to_le_bytes());
    }

    /// Reads the meta block, rejecting pages that are not index meta pages.
    pub fn read_from(page: &[u8; PAGE_SIZE]) -> Result<Self> {
        let o = Self::OFFSET;
        let magic = u32::from_le_bytes([page[o], page[o + 1], page[o + 2], page[o + 3]]);
        if PageHeader::page_type_of(page) != PageType::Meta || magic != BTREE_MAGIC {
            return Err(KeystoneError::BTreeCorrupted(
                "page 0 is not an index meta page".to_string(),
            ));
        }
        Ok(Self {
            key_size: u16::from_le_bytes([page[o + 4], page[o + 5]]),
            height: u16::from_le_bytes([page[o + 6], page[o + 7]]),
            root: u32::from_le_bytes([page[o + 8], page[o + 9], page[o + 10], page[o + 11]]),
            count: u32::from_le_bytes([page[o + 12], page[o + 13], page[o + 14], page[o + 15]]),
        })
    }
}

/// Builds the `(key, value)` composite stored in leaves and used as
/// separator in internal nodes. The value is big-endian so that a byte
/// comparison of two composites orders by key first, then by value.
#[inline]
pub fn composite(key: &[u8], value: u32) -> Vec<u8> {
    let mut entry = Vec::with_capacity(key.len() + VALUE_SIZE);
    entry.extend_from_slice(key);
    entry.extend_from_slice(&value.to_be_bytes());
    entry
}

/// Splits a composite back into its key bytes and value.
#[inline]
pub fn split_composite(entry: &[u8]) -> (&[u8], u32) {
    let at = entry.len() - VALUE_SIZE;
    let (key, value) = entry.split_at(at);
    (key, u32::from_be_bytes([value[0], value[1], value[2], value[3]]))
}

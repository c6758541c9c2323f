//! B+ tree page layout constants.

use keystone_common::page::PageHeader;

/// Magic number stored in the index meta page ("KSBT").
pub const BTREE_MAGIC: u32 = 0x4B53_4254;

/// Maximum key size in bytes.
pub const MAX_KEY_SIZE: usize = 256;

/// Maximum tree height. A 16KB page holds hundreds of entries even for the
/// widest keys, so this is never reached in practice.
pub const MAX_HEIGHT: usize = 16;

/// Offset of the node header (right after the page header).
pub(crate) const NODE_HEADER_OFFSET: usize = PageHeader::SIZE;

/// Node header size: link/child pointer (4), level (2), reserved (2).
pub(crate) const NODE_HEADER_SIZE: usize = 8;

/// First byte of the entry array.
pub(crate) const ENTRIES_START: usize = NODE_HEADER_OFFSET + NODE_HEADER_SIZE;

/// Offset of the entry count inside the page header.
pub(crate) const ENTRY_COUNT_OFFSET: usize = 6;

/// Width of the record value stored after each key.
pub(crate) const VALUE_SIZE: usize = 4;

/// Width of a child pointer in internal entries.
pub(crate) const CHILD_SIZE: usize = 4;

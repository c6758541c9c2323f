//! B+ tree node views over raw page buffers.
//!
//! Both node kinds store fixed-width entries in a sorted array right after
//! the node header, so lookups are a binary search over the array and
//! inserts/removals shift the tail with `copy_within`.
//!
//! Leaf layout:
//! ```text
//! +------------------------+ 0
//! | Page Header (32 bytes) |   entry_count lives here
//! +------------------------+ 32
//! | next_leaf: u32         |
//! | level: u16 (0)         |
//! | reserved: u16          |
//! +------------------------+ 40
//! | key_0 | value_0 (BE)   |
//! | key_1 | value_1 (BE)   |
//! | ...                    |
//! +------------------------+
//! ```
//!
//! Internal layout:
//! ```text
//! +------------------------+ 0
//! | Page Header (32 bytes) |
//! +------------------------+ 32
//! | leftmost_child: u32    |
//! | level: u16             |
//! | reserved: u16          |
//! +------------------------+ 40
//! | separator_0 | child_0  |
//! | separator_1 | child_1  |
//! | ...                    |
//! +------------------------+
//! ```
//!
//! A separator is the full `(key, value)` composite of the first entry in
//! the subtree to its right.

use super::constants::{
    CHILD_SIZE, ENTRIES_START, ENTRY_COUNT_OFFSET, NODE_HEADER_OFFSET, VALUE_SIZE,
};
use keystone_common::page::{PageHeader, PageType, INVALID_PAGE_NUM, PAGE_SIZE};

#[inline]
fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

#[inline]
fn entry_count(data: &[u8]) -> usize {
    u16::from_le_bytes([data[ENTRY_COUNT_OFFSET], data[ENTRY_COUNT_OFFSET + 1]]) as usize
}

#[inline]
fn set_entry_count(data: &mut [u8], count: usize) {
    data[ENTRY_COUNT_OFFSET..ENTRY_COUNT_OFFSET + 2].copy_from_slice(&(count as u16).to_le_bytes());
}

fn init_node(data: &mut [u8], page_num: u32, page_type: PageType, link: u32, level: u16) {
    data.fill(0);
    data[..PageHeader::SIZE].copy_from_slice(&PageHeader::new(page_num, page_type).to_bytes());
    let o = NODE_HEADER_OFFSET;
    data[o..o + 4].copy_from_slice(&link.to_le_bytes());
    data[o + 4..o + 6].copy_from_slice(&level.to_le_bytes());
}

/// Leaf node view.
pub struct BTreeLeafPage<T> {
    data: T,
    width: usize,
}

impl<T: AsRef<[u8]>> BTreeLeafPage<T> {
    /// Wraps an existing leaf page holding keys of `key_size` bytes.
    pub fn new(data: T, key_size: usize) -> Self {
        Self {
            data,
            width: key_size + VALUE_SIZE,
        }
    }

    /// Maximum number of entries a leaf can hold.
    pub fn capacity(key_size: usize) -> usize {
        (PAGE_SIZE - ENTRIES_START) / (key_size + VALUE_SIZE)
    }

    #[inline]
    pub fn len(&self) -> usize {
        entry_count(self.data.as_ref())
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Page number of the next leaf to the right, if any.
    pub fn next_leaf(&self) -> Option<u32> {
        match read_u32(self.data.as_ref(), NODE_HEADER_OFFSET) {
            INVALID_PAGE_NUM => None,
            next => Some(next),
        }
    }

    /// Returns entry `index` as a `(key, value)` composite.
    #[inline]
    pub fn entry(&self, index: usize) -> &[u8] {
        let start = ENTRIES_START + index * self.width;
        &self.data.as_ref()[start..start + self.width]
    }

    /// Index of the first entry not less than `target`.
    pub fn lower_bound(&self, target: &[u8]) -> usize {
        let (mut lo, mut hi) = (0, self.len());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.entry(mid) < target {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// Raw bytes of the entries in `[from, len)`.
    pub fn entries_from(&self, from: usize) -> &[u8] {
        let start = ENTRIES_START + from * self.width;
        let end = ENTRIES_START + self.len() * self.width;
        &self.data.as_ref()[start..end]
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> BTreeLeafPage<T> {
    /// Formats `data` as an empty leaf.
    pub fn init(mut data: T, page_num: u32, key_size: usize) -> Self {
        init_node(data.as_mut(), page_num, PageType::BTreeLeaf, INVALID_PAGE_NUM, 0);
        Self::new(data, key_size)
    }

    pub fn set_next_leaf(&mut self, next: Option<u32>) {
        let next = next.unwrap_or(INVALID_PAGE_NUM);
        let o = NODE_HEADER_OFFSET;
        self.data.as_mut()[o..o + 4].copy_from_slice(&next.to_le_bytes());
    }

    /// Inserts a composite at `index`. The caller checks capacity.
    pub fn insert_at(&mut self, index: usize, entry: &[u8]) {
        let len = self.len();
        let width = self.width;
        let start = ENTRIES_START + index * width;
        let end = ENTRIES_START + len * width;
        let data = self.data.as_mut();
        data.copy_within(start..end, start + width);
        data[start..start + width].copy_from_slice(entry);
        set_entry_count(data, len + 1);
    }

    /// Removes the entry at `index`.
    pub fn remove_at(&mut self, index: usize) {
        let len = self.len();
        let width = self.width;
        let start = ENTRIES_START + index * width;
        let end = ENTRIES_START + len * width;
        let data = self.data.as_mut();
        data.copy_within(start + width..end, start);
        data[end - width..end].fill(0);
        set_entry_count(data, len - 1);
    }

    /// Drops every entry from `len` onwards.
    pub fn truncate(&mut self, len: usize) {
        let old = self.len();
        if len >= old {
            return;
        }
        let width = self.width;
        let data = self.data.as_mut();
        data[ENTRIES_START + len * width..ENTRIES_START + old * width].fill(0);
        set_entry_count(data, len);
    }

    /// Appends raw composites (a whole number of entries) after the last one.
    pub fn extend_from(&mut self, entries: &[u8]) {
        let len = self.len();
        let start = ENTRIES_START + len * self.width;
        let added = entries.len() / self.width;
        let data = self.data.as_mut();
        data[start..start + entries.len()].copy_from_slice(entries);
        set_entry_count(data, len + added);
    }
}

/// Internal node view.
pub struct BTreeInternalPage<T> {
    data: T,
    separator_width: usize,
}

impl<T: AsRef<[u8]>> BTreeInternalPage<T> {
    /// Wraps an existing internal page holding keys of `key_size` bytes.
    pub fn new(data: T, key_size: usize) -> Self {
        Self {
            data,
            separator_width: key_size + VALUE_SIZE,
        }
    }

    /// Maximum number of separators an internal node can hold.
    pub fn capacity(key_size: usize) -> usize {
        (PAGE_SIZE - ENTRIES_START) / (key_size + VALUE_SIZE + CHILD_SIZE)
    }

    #[inline]
    fn entry_width(&self) -> usize {
        self.separator_width + CHILD_SIZE
    }

    #[inline]
    pub fn len(&self) -> usize {
        entry_count(self.data.as_ref())
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn leftmost_child(&self) -> u32 {
        read_u32(self.data.as_ref(), NODE_HEADER_OFFSET)
    }

    /// Level above the leaves (1 = children are leaves).
    pub fn level(&self) -> u16 {
        let o = NODE_HEADER_OFFSET + 4;
        u16::from_le_bytes([self.data.as_ref()[o], self.data.as_ref()[o + 1]])
    }

    /// Separator composite of entry `index`.
    #[inline]
    pub fn separator(&self, index: usize) -> &[u8] {
        let start = ENTRIES_START + index * self.entry_width();
        &self.data.as_ref()[start..start + self.separator_width]
    }

    /// Child pointer of entry `index`.
    #[inline]
    pub fn child(&self, index: usize) -> u32 {
        let start = ENTRIES_START + index * self.entry_width() + self.separator_width;
        read_u32(self.data.as_ref(), start)
    }

    /// Number of separators less than or equal to `target`.
    fn upper_bound(&self, target: &[u8]) -> usize {
        let (mut lo, mut hi) = (0, self.len());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.separator(mid) <= target {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// Child whose subtree holds `target`.
    pub fn find_child(&self, target: &[u8]) -> u32 {
        match self.upper_bound(target) {
            0 => self.leftmost_child(),
            i => self.child(i - 1),
        }
    }

    /// Position at which a new separator equal to `target` belongs.
    pub fn insert_position(&self, target: &[u8]) -> usize {
        self.upper_bound(target)
    }

    /// Copies all `(separator, child)` pairs out of the node.
    pub fn entries(&self) -> Vec<(Vec<u8>, u32)> {
        (0..self.len())
            .map(|i| (self.separator(i).to_vec(), self.child(i)))
            .collect()
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> BTreeInternalPage<T> {
    /// Formats `data` as an empty internal node.
    pub fn init(mut data: T, page_num: u32, key_size: usize, leftmost: u32, level: u16) -> Self {
        init_node(data.as_mut(), page_num, PageType::BTreeInternal, leftmost, level);
        Self::new(data, key_size)
    }

    /// Inserts a `(separator, child)` pair at `index`. The caller checks capacity.
    pub fn insert_at(&mut self, index: usize, separator: &[u8], child: u32) {
        let len = self.len();
        let width = self.entry_width();
        let sep_width = self.separator_width;
        let start = ENTRIES_START + index * width;
        let end = ENTRIES_START + len * width;
        let data = self.data.as_mut();
        data.copy_within(start..end, start + width);
        data[start..start + sep_width].copy_from_slice(separator);
        data[start + sep_width..start + width].copy_from_slice(&child.to_le_bytes());
        set_entry_count(data, len + 1);
    }

    /// Replaces all entries of the node.
    pub fn set_entries(&mut self, entries: &[(Vec<u8>, u32)]) {
        let old = self.len();
        let width = self.entry_width();
        let data = self.data.as_mut();
        data[ENTRIES_START..ENTRIES_START + old * width].fill(0);
        set_entry_count(data, 0);
        for (i, (separator, child)) in entries.iter().enumerate() {
            self.insert_at(i, separator, *child);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::types::{composite, split_composite};

    fn page() -> Box<[u8; PAGE_SIZE]> {
        Box::new([0u8; PAGE_SIZE])
    }

    #[test]
    fn test_leaf_capacity() {
        assert_eq!(BTreeLeafPage::<&[u8]>::capacity(4), (PAGE_SIZE - 40) / 8);
        assert_eq!(BTreeInternalPage::<&[u8]>::capacity(4), (PAGE_SIZE - 40) / 12);
    }

    #[test]
    fn test_leaf_sorted_insert_and_remove() {
        let mut buf = page();
        let mut leaf = BTreeLeafPage::init(&mut buf[..], 3, 4);
        assert!(leaf.is_empty());
        assert_eq!(leaf.next_leaf(), None);

        for v in [30u32, 10, 20] {
            let entry = composite(&[0, 0, 0, 1], v);
            let at = leaf.lower_bound(&entry);
            leaf.insert_at(at, &entry);
        }
        assert_eq!(leaf.len(), 3);
        let values: Vec<u32> = (0..3).map(|i| split_composite(leaf.entry(i)).1).collect();
        assert_eq!(values, vec![10, 20, 30]);

        leaf.remove_at(1);
        assert_eq!(leaf.len(), 2);
        assert_eq!(split_composite(leaf.entry(1)).1, 30);

        let header = PageHeader::from_bytes(&buf[..]);
        assert_eq!(header.entry_count, 2);
        assert_eq!(header.page_num, 3);
        assert_eq!(header.page_type, PageType::BTreeLeaf);
    }

    #[test]
    fn test_leaf_truncate_and_extend() {
        let mut left = page();
        let mut right = page();
        let mut a = BTreeLeafPage::init(&mut left[..], 1, 4);
        for v in 0..10u32 {
            a.insert_at(v as usize, &composite(&v.to_be_bytes(), v));
        }
        let tail = a.entries_from(6).to_vec();
        a.truncate(6);
        let mut b = BTreeLeafPage::init(&mut right[..], 2, 4);
        b.extend_from(&tail);
        assert_eq!(a.len(), 6);
        assert_eq!(b.len(), 4);
        assert_eq!(split_composite(b.entry(0)).1, 6);
    }

    #[test]
    fn test_leaf_link() {
        let mut buf = page();
        let mut leaf = BTreeLeafPage::init(&mut buf[..], 1, 8);
        leaf.set_next_leaf(Some(9));
        assert_eq!(leaf.next_leaf(), Some(9));
        leaf.set_next_leaf(None);
        assert_eq!(leaf.next_leaf(), None);
    }

    #[test]
    fn test_internal_find_child() {
        let mut buf = page();
        let mut node = BTreeInternalPage::init(&mut buf[..], 5, 4, 100, 1);
        node.insert_at(0, &composite(&[0, 0, 0, 10], 0), 101);
        node.insert_at(1, &composite(&[0, 0, 0, 20], 0), 102);
        assert_eq!(node.level(), 1);

        assert_eq!(node.find_child(&composite(&[0, 0, 0, 5], 7)), 100);
        assert_eq!(node.find_child(&composite(&[0, 0, 0, 10], 0)), 101);
        assert_eq!(node.find_child(&composite(&[0, 0, 0, 15], 0)), 101);
        assert_eq!(node.find_child(&composite(&[0, 0, 0, 20], 3)), 102);
        assert_eq!(node.find_child(&composite(&[0xFF, 0, 0, 0], 0)), 102);
    }

    #[test]
    fn test_internal_set_entries() {
        let mut buf = page();
        let mut node = BTreeInternalPage::init(&mut buf[..], 5, 4, 100, 1);
        let entries = vec![
            (composite(&[0, 0, 0, 1], 0), 7),
            (composite(&[0, 0, 0, 2], 0), 8),
        ];
        node.set_entries(&entries);
        assert_eq!(node.entries(), entries);
        node.set_entries(&entries[..1]);
        assert_eq!(node.len(), 1);
    }
}

//! Persistent B+ tree index.

use super::constants::{MAX_HEIGHT, MAX_KEY_SIZE};
use super::page::{BTreeInternalPage, BTreeLeafPage};
use super::types::{composite, split_composite, BTreeMeta};
use crate::disk::DiskManager;
use crate::key::KeyCodec;
use crate::store::PageStore;
use keystone_common::page::{PageHeader, PageType};
use keystone_common::{KeystoneError, Result};
use std::sync::Arc;
use tracing::{debug, trace};

/// B+ tree mapping fixed-width keys to `u32` values.
///
/// Entries are ordered by `(key, value)`, which keeps duplicate keys apart
/// and lets `delete_key` address a single entry. Page 0 is the meta page;
/// every other page is a leaf or internal node. Deletion is lazy: entries
/// are removed from their leaf and nodes are never merged.
pub struct BTree {
    store: PageStore,
    codec: KeyCodec,
    meta: BTreeMeta,
    leaf_capacity: usize,
    internal_capacity: usize,
}

impl BTree {
    /// Opens the named index file, creating a meta page and an empty root
    /// leaf when the file does not exist yet.
    pub fn open(disk: Arc<DiskManager>, name: &str, codec: KeyCodec) -> Result<Self> {
        let key_size = codec.key_size();
        if key_size > MAX_KEY_SIZE {
            return Err(KeystoneError::KeyTooLarge {
                size: key_size,
                max: MAX_KEY_SIZE,
            });
        }

        let mut store = PageStore::open(disk, name)?;
        let meta = if store.num_pages() == 0 {
            Self::init_file(&mut store, key_size)?
        } else {
            let meta = BTreeMeta::read_from(store.get(0)?)?;
            if meta.key_size as usize != key_size {
                return Err(KeystoneError::KeySizeMismatch {
                    stored: meta.key_size as usize,
                    expected: key_size,
                });
            }
            if meta.root == 0 || meta.root >= store.num_pages() || meta.height == 0 {
                return Err(KeystoneError::BTreeCorrupted(format!(
                    "{}: invalid root {} at height {}",
                    name, meta.root, meta.height
                )));
            }
            meta
        };

        debug!(
            "[{}] Opened index: {} entries, height {}, {}-byte keys",
            name, meta.count, meta.height, key_size
        );
        Ok(Self {
            store,
            codec,
            meta,
            leaf_capacity: BTreeLeafPage::<&[u8]>::capacity(key_size),
            internal_capacity: BTreeInternalPage::<&[u8]>::capacity(key_size),
        })
    }

    fn init_file(store: &mut PageStore, key_size: usize) -> Result<BTreeMeta> {
        let meta_page = store.allocate();
        let root = store.allocate();
        let meta = BTreeMeta {
            key_size: key_size as u16,
            height: 1,
            root,
            count: 0,
        };
        let page = store.get_mut(meta_page)?;
        page[..PageHeader::SIZE].copy_from_slice(&PageHeader::new(0, PageType::Meta).to_bytes());
        meta.write_to(page);
        BTreeLeafPage::init(store.get_mut(root)?, root, key_size);
        Ok(meta)
    }

    fn save_meta(&mut self) -> Result<()> {
        let meta = self.meta;
        meta.write_to(self.store.get_mut(0)?);
        Ok(())
    }

    /// Returns the file name.
    pub fn name(&self) -> &str {
        self.store.name()
    }

    /// Returns the key codec.
    pub fn codec(&self) -> &KeyCodec {
        &self.codec
    }

    /// Number of entries.
    pub fn count(&self) -> u32 {
        self.meta.count
    }

    /// Tree height (1 = the root is a leaf).
    pub fn height(&self) -> u32 {
        self.meta.height as u32
    }

    #[inline]
    fn key_size(&self) -> usize {
        self.meta.key_size as usize
    }

    fn check_key(&self, key: &[u8]) -> Result<()> {
        if key.len() != self.key_size() {
            return Err(KeystoneError::KeySizeMismatch {
                stored: self.key_size(),
                expected: key.len(),
            });
        }
        Ok(())
    }

    /// Walks from the root to the leaf that holds `target`, recording the
    /// page number of every node on the way.
    fn find_path(&self, target: &[u8]) -> Result<([u32; MAX_HEIGHT], usize)> {
        let mut path = [0u32; MAX_HEIGHT];
        let height = self.meta.height as usize;
        if height > MAX_HEIGHT {
            return Err(KeystoneError::BTreeCorrupted(format!(
                "height {} exceeds {}",
                height, MAX_HEIGHT
            )));
        }

        let mut current = self.meta.root;
        path[0] = current;
        for depth in 1..height {
            let data = self.store.get(current)?;
            if PageHeader::page_type_of(data) != PageType::BTreeInternal {
                return Err(KeystoneError::BTreeCorrupted(format!(
                    "page {} expected to be an internal node",
                    current
                )));
            }
            current = BTreeInternalPage::new(data, self.key_size()).find_child(target);
            path[depth] = current;
        }

        if PageHeader::page_type_of(self.store.get(current)?) != PageType::BTreeLeaf {
            return Err(KeystoneError::BTreeCorrupted(format!(
                "page {} expected to be a leaf",
                current
            )));
        }
        Ok((path, height))
    }

    /// Adds an entry. Duplicate keys each get their own entry.
    pub fn insert_key(&mut self, key: &[u8], value: u32) -> Result<()> {
        self.check_key(key)?;
        let entry = composite(key, value);
        let (path, path_len) = self.find_path(&entry)?;
        let leaf_num = path[path_len - 1];
        let key_size = self.key_size();

        let mut leaf = BTreeLeafPage::new(self.store.get_mut(leaf_num)?, key_size);
        if leaf.len() < self.leaf_capacity {
            let at = leaf.lower_bound(&entry);
            leaf.insert_at(at, &entry);
        } else {
            let (separator, right) = self.split_leaf(leaf_num, &entry)?;
            self.propagate_split(separator, right, &path[..path_len])?;
        }

        self.meta.count += 1;
        self.save_meta()
    }

    /// Splits a full leaf, inserting `entry` into the proper half. Returns
    /// the separator and page number of the new right leaf.
    fn split_leaf(&mut self, leaf_num: u32, entry: &[u8]) -> Result<(Vec<u8>, u32)> {
        let key_size = self.key_size();
        let right_num = self.store.allocate();

        let mut leaf = BTreeLeafPage::new(self.store.get_mut(leaf_num)?, key_size);
        let mid = leaf.len() / 2;
        let moved = leaf.entries_from(mid).to_vec();
        let old_next = leaf.next_leaf();
        leaf.truncate(mid);
        leaf.set_next_leaf(Some(right_num));
        let goes_left = entry < &moved[..entry.len()];
        if goes_left {
            let at = leaf.lower_bound(entry);
            leaf.insert_at(at, entry);
        }

        let mut right = BTreeLeafPage::init(self.store.get_mut(right_num)?, right_num, key_size);
        right.extend_from(&moved);
        right.set_next_leaf(old_next);
        if !goes_left {
            let at = right.lower_bound(entry);
            right.insert_at(at, entry);
        }
        let separator = right.entry(0).to_vec();

        trace!(
            "[{}] Split leaf {} -> {} at {}",
            self.store.name(),
            leaf_num,
            right_num,
            mid
        );
        Ok((separator, right_num))
    }

    /// Inserts a separator into the parents along `path`, splitting full
    /// internal nodes and growing a new root when the old one splits.
    fn propagate_split(&mut self, separator: Vec<u8>, child: u32, path: &[u32]) -> Result<()> {
        let key_size = self.key_size();
        let mut separator = separator;
        let mut child = child;

        for depth in (0..path.len() - 1).rev() {
            let node_num = path[depth];
            let mut node = BTreeInternalPage::new(self.store.get_mut(node_num)?, key_size);
            let at = node.insert_position(&separator);
            if node.len() < self.internal_capacity {
                node.insert_at(at, &separator, child);
                return Ok(());
            }

            let mut entries = node.entries();
            entries.insert(at, (separator, child));
            let mid = entries.len() / 2;
            let right_entries = entries.split_off(mid + 1);
            let (promoted, right_leftmost) = entries.pop().ok_or_else(|| {
                KeystoneError::BTreeCorrupted("empty internal node split".to_string())
            })?;
            let level = node.level();
            node.set_entries(&entries);

            let right_num = self.store.allocate();
            let mut right = BTreeInternalPage::init(
                self.store.get_mut(right_num)?,
                right_num,
                key_size,
                right_leftmost,
                level,
            );
            right.set_entries(&right_entries);

            trace!(
                "[{}] Split internal node {} -> {} at level {}",
                self.store.name(),
                node_num,
                right_num,
                level
            );
            separator = promoted;
            child = right_num;
        }

        self.grow_root(separator, child)
    }

    fn grow_root(&mut self, separator: Vec<u8>, right: u32) -> Result<()> {
        if self.meta.height as usize >= MAX_HEIGHT {
            return Err(KeystoneError::NodeFull);
        }
        let key_size = self.key_size();
        let old_root = self.meta.root;
        let new_root = self.store.allocate();
        let mut root = BTreeInternalPage::init(
            self.store.get_mut(new_root)?,
            new_root,
            key_size,
            old_root,
            self.meta.height,
        );
        root.insert_at(0, &separator, right);

        self.meta.root = new_root;
        self.meta.height += 1;
        trace!(
            "[{}] New root {} at height {}",
            self.store.name(),
            new_root,
            self.meta.height
        );
        Ok(())
    }

    /// Removes the entry `(key, value)`. Returns false if it is not present.
    pub fn delete_key(&mut self, key: &[u8], value: u32) -> Result<bool> {
        self.check_key(key)?;
        let entry = composite(key, value);
        let (path, path_len) = self.find_path(&entry)?;
        let key_size = self.key_size();

        let leaf_num = path[path_len - 1];
        let mut leaf = BTreeLeafPage::new(self.store.get_mut(leaf_num)?, key_size);
        let at = leaf.lower_bound(&entry);
        if at >= leaf.len() || leaf.entry(at) != entry.as_slice() {
            return Ok(false);
        }
        leaf.remove_at(at);
        self.meta.count -= 1;
        self.save_meta()?;
        Ok(true)
    }

    /// Visits every entry with `low <= key <= high` in order. The visitor
    /// returns false to stop early. Returns the number of entries visited.
    pub fn scan_range<F>(&self, low: &[u8], high: &[u8], mut visit: F) -> Result<usize>
    where
        F: FnMut(&[u8], u32) -> bool,
    {
        self.check_key(low)?;
        self.check_key(high)?;
        if low > high {
            return Ok(0);
        }

        let low_entry = composite(low, 0);
        let high_entry = composite(high, u32::MAX);
        let (path, path_len) = self.find_path(&low_entry)?;
        let key_size = self.key_size();

        let mut visited = 0;
        let mut current = Some(path[path_len - 1]);
        let mut first = true;
        while let Some(page_num) = current {
            let leaf = BTreeLeafPage::new(self.store.get(page_num)?, key_size);
            let start = if first { leaf.lower_bound(&low_entry) } else { 0 };
            first = false;
            for i in start..leaf.len() {
                let entry = leaf.entry(i);
                if entry > high_entry.as_slice() {
                    return Ok(visited);
                }
                let (key, value) = split_composite(entry);
                visited += 1;
                if !visit(key, value) {
                    return Ok(visited);
                }
            }
            current = leaf.next_leaf();
        }
        Ok(visited)
    }

    /// Appends the values of all entries with `low <= key <= high` to `out`
    /// in key order. An inverted range yields nothing.
    pub fn search_for_range(&self, low: &[u8], high: &[u8], out: &mut Vec<u32>) -> Result<usize> {
        self.scan_range(low, high, |_, value| {
            out.push(value);
            true
        })
    }

    /// Appends the values of all entries with exactly `key` to `out`.
    pub fn search_exact(&self, key: &[u8], out: &mut Vec<u32>) -> Result<usize> {
        self.search_for_range(key, key, out)
    }

    /// Drops every entry, leaving an empty root leaf.
    pub fn clear(&mut self) -> Result<()> {
        let key_size = self.key_size();
        self.store.reset()?;
        self.meta = Self::init_file(&mut self.store, key_size)?;
        debug!("[{}] Cleared index", self.store.name());
        Ok(())
    }

    /// Writes all modified pages to disk.
    pub fn flush(&mut self) -> Result<()> {
        self.store.flush()
    }

    /// Flushes and releases the file.
    pub fn close(self) -> Result<()> {
        debug!("[{}] Closing index", self.store.name());
        self.store.close()
    }
}

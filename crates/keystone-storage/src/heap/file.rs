//! Heap file holding the records of one table.
//!
//! Page 0 is a meta page carrying the table's persisted record ID counter and
//! live record count. All other pages are slotted heap pages. New records are
//! appended to the last page; a page is never revisited for inserts once a
//! later page exists, so record offsets grow in insertion order until the
//! file is rewritten by defragmentation.

use super::constants::{HEAP_MAGIC, MAX_RECORD_SIZE};
use super::page::HeapPage;
use crate::disk::DiskManager;
use crate::record::{RecordHeader, RecordOffset, StoredRecord};
use crate::store::PageStore;
use bytes::Bytes;
use keystone_common::page::{PageHeader, PageType, PAGE_SIZE};
use keystone_common::{KeystoneError, Result};
use std::sync::Arc;
use tracing::debug;

/// Result of `HeapFile::compute_wasted_space`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WastedSpace {
    /// Live records.
    pub normal_record_count: u32,
    /// Live records plus tombstones not yet reclaimed.
    pub total_record_count: u32,
}

/// Contents of the heap meta page.
///
/// Meta block (12 bytes), placed after the 32-byte page header:
/// - magic: 4 bytes
/// - next_id: 4 bytes
/// - normal_count: 4 bytes
#[derive(Debug, Clone, Copy)]
struct HeapMeta {
    next_id: u32,
    normal_count: u32,
}

impl HeapMeta {
    const OFFSET: usize = PageHeader::SIZE;

    fn write_to(&self, page: &mut [u8; PAGE_SIZE]) {
        let o = Self::OFFSET;
        page[o..o + 4].copy_from_slice(&HEAP_MAGIC.to_le_bytes());
        page[o + 4..o + 8].copy_from_slice(&self.next_id.to_le_bytes());
        page[o + 8..o + 12].copy_from_slice(&self.normal_count.to_le_bytes());
    }

    fn read_from(page: &[u8; PAGE_SIZE]) -> Result<Self> {
        let o = Self::OFFSET;
        let magic = u32::from_le_bytes([page[o], page[o + 1], page[o + 2], page[o + 3]]);
        if PageHeader::page_type_of(page) != PageType::Meta || magic != HEAP_MAGIC {
            return Err(KeystoneError::PageCorrupted {
                page_num: 0,
                reason: "not a heap meta page".to_string(),
            });
        }
        Ok(Self {
            next_id: u32::from_le_bytes([page[o + 4], page[o + 5], page[o + 6], page[o + 7]]),
            normal_count: u32::from_le_bytes([
                page[o + 8],
                page[o + 9],
                page[o + 10],
                page[o + 11],
            ]),
        })
    }
}

/// Record storage for one table.
pub struct HeapFile {
    store: PageStore,
    meta: HeapMeta,
}

impl HeapFile {
    /// Opens the named heap file, creating it with an empty meta page if it
    /// does not exist yet.
    pub fn open(disk: Arc<DiskManager>, name: &str) -> Result<Self> {
        let mut store = PageStore::open(disk, name)?;

        let meta = if store.num_pages() == 0 {
            let meta = HeapMeta {
                next_id: 0,
                normal_count: 0,
            };
            Self::init_meta_page(&mut store, meta)?;
            meta
        } else {
            HeapMeta::read_from(store.get(0)?)?
        };

        debug!(
            "[{}] Opened heap file: {} pages, {} records, next id {}",
            name,
            store.num_pages(),
            meta.normal_count,
            meta.next_id
        );
        Ok(Self { store, meta })
    }

    fn init_meta_page(store: &mut PageStore, meta: HeapMeta) -> Result<()> {
        let page_num = store.allocate();
        let page = store.get_mut(page_num)?;
        page[..PageHeader::SIZE].copy_from_slice(&PageHeader::new(0, PageType::Meta).to_bytes());
        meta.write_to(page);
        Ok(())
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

    /// Returns the ID the next new record will receive.
    pub fn next_id(&self) -> u32 {
        self.meta.next_id
    }

    /// Hands out the next record ID and advances the persisted counter.
    pub fn allocate_id(&mut self) -> Result<u32> {
        let id = self.meta.next_id;
        self.meta.next_id = id.checked_add(1).ok_or_else(|| {
            KeystoneError::IoError(format!("{}: record IDs exhausted", self.store.name()))
        })?;
        self.save_meta()?;
        Ok(id)
    }

    /// Number of live records.
    pub fn count(&self) -> u32 {
        self.meta.normal_count
    }

    fn encode(record_id: u32, body: &[u8]) -> Result<Vec<u8>> {
        let size = RecordHeader::SIZE + body.len();
        if size > MAX_RECORD_SIZE {
            return Err(KeystoneError::RecordTooLarge {
                size,
                max: MAX_RECORD_SIZE,
            });
        }
        let mut bytes = Vec::with_capacity(size);
        bytes.extend_from_slice(&RecordHeader::new(record_id, body.len() as u16).to_bytes());
        bytes.extend_from_slice(body);
        Ok(bytes)
    }

    /// Appends a record, allocating a new page when the last one is full.
    fn append(&mut self, record: &[u8]) -> Result<RecordOffset> {
        let last = self.store.num_pages() - 1;
        if last > 0 && HeapPage::new(self.store.get(last)?).can_fit(record.len()) {
            let slot = HeapPage::new(self.store.get_mut(last)?).insert_record(record)?;
            return Ok(RecordOffset::from_slot(last, slot));
        }

        let page_num = self.store.num_pages();
        if page_num > RecordOffset::MAX_PAGE_NUM {
            return Err(KeystoneError::IoError(format!(
                "{}: heap file exceeds the addressable size",
                self.store.name()
            )));
        }
        self.store.allocate();
        let mut page = HeapPage::init(self.store.get_mut(page_num)?, page_num);
        let slot = page.insert_record(record)?;
        Ok(RecordOffset::from_slot(page_num, slot))
    }

    /// Inserts a new live record and returns its offset.
    pub fn insert(&mut self, record_id: u32, body: &[u8]) -> Result<RecordOffset> {
        let record = Self::encode(record_id, body)?;
        let offset = self.append(&record)?;
        self.meta.normal_count += 1;
        self.save_meta()?;
        Ok(offset)
    }

    fn locate(&self, offset: RecordOffset) -> Result<(u32, u16)> {
        let page_num = offset.page_num();
        match offset.slot() {
            Some(slot) if page_num > 0 && page_num < self.store.num_pages() => {
                Ok((page_num, slot))
            }
            _ => Err(KeystoneError::RecordNotFound(offset.0)),
        }
    }

    /// Reads the record stored at an offset. Tombstones are returned too.
    pub fn read(&self, offset: RecordOffset) -> Result<StoredRecord> {
        let (page_num, slot) = self.locate(offset)?;
        let page = HeapPage::new(self.store.get(page_num)?);
        let bytes = page
            .record_bytes(slot)
            .ok_or(KeystoneError::RecordNotFound(offset.0))?;
        let header = RecordHeader::from_bytes(&bytes[..RecordHeader::SIZE]);
        let end = RecordHeader::SIZE + header.data_len as usize;
        if end > bytes.len() {
            return Err(KeystoneError::PageCorrupted {
                page_num,
                reason: format!("record in slot {} is truncated", slot),
            });
        }
        Ok(StoredRecord {
            header,
            body: Bytes::copy_from_slice(&bytes[RecordHeader::SIZE..end]),
        })
    }

    /// Replaces the body of a live record.
    ///
    /// The record keeps its offset when the new body fits on its page;
    /// otherwise the old slot becomes a tombstone and the record is appended
    /// at a new offset, which is returned.
    pub fn update(&mut self, offset: RecordOffset, body: &[u8]) -> Result<RecordOffset> {
        let current = self.read(offset)?;
        if current.is_deleted() {
            return Err(KeystoneError::RecordNotFound(offset.0));
        }
        let record = Self::encode(current.id(), body)?;
        let (page_num, slot) = self.locate(offset)?;

        let result = HeapPage::new(self.store.get_mut(page_num)?).update_record(slot, &record);
        match result {
            Ok(()) => Ok(offset),
            Err(KeystoneError::PageFull) => {
                HeapPage::new(self.store.get_mut(page_num)?).mark_deleted(slot);
                let moved = self.append(&record)?;
                debug!(
                    "[{}] Record {} moved from {} to {}",
                    self.store.name(),
                    current.id(),
                    offset,
                    moved
                );
                Ok(moved)
            }
            Err(e) => Err(e),
        }
    }

    /// Turns the record at an offset into a tombstone.
    pub fn delete(&mut self, offset: RecordOffset) -> Result<()> {
        let (page_num, slot) = self.locate(offset)?;
        if !HeapPage::new(self.store.get_mut(page_num)?).mark_deleted(slot) {
            return Err(KeystoneError::RecordNotFound(offset.0));
        }
        self.meta.normal_count = self.meta.normal_count.saturating_sub(1);
        self.save_meta()
    }

    /// Iterates over every stored record in heap order, tombstones included.
    pub fn scan(&self) -> HeapScan<'_> {
        HeapScan {
            file: self,
            page_num: 1,
            slot: 0,
        }
    }

    /// Counts live records and tombstones.
    pub fn compute_wasted_space(&self) -> Result<WastedSpace> {
        let mut wasted = WastedSpace::default();
        for page_num in 1..self.store.num_pages() {
            let page = HeapPage::new(self.store.get(page_num)?);
            let header = page.heap_header();
            wasted.total_record_count += header.slot_count as u32;
            wasted.normal_record_count += (header.slot_count - header.tombstones) as u32;
        }
        Ok(wasted)
    }

    /// Replaces the whole file contents with the given live records, in the
    /// given order. The record ID counter is kept.
    ///
    /// Returns the new offset of each record, in input order.
    pub fn rewrite<I>(&mut self, records: I) -> Result<Vec<RecordOffset>>
    where
        I: IntoIterator<Item = (u32, Bytes)>,
    {
        let next_id = self.meta.next_id;
        self.store.reset()?;
        self.meta = HeapMeta {
            next_id,
            normal_count: 0,
        };
        Self::init_meta_page(&mut self.store, self.meta)?;

        let mut offsets = Vec::new();
        for (record_id, body) in records {
            offsets.push(self.insert(record_id, &body)?);
        }
        for page_num in 1..self.store.num_pages() {
            let page = self.store.get_mut(page_num)?;
            let mut header = PageHeader::from_bytes(&page[..]);
            header.flags.set_compacted(true);
            page[..PageHeader::SIZE].copy_from_slice(&header.to_bytes());
        }
        self.store.flush()?;
        debug!(
            "[{}] Rewrote heap file: {} records in {} pages",
            self.store.name(),
            offsets.len(),
            self.store.num_pages()
        );
        Ok(offsets)
    }

    /// Number of pages, meta page included.
    pub fn num_pages(&self) -> u32 {
        self.store.num_pages()
    }

    /// Writes all modified pages to disk.
    pub fn flush(&mut self) -> Result<()> {
        self.store.flush()
    }

    /// Flushes and closes the file.
    pub fn close(self) -> Result<()> {
        self.store.close()
    }
}

/// Iterator over the records of a heap file.
pub struct HeapScan<'a> {
    file: &'a HeapFile,
    page_num: u32,
    slot: u16,
}

impl Iterator for HeapScan<'_> {
    type Item = Result<(RecordOffset, StoredRecord)>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.page_num < self.file.store.num_pages() {
            let data = match self.file.store.get(self.page_num) {
                Ok(data) => data,
                Err(e) => return Some(Err(e)),
            };
            if self.slot >= HeapPage::new(data).slot_count() {
                self.page_num += 1;
                self.slot = 0;
                continue;
            }
            let offset = RecordOffset::from_slot(self.page_num, self.slot);
            self.slot += 1;
            return Some(self.file.read(offset).map(|record| (offset, record)));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::DiskManagerConfig;
    use tempfile::tempdir;

    fn create_disk(dir: &tempfile::TempDir) -> Arc<DiskManager> {
        Arc::new(
            DiskManager::new(DiskManagerConfig {
                data_dir: dir.path().to_path_buf(),
                fsync_enabled: false,
            })
            .unwrap(),
        )
    }

    fn insert_new(heap: &mut HeapFile, body: &[u8]) -> (u32, RecordOffset) {
        let id = heap.allocate_id().unwrap();
        (id, heap.insert(id, body).unwrap())
    }

    #[test]
    fn test_heap_file_new() {
        let dir = tempdir().unwrap();
        let heap = HeapFile::open(create_disk(&dir), "t.dat").unwrap();
        assert_eq!(heap.next_id(), 0);
        assert_eq!(heap.count(), 0);
        assert_eq!(heap.num_pages(), 1);
    }

    #[test]
    fn test_insert_read() {
        let dir = tempdir().unwrap();
        let mut heap = HeapFile::open(create_disk(&dir), "t.dat").unwrap();

        let (id, offset) = insert_new(&mut heap, b"hello");
        let record = heap.read(offset).unwrap();
        assert_eq!(record.id(), id);
        assert_eq!(&record.body[..], b"hello");
        assert!(!record.is_deleted());
        assert_eq!(heap.count(), 1);
        assert_eq!(heap.next_id(), 1);
    }

    #[test]
    fn test_read_invalid_offset() {
        let dir = tempdir().unwrap();
        let mut heap = HeapFile::open(create_disk(&dir), "t.dat").unwrap();
        let (_, offset) = insert_new(&mut heap, b"x");

        assert!(matches!(
            heap.read(RecordOffset(0)),
            Err(KeystoneError::RecordNotFound(0))
        ));
        assert!(heap.read(RecordOffset(offset.0 + 4)).is_err());
        assert!(heap.read(RecordOffset(offset.0 + 1)).is_err());
        assert!(heap.read(RecordOffset::from_slot(50, 0)).is_err());
    }

    #[test]
    fn test_inserts_span_pages() {
        let dir = tempdir().unwrap();
        let mut heap = HeapFile::open(create_disk(&dir), "t.dat").unwrap();
        let body = vec![9u8; 3000];

        let offsets: Vec<_> = (0..20).map(|_| insert_new(&mut heap, &body).1).collect();
        assert!(heap.num_pages() > 2);
        assert!(offsets.windows(2).all(|w| w[0] < w[1]));
        for offset in offsets {
            assert_eq!(heap.read(offset).unwrap().body.len(), 3000);
        }
    }

    #[test]
    fn test_record_too_large() {
        let dir = tempdir().unwrap();
        let mut heap = HeapFile::open(create_disk(&dir), "t.dat").unwrap();
        let body = vec![0u8; PAGE_SIZE];
        assert!(matches!(
            heap.insert(0, &body),
            Err(KeystoneError::RecordTooLarge { .. })
        ));
        assert_eq!(heap.count(), 0);
    }

    #[test]
    fn test_delete_leaves_tombstone() {
        let dir = tempdir().unwrap();
        let mut heap = HeapFile::open(create_disk(&dir), "t.dat").unwrap();
        let (_, a) = insert_new(&mut heap, b"a");
        let (_, b) = insert_new(&mut heap, b"b");

        heap.delete(a).unwrap();
        assert!(matches!(heap.delete(a), Err(KeystoneError::RecordNotFound(_))));

        let tombstone = heap.read(a).unwrap();
        assert!(tombstone.is_deleted());
        assert_eq!(&tombstone.body[..], b"a");
        assert!(!heap.read(b).unwrap().is_deleted());

        assert_eq!(heap.count(), 1);
        assert_eq!(
            heap.compute_wasted_space().unwrap(),
            WastedSpace {
                normal_record_count: 1,
                total_record_count: 2
            }
        );
    }

    #[test]
    fn test_update_in_place_and_relocate() {
        let dir = tempdir().unwrap();
        let mut heap = HeapFile::open(create_disk(&dir), "t.dat").unwrap();
        let (id, offset) = insert_new(&mut heap, &[1u8; 100]);

        let same = heap.update(offset, &[2u8; 50]).unwrap();
        assert_eq!(same, offset);
        assert_eq!(&heap.read(offset).unwrap().body[..], &[2u8; 50]);

        // Fill the page so a big update cannot stay.
        for _ in 0..3 {
            insert_new(&mut heap, &[3u8; 5000]);
        }
        let moved = heap.update(offset, &[4u8; 6000]).unwrap();
        assert_ne!(moved, offset);
        assert!(heap.read(offset).unwrap().is_deleted());
        let record = heap.read(moved).unwrap();
        assert_eq!(record.id(), id);
        assert_eq!(record.body.len(), 6000);

        assert_eq!(heap.count(), 4);
        let wasted = heap.compute_wasted_space().unwrap();
        assert_eq!(wasted.normal_record_count, 4);
        assert_eq!(wasted.total_record_count, 5);
    }

    #[test]
    fn test_scan_in_heap_order() {
        let dir = tempdir().unwrap();
        let mut heap = HeapFile::open(create_disk(&dir), "t.dat").unwrap();
        for i in 0..10u8 {
            insert_new(&mut heap, &[i; 2000]);
        }
        let third = RecordOffset::from_slot(1, 3);
        heap.delete(third).unwrap();

        let scanned: Vec<_> = heap.scan().map(|r| r.unwrap()).collect();
        assert_eq!(scanned.len(), 10);
        let ids: Vec<u32> = scanned.iter().map(|(_, r)| r.id()).collect();
        assert_eq!(ids, (0..10).collect::<Vec<_>>());
        assert!(scanned[3].1.is_deleted());
        assert_eq!(scanned.iter().filter(|(_, r)| !r.is_deleted()).count(), 9);
    }

    #[test]
    fn test_next_id_persists() {
        let dir = tempdir().unwrap();
        let disk = create_disk(&dir);
        {
            let mut heap = HeapFile::open(disk.clone(), "t.dat").unwrap();
            let (_, a) = insert_new(&mut heap, b"a");
            insert_new(&mut heap, b"b");
            heap.delete(a).unwrap();
            heap.close().unwrap();
        }

        let mut heap = HeapFile::open(disk, "t.dat").unwrap();
        assert_eq!(heap.next_id(), 2);
        assert_eq!(heap.count(), 1);
        assert_eq!(heap.allocate_id().unwrap(), 2);
    }

    #[test]
    fn test_rewrite_drops_tombstones() {
        let dir = tempdir().unwrap();
        let mut heap = HeapFile::open(create_disk(&dir), "t.dat").unwrap();
        let mut offsets = Vec::new();
        for i in 0..6u8 {
            offsets.push(insert_new(&mut heap, &[i; 10]).1);
        }
        heap.delete(offsets[1]).unwrap();
        heap.delete(offsets[4]).unwrap();

        let mut live: Vec<(u32, Bytes)> = heap
            .scan()
            .map(|r| r.unwrap())
            .filter(|(_, r)| !r.is_deleted())
            .map(|(_, r)| (r.id(), r.body))
            .collect();
        live.reverse();
        let new_offsets = heap.rewrite(live).unwrap();

        assert_eq!(new_offsets.len(), 4);
        assert_eq!(heap.count(), 4);
        assert_eq!(heap.next_id(), 6);
        let wasted = heap.compute_wasted_space().unwrap();
        assert_eq!(wasted.normal_record_count, wasted.total_record_count);

        // Reverse order was preserved.
        assert_eq!(heap.read(new_offsets[0]).unwrap().id(), 5);
        assert_eq!(heap.read(new_offsets[3]).unwrap().id(), 0);

        let page = heap.store.get(new_offsets[0].page_num()).unwrap();
        assert!(PageHeader::from_bytes(&page[..]).flags.is_compacted());
    }
}

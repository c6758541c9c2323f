//! Heap page implementation using slotted page format.
//!
//! Page layout:
//! ```text
//! +------------------+
//! | Page Header (32) |
//! +------------------+
//! | Heap Header (8)  |
//! +------------------+
//! | Slot Array       |  <- Grows downward
//! | (4 bytes/slot)   |
//! +------------------+
//! |                  |
//! | Free Space       |
//! |                  |
//! +------------------+
//! | Record Data      |  <- Grows upward
//! +------------------+
//! ```
//!
//! Slots are never reused: a deleted record keeps its slot with the
//! tombstone flag set in its header until the file is defragmented, so a
//! record offset never silently starts pointing at another record.

use super::constants::{DATA_START, HEAP_HEADER_OFFSET, HEAP_HEADER_SIZE, RECORD_SLOT_SIZE};
use crate::record::RecordHeader;
use keystone_common::page::{PageHeader, PageType, PAGE_SIZE};
use keystone_common::{KeystoneError, Result};

/// A slot in the slot array pointing to record data.
///
/// Layout (4 bytes):
/// - offset: 2 bytes (offset from page start to record data)
/// - length: 2 bytes (length of record data including header)
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordSlot {
    pub offset: u16,
    pub length: u16,
}

impl RecordSlot {
    /// Size of a slot entry in bytes.
    pub const SIZE: usize = RECORD_SLOT_SIZE;

    /// Creates a new slot.
    pub fn new(offset: u16, length: u16) -> Self {
        Self { offset, length }
    }

    /// Serializes the slot to bytes.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..2].copy_from_slice(&self.offset.to_le_bytes());
        buf[2..4].copy_from_slice(&self.length.to_le_bytes());
        buf
    }

    /// Deserializes a slot from bytes.
    pub fn from_bytes(buf: &[u8]) -> Self {
        Self {
            offset: u16::from_le_bytes([buf[0], buf[1]]),
            length: u16::from_le_bytes([buf[2], buf[3]]),
        }
    }
}

/// Heap page header extension.
///
/// Stored after the standard PageHeader.
/// Layout (8 bytes):
/// - slot_count: 2 bytes
/// - free_space_start: 2 bytes (end of slot array)
/// - free_space_end: 2 bytes (start of record data)
/// - tombstones: 2 bytes (slots whose record is deleted)
#[derive(Debug, Clone, Copy)]
pub struct HeapPageHeader {
    pub slot_count: u16,
    pub free_space_start: u16,
    pub free_space_end: u16,
    pub tombstones: u16,
}

impl HeapPageHeader {
    /// Size of the heap page header in bytes.
    pub const SIZE: usize = HEAP_HEADER_SIZE;

    /// Offset of heap header in page (after PageHeader).
    pub const OFFSET: usize = HEAP_HEADER_OFFSET;

    /// Creates a new heap page header.
    pub fn new() -> Self {
        Self {
            slot_count: 0,
            free_space_start: DATA_START as u16,
            free_space_end: PAGE_SIZE as u16,
            tombstones: 0,
        }
    }

    /// Returns the amount of contiguous free space available.
    pub fn free_space(&self) -> usize {
        (self.free_space_end as usize).saturating_sub(self.free_space_start as usize)
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..2].copy_from_slice(&self.slot_count.to_le_bytes());
        buf[2..4].copy_from_slice(&self.free_space_start.to_le_bytes());
        buf[4..6].copy_from_slice(&self.free_space_end.to_le_bytes());
        buf[6..8].copy_from_slice(&self.tombstones.to_le_bytes());
        buf
    }

    /// Deserializes from bytes.
    pub fn from_bytes(buf: &[u8]) -> Self {
        Self {
            slot_count: u16::from_le_bytes([buf[0], buf[1]]),
            free_space_start: u16::from_le_bytes([buf[2], buf[3]]),
            free_space_end: u16::from_le_bytes([buf[4], buf[5]]),
            tombstones: u16::from_le_bytes([buf[6], buf[7]]),
        }
    }
}

impl Default for HeapPageHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// View over a heap page buffer.
///
/// `T` is any byte buffer: `&[u8; PAGE_SIZE]` for reads, `&mut [u8; PAGE_SIZE]`
/// for modifications.
pub struct HeapPage<T> {
    data: T,
}

impl<T: AsRef<[u8]>> HeapPage<T> {
    /// Wraps an existing heap page buffer.
    pub fn new(data: T) -> Self {
        Self { data }
    }

    fn bytes(&self) -> &[u8] {
        self.data.as_ref()
    }

    /// Returns the heap header.
    pub fn heap_header(&self) -> HeapPageHeader {
        let offset = HeapPageHeader::OFFSET;
        HeapPageHeader::from_bytes(&self.bytes()[offset..offset + HeapPageHeader::SIZE])
    }

    /// Returns the number of slots in the page.
    pub fn slot_count(&self) -> u16 {
        self.heap_header().slot_count
    }

    /// Returns the number of tombstoned slots in the page.
    pub fn tombstone_count(&self) -> u16 {
        self.heap_header().tombstones
    }

    /// Returns the amount of contiguous free space available.
    pub fn free_space(&self) -> usize {
        self.heap_header().free_space()
    }

    /// Returns the offset of a slot in the slot array.
    fn slot_offset(slot: u16) -> usize {
        DATA_START + (slot as usize) * RecordSlot::SIZE
    }

    /// Reads a slot from the slot array.
    pub fn get_slot(&self, slot: u16) -> Option<RecordSlot> {
        if slot >= self.slot_count() {
            return None;
        }
        let offset = Self::slot_offset(slot);
        Some(RecordSlot::from_bytes(&self.bytes()[offset..offset + RecordSlot::SIZE]))
    }

    /// Returns the stored bytes (header + body) of a slot.
    pub fn record_bytes(&self, slot: u16) -> Option<&[u8]> {
        let entry = self.get_slot(slot)?;
        let start = entry.offset as usize;
        let end = start + entry.length as usize;
        if (entry.length as usize) < RecordHeader::SIZE || end > PAGE_SIZE {
            return None;
        }
        Some(&self.bytes()[start..end])
    }

    /// Returns the record header of a slot.
    pub fn record_header(&self, slot: u16) -> Option<RecordHeader> {
        self.record_bytes(slot)
            .map(|bytes| RecordHeader::from_bytes(&bytes[..RecordHeader::SIZE]))
    }

    /// Returns true if a record of `record_size` bytes fits in a new slot.
    pub fn can_fit(&self, record_size: usize) -> bool {
        self.free_space() >= record_size + RecordSlot::SIZE
    }

    /// Space held by record data that no slot refers to any more.
    pub fn reclaimable_space(&self) -> usize {
        let header = self.heap_header();
        let live: usize = (0..header.slot_count)
            .filter_map(|i| self.get_slot(i))
            .map(|s| s.length as usize)
            .sum();
        let data_area = PAGE_SIZE - header.free_space_end as usize;
        data_area.saturating_sub(live)
    }

    /// Iterates over all slots with their record header and body.
    pub fn iter(&self) -> HeapPageIterator<'_, T> {
        HeapPageIterator {
            page: self,
            current_slot: 0,
            slot_count: self.slot_count(),
        }
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> HeapPage<T> {
    /// Initializes an empty heap page in the buffer.
    pub fn init(mut data: T, page_num: u32) -> Self {
        let buf = data.as_mut();
        buf.fill(0);
        let page_header = PageHeader::new(page_num, PageType::Heap);
        buf[..PageHeader::SIZE].copy_from_slice(&page_header.to_bytes());
        let offset = HeapPageHeader::OFFSET;
        buf[offset..offset + HeapPageHeader::SIZE]
            .copy_from_slice(&HeapPageHeader::new().to_bytes());
        Self { data }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        self.data.as_mut()
    }

    /// Writes the heap header back to the page.
    fn set_heap_header(&mut self, header: HeapPageHeader) {
        let offset = HeapPageHeader::OFFSET;
        self.bytes_mut()[offset..offset + HeapPageHeader::SIZE]
            .copy_from_slice(&header.to_bytes());
        // Keep the generic entry count in the page header in sync.
        self.bytes_mut()[6..8].copy_from_slice(&header.slot_count.to_le_bytes());
    }

    /// Writes a slot to the slot array.
    fn set_slot(&mut self, slot: u16, entry: RecordSlot) {
        let offset = Self::slot_offset(slot);
        self.bytes_mut()[offset..offset + RecordSlot::SIZE].copy_from_slice(&entry.to_bytes());
    }

    /// Copies record bytes into the data area and returns their offset.
    fn place(&mut self, header: &mut HeapPageHeader, record: &[u8]) -> u16 {
        header.free_space_end -= record.len() as u16;
        let start = header.free_space_end as usize;
        self.bytes_mut()[start..start + record.len()].copy_from_slice(record);
        header.free_space_end
    }

    /// Appends a record (header + body) in a new slot.
    ///
    /// Returns the slot index.
    pub fn insert_record(&mut self, record: &[u8]) -> Result<u16> {
        let mut header = self.heap_header();
        if header.free_space() < record.len() + RecordSlot::SIZE {
            if self.free_space() + self.reclaimable_space() >= record.len() + RecordSlot::SIZE {
                self.compact();
                header = self.heap_header();
            } else {
                return Err(KeystoneError::PageFull);
            }
        }

        let offset = self.place(&mut header, record);
        let slot = header.slot_count;
        header.slot_count += 1;
        header.free_space_start += RecordSlot::SIZE as u16;
        self.set_slot(slot, RecordSlot::new(offset, record.len() as u16));
        self.set_heap_header(header);
        Ok(slot)
    }

    /// Replaces the record stored in a slot, keeping the slot index.
    ///
    /// Overwrites in place when the new record is not larger, otherwise moves
    /// the data within the page. Returns `PageFull` if the page cannot hold it.
    pub fn update_record(&mut self, slot: u16, record: &[u8]) -> Result<()> {
        let old = self
            .get_slot(slot)
            .ok_or_else(|| KeystoneError::IoError(format!("slot {} not found", slot)))?;

        if record.len() <= old.length as usize {
            let start = old.offset as usize;
            self.bytes_mut()[start..start + record.len()].copy_from_slice(record);
            self.set_slot(slot, RecordSlot::new(old.offset, record.len() as u16));
            return Ok(());
        }

        let mut header = self.heap_header();
        if header.free_space() < record.len() {
            // The old copy becomes reclaimable once the slot moves.
            let available = header.free_space() + self.reclaimable_space() + old.length as usize;
            if available < record.len() {
                return Err(KeystoneError::PageFull);
            }
            self.set_slot(slot, RecordSlot::new(old.offset, 0));
            self.compact();
            header = self.heap_header();
        }

        let offset = self.place(&mut header, record);
        self.set_slot(slot, RecordSlot::new(offset, record.len() as u16));
        self.set_heap_header(header);
        Ok(())
    }

    /// Sets the tombstone flag on the record in a slot.
    ///
    /// Returns false if the slot does not exist or is already a tombstone.
    pub fn mark_deleted(&mut self, slot: u16) -> bool {
        let Some(entry) = self.get_slot(slot) else {
            return false;
        };
        let start = entry.offset as usize;
        let mut record_header =
            RecordHeader::from_bytes(&self.bytes()[start..start + RecordHeader::SIZE]);
        if record_header.flags.is_deleted() {
            return false;
        }
        record_header.flags.set_deleted(true);
        self.bytes_mut()[start..start + RecordHeader::SIZE]
            .copy_from_slice(&record_header.to_bytes());

        let mut header = self.heap_header();
        header.tombstones += 1;
        self.set_heap_header(header);
        true
    }

    /// Compacts the page by moving all slot data together at the end of
    /// the page, eliminating holes left by moved records.
    pub fn compact(&mut self) {
        let header = self.heap_header();

        let mut live: Vec<(u16, Vec<u8>)> = Vec::with_capacity(header.slot_count as usize);
        for i in 0..header.slot_count {
            if let Some(entry) = self.get_slot(i) {
                let start = entry.offset as usize;
                let end = start + entry.length as usize;
                live.push((i, self.bytes()[start..end].to_vec()));
            }
        }

        let mut new_header = header;
        new_header.free_space_end = PAGE_SIZE as u16;
        for (slot, data) in &live {
            if data.is_empty() {
                self.set_slot(*slot, RecordSlot::new(PAGE_SIZE as u16, 0));
                continue;
            }
            let offset = self.place(&mut new_header, data);
            self.set_slot(*slot, RecordSlot::new(offset, data.len() as u16));
        }
        self.set_heap_header(new_header);
    }
}

/// Iterator over the records of a heap page, tombstones included.
pub struct HeapPageIterator<'a, T> {
    page: &'a HeapPage<T>,
    current_slot: u16,
    slot_count: u16,
}

impl<'a, T: AsRef<[u8]>> Iterator for HeapPageIterator<'a, T> {
    type Item = (u16, RecordHeader, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        while self.current_slot < self.slot_count {
            let slot = self.current_slot;
            self.current_slot += 1;

            if let Some(bytes) = self.page.record_bytes(slot) {
                let header = RecordHeader::from_bytes(&bytes[..RecordHeader::SIZE]);
                let end = (RecordHeader::SIZE + header.data_len as usize).min(bytes.len());
                return Some((slot, header, &bytes[RecordHeader::SIZE..end]));
            }
        }
        None
    }
}

//! Disk-backed page storage shared by heap files and B+ tree indexes.
//!
//! All pages of a file are held in RAM as boxed page buffers. Page numbers
//! map directly to Vec indices. Modified pages are tracked with a dirty flag
//! and written back on `flush`, each sealed with a CRC-32 checksum that is
//! verified when the file is opened again.

use crate::disk::DiskManager;
use crc::{Crc, CRC_32_ISO_HDLC};
use keystone_common::page::{PageHeader, PageId, PageType, PAGE_SIZE};
use keystone_common::{KeystoneError, Result};
use std::sync::Arc;
use tracing::debug;

const PAGE_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Computes the checksum of a page, skipping the checksum field itself.
pub fn page_checksum(data: &[u8; PAGE_SIZE]) -> u32 {
    let mut digest = PAGE_CRC.digest();
    digest.update(&data[..PageHeader::CHECKSUM_RANGE.start]);
    digest.update(&data[PageHeader::CHECKSUM_RANGE.end..]);
    digest.finalize()
}

/// In-memory image of one paged file.
pub struct PageStore {
    disk: Arc<DiskManager>,
    file_id: u32,
    name: String,
    /// Pages stored by page number (index = page_num).
    pages: Vec<Box<[u8; PAGE_SIZE]>>,
    dirty: Vec<bool>,
}

impl PageStore {
    /// Opens (or creates) the named file and loads every page.
    pub fn open(disk: Arc<DiskManager>, name: &str) -> Result<Self> {
        let file_id = disk.open_file(name)?;
        let num_pages = disk.num_pages(file_id)?;

        let mut pages = Vec::with_capacity(num_pages as usize);
        for page_num in 0..num_pages {
            let data = disk.read_page(PageId::new(file_id, page_num))?;
            Self::verify(&data, page_num)?;
            pages.push(Box::new(data));
        }
        debug!("Loaded {} pages from {}", num_pages, name);

        Ok(Self {
            disk,
            file_id,
            name: name.to_string(),
            dirty: vec![false; pages.len()],
            pages,
        })
    }

    /// Checks the stored checksum of a page read from disk.
    fn verify(data: &[u8; PAGE_SIZE], page_num: u32) -> Result<()> {
        // Zeroed pages were allocated but never written.
        if PageHeader::page_type_of(data) == PageType::Free {
            return Ok(());
        }
        let header = PageHeader::from_bytes(data);
        if header.page_num != page_num {
            return Err(KeystoneError::PageCorrupted {
                page_num,
                reason: format!("header claims page {}", header.page_num),
            });
        }
        let actual = page_checksum(data);
        if header.checksum != actual {
            return Err(KeystoneError::PageCorrupted {
                page_num,
                reason: format!(
                    "checksum mismatch: stored {:#010x}, computed {:#010x}",
                    header.checksum, actual
                ),
            });
        }
        Ok(())
    }

    /// Returns the file name this store was opened from.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the disk manager file id.
    pub fn file_id(&self) -> u32 {
        self.file_id
    }

    /// Returns the number of pages.
    #[inline]
    pub fn num_pages(&self) -> u32 {
        self.pages.len() as u32
    }

    /// Allocates a new zeroed page and returns its page number.
    #[inline]
    pub fn allocate(&mut self) -> u32 {
        let page_num = self.pages.len() as u32;
        self.pages.push(Box::new([0u8; PAGE_SIZE]));
        self.dirty.push(true);
        page_num
    }

    /// Gets a page by page number (read-only).
    #[inline]
    pub fn get(&self, page_num: u32) -> Result<&[u8; PAGE_SIZE]> {
        self.pages
            .get(page_num as usize)
            .map(|p| &**p)
            .ok_or_else(|| self.missing(page_num))
    }

    /// Gets a mutable page by page number and marks it dirty.
    #[inline]
    pub fn get_mut(&mut self, page_num: u32) -> Result<&mut [u8; PAGE_SIZE]> {
        let idx = page_num as usize;
        if idx >= self.pages.len() {
            return Err(self.missing(page_num));
        }
        self.dirty[idx] = true;
        Ok(&mut *self.pages[idx])
    }

    fn missing(&self, page_num: u32) -> KeystoneError {
        KeystoneError::PageCorrupted {
            page_num,
            reason: format!("page does not exist in {}", self.name),
        }
    }

    /// Returns true if any page is waiting to be written.
    pub fn is_dirty(&self) -> bool {
        self.dirty.iter().any(|d| *d)
    }

    /// Drops every page, in memory and on disk.
    pub fn reset(&mut self) -> Result<()> {
        self.pages.clear();
        self.dirty.clear();
        self.disk.truncate(self.file_id, 0)
    }

    /// Writes dirty pages back to disk and syncs the file.
    pub fn flush(&mut self) -> Result<()> {
        let mut written = 0usize;
        for (idx, page) in self.pages.iter_mut().enumerate() {
            if !self.dirty[idx] {
                continue;
            }
            let checksum = page_checksum(page);
            page[PageHeader::CHECKSUM_RANGE].copy_from_slice(&checksum.to_le_bytes());
            self.disk
                .write_page(PageId::new(self.file_id, idx as u32), page)?;
            self.dirty[idx] = false;
            written += 1;
        }
        if written > 0 {
            self.disk.sync_file(self.file_id)?;
            debug!("Flushed {} pages of {}", written, self.name);
        }
        Ok(())
    }

    /// Flushes and releases the underlying file handle.
    pub fn close(mut self) -> Result<()> {
        self.flush()?;
        self.disk.close_file(self.file_id)
    }
}

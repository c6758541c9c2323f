//! Disk manager for page-level file I/O.

use keystone_common::page::{PageId, PAGE_SIZE};
use keystone_common::{DatabaseConfig, KeystoneError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::debug;

/// Configuration for the disk manager.
#[derive(Debug, Clone)]
pub struct DiskManagerConfig {
    /// Base directory for data files.
    pub data_dir: PathBuf,
    /// Enable fsync when a file is synced.
    pub fsync_enabled: bool,
}

impl Default for DiskManagerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            fsync_enabled: true,
        }
    }
}

impl From<&DatabaseConfig> for DiskManagerConfig {
    fn from(config: &DatabaseConfig) -> Self {
        Self {
            data_dir: config.data_dir.clone(),
            fsync_enabled: config.fsync_enabled,
        }
    }
}

/// Manages reading and writing pages of named files under one directory.
///
/// Opening a file hands out a `file_id` that stays valid until the file is
/// closed. Heap files and index files share the same manager.
pub struct DiskManager {
    config: DiskManagerConfig,
    /// Open file handles keyed by file_id.
    files: Mutex<HashMap<u32, FileHandle>>,
    next_file_id: AtomicU32,
}

/// Handle for an open data file.
struct FileHandle {
    file: File,
    /// File name relative to the data directory.
    name: String,
    /// Number of pages in the file.
    num_pages: u32,
}

impl DiskManager {
    /// Creates a new disk manager, creating the data directory if needed.
    pub fn new(config: DiskManagerConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;

        Ok(Self {
            config,
            files: Mutex::new(HashMap::new()),
            next_file_id: AtomicU32::new(0),
        })
    }

    /// Returns the data directory path.
    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }

    /// Returns the full path of a named file.
    pub fn file_path(&self, name: &str) -> PathBuf {
        self.config.data_dir.join(name)
    }

    /// Returns true if the named file exists on disk.
    pub fn file_exists(&self, name: &str) -> bool {
        self.file_path(name).exists()
    }

    /// Opens or creates a named data file and returns its file id.
    ///
    /// Opening a file that is already open returns the existing id.
    pub fn open_file(&self, name: &str) -> Result<u32> {
        let mut files = self.files.lock();

        if let Some((id, _)) = files.iter().find(|(_, h)| h.name == name) {
            return Ok(*id);
        }

        let path = self.file_path(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let file_size = file.metadata()?.len();
        if file_size % PAGE_SIZE as u64 != 0 {
            return Err(KeystoneError::IoError(format!(
                "{} has size {} which is not a multiple of the page size",
                path.display(),
                file_size
            )));
        }
        let num_pages = (file_size / PAGE_SIZE as u64) as u32;

        let file_id = self.next_file_id.fetch_add(1, Ordering::Relaxed);
        debug!(
            "Opened {} as file {} ({} pages)",
            path.display(),
            file_id,
            num_pages
        );
        files.insert(
            file_id,
            FileHandle {
                file,
                name: name.to_string(),
                num_pages,
            },
        );

        Ok(file_id)
    }

    fn not_open(file_id: u32) -> KeystoneError {
        KeystoneError::IoError(format!("file {} not open", file_id))
    }

    /// Reads a page from disk.
    pub fn read_page(&self, page_id: PageId) -> Result<[u8; PAGE_SIZE]> {
        let mut files = self.files.lock();
        let handle = files
            .get_mut(&page_id.file_id)
            .ok_or_else(|| Self::not_open(page_id.file_id))?;

        if page_id.page_num >= handle.num_pages {
            return Err(KeystoneError::IoError(format!(
                "page {} does not exist in {}",
                page_id.page_num, handle.name
            )));
        }

        handle.file.seek(SeekFrom::Start(page_id.file_offset()))?;

        let mut buffer = [0u8; PAGE_SIZE];
        handle.file.read_exact(&mut buffer)?;

        Ok(buffer)
    }

    /// Writes a page to disk. The write is not synced until `sync_file`.
    pub fn write_page(&self, page_id: PageId, data: &[u8; PAGE_SIZE]) -> Result<()> {
        let mut files = self.files.lock();
        let handle = files
            .get_mut(&page_id.file_id)
            .ok_or_else(|| Self::not_open(page_id.file_id))?;

        handle.file.seek(SeekFrom::Start(page_id.file_offset()))?;
        handle.file.write_all(data)?;

        if page_id.page_num >= handle.num_pages {
            handle.num_pages = page_id.page_num + 1;
        }

        Ok(())
    }

    /// Returns the number of pages in a file.
    pub fn num_pages(&self, file_id: u32) -> Result<u32> {
        let files = self.files.lock();
        let handle = files.get(&file_id).ok_or_else(|| Self::not_open(file_id))?;
        Ok(handle.num_pages)
    }

    /// Shrinks (or grows with zeroes) a file to exactly `num_pages` pages.
    pub fn truncate(&self, file_id: u32, num_pages: u32) -> Result<()> {
        let mut files = self.files.lock();
        let handle = files.get_mut(&file_id).ok_or_else(|| Self::not_open(file_id))?;

        handle.file.set_len(num_pages as u64 * PAGE_SIZE as u64)?;
        handle.num_pages = num_pages;
        debug!("Truncated {} to {} pages", handle.name, num_pages);
        Ok(())
    }

    /// Syncs one file to stable storage when fsync is enabled.
    pub fn sync_file(&self, file_id: u32) -> Result<()> {
        if !self.config.fsync_enabled {
            return Ok(());
        }
        let files = self.files.lock();
        let handle = files.get(&file_id).ok_or_else(|| Self::not_open(file_id))?;
        handle.file.sync_all()?;
        Ok(())
    }

    /// Flushes all pending writes to disk.
    pub fn flush(&self) -> Result<()> {
        let files = self.files.lock();
        for handle in files.values() {
            handle.file.sync_all()?;
        }
        Ok(())
    }

    /// Closes a specific file.
    pub fn close_file(&self, file_id: u32) -> Result<()> {
        let mut files = self.files.lock();
        if let Some(handle) = files.remove(&file_id) {
            handle.file.sync_all()?;
            debug!("Closed {}", handle.name);
        }
        Ok(())
    }

    /// Closes all open files.
    pub fn close_all(&self) -> Result<()> {
        let mut files = self.files.lock();
        for (_, handle) in files.drain() {
            handle.file.sync_all()?;
        }
        Ok(())
    }

    /// Deletes a named data file, closing it first if it is open.
    pub fn delete_file(&self, name: &str) -> Result<()> {
        let open_id = {
            let files = self.files.lock();
            files
                .iter()
                .find(|(_, h)| h.name == name)
                .map(|(id, _)| *id)
        };
        if let Some(file_id) = open_id {
            self.close_file(file_id)?;
        }

        let path = self.file_path(name);
        if path.exists() {
            std::fs::remove_file(&path)?;
            debug!("Deleted {}", path.display());
        }
        Ok(())
    }
}

impl Drop for DiskManager {
    fn drop(&mut self) {
        let _ = self.close_all();
    }
}

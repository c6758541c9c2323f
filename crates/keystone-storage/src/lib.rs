//! Storage engine for Keystone.
//!
//! This crate provides:
//! - Disk manager for page-level file I/O
//! - Checksummed in-memory page store shared by heap and index files
//! - Record encoding and the slotted heap file holding a table's records
//! - Fixed-length key codecs
//! - Persistent B+ tree index

mod btree;
mod disk;
mod heap;
mod key;
mod record;
mod store;

pub use btree::{BTree, BTreeInternalPage, BTreeLeafPage, BTreeMeta, MAX_HEIGHT, MAX_KEY_SIZE};
pub use disk::{DiskManager, DiskManagerConfig};
pub use heap::{
    HeapFile, HeapPage, HeapPageHeader, HeapPageIterator, HeapScan, RecordSlot, WastedSpace,
};
pub use key::{string_key_hash, KeyCodec, KeyValue};
pub use record::{
    decode_values, encode_values, RecordFlags, RecordHeader, RecordOffset, StoredRecord,
};
pub use store::{page_checksum, PageStore};

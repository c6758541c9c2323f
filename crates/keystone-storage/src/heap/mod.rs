//! Heap storage for table records.
//!
//! - HeapPage: slotted page format for variable-length records
//! - HeapFile: meta page, record ID counter, and record-level operations

pub mod constants;
mod file;
mod page;

pub use file::{HeapFile, HeapScan, WastedSpace};
pub use page::{HeapPage, HeapPageHeader, HeapPageIterator, RecordSlot};

//! Heap page layout constants.

use keystone_common::page::{PageHeader, PAGE_SIZE};

/// Size of the heap page header in bytes.
pub const HEAP_HEADER_SIZE: usize = 8;

/// Offset of heap header in page (after PageHeader).
pub const HEAP_HEADER_OFFSET: usize = PageHeader::SIZE;

/// Offset where slot array begins (after PageHeader + HeapPageHeader).
pub const DATA_START: usize = PageHeader::SIZE + HEAP_HEADER_SIZE;

/// Size of a record slot entry in bytes.
pub const RECORD_SLOT_SIZE: usize = 4;

/// Largest stored record (header included) that fits on an empty page.
pub const MAX_RECORD_SIZE: usize = PAGE_SIZE - DATA_START - RECORD_SLOT_SIZE;

/// Magic number at the start of a heap meta page ("KSHP").
pub const HEAP_MAGIC: u32 = 0x4B53_4850;

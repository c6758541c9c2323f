//! Persistent B+ tree index over fixed-width keys.
//!
//! ## Layout
//!
//! An index file is a sequence of 16KB pages sharing the common page header:
//!
//! ```text
//! page 0        meta: magic, key size, height, root, entry count
//! page 1..n     leaf or internal nodes
//! ```
//!
//! Leaves hold sorted `(key, value)` composites and are linked left to right
//! for range scans. Internal nodes hold a leftmost child plus sorted
//! `(separator, child)` pairs, where a separator is the composite of the
//! first entry in the subtree to its right.
//!
//! With 4-byte keys a leaf holds 2043 entries and an internal node 1362
//! separators, so a few million entries fit in a tree of height 3.

pub mod constants;
mod index;
mod page;
mod types;

pub use constants::{MAX_HEIGHT, MAX_KEY_SIZE};
pub use index::BTree;
pub use page::{BTreeInternalPage, BTreeLeafPage};
pub use types::BTreeMeta;

//! Column types supported by Keystone tables.

use serde::{Deserialize, Serialize};

/// Data type of a table column.
///
/// The discriminants are part of the structure file format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ColumnType {
    /// 32-bit signed integer.
    Integer = 1,
    /// 64-bit IEEE float.
    Double = 2,
    /// UTF-8 string with a 2-byte length prefix, indexed by hash.
    String = 3,
    /// Timestamp stored as 64-bit ticks.
    DateTime = 4,
    /// UTF-8 text with a 4-byte length prefix, not indexable.
    ///
    /// Records do not span pages, so a whole record body (every column
    /// included) must fit in one heap page, just under 16 KB. That bound
    /// applies to `String`, `LongString` and `Blob` alike; the wider length
    /// prefix does not buy a longer value.
    LongString = 5,
    /// Opaque bytes, not indexable. Bounded by the heap page like `LongString`.
    Blob = 6,
}

impl ColumnType {
    /// Returns the fixed byte size of a stored value, or None for variable-length types.
    pub fn fixed_size(&self) -> Option<usize> {
        match self {
            ColumnType::Integer => Some(4),
            ColumnType::Double | ColumnType::DateTime => Some(8),
            ColumnType::String | ColumnType::LongString | ColumnType::Blob => None,
        }
    }

    /// Returns true if this type has a fixed byte size.
    pub fn is_fixed_size(&self) -> bool {
        self.fixed_size().is_some()
    }

    /// Returns true if a B+ tree index can be built over this type.
    pub fn is_indexable(&self) -> bool {
        !matches!(self, ColumnType::LongString | ColumnType::Blob)
    }

    /// Returns true if this type is numeric and supports range queries.
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            ColumnType::Integer | ColumnType::Double | ColumnType::DateTime
        )
    }

    /// Returns true if this type holds text.
    pub fn is_string(&self) -> bool {
        matches!(self, ColumnType::String | ColumnType::LongString)
    }
}

impl std::fmt::Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ColumnType::Integer => "INTEGER",
            ColumnType::Double => "DOUBLE",
            ColumnType::String => "STRING",
            ColumnType::DateTime => "DATETIME",
            ColumnType::LongString => "LONGSTRING",
            ColumnType::Blob => "BLOB",
        };
        write!(f, "{}", name)
    }
}

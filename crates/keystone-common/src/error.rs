//! Error types for Keystone.

use thiserror::Error;

/// Result type alias using KeystoneError.
pub type Result<T> = std::result::Result<T, KeystoneError>;

/// Errors that can occur in Keystone operations.
#[derive(Debug, Error)]
pub enum KeystoneError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Storage errors
    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Page corrupted: {page_num}, reason: {reason}")]
    PageCorrupted { page_num: u32, reason: String },

    #[error("Page full, unable to insert record")]
    PageFull,

    #[error("Record not found at offset {0}")]
    RecordNotFound(u32),

    #[error("Record too large: {size} bytes (max {max})")]
    RecordTooLarge { size: usize, max: usize },

    // B+ tree errors
    #[error("B+ tree node full")]
    NodeFull,

    #[error("Key too large: {size} bytes (max {max})")]
    KeyTooLarge { size: usize, max: usize },

    #[error("Key size mismatch: index stores {stored}-byte keys, codec produces {expected}")]
    KeySizeMismatch { stored: usize, expected: usize },

    #[error("B+ tree corrupted: {0}")]
    BTreeCorrupted(String),

    // Type errors
    #[error("Type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    #[error("Null value not allowed in column {0}")]
    NullNotAllowed(String),

    // Schema errors
    #[error("Table not found: {0}")]
    TableNotFound(String),

    #[error("Table already exists: {0}")]
    TableAlreadyExists(String),

    #[error("Column does not exist: {0}")]
    ColumnDoesNotExist(String),

    #[error("Column already exists: {0}")]
    ColumnAlreadyExists(String),

    #[error("Column cannot be indexed: {0}")]
    ColumnNotIndexable(String),

    #[error("Index already exists: {0}")]
    IndexAlreadyExists(String),

    #[error("Column has no index: {0}")]
    ColumnHasNoIndex(String),

    #[error("Database structure not found: {0}")]
    StructureNotFound(String),

    #[error("Database structure corrupted: {0}")]
    StructureCorrupted(String),

    #[error("Table is closed: {0}")]
    TableClosed(String),

    // Record lifecycle errors
    #[error("Attempt writing to deleted record {0}")]
    AttemptWritingToDeletedRecord(u32),

    #[error("Attempt to delete record {0} that is neither normal nor updated")]
    AttemptDeleteNotNormalOrNotUpdatedRecord(u32),

    #[error("Record {0} belongs to a read-only result set")]
    ReadOnlyRecord(u32),

    #[error("Result set over {0} was invalidated by defragmentation")]
    ResultSetInvalidated(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter { name: String, value: String },
}

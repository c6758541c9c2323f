//! Keystone common types, errors, and utilities.
//!
//! This crate provides shared definitions used across all Keystone components.

pub mod config;
pub mod error;
pub mod page;
pub mod types;
pub mod value;

pub use config::DatabaseConfig;
pub use error::{KeystoneError, Result};
pub use page::{PageHeader, PageId, PageType, INVALID_PAGE_NUM, PAGE_SIZE};
pub use types::ColumnType;
pub use value::Value;

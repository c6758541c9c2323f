//! Keystone embedded table store.
//!
//! A database is a directory of files: one JSON schema, one heap file per
//! table and one B+ tree file per index.
//!
//! ```text
//! Database ── DatabaseStructure (pim.structure.json)
//!    │
//!    └── Table ── HeapFile (pim.People.dat)
//!          │  └── BTree per index (pim.People.Id.idx, pim.People.Name+Age.idx)
//!          │
//!          ├── Record (New → Normal ⇄ Updated → Deleted)
//!          └── ResultSet (offsets from one index search)
//! ```
//!
//! Tables are single-writer: callers serialize writes to a table.

mod database;
mod record;
mod result_set;
mod structure;
mod table;

pub use database::Database;
pub use keystone_common::{ColumnType, DatabaseConfig, KeystoneError, Result, Value};
pub use keystone_storage::WastedSpace;
pub use record::{Record, RecordState};
pub use result_set::{IntoIter, ResultSet};
pub use structure::{
    Column, DatabaseStructure, IndexDefinition, TableStructure, STRUCTURE_FORMAT_VERSION,
};
pub use table::{SortedColumn, Table};

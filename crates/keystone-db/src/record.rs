//! Records and their lifecycle.
//!
//! ```text
//! New --commit--> Normal --set_value--> Updated --commit--> Normal
//!                   |                      |
//!                   +-------delete---------+--> Deleted
//! ```
//!
//! A deleted record keeps its last values readable; writes fail.

use crate::table::Table;
use chrono::NaiveDateTime;
use keystone_common::{KeystoneError, Result, Value};
use keystone_storage::RecordOffset;
use std::fmt;

/// Lifecycle state of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    /// Created by `Table::new_record`, not stored yet.
    New,
    /// Stored and indexed.
    Normal,
    /// Stored, with changes not committed yet.
    Updated,
    /// Tombstoned.
    Deleted,
}

/// A row of a table.
pub struct Record {
    table: Table,
    id: u32,
    offset: Option<RecordOffset>,
    values: Vec<Value>,
    state: RecordState,
    read_only: bool,
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("table", &self.table.name())
            .field("id", &self.id)
            .field("state", &self.state)
            .field("values", &self.values)
            .finish()
    }
}

impl Record {
    pub(crate) fn new_record(table: Table, id: u32, values: Vec<Value>) -> Self {
        Self {
            table,
            id,
            offset: None,
            values,
            state: RecordState::New,
            read_only: false,
        }
    }

    pub(crate) fn loaded(
        table: Table,
        id: u32,
        offset: RecordOffset,
        values: Vec<Value>,
        read_only: bool,
    ) -> Self {
        Self {
            table,
            id,
            offset: Some(offset),
            values,
            state: RecordState::Normal,
            read_only,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn state(&self) -> RecordState {
        self.state
    }

    /// True for records yielded by a read-only result set.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn table(&self) -> &Table {
        &self.table
    }

    /// All values in column order.
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn value(&self, column: usize) -> Result<&Value> {
        self.values
            .get(column)
            .ok_or_else(|| KeystoneError::ColumnDoesNotExist(format!("#{}", column)))
    }

    pub fn value_by_name(&self, name: &str) -> Result<&Value> {
        let column = self.table.column_index(name)?;
        self.value(column)
    }

    fn mismatch(expected: &str, actual: &Value) -> KeystoneError {
        KeystoneError::TypeMismatch {
            expected: expected.to_string(),
            actual: actual.type_name().to_string(),
        }
    }

    pub fn int_value(&self, column: usize) -> Result<i32> {
        let value = self.value(column)?;
        value.as_int().ok_or_else(|| Self::mismatch("INTEGER", value))
    }

    pub fn double_value(&self, column: usize) -> Result<f64> {
        let value = self.value(column)?;
        value.as_double().ok_or_else(|| Self::mismatch("DOUBLE", value))
    }

    pub fn string_value(&self, column: usize) -> Result<&str> {
        let value = self.value(column)?;
        value.as_str().ok_or_else(|| Self::mismatch("STRING", value))
    }

    pub fn date_time_value(&self, column: usize) -> Result<NaiveDateTime> {
        let value = self.value(column)?;
        value
            .as_date_time()
            .ok_or_else(|| Self::mismatch("DATETIME", value))
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(KeystoneError::ReadOnlyRecord(self.id));
        }
        if self.state == RecordState::Deleted {
            return Err(KeystoneError::AttemptWritingToDeletedRecord(self.id));
        }
        Ok(())
    }

    /// Changes a value. Committed records move to `Updated`.
    pub fn set_value(&mut self, column: usize, value: impl Into<Value>) -> Result<()> {
        self.check_writable()?;
        let value = self.table.check_value(column, value.into())?;
        self.values[column] = value;
        if self.state == RecordState::Normal {
            self.state = RecordState::Updated;
        }
        Ok(())
    }

    pub fn set_value_by_name(&mut self, name: &str, value: impl Into<Value>) -> Result<()> {
        let column = self.table.column_index(name)?;
        self.set_value(column, value)
    }

    /// Stores the record and updates every index of its table.
    pub fn commit(&mut self) -> Result<()> {
        self.check_writable()?;
        match (self.state, self.offset) {
            (RecordState::New, _) => {
                self.offset = Some(self.table.insert_record(self.id, &self.values)?);
            }
            (RecordState::Updated, Some(offset)) => {
                self.offset = Some(self.table.update_record(offset, self.id, &self.values)?);
            }
            _ => return Ok(()),
        }
        self.state = RecordState::Normal;
        Ok(())
    }

    /// Tombstones the record and removes its index entries.
    pub fn delete(&mut self) -> Result<()> {
        if self.read_only {
            return Err(KeystoneError::ReadOnlyRecord(self.id));
        }
        match (self.state, self.offset) {
            (RecordState::Normal | RecordState::Updated, Some(offset)) => {
                self.table.delete_record(offset, self.id)?;
                self.state = RecordState::Deleted;
                Ok(())
            }
            _ => Err(KeystoneError::AttemptDeleteNotNormalOrNotUpdatedRecord(self.id)),
        }
    }
}

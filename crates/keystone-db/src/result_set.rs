//! Cursors over search results.

use crate::record::Record;
use crate::table::Table;
use keystone_common::Result;
use keystone_storage::RecordOffset;

/// Cursor over the records matched by one search.
///
/// The matching offsets are collected when the result set is created, so
/// `count` is known up front and changes made while iterating (deleting or
/// updating yielded records) do not disturb the remaining cursor. Records
/// deleted after the search are skipped. Records are read from the heap one
/// at a time as the cursor advances.
///
/// The table tracks how many result sets are open; dropping or disposing a
/// result set releases it.
pub struct ResultSet {
    table: Table,
    offsets: Vec<RecordOffset>,
    position: usize,
    modifiable: bool,
    generation: u64,
    released: bool,
}

impl ResultSet {
    pub(crate) fn new(table: Table, offsets: Vec<RecordOffset>, modifiable: bool) -> Self {
        table.result_set_opened();
        let generation = table.generation();
        Self {
            table,
            offsets,
            position: 0,
            modifiable,
            generation,
            released: false,
        }
    }

    /// Number of records matched by the search.
    pub fn count(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn is_modifiable(&self) -> bool {
        self.modifiable
    }

    /// Releases the result set.
    pub fn dispose(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.table.result_set_closed();
        }
    }
}

impl ResultSet {
    /// Advances the cursor. Records deleted since the search are skipped;
    /// after an error the cursor is exhausted.
    pub fn next_record(&mut self) -> Option<Result<Record>> {
        while let Some(offset) = self.offsets.get(self.position).copied() {
            self.position += 1;
            match self
                .table
                .load_record(offset, !self.modifiable, self.generation)
            {
                Ok(Some(record)) => return Some(Ok(record)),
                Ok(None) => continue,
                Err(e) => {
                    self.position = self.offsets.len();
                    return Some(Err(e));
                }
            }
        }
        None
    }

    /// Iterates the remaining records without consuming the result set.
    pub fn iter(&mut self) -> impl Iterator<Item = Result<Record>> + '_ {
        std::iter::from_fn(move || self.next_record())
    }
}

/// Owning iterator over a result set's records.
pub struct IntoIter(ResultSet);

impl Iterator for IntoIter {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        self.0.next_record()
    }
}

impl IntoIterator for ResultSet {
    type Item = Result<Record>;
    type IntoIter = IntoIter;

    fn into_iter(self) -> IntoIter {
        IntoIter(self)
    }
}

impl Drop for ResultSet {
    fn drop(&mut self) {
        self.release();
    }
}

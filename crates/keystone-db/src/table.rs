//! Table handles: a heap file plus one B+ tree per index.
//!
//! A `Table` is a cheap clonable handle. Records and result sets keep a
//! clone, so the files stay reachable until the database shuts down; after
//! that every call fails with `TableClosed`.

use crate::record::Record;
use crate::result_set::ResultSet;
use crate::structure::{IndexDefinition, TableStructure};
use bytes::{Bytes, BytesMut};
use keystone_common::value::date_time_to_ticks;
use keystone_common::{ColumnType, KeystoneError, Result, Value};
use keystone_storage::{
    decode_values, encode_values, BTree, DiskManager, HeapFile, KeyCodec, KeyValue, RecordOffset,
    WastedSpace,
};
use parking_lot::Mutex;
use std::cmp::Ordering as CmpOrdering;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Heap file name of a table.
pub(crate) fn heap_file_name(db: &str, table: &str) -> String {
    format!("{}.{}.dat", db, table)
}

/// Index file name, e.g. `pim.People.Name+Age.idx`.
pub(crate) fn index_file_name(db: &str, table: &str, index: &IndexDefinition) -> String {
    format!("{}.{}.{}.idx", db, table, index.display_name())
}

/// Record order produced by `Table::defragment`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortedColumn {
    /// Keep the current heap order.
    Unsorted,
    /// Order by record ID.
    Id,
    /// Order by the value of a column (by position), then by ID.
    Column(usize),
}

/// Orders two column values of the same type. `Null` sorts first.
pub(crate) fn compare_values(a: &Value, b: &Value) -> CmpOrdering {
    match (a, b) {
        (Value::Null, Value::Null) => CmpOrdering::Equal,
        (Value::Null, _) => CmpOrdering::Less,
        (_, Value::Null) => CmpOrdering::Greater,
        (Value::Integer(x), Value::Integer(y)) => x.cmp(y),
        (Value::Double(x), Value::Double(y)) => x.total_cmp(y),
        (Value::DateTime(x), Value::DateTime(y)) => x.cmp(y),
        (Value::String(x) | Value::LongString(x), Value::String(y) | Value::LongString(y)) => {
            x.cmp(y)
        }
        (Value::Blob(x), Value::Blob(y)) => x.cmp(y),
        _ => CmpOrdering::Equal,
    }
}

/// One open index of a table.
struct TableIndex {
    definition: IndexDefinition,
    /// Column positions in key order.
    columns: Vec<usize>,
    types: Vec<ColumnType>,
    codec: KeyCodec,
    tree: BTree,
    /// Components whose key does not prove equality (string hashes and
    /// nullable columns); hits on them are checked against the record.
    inexact: Vec<bool>,
}

impl TableIndex {
    fn key_parts(&self, values: &[Value]) -> Result<Vec<KeyValue>> {
        self.columns
            .iter()
            .zip(&self.types)
            .map(|(column, column_type)| KeyValue::from_value(&values[*column], *column_type))
            .collect()
    }

    fn key(&self, values: &[Value]) -> Result<Bytes> {
        let mut parts = self.key_parts(values)?;
        let key = if parts.len() == 1 {
            parts.remove(0)
        } else {
            KeyValue::Compound(parts)
        };
        self.codec.encode(&key)
    }

    fn insert(&mut self, values: &[Value], offset: RecordOffset) -> Result<()> {
        let key = self.key(values)?;
        self.tree.insert_key(&key, offset.0)
    }

    fn remove(&mut self, values: &[Value], offset: RecordOffset) -> Result<()> {
        let key = self.key(values)?;
        if !self.tree.delete_key(&key, offset.0)? {
            warn!(
                "[{}] No entry for record at {} in index {}",
                self.tree.name(),
                offset,
                self.definition.display_name()
            );
        }
        Ok(())
    }

    /// Inclusive key bounds for a prefix of components.
    fn bounds(&self, low: &[KeyValue], high: &[KeyValue]) -> Result<(Bytes, Bytes)> {
        let size = self.codec.key_size();
        let mut lo = BytesMut::with_capacity(size);
        let mut hi = BytesMut::with_capacity(size);
        self.codec.write_prefix_low(low, &mut lo)?;
        self.codec.write_prefix_high(high, &mut hi)?;
        Ok((lo.freeze(), hi.freeze()))
    }
}

/// Files of an open table.
struct TableFiles {
    heap: HeapFile,
    indexes: Vec<TableIndex>,
}

impl TableFiles {
    /// Live records as `(id, offset, body, values)` in heap order.
    fn live_records(&self, types: &[ColumnType]) -> Result<Vec<LiveRecord>> {
        let mut live = Vec::with_capacity(self.heap.count() as usize);
        for item in self.heap.scan() {
            let (offset, record) = item?;
            if record.is_deleted() {
                continue;
            }
            let values = decode_values(types, &record.body)?;
            live.push((record.id(), offset, record.body, values));
        }
        Ok(live)
    }
}

type LiveRecord = (u32, RecordOffset, Bytes, Vec<Value>);

/// An equality condition or range bound on one column.
struct Condition {
    column: usize,
    value: Value,
}

pub(crate) struct TableInner {
    db_name: String,
    structure: TableStructure,
    types: Vec<ColumnType>,
    files: Mutex<Option<TableFiles>>,
    open_result_sets: AtomicUsize,
    /// Bumped whenever record offsets change wholesale.
    generation: AtomicU64,
}

/// Handle to an open table.
#[derive(Clone)]
pub struct Table {
    inner: Arc<TableInner>,
}

impl fmt::Debug for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Table")
            .field("name", &self.name())
            .finish()
    }
}

impl Table {
    /// Opens the heap and index files of a table, building indexes that are
    /// new and rebuilding those whose entry count disagrees with the heap.
    pub(crate) fn open(
        disk: &Arc<DiskManager>,
        db_name: &str,
        structure: TableStructure,
        verify_on_load: bool,
    ) -> Result<Self> {
        let name = structure.name().to_string();
        let types = structure.column_types();
        let heap = HeapFile::open(disk.clone(), &heap_file_name(db_name, &name))?;

        let mut files = TableFiles {
            heap,
            indexes: Vec::with_capacity(structure.indexes().len()),
        };
        for definition in structure.indexes() {
            let mut columns = Vec::with_capacity(definition.columns.len());
            let mut inexact = Vec::with_capacity(definition.columns.len());
            for column_name in &definition.columns {
                let position = structure
                    .column_index(column_name)
                    .ok_or_else(|| KeystoneError::ColumnDoesNotExist(column_name.clone()))?;
                let column = &structure.columns()[position];
                columns.push(position);
                inexact.push(column.column_type == ColumnType::String || column.nullable);
            }
            let index_types: Vec<ColumnType> = columns.iter().map(|c| types[*c]).collect();
            let codec = KeyCodec::for_columns(&index_types)?;

            let file_name = index_file_name(db_name, &name, definition);
            let existed = disk.file_exists(&file_name);
            let tree = BTree::open(disk.clone(), &file_name, codec.clone())?;
            let mut index = TableIndex {
                definition: definition.clone(),
                columns,
                types: index_types,
                codec,
                tree,
                inexact,
            };

            let live = files.heap.count();
            if !existed {
                if live > 0 {
                    debug!(
                        "[{}] Building index {} over {} records",
                        name,
                        definition.display_name(),
                        live
                    );
                    Self::rebuild_index(&files.heap, &types, &mut index)?;
                }
            } else if verify_on_load && index.tree.count() != live {
                warn!(
                    "[{}] Index {} has {} entries for {} records, rebuilding",
                    name,
                    definition.display_name(),
                    index.tree.count(),
                    live
                );
                Self::rebuild_index(&files.heap, &types, &mut index)?;
            }
            files.indexes.push(index);
        }

        debug!(
            "[{}] Opened table: {} records, {} indexes",
            name,
            files.heap.count(),
            files.indexes.len()
        );
        Ok(Self {
            inner: Arc::new(TableInner {
                db_name: db_name.to_string(),
                structure,
                types,
                files: Mutex::new(Some(files)),
                open_result_sets: AtomicUsize::new(0),
                generation: AtomicU64::new(0),
            }),
        })
    }

    fn rebuild_index(heap: &HeapFile, types: &[ColumnType], index: &mut TableIndex) -> Result<()> {
        index.tree.clear()?;
        for item in heap.scan() {
            let (offset, record) = item?;
            if record.is_deleted() {
                continue;
            }
            let values = decode_values(types, &record.body)?;
            index.insert(&values, offset)?;
        }
        index.tree.flush()
    }

    fn with_files<R>(&self, f: impl FnOnce(&mut TableFiles) -> Result<R>) -> Result<R> {
        let mut guard = self.inner.files.lock();
        match guard.as_mut() {
            Some(files) => f(files),
            None => Err(KeystoneError::TableClosed(self.name().to_string())),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.structure.name()
    }

    /// Name of the database the table belongs to.
    pub fn database_name(&self) -> &str {
        &self.inner.db_name
    }

    pub fn structure(&self) -> &TableStructure {
        &self.inner.structure
    }

    pub fn is_closed(&self) -> bool {
        self.inner.files.lock().is_none()
    }

    /// Position of a column by name.
    pub fn column_index(&self, name: &str) -> Result<usize> {
        self.inner
            .structure
            .column_index(name)
            .ok_or_else(|| KeystoneError::ColumnDoesNotExist(name.to_string()))
    }

    fn column_name(&self, column: usize) -> Result<&str> {
        self.inner
            .structure
            .columns()
            .get(column)
            .map(|c| c.name.as_str())
            .ok_or_else(|| KeystoneError::ColumnDoesNotExist(format!("#{}", column)))
    }

    /// Converts a value for storage in `column`, rejecting `Null` in
    /// non-nullable columns.
    pub(crate) fn check_value(&self, column: usize, value: Value) -> Result<Value> {
        let name = self.column_name(column)?;
        let definition = &self.inner.structure.columns()[column];
        let value = value.coerce_to(definition.column_type)?;
        if value.is_null() && !definition.nullable {
            return Err(KeystoneError::NullNotAllowed(name.to_string()));
        }
        if let Value::DateTime(dt) = &value {
            date_time_to_ticks(dt)?;
        }
        Ok(value)
    }

    /// Number of live records.
    pub fn count(&self) -> Result<u32> {
        self.with_files(|files| Ok(files.heap.count()))
    }

    /// ID the next new record will receive.
    pub fn next_id(&self) -> Result<u32> {
        self.with_files(|files| Ok(files.heap.next_id()))
    }

    /// Number of result sets over this table not yet disposed.
    pub fn open_result_sets(&self) -> usize {
        self.inner.open_result_sets.load(Ordering::Acquire)
    }

    pub(crate) fn result_set_opened(&self) {
        self.inner.open_result_sets.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn result_set_closed(&self) {
        self.inner.open_result_sets.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::Acquire)
    }

    /// Allocates an ID and returns a record in the `New` state holding the
    /// column defaults (`Null` for nullable columns).
    pub fn new_record(&self) -> Result<Record> {
        let id = self.with_files(|files| files.heap.allocate_id())?;
        let values = self
            .inner
            .structure
            .columns()
            .iter()
            .map(|c| {
                if c.nullable {
                    Value::Null
                } else {
                    Value::default_for(c.column_type)
                }
            })
            .collect();
        Ok(Record::new_record(self.clone(), id, values))
    }

    pub(crate) fn insert_record(&self, id: u32, values: &[Value]) -> Result<RecordOffset> {
        let body = encode_values(&self.inner.types, values)?;
        self.with_files(|files| {
            let offset = files.heap.insert(id, &body)?;
            for index in &mut files.indexes {
                index.insert(values, offset)?;
            }
            Ok(offset)
        })
    }

    pub(crate) fn update_record(
        &self,
        offset: RecordOffset,
        id: u32,
        values: &[Value],
    ) -> Result<RecordOffset> {
        let types = &self.inner.types;
        let body = encode_values(types, values)?;
        self.with_files(|files| {
            let stored = files.heap.read(offset)?;
            if stored.is_deleted() || stored.id() != id {
                return Err(KeystoneError::AttemptWritingToDeletedRecord(id));
            }
            let old_values = decode_values(types, &stored.body)?;
            let new_offset = files.heap.update(offset, &body)?;
            for index in &mut files.indexes {
                index.remove(&old_values, offset)?;
                index.insert(values, new_offset)?;
            }
            Ok(new_offset)
        })
    }

    pub(crate) fn delete_record(&self, offset: RecordOffset, id: u32) -> Result<()> {
        let types = &self.inner.types;
        self.with_files(|files| {
            let stored = files.heap.read(offset)?;
            if stored.is_deleted() || stored.id() != id {
                return Err(KeystoneError::AttemptDeleteNotNormalOrNotUpdatedRecord(id));
            }
            let values = decode_values(types, &stored.body)?;
            files.heap.delete(offset)?;
            for index in &mut files.indexes {
                index.remove(&values, offset)?;
            }
            Ok(())
        })
    }

    /// Materializes the record at `offset`. Tombstones yield `None`.
    pub(crate) fn load_record(
        &self,
        offset: RecordOffset,
        read_only: bool,
        generation: u64,
    ) -> Result<Option<Record>> {
        let types = &self.inner.types;
        let loaded = self.with_files(|files| {
            if generation != self.generation() {
                return Err(KeystoneError::ResultSetInvalidated(self.name().to_string()));
            }
            let stored = files.heap.read(offset)?;
            if stored.is_deleted() {
                return Ok(None);
            }
            Ok(Some((stored.id(), decode_values(types, &stored.body)?)))
        })?;
        Ok(loaded.map(|(id, values)| Record::loaded(self.clone(), id, offset, values, read_only)))
    }

    fn condition(&self, column: usize, value: Value) -> Result<Condition> {
        self.column_name(column)?;
        let column_type = self.inner.types[column];
        Ok(Condition {
            column,
            value: value.coerce_to(column_type)?,
        })
    }

    /// Picks the index serving `equal` columns (in any order) followed by
    /// an optional range column. Exact column sets win over longer
    /// compound indexes that merely start with them.
    fn plan(files: &TableFiles, equal: &[usize], range: Option<usize>) -> Option<usize> {
        let needed = equal.len() + range.is_some() as usize;
        files
            .indexes
            .iter()
            .enumerate()
            .filter(|(_, index)| {
                index.columns.len() >= needed
                    && index.columns[..equal.len()]
                        .iter()
                        .all(|c| equal.contains(c))
                    && range.map_or(true, |r| index.columns[equal.len()] == r)
            })
            .min_by_key(|(_, index)| index.columns.len())
            .map(|(position, _)| position)
    }

    fn index_name(&self, columns: &[usize]) -> String {
        columns
            .iter()
            .map(|c| self.column_name(*c).unwrap_or("?"))
            .collect::<Vec<_>>()
            .join("+")
    }

    /// Runs an index search and returns the matching offsets in key order.
    fn search(
        &self,
        equal: Vec<Condition>,
        range: Option<(usize, Value, Value)>,
    ) -> Result<Vec<RecordOffset>> {
        let range = match range {
            Some((column, low, high)) => {
                let low = self.condition(column, low)?;
                let high = self.condition(column, high)?;
                if self.inner.types[column] == ColumnType::String {
                    return Err(KeystoneError::InvalidParameter {
                        name: "range column".to_string(),
                        value: self.column_name(column)?.to_string(),
                    });
                }
                Some((low, high))
            }
            None => None,
        };
        let equal_columns: Vec<usize> = equal.iter().map(|c| c.column).collect();
        let range_column = range.as_ref().map(|(low, _)| low.column);
        let types = &self.inner.types;

        self.with_files(|files| {
            let position = Self::plan(files, &equal_columns, range_column).ok_or_else(|| {
                let mut columns = equal_columns.clone();
                columns.extend(range_column);
                KeystoneError::ColumnHasNoIndex(self.index_name(&columns))
            })?;
            let index = &files.indexes[position];

            // Conditions in index key order.
            let mut ordered: Vec<&Condition> = Vec::with_capacity(equal.len());
            for column in &index.columns[..equal.len()] {
                if let Some(condition) = equal.iter().find(|c| c.column == *column) {
                    ordered.push(condition);
                }
            }
            let mut low_parts = ordered
                .iter()
                .map(|c| KeyValue::from_value(&c.value, types[c.column]))
                .collect::<Result<Vec<_>>>()?;
            let mut high_parts = low_parts.clone();
            if let Some((low, high)) = &range {
                low_parts.push(KeyValue::from_value(&low.value, types[low.column])?);
                high_parts.push(KeyValue::from_value(&high.value, types[high.column])?);
            }
            let (low_key, high_key) = index.bounds(&low_parts, &high_parts)?;

            let mut raw = Vec::new();
            index.tree.search_for_range(&low_key, &high_key, &mut raw)?;

            let verify = index.inexact[..ordered.len()].iter().any(|v| *v)
                || range.is_some() && index.inexact[ordered.len()];
            if !verify {
                return Ok(raw.into_iter().map(RecordOffset).collect());
            }

            let mut offsets = Vec::with_capacity(raw.len());
            for offset in raw.into_iter().map(RecordOffset) {
                let stored = files.heap.read(offset)?;
                let values = decode_values(types, &stored.body)?;
                let equal_ok = ordered.iter().all(|c| values[c.column] == c.value);
                let range_ok = match &range {
                    Some((low, high)) => {
                        let v = &values[low.column];
                        !v.is_null()
                            && compare_values(v, &low.value) != CmpOrdering::Less
                            && compare_values(v, &high.value) != CmpOrdering::Greater
                    }
                    None => true,
                };
                if equal_ok && range_ok {
                    offsets.push(offset);
                }
            }
            Ok(offsets)
        })
    }

    fn equal_search(&self, conditions: Vec<(usize, Value)>) -> Result<Vec<RecordOffset>> {
        let equal = conditions
            .into_iter()
            .map(|(column, value)| self.condition(column, value))
            .collect::<Result<Vec<_>>>()?;
        self.search(equal, None)
    }

    /// Returns the first record whose `column` equals `value`, or `None`.
    /// Fails with `ColumnHasNoIndex` if no index starts with the column.
    pub fn get_record_by_equal(
        &self,
        column: usize,
        value: impl Into<Value>,
    ) -> Result<Option<Record>> {
        let offsets = self.equal_search(vec![(column, value.into())])?;
        let generation = self.generation();
        for offset in offsets {
            if let Some(record) = self.load_record(offset, false, generation)? {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    /// Read-only result set of records whose `column` equals `value`.
    pub fn create_result_set(&self, column: usize, value: impl Into<Value>) -> Result<ResultSet> {
        let offsets = self.equal_search(vec![(column, value.into())])?;
        Ok(ResultSet::new(self.clone(), offsets, false))
    }

    /// Read-only result set matching two columns, served by a compound index.
    pub fn create_result_set2(
        &self,
        column1: usize,
        value1: impl Into<Value>,
        column2: usize,
        value2: impl Into<Value>,
    ) -> Result<ResultSet> {
        let offsets =
            self.equal_search(vec![(column1, value1.into()), (column2, value2.into())])?;
        Ok(ResultSet::new(self.clone(), offsets, false))
    }

    /// Like `create_result_set`, but yielded records can be changed and deleted.
    pub fn create_modifiable_result_set(
        &self,
        column: usize,
        value: impl Into<Value>,
    ) -> Result<ResultSet> {
        let offsets = self.equal_search(vec![(column, value.into())])?;
        Ok(ResultSet::new(self.clone(), offsets, true))
    }

    pub fn create_modifiable_result_set2(
        &self,
        column1: usize,
        value1: impl Into<Value>,
        column2: usize,
        value2: impl Into<Value>,
    ) -> Result<ResultSet> {
        let offsets =
            self.equal_search(vec![(column1, value1.into()), (column2, value2.into())])?;
        Ok(ResultSet::new(self.clone(), offsets, true))
    }

    /// Records with `column == value` and `low <= range_column <= high`,
    /// served by a compound index over `(column, range_column)`.
    pub fn create_result_set_for_range(
        &self,
        column: usize,
        value: impl Into<Value>,
        range_column: usize,
        low: impl Into<Value>,
        high: impl Into<Value>,
    ) -> Result<ResultSet> {
        let offsets =
            self.range_search(column, value.into(), range_column, low.into(), high.into())?;
        Ok(ResultSet::new(self.clone(), offsets, false))
    }

    pub fn create_modifiable_result_set_for_range(
        &self,
        column: usize,
        value: impl Into<Value>,
        range_column: usize,
        low: impl Into<Value>,
        high: impl Into<Value>,
    ) -> Result<ResultSet> {
        let offsets =
            self.range_search(column, value.into(), range_column, low.into(), high.into())?;
        Ok(ResultSet::new(self.clone(), offsets, true))
    }

    fn range_search(
        &self,
        column: usize,
        value: Value,
        range_column: usize,
        low: Value,
        high: Value,
    ) -> Result<Vec<RecordOffset>> {
        let equal = vec![self.condition(column, value)?];
        self.search(equal, Some((range_column, low, high)))
    }

    /// Records with `low <= column <= high`, served by an index led by `column`.
    pub fn create_result_set_for_column_range(
        &self,
        column: usize,
        low: impl Into<Value>,
        high: impl Into<Value>,
    ) -> Result<ResultSet> {
        let offsets = self.search(Vec::new(), Some((column, low.into(), high.into())))?;
        Ok(ResultSet::new(self.clone(), offsets, false))
    }

    /// Modifiable result set over every live record in heap order.
    pub fn records(&self) -> Result<ResultSet> {
        let offsets = self.with_files(|files| {
            let mut offsets = Vec::with_capacity(files.heap.count() as usize);
            for item in files.heap.scan() {
                let (offset, record) = item?;
                if !record.is_deleted() {
                    offsets.push(offset);
                }
            }
            Ok(offsets)
        })?;
        Ok(ResultSet::new(self.clone(), offsets, true))
    }

    /// Live and total (live plus tombstoned) record counts.
    pub fn compute_wasted_space(&self) -> Result<WastedSpace> {
        self.with_files(|files| files.heap.compute_wasted_space())
    }

    /// Rewrites the heap without tombstones, optionally ordered, and
    /// rebuilds every index. Open result sets become invalid.
    pub fn defragment(&self, sorted: SortedColumn) -> Result<()> {
        if let SortedColumn::Column(column) = sorted {
            self.column_name(column)?;
        }
        let types = &self.inner.types;
        let name = self.name();

        self.with_files(|files| {
            let before = files.heap.compute_wasted_space()?;
            let mut live = files.live_records(types)?;
            match sorted {
                SortedColumn::Unsorted => {}
                SortedColumn::Id => live.sort_by_key(|(id, ..)| *id),
                SortedColumn::Column(column) => live.sort_by(|a, b| {
                    compare_values(&a.3[column], &b.3[column]).then(a.0.cmp(&b.0))
                }),
            }

            let offsets = files
                .heap
                .rewrite(live.iter().map(|(id, _, body, _)| (*id, body.clone())))?;
            for index in &mut files.indexes {
                index.tree.clear()?;
                for ((_, _, _, values), offset) in live.iter().zip(&offsets) {
                    index.insert(values, *offset)?;
                }
                index.tree.flush()?;
            }

            info!(
                "[{}] Defragmented ({:?}): {} records kept, {} tombstones reclaimed, {} pages",
                name,
                sorted,
                live.len(),
                before.total_record_count - before.normal_record_count,
                files.heap.num_pages()
            );
            Ok(())
        })?;
        self.inner.generation.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Writes the heap and all indexes to disk.
    pub fn flush(&self) -> Result<()> {
        self.with_files(|files| {
            files.heap.flush()?;
            for index in &mut files.indexes {
                index.tree.flush()?;
            }
            Ok(())
        })
    }

    /// Flushes and closes all files. Later calls fail with `TableClosed`.
    pub(crate) fn close(&self) -> Result<()> {
        let files = self.inner.files.lock().take();
        let Some(files) = files else {
            return Ok(());
        };
        let mut result = files.heap.close();
        for index in files.indexes {
            let closed = index.tree.close();
            if result.is_ok() {
                result = closed;
            }
        }
        debug!("[{}] Closed table", self.name());
        result
    }
}

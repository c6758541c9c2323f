//! Table and database schema definitions.
//!
//! The schema is persisted as JSON next to the data files and reloaded
//! before any table is opened. All validation happens here, at definition
//! time, so a loaded structure is always consistent.

use keystone_common::{ColumnType, KeystoneError, Result};
use serde::{Deserialize, Serialize};

/// Current schema file format.
pub const STRUCTURE_FORMAT_VERSION: u32 = 1;

/// A column definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub column_type: ColumnType,
    /// Key columns get a single-column index on creation.
    pub is_key: bool,
    pub nullable: bool,
}

/// An index over one or more columns, in key order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDefinition {
    pub columns: Vec<String>,
}

impl IndexDefinition {
    pub fn new<S: AsRef<str>>(columns: &[S]) -> Self {
        Self {
            columns: columns.iter().map(|c| c.as_ref().to_string()).collect(),
        }
    }

    pub fn is_compound(&self) -> bool {
        self.columns.len() > 1
    }

    /// Name used in error messages and index file names, e.g. `Name+Age`.
    pub fn display_name(&self) -> String {
        self.columns.join("+")
    }

    fn matches<S: AsRef<str>>(&self, columns: &[S]) -> bool {
        self.columns.len() == columns.len()
            && self
                .columns
                .iter()
                .zip(columns)
                .all(|(a, b)| a == b.as_ref())
    }
}

/// Schema of one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableStructure {
    name: String,
    columns: Vec<Column>,
    indexes: Vec<IndexDefinition>,
}

impl TableStructure {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            indexes: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Single-column and compound indexes, in creation order.
    pub fn indexes(&self) -> &[IndexDefinition] {
        &self.indexes
    }

    pub fn column_types(&self) -> Vec<ColumnType> {
        self.columns.iter().map(|c| c.column_type).collect()
    }

    /// Position of a column within a record.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    fn require_column(&self, name: &str) -> Result<&Column> {
        self.column(name)
            .ok_or_else(|| KeystoneError::ColumnDoesNotExist(name.to_string()))
    }

    /// Adds a non-nullable column. A key column is indexed immediately.
    pub fn create_column(
        &mut self,
        name: &str,
        column_type: ColumnType,
        is_key: bool,
    ) -> Result<()> {
        self.add_column(name, column_type, is_key, false)
    }

    /// Adds a nullable column. New records start with `Null` in it.
    pub fn create_nullable_column(&mut self, name: &str, column_type: ColumnType) -> Result<()> {
        self.add_column(name, column_type, false, true)
    }

    fn add_column(
        &mut self,
        name: &str,
        column_type: ColumnType,
        is_key: bool,
        nullable: bool,
    ) -> Result<()> {
        if name.is_empty() || name.contains('+') || name.contains('.') {
            return Err(KeystoneError::InvalidParameter {
                name: "column".to_string(),
                value: name.to_string(),
            });
        }
        if self.column(name).is_some() {
            return Err(KeystoneError::ColumnAlreadyExists(name.to_string()));
        }
        if is_key && !column_type.is_indexable() {
            return Err(KeystoneError::ColumnNotIndexable(name.to_string()));
        }
        self.columns.push(Column {
            name: name.to_string(),
            column_type,
            is_key,
            nullable,
        });
        if is_key {
            self.indexes.push(IndexDefinition::new(&[name]));
        }
        Ok(())
    }

    /// Returns true if an index over exactly these columns exists.
    pub fn has_index<S: AsRef<str>>(&self, columns: &[S]) -> bool {
        self.indexes.iter().any(|i| i.matches(columns))
    }

    fn add_index<S: AsRef<str>>(&mut self, columns: &[S]) -> Result<()> {
        for (i, name) in columns.iter().enumerate() {
            if columns[..i].iter().any(|c| c.as_ref() == name.as_ref()) {
                return Err(KeystoneError::InvalidParameter {
                    name: "index".to_string(),
                    value: IndexDefinition::new(columns).display_name(),
                });
            }
            let column = self.require_column(name.as_ref())?;
            if !column.column_type.is_indexable() {
                return Err(KeystoneError::ColumnNotIndexable(column.name.clone()));
            }
        }
        let index = IndexDefinition::new(columns);
        if self.has_index(columns) {
            return Err(KeystoneError::IndexAlreadyExists(index.display_name()));
        }
        self.indexes.push(index);
        Ok(())
    }

    /// Creates a single-column index.
    pub fn create_index(&mut self, column: &str) -> Result<()> {
        self.add_index(&[column])
    }

    /// Creates a compound index over two or more columns.
    pub fn set_compound_index<S: AsRef<str>>(&mut self, columns: &[S]) -> Result<()> {
        if columns.len() < 2 {
            return Err(KeystoneError::InvalidParameter {
                name: "compound index".to_string(),
                value: IndexDefinition::new(columns).display_name(),
            });
        }
        self.add_index(columns)
    }

    /// Drops the single-column index on `column`.
    pub fn drop_index(&mut self, column: &str) -> Result<()> {
        self.require_column(column)?;
        self.remove_index(&[column])
    }

    /// Drops a compound index.
    pub fn drop_compound_index<S: AsRef<str>>(&mut self, columns: &[S]) -> Result<()> {
        self.remove_index(columns)
    }

    fn remove_index<S: AsRef<str>>(&mut self, columns: &[S]) -> Result<()> {
        match self.indexes.iter().position(|i| i.matches(columns)) {
            Some(pos) => {
                self.indexes.remove(pos);
                Ok(())
            }
            None => Err(KeystoneError::ColumnHasNoIndex(
                IndexDefinition::new(columns).display_name(),
            )),
        }
    }

    /// Checks a structure read from disk.
    pub fn validate(&self) -> Result<()> {
        let corrupted = |reason: String| {
            KeystoneError::StructureCorrupted(format!("table {}: {}", self.name, reason))
        };
        for (i, column) in self.columns.iter().enumerate() {
            if self.columns[..i].iter().any(|c| c.name == column.name) {
                return Err(corrupted(format!("duplicate column {}", column.name)));
            }
        }
        for (i, index) in self.indexes.iter().enumerate() {
            if index.columns.is_empty() {
                return Err(corrupted("empty index".to_string()));
            }
            for (j, name) in index.columns.iter().enumerate() {
                if index.columns[..j].contains(name) {
                    return Err(corrupted(format!("column {} repeated in index", name)));
                }
                match self.column(name) {
                    Some(c) if c.column_type.is_indexable() => {}
                    Some(_) => return Err(corrupted(format!("column {} is not indexable", name))),
                    None => return Err(corrupted(format!("index on missing column {}", name))),
                }
            }
            if self.indexes[..i].iter().any(|other| other == index) {
                return Err(corrupted(format!("duplicate index {}", index.display_name())));
            }
        }
        Ok(())
    }
}

/// Schema of a whole database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseStructure {
    version: u32,
    name: String,
    tables: Vec<TableStructure>,
}

impl DatabaseStructure {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            version: STRUCTURE_FORMAT_VERSION,
            name: name.into(),
            tables: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tables(&self) -> &[TableStructure] {
        &self.tables
    }

    /// Adds an empty table and returns it for column definitions.
    pub fn create_table(&mut self, name: &str) -> Result<&mut TableStructure> {
        if name.is_empty() || name.contains('.') {
            return Err(KeystoneError::InvalidParameter {
                name: "table".to_string(),
                value: name.to_string(),
            });
        }
        if self.table(name).is_some() {
            return Err(KeystoneError::TableAlreadyExists(name.to_string()));
        }
        self.tables.push(TableStructure::new(name));
        let last = self.tables.len() - 1;
        Ok(&mut self.tables[last])
    }

    pub fn table(&self, name: &str) -> Option<&TableStructure> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Mutable access to a table definition.
    pub fn table_mut(&mut self, name: &str) -> Result<&mut TableStructure> {
        self.tables
            .iter_mut()
            .find(|t| t.name == name)
            .ok_or_else(|| KeystoneError::TableNotFound(name.to_string()))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| KeystoneError::StructureCorrupted(e.to_string()))
    }

    /// Parses and validates a saved structure.
    pub fn from_json(json: &str) -> Result<Self> {
        let structure: Self = serde_json::from_str(json)
            .map_err(|e| KeystoneError::StructureCorrupted(e.to_string()))?;
        if structure.version != STRUCTURE_FORMAT_VERSION {
            return Err(KeystoneError::StructureCorrupted(format!(
                "unsupported format version {}",
                structure.version
            )));
        }
        for (i, table) in structure.tables.iter().enumerate() {
            if structure.tables[..i].iter().any(|t| t.name == table.name) {
                return Err(KeystoneError::StructureCorrupted(format!(
                    "duplicate table {}",
                    table.name
                )));
            }
            table.validate()?;
        }
        Ok(structure)
    }
}

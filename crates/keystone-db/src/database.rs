//! Database lifecycle: schema persistence and the set of open tables.

use crate::structure::DatabaseStructure;
use crate::table::{heap_file_name, index_file_name, Table};
use keystone_common::{DatabaseConfig, KeystoneError, Result};
use keystone_storage::{DiskManager, DiskManagerConfig};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Schema file name of a database.
fn structure_file_name(db: &str) -> String {
    format!("{}.structure.json", db)
}

/// A named database under a data directory.
///
/// Defining tables is a three step affair: edit the schema through
/// `structure_mut`, persist it with `save_structure`, then open the tables
/// with `load_structure`. `Database::open` does the last step itself.
pub struct Database {
    name: String,
    config: DatabaseConfig,
    disk: Arc<DiskManager>,
    structure: DatabaseStructure,
    tables: HashMap<String, Table>,
    shut_down: bool,
}

impl Database {
    /// Creates an empty database, removing the schema, heap and index files
    /// of any existing database with the same name.
    pub fn create(config: DatabaseConfig, name: &str) -> Result<Self> {
        config.validate()?;
        validate_name(name)?;
        let disk = Arc::new(DiskManager::new(DiskManagerConfig::from(&config))?);

        let prefix = format!("{}.", name);
        let mut removed = 0;
        for file in data_files(&disk)? {
            let owned = file.starts_with(&prefix)
                && (file.ends_with(".dat") || file.ends_with(".idx") || file.ends_with(".json"));
            if owned {
                disk.delete_file(&file)?;
                removed += 1;
            }
        }

        let db = Self {
            name: name.to_string(),
            config,
            disk,
            structure: DatabaseStructure::new(name),
            tables: HashMap::new(),
            shut_down: false,
        };
        db.save_structure()?;
        info!(
            "[{}] Created database in {} ({} old files removed)",
            name,
            db.disk.data_dir().display(),
            removed
        );
        Ok(db)
    }

    /// Opens an existing database and all of its tables.
    pub fn open(config: DatabaseConfig, name: &str) -> Result<Self> {
        config.validate()?;
        validate_name(name)?;
        let disk = Arc::new(DiskManager::new(DiskManagerConfig::from(&config))?);
        if !disk.file_exists(&structure_file_name(name)) {
            return Err(KeystoneError::StructureNotFound(name.to_string()));
        }

        let mut db = Self {
            name: name.to_string(),
            config,
            disk,
            structure: DatabaseStructure::new(name),
            tables: HashMap::new(),
            shut_down: false,
        };
        db.load_structure()?;
        info!("[{}] Opened database with {} tables", name, db.tables.len());
        Ok(db)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// The schema as last loaded or edited.
    pub fn structure(&self) -> &DatabaseStructure {
        &self.structure
    }

    /// Schema for editing. Changes take effect after `save_structure` and
    /// `load_structure`.
    pub fn structure_mut(&mut self) -> &mut DatabaseStructure {
        &mut self.structure
    }

    /// Writes the schema to `<db>.structure.json`.
    pub fn save_structure(&self) -> Result<()> {
        let json = self.structure.to_json()?;
        let file_name = structure_file_name(&self.name);
        let path = self.disk.file_path(&file_name);
        let tmp = self.disk.file_path(&format!("{}.tmp", file_name));
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path)?;
        debug!("[{}] Saved structure to {}", self.name, path.display());
        Ok(())
    }

    /// Reads the schema from disk and (re)opens every table.
    ///
    /// Tables opened earlier are closed first, so handles and result sets
    /// obtained before the call fail with `TableClosed`. Index files that no
    /// longer belong to an index are deleted; indexes that are new or out of
    /// step with their heap are rebuilt.
    pub fn load_structure(&mut self) -> Result<()> {
        let path = self.disk.file_path(&structure_file_name(&self.name));
        let json = match std::fs::read_to_string(&path) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(KeystoneError::StructureNotFound(self.name.clone()));
            }
            Err(e) => return Err(e.into()),
        };
        let structure = DatabaseStructure::from_json(&json)?;
        if structure.name() != self.name {
            return Err(KeystoneError::StructureCorrupted(format!(
                "structure file names database {}, expected {}",
                structure.name(),
                self.name
            )));
        }

        self.close_tables()?;
        self.remove_stale_indexes(&structure)?;

        let mut tables = HashMap::with_capacity(structure.tables().len());
        for table_structure in structure.tables() {
            let table = Table::open(
                &self.disk,
                &self.name,
                table_structure.clone(),
                self.config.verify_on_load,
            )?;
            tables.insert(table_structure.name().to_string(), table);
        }

        info!(
            "[{}] Loaded structure: {} tables",
            self.name,
            structure.tables().len()
        );
        self.structure = structure;
        self.tables = tables;
        self.shut_down = false;
        Ok(())
    }

    /// Deletes index files of tables in `structure` that match none of the
    /// table's current indexes.
    fn remove_stale_indexes(&self, structure: &DatabaseStructure) -> Result<()> {
        let files = data_files(&self.disk)?;
        for table in structure.tables() {
            let prefix = format!("{}.{}.", self.name, table.name());
            let expected: HashSet<String> = table
                .indexes()
                .iter()
                .map(|index| index_file_name(&self.name, table.name(), index))
                .collect();
            for file in &files {
                if file.starts_with(&prefix) && file.ends_with(".idx") && !expected.contains(file)
                {
                    debug!("[{}] Removing stale index file {}", self.name, file);
                    self.disk.delete_file(file)?;
                }
            }
        }
        Ok(())
    }

    /// Handle to an open table.
    pub fn table(&self, name: &str) -> Result<Table> {
        self.tables
            .get(name)
            .cloned()
            .ok_or_else(|| KeystoneError::TableNotFound(name.to_string()))
    }

    /// Handles to every open table.
    pub fn tables(&self) -> impl Iterator<Item = &Table> {
        self.tables.values()
    }

    /// Heap file name of a table, relative to the data directory.
    pub fn heap_file_name(&self, table: &str) -> String {
        heap_file_name(&self.name, table)
    }

    fn close_tables(&mut self) -> Result<()> {
        let mut result = Ok(());
        for (_, table) in self.tables.drain() {
            let open = table.open_result_sets();
            if open > 0 {
                warn!(
                    "[{}] Closing table {} with {} open result sets",
                    self.name,
                    table.name(),
                    open
                );
            }
            let closed = table.close();
            if result.is_ok() {
                result = closed;
            }
        }
        result
    }

    /// Flushes and closes every table file. Table handles still held by the
    /// caller fail with `TableClosed` afterwards.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;
        let tables = self.tables.len();
        self.close_tables()?;
        self.disk.close_all()?;
        info!("[{}] Shut down ({} tables closed)", self.name, tables);
        Ok(())
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("[{}] Shutdown on drop failed: {}", self.name, e);
        }
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('.') || name.contains(std::path::is_separator) {
        return Err(KeystoneError::InvalidParameter {
            name: "database".to_string(),
            value: name.to_string(),
        });
    }
    Ok(())
}

/// Names of the regular files in the data directory.
fn data_files(disk: &DiskManager) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(disk.data_dir())? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
    }
    Ok(names)
}

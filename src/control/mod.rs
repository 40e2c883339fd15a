// Database control plane - narrow interface to the database that owns
// the data being backed up, plus its resource models

pub mod http;
pub mod schema;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A database known to the control plane.
#[derive(Debug, Clone, PartialEq)]
pub struct DatabaseInfo {
    pub name: String,
    pub engine: Option<String>,
    pub metadata_path: Option<String>,
}

impl DatabaseInfo {
    pub fn is_atomic(&self) -> bool {
        matches!(self.engine.as_deref(), Some("Atomic") | Some("Replicated"))
    }

    pub fn is_external_db_engine(&self) -> bool {
        matches!(
            self.engine.as_deref(),
            Some("MySQL")
                | Some("MaterializedMySQL")
                | Some("PostgreSQL")
                | Some("MaterializedPostgreSQL")
        )
    }

    /// True when the create statement is managed by the database itself
    /// and must be neither uploaded nor re-applied on restore.
    pub fn has_embedded_metadata(&self) -> bool {
        matches!(
            self.name.as_str(),
            "default" | "system" | "information_schema" | "INFORMATION_SCHEMA"
        )
    }
}

/// A table known to the control plane.
#[derive(Debug, Clone)]
pub struct TableInfo {
    pub database: String,
    pub name: String,
    pub engine: String,
    pub uuid: Option<String>,
    pub create_statement: String,
    /// Local path of the table's schema file.
    pub metadata_path: PathBuf,
    /// Data directories of the table with the disks they live on.
    pub paths_with_disks: Vec<(PathBuf, String)>,
}

impl TableInfo {
    pub fn is_merge_tree(&self) -> bool {
        schema::is_merge_tree(&self.engine)
    }

    pub fn is_replicated(&self) -> bool {
        schema::is_replicated(&self.engine)
    }

    pub fn is_distributed(&self) -> bool {
        schema::is_distributed(&self.engine)
    }

    pub fn is_view(&self) -> bool {
        schema::is_view(&self.engine)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskType {
    Local,
    ObjectStorage,
}

#[derive(Debug, Clone)]
pub struct Disk {
    pub name: String,
    pub disk_type: DiskType,
    pub path: PathBuf,
    pub cache_path: Option<PathBuf>,
}

/// An immutable hard-linked snapshot of one data part, produced by
/// freezing a table.
#[derive(Debug, Clone)]
pub struct FrozenPart {
    pub database: String,
    pub table: String,
    pub name: String,
    pub disk_name: String,
    /// Local directory holding the snapshot files.
    pub path: PathBuf,
    pub checksum: String,
    pub size: u64,
    pub files: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AccessControlObject {
    pub id: String,
    pub name: String,
    pub type_tag: String,
}

/// Narrow interface to the database control plane. Freezing, attaching,
/// DDL and enumeration live on the database side; the backup engine
/// only consumes the results.
pub trait DatabaseControl: Send + Sync {
    fn version(&self) -> Result<String>;

    fn databases(&self, exclude: &[String]) -> Result<Vec<DatabaseInfo>>;

    /// Tables of a database, ordered by schema-file modification time.
    /// An empty filter returns all tables.
    fn tables(&self, db: &str, tables_filter: &[String]) -> Result<Vec<TableInfo>>;

    fn table_exists(&self, db: &str, table: &str) -> Result<bool>;

    fn get_database_schema(&self, db: &str) -> Result<String>;

    fn get_table_schema(&self, db: &str, table: &str) -> Result<String>;

    /// Freeze a table, producing immutable snapshot parts.
    fn freeze_table(&self, backup_name: &str, table: &TableInfo) -> Result<Vec<FrozenPart>>;

    /// Release all frozen data recorded under the given snapshot label.
    fn unfreeze_all(&self, backup_name: &str) -> Result<()>;

    /// Release a single frozen part after it was linked via dedup.
    fn remove_frozen_part(&self, part: &FrozenPart) -> Result<()>;

    fn disks(&self) -> Result<HashMap<String, Disk>>;

    fn get_detached_part_path(
        &self,
        table: &TableInfo,
        disk_name: &str,
        part_name: &str,
    ) -> Result<PathBuf>;

    fn attach_part(&self, table: &TableInfo, part_name: &str) -> Result<()>;

    fn create_database(&self, statement: &str) -> Result<()>;

    fn create_table(&self, statement: &str) -> Result<()>;

    fn create_udf(&self, statement: &str) -> Result<()>;

    fn drop_table_if_exists(&self, db: &str, table: &str) -> Result<()>;

    fn restore_replica(&self, table: &TableInfo) -> Result<()>;

    /// Fix ownership of detached parts so the database can adopt them.
    fn chown_detached_parts(&self, table: &TableInfo) -> Result<()>;

    fn access_control_objects(&self) -> Result<Vec<AccessControlObject>>;

    fn udf_definitions(&self) -> Result<HashMap<String, String>>;
}

/// Compute the frozen-part descriptor for a snapshot directory: file
/// list, total size and a content checksum. Shared by control-plane
/// implementations.
pub fn describe_frozen_dir(
    database: &str,
    table: &str,
    part_name: &str,
    disk_name: &str,
    path: &Path,
) -> Result<FrozenPart> {
    use sha2::{Digest, Sha256};

    let mut files = Vec::new();
    let mut entries: Vec<_> = std::fs::read_dir(path)?.collect::<std::io::Result<Vec<_>>>()?;
    entries.sort_by_key(|e| e.file_name());

    let mut size = 0u64;
    let mut hasher = Sha256::new();
    for entry in entries {
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        let data = std::fs::read(entry.path())?;
        size += data.len() as u64;
        hasher.update(name.as_bytes());
        hasher.update(&data);
        files.push(name);
    }

    Ok(FrozenPart {
        database: database.to_string(),
        table: table.to_string(),
        name: part_name.to_string(),
        disk_name: disk_name.to_string(),
        path: path.to_path_buf(),
        checksum: hex::encode(hasher.finalize()),
        size,
        files,
    })
}

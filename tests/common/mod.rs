// Shared test fixtures: a filesystem-backed fake control plane and a
// ready-to-use engine configuration over local storage.
#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tempfile::TempDir;

use rusty_backup::config::{Config, EncryptionConfig, StorageKind};
use rusty_backup::control::{
    describe_frozen_dir, schema, AccessControlObject, DatabaseControl, DatabaseInfo, Disk,
    DiskType, FrozenPart, TableInfo,
};
use rusty_backup::error::{BackupError, Result};
use rusty_backup::BackupEngine;

type FreezeHook = Box<dyn Fn(&str, &str) + Send + Sync>;

#[derive(Default)]
struct FakeState {
    /// db -> table -> engine
    tables: HashMap<String, HashMap<String, String>>,
    databases: Vec<String>,
    attached: Vec<(String, String, String)>,
    udfs: HashMap<String, String>,
    access_objects: Vec<AccessControlObject>,
}

/// Filesystem-backed fake of the database control plane.
///
/// Table data lives under `<root>/data/<db>/<table>/<part>/`, schema
/// files under `<root>/metadata/`, frozen snapshots under
/// `<root>/shadow/<label>/`.
pub struct FakeControl {
    root: PathBuf,
    state: Mutex<FakeState>,
    freeze_hook: Mutex<Option<FreezeHook>>,
}

impl FakeControl {
    pub fn new(root: &Path) -> Arc<Self> {
        std::fs::create_dir_all(root.join("data")).unwrap();
        std::fs::create_dir_all(root.join("metadata")).unwrap();
        Arc::new(Self {
            root: root.to_path_buf(),
            state: Mutex::new(FakeState::default()),
            freeze_hook: Mutex::new(None),
        })
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root.join("data")
    }

    fn table_dir(&self, db: &str, table: &str) -> PathBuf {
        self.data_dir().join(db).join(table)
    }

    pub fn metadata_file(&self, db: &str, table: &str) -> PathBuf {
        self.root.join("metadata").join(db).join(format!("{}.sql", table))
    }

    /// Run a callback inside every freeze, after the snapshot is taken.
    pub fn set_freeze_hook(&self, hook: FreezeHook) {
        *self.freeze_hook.lock() = Some(hook);
    }

    pub fn add_database(&self, db: &str) {
        let mut state = self.state.lock();
        if !state.databases.contains(&db.to_string()) {
            state.databases.push(db.to_string());
        }
        drop(state);
        std::fs::create_dir_all(self.data_dir().join(db)).unwrap();
        std::fs::create_dir_all(self.root.join("metadata").join(db)).unwrap();
        std::fs::write(
            self.root.join("metadata").join(format!("{}.sql", db)),
            format!("CREATE DATABASE {} ENGINE = Atomic", db),
        )
        .unwrap();
    }

    pub fn add_table(&self, db: &str, table: &str) {
        self.add_database(db);
        let statement = format!(
            "CREATE TABLE {}.{} (n Int32) ENGINE = MergeTree ORDER BY n",
            db, table
        );
        self.state
            .lock()
            .tables
            .entry(db.to_string())
            .or_default()
            .insert(table.to_string(), "MergeTree".to_string());
        std::fs::create_dir_all(self.table_dir(db, table)).unwrap();
        std::fs::write(self.metadata_file(db, table), statement).unwrap();
    }

    pub fn add_part(&self, db: &str, table: &str, part: &str, files: &[(&str, &[u8])]) {
        let part_dir = self.table_dir(db, table).join(part);
        std::fs::create_dir_all(&part_dir).unwrap();
        for (name, content) in files {
            std::fs::write(part_dir.join(name), content).unwrap();
        }
    }

    pub fn add_udf(&self, name: &str, statement: &str) {
        self.state
            .lock()
            .udfs
            .insert(name.to_string(), statement.to_string());
    }

    pub fn add_access_object(&self, id: &str, name: &str, type_tag: &str) {
        self.state.lock().access_objects.push(AccessControlObject {
            id: id.to_string(),
            name: name.to_string(),
            type_tag: type_tag.to_string(),
        });
    }

    pub fn attached_parts(&self) -> Vec<(String, String, String)> {
        self.state.lock().attached.clone()
    }

    pub fn applied_udfs(&self) -> HashMap<String, String> {
        self.state.lock().udfs.clone()
    }

    /// Contents of one part directory in table data, file name -> bytes.
    pub fn part_files(&self, db: &str, table: &str, part: &str) -> HashMap<String, Vec<u8>> {
        let part_dir = self.table_dir(db, table).join(part);
        let mut files = HashMap::new();
        if let Ok(entries) = std::fs::read_dir(&part_dir) {
            for entry in entries.flatten() {
                files.insert(
                    entry.file_name().to_string_lossy().to_string(),
                    std::fs::read(entry.path()).unwrap(),
                );
            }
        }
        files
    }

    fn table_info(&self, db: &str, table: &str, engine: &str) -> TableInfo {
        TableInfo {
            database: db.to_string(),
            name: table.to_string(),
            engine: engine.to_string(),
            uuid: None,
            create_statement: format!(
                "CREATE TABLE {}.{} (n Int32) ENGINE = {} ORDER BY n",
                db, table, engine
            ),
            metadata_path: self.metadata_file(db, table),
            paths_with_disks: vec![(self.table_dir(db, table), "default".to_string())],
        }
    }

    fn parse_table_reference(statement: &str) -> Result<(String, String)> {
        let token = statement
            .split_whitespace()
            .skip_while(|t| *t != "TABLE")
            .nth(1)
            .ok_or_else(|| {
                BackupError::DatabaseControl(format!("Cannot parse statement: {}", statement))
            })?;
        let token = token.trim_matches('`');
        token
            .split_once('.')
            .map(|(db, table)| (db.trim_matches('`').to_string(), table.trim_matches('`').to_string()))
            .ok_or_else(|| {
                BackupError::DatabaseControl(format!("Cannot parse table reference: {}", token))
            })
    }
}

impl DatabaseControl for FakeControl {
    fn version(&self) -> Result<String> {
        Ok("24.3.fake".to_string())
    }

    fn databases(&self, exclude: &[String]) -> Result<Vec<DatabaseInfo>> {
        let state = self.state.lock();
        Ok(state
            .databases
            .iter()
            .filter(|db| !exclude.contains(db))
            .map(|db| DatabaseInfo {
                name: db.clone(),
                engine: Some("Atomic".to_string()),
                metadata_path: Some(
                    self.root
                        .join("metadata")
                        .join(format!("{}.sql", db))
                        .to_string_lossy()
                        .to_string(),
                ),
            })
            .collect())
    }

    fn tables(&self, db: &str, tables_filter: &[String]) -> Result<Vec<TableInfo>> {
        let state = self.state.lock();
        let mut tables: Vec<TableInfo> = state
            .tables
            .get(db)
            .map(|tables| {
                tables
                    .iter()
                    .filter(|(name, _)| tables_filter.is_empty() || tables_filter.contains(name))
                    .map(|(name, engine)| self.table_info(db, name, engine))
                    .collect()
            })
            .unwrap_or_default();
        tables.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(tables)
    }

    fn table_exists(&self, db: &str, table: &str) -> Result<bool> {
        Ok(self
            .state
            .lock()
            .tables
            .get(db)
            .map(|tables| tables.contains_key(table))
            .unwrap_or(false))
    }

    fn get_database_schema(&self, db: &str) -> Result<String> {
        Ok(format!("CREATE DATABASE {} ENGINE = Atomic", db))
    }

    fn get_table_schema(&self, db: &str, table: &str) -> Result<String> {
        let state = self.state.lock();
        let engine = state
            .tables
            .get(db)
            .and_then(|tables| tables.get(table))
            .cloned()
            .ok_or_else(|| BackupError::DatabaseControl(format!("No such table: {}.{}", db, table)))?;
        Ok(format!(
            "CREATE TABLE {}.{} (n Int32) ENGINE = {} ORDER BY n",
            db, table, engine
        ))
    }

    fn freeze_table(&self, backup_name: &str, table: &TableInfo) -> Result<Vec<FrozenPart>> {
        let shadow_table_dir = self
            .root
            .join("shadow")
            .join(backup_name)
            .join(&table.database)
            .join(&table.name);
        std::fs::create_dir_all(&shadow_table_dir)?;

        let table_dir = self.table_dir(&table.database, &table.name);
        let mut parts = Vec::new();
        if table_dir.is_dir() {
            let mut entries: Vec<_> =
                std::fs::read_dir(&table_dir)?.collect::<std::io::Result<Vec<_>>>()?;
            entries.sort_by_key(|e| e.file_name());
            for entry in entries {
                if !entry.file_type()?.is_dir() {
                    continue;
                }
                let part_name = entry.file_name().to_string_lossy().to_string();
                if part_name == "detached" {
                    continue;
                }
                let snapshot_dir = shadow_table_dir.join(&part_name);
                std::fs::create_dir_all(&snapshot_dir)?;
                for file in std::fs::read_dir(entry.path())? {
                    let file = file?;
                    std::fs::copy(file.path(), snapshot_dir.join(file.file_name()))?;
                }
                parts.push(describe_frozen_dir(
                    &table.database,
                    &table.name,
                    &part_name,
                    "default",
                    &snapshot_dir,
                )?);
            }
        }

        if let Some(hook) = &*self.freeze_hook.lock() {
            hook(&table.database, &table.name);
        }
        Ok(parts)
    }

    fn unfreeze_all(&self, backup_name: &str) -> Result<()> {
        let shadow = self.root.join("shadow").join(backup_name);
        match std::fs::remove_dir_all(shadow) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn remove_frozen_part(&self, part: &FrozenPart) -> Result<()> {
        match std::fs::remove_dir_all(&part.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn disks(&self) -> Result<HashMap<String, Disk>> {
        let mut disks = HashMap::new();
        disks.insert(
            "default".to_string(),
            Disk {
                name: "default".to_string(),
                disk_type: DiskType::Local,
                path: self.data_dir(),
                cache_path: None,
            },
        );
        Ok(disks)
    }

    fn get_detached_part_path(
        &self,
        table: &TableInfo,
        _disk_name: &str,
        part_name: &str,
    ) -> Result<PathBuf> {
        Ok(self
            .table_dir(&table.database, &table.name)
            .join("detached")
            .join(part_name))
    }

    fn attach_part(&self, table: &TableInfo, part_name: &str) -> Result<()> {
        let detached = self
            .table_dir(&table.database, &table.name)
            .join("detached")
            .join(part_name);
        if !detached.is_dir() {
            return Err(BackupError::DatabaseControl(format!(
                "No detached part {} for {}.{}",
                part_name, table.database, table.name
            )));
        }
        let target = self.table_dir(&table.database, &table.name).join(part_name);
        std::fs::rename(&detached, &target)?;
        self.state.lock().attached.push((
            table.database.clone(),
            table.name.clone(),
            part_name.to_string(),
        ));
        Ok(())
    }

    fn create_database(&self, statement: &str) -> Result<()> {
        let name = statement
            .split_whitespace()
            .skip_while(|t| *t != "DATABASE")
            .find(|t| !matches!(*t, "DATABASE" | "IF" | "NOT" | "EXISTS"))
            .ok_or_else(|| {
                BackupError::DatabaseControl(format!("Cannot parse statement: {}", statement))
            })?
            .to_string();
        let mut state = self.state.lock();
        if !state.databases.contains(&name) {
            state.databases.push(name.clone());
        }
        drop(state);
        std::fs::create_dir_all(self.data_dir().join(&name))?;
        Ok(())
    }

    fn create_table(&self, statement: &str) -> Result<()> {
        let (db, table) = Self::parse_table_reference(statement)?;
        let engine =
            schema::engine_from_statement(statement).unwrap_or_else(|| "MergeTree".to_string());
        self.state
            .lock()
            .tables
            .entry(db.clone())
            .or_default()
            .insert(table.clone(), engine);
        std::fs::create_dir_all(self.table_dir(&db, &table))?;
        Ok(())
    }

    fn create_udf(&self, statement: &str) -> Result<()> {
        let name = statement
            .split_whitespace()
            .skip_while(|t| *t != "FUNCTION")
            .nth(1)
            .unwrap_or("unknown")
            .to_string();
        self.state.lock().udfs.insert(name, statement.to_string());
        Ok(())
    }

    fn drop_table_if_exists(&self, db: &str, table: &str) -> Result<()> {
        if let Some(tables) = self.state.lock().tables.get_mut(db) {
            tables.remove(table);
        }
        let dir = self.table_dir(db, table);
        if dir.is_dir() {
            std::fs::remove_dir_all(dir)?;
        }
        Ok(())
    }

    fn restore_replica(&self, _table: &TableInfo) -> Result<()> {
        Ok(())
    }

    fn chown_detached_parts(&self, _table: &TableInfo) -> Result<()> {
        Ok(())
    }

    fn access_control_objects(&self) -> Result<Vec<AccessControlObject>> {
        Ok(self.state.lock().access_objects.clone())
    }

    fn udf_definitions(&self) -> Result<HashMap<String, String>> {
        Ok(self.state.lock().udfs.clone())
    }
}

/// One test environment: local object storage, a fake control plane
/// and a config wired to both.
pub struct TestEnv {
    pub dir: TempDir,
    pub config: Config,
    pub control: Arc<FakeControl>,
}

impl TestEnv {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let control = FakeControl::new(&dir.path().join("db"));
        let config = base_config(dir.path());
        Self {
            dir,
            config,
            control,
        }
    }

    pub fn engine(&self) -> BackupEngine {
        BackupEngine::new(self.config.clone(), self.control.clone(), None).unwrap()
    }

    /// A second control plane sharing the same object storage,
    /// simulating a restore on a fresh host.
    pub fn fresh_host(&self) -> (Arc<FakeControl>, BackupEngine) {
        let control = FakeControl::new(&self.dir.path().join("db-restore"));
        let mut config = self.config.clone();
        config.backup.restore_context_path = self.dir.path().join("restore_state_fresh.json");
        config.database.access_control_path = self.dir.path().join("db-restore/access");
        let engine = BackupEngine::new(config, control.clone(), None).unwrap();
        (control, engine)
    }

    /// Rewrite a stored backup's start time, aging it by the given
    /// number of seconds.
    pub fn age_backup(&self, name: &str, seconds: i64) {
        let engine = self.engine();
        let mut meta = engine.get(name).unwrap();
        meta.start_time = meta.start_time - chrono::Duration::seconds(seconds);
        let path = self
            .dir
            .path()
            .join("storage")
            .join("backups")
            .join(name)
            .join("backup_struct.json");
        std::fs::write(path, meta.dump_json(false)).unwrap();
    }

    /// Path of a stored object in the local storage backend.
    pub fn storage_object(&self, key: &str) -> PathBuf {
        self.dir.path().join("storage").join(key)
    }
}

pub fn base_config(root: &Path) -> Config {
    let mut config = Config::default();
    config.backup.path_root = "backups".to_string();
    config.backup.restore_context_path = root.join("restore_state.json");
    config.storage.kind = StorageKind::Local;
    config.storage.local_root = root.join("storage");
    config.storage.max_attempts = 2;
    config.storage.retry_base_interval_ms = 1;
    config.encryption = EncryptionConfig {
        key: "a1".repeat(32),
        ..EncryptionConfig::default()
    };
    config.database.access_control_path = root.join("db/access");
    config.pipeline.workers = 2;
    config.validate().unwrap();
    config
}

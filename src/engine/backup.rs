// Backup orchestration - state machine, per-table freeze/upload loop
// and the part-upload observer

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant, SystemTime};

use crossbeam::channel::{unbounded, Receiver, Sender};
use tracing::{debug, info, warn};

use crate::control::{DatabaseInfo, DiskType, FrozenPart, TableInfo};
use crate::dedup::{self, DedupInfo};
use crate::error::{BackupError, Result};
use crate::metadata::{BackupMetadata, BackupState, PartMetadata, TableMetadata};

use super::{BackupEngine, ENGINE_VERSION};

/// What a backup covers besides table data.
#[derive(Debug, Clone, Copy)]
pub struct BackupSources {
    pub data: bool,
    pub access: bool,
    pub udf: bool,
}

impl BackupSources {
    pub fn for_backup(schema_only: bool, backup_access_control: bool) -> Self {
        Self {
            data: !schema_only,
            access: backup_access_control,
            udf: true,
        }
    }

    pub fn schema_only(&self) -> bool {
        !self.data
    }
}

#[derive(Debug, Clone, Default)]
pub struct BackupOptions {
    pub name: String,
    /// Databases to back up; None means all except the exclude list.
    pub databases: Option<Vec<String>>,
    /// Tables to back up, as `db.table`. Mutually exclusive with
    /// `databases`.
    pub tables: Vec<String>,
    /// Ignore the min-interval check.
    pub force: bool,
    pub labels: HashMap<String, String>,
}

/// Collects completed part uploads from pipeline jobs and re-uploads
/// backup metadata with the configured interval so partial progress is
/// observable.
struct UploadObserver {
    tx: Sender<PartMetadata>,
    rx: Receiver<PartMetadata>,
    uploaded: Vec<PartMetadata>,
    interval: Duration,
    last_upload: Instant,
}

impl UploadObserver {
    fn new(interval: Duration) -> Self {
        let (tx, rx) = unbounded();
        Self {
            tx,
            rx,
            uploaded: Vec::new(),
            interval,
            last_upload: Instant::now(),
        }
    }

    fn sender(&self) -> Sender<PartMetadata> {
        self.tx.clone()
    }

    /// Merge completed parts into the metadata document, persisting it
    /// when the update interval has elapsed.
    fn drain(&mut self, engine: &BackupEngine, meta: &mut BackupMetadata) -> Result<()> {
        let mut merged = false;
        while let Ok(part) = self.rx.try_recv() {
            meta.add_part(part.clone());
            self.uploaded.push(part);
            merged = true;
        }

        if merged && self.last_upload.elapsed() >= self.interval {
            engine.layout.upload_backup_metadata(meta)?;
            self.last_upload = Instant::now();
        }
        Ok(())
    }
}

impl BackupEngine {
    /// Perform a backup. Returns the backup name and an optional
    /// message when the backup was skipped.
    pub fn backup(
        &self,
        sources: BackupSources,
        options: BackupOptions,
    ) -> Result<(String, Option<String>)> {
        assert!(
            options.databases.is_none() || options.tables.is_empty(),
            "databases and tables filters are mutually exclusive"
        );

        let mut labels = self.config.backup.labels.clone();
        labels.extend(options.labels.clone());

        let mut db_tables: HashMap<String, Vec<String>> = HashMap::new();
        for table in &options.tables {
            let (db_name, table_name) = table.split_once('.').ok_or_else(|| {
                BackupError::Configuration(format!("Invalid table reference: {}", table))
            })?;
            db_tables
                .entry(db_name.to_string())
                .or_default()
                .push(table_name.to_string());
        }

        let mut databases: Vec<DatabaseInfo> = match &options.databases {
            Some(names) => {
                let all = self.control.databases(&[])?;
                let mut selected = Vec::new();
                for name in names {
                    let db = all.iter().find(|db| &db.name == name).ok_or_else(|| {
                        BackupError::DatabaseControl(format!("No such database: {}", name))
                    })?;
                    selected.push(db.clone());
                }
                selected
            }
            None if !db_tables.is_empty() => {
                let all = self.control.databases(&[])?;
                all.into_iter()
                    .filter(|db| db_tables.contains_key(&db.name))
                    .collect()
            }
            None => self.control.databases(&self.config.backup.exclude_dbs)?,
        };
        // Deterministic order by schema-file modification time.
        databases.sort_by_key(|db| {
            (
                db.metadata_path
                    .as_ref()
                    .and_then(|p| crate::util::file_mtime(std::path::Path::new(p))),
                db.name.clone(),
            )
        });

        let prior_backups = self.layout.get_backups()?;
        if let Some((name, msg)) = self.check_min_interval(&prior_backups, options.force) {
            info!("{}", msg);
            return Ok((name, Some(msg)));
        }

        let mut meta = BackupMetadata::new(
            &options.name,
            &self.layout.backup_path(&options.name),
            ENGINE_VERSION,
            &self.control.version()?,
            &self.config.backup.time_format,
            &self.hostname,
            labels,
            sources.schema_only(),
        );
        self.layout.upload_backup_metadata(&meta)?;

        debug!(
            backup = %meta.name,
            databases = %databases.iter().map(|d| d.name.as_str()).collect::<Vec<_>>().join(", "),
            "Starting backup"
        );

        let result = self.acquire_locks("backup").and_then(|_guard| {
            self.do_backup(&mut meta, sources, &databases, &db_tables, &prior_backups)
        });

        match result {
            Ok(()) => {
                meta.set_state(BackupState::Created);
            }
            Err(ref e) => {
                warn!(error = %e, "Backup failed");
                meta.set_state(BackupState::Failed);
            }
        }
        meta.update_end_time();
        self.layout.upload_backup_metadata(&meta)?;

        if !self.config.backup.keep_frozen_data_on_failure || result.is_ok() {
            if let Err(e) = self.control.unfreeze_all(&meta.sanitized_name()) {
                warn!(error = %e, "Failed to release frozen data");
            }
        }

        result.map(|_| (meta.name.clone(), None))
    }

    fn check_min_interval(
        &self,
        prior_backups: &[BackupMetadata],
        force: bool,
    ) -> Option<(String, String)> {
        if force || self.config.backup.min_interval_secs == 0 {
            return None;
        }
        let last_created = prior_backups
            .iter()
            .find(|b| b.state() == BackupState::Created)?;
        let end_time = last_created.end_time?;

        let min_interval =
            chrono::Duration::seconds(self.config.backup.min_interval_secs as i64);
        if crate::util::now() - end_time < min_interval {
            return Some((
                last_created.name.clone(),
                "Backup is skipped per backup.min_interval config option.".to_string(),
            ));
        }
        None
    }

    fn do_backup(
        &self,
        meta: &mut BackupMetadata,
        sources: BackupSources,
        databases: &[DatabaseInfo],
        db_tables: &HashMap<String, Vec<String>>,
        prior_backups: &[BackupMetadata],
    ) -> Result<()> {
        if sources.access || self.config.backup.backup_access_control {
            self.backup_access_control(meta)?;
        }
        if sources.udf {
            self.backup_udfs(meta)?;
        }

        // Record databases and their create statements.
        for db in databases {
            self.check_cancelled()?;
            meta.add_database(db);
            if !db.has_embedded_metadata() && !db.is_external_db_engine() {
                let statement = self.control.get_database_schema(&db.name)?;
                self.layout
                    .upload_database_create(&meta.name, &db.name, statement)?;
            }
            self.layout.upload_backup_metadata(meta)?;
        }

        let mut dedup_info = dedup::collect_dedup_info(
            &self.layout,
            &self.config.backup,
            meta,
            databases,
            prior_backups,
        )?;

        let disks = self.control.disks()?;
        let object_storage_disks: HashSet<String> = disks
            .values()
            .filter(|d| d.disk_type == DiskType::ObjectStorage)
            .map(|d| d.name.clone())
            .collect();

        let empty = Vec::new();
        for db in databases {
            if db.is_external_db_engine() {
                continue;
            }
            self.check_cancelled()?;
            let tables_filter = db_tables.get(&db.name).unwrap_or(&empty);
            self.backup_database_tables(
                meta,
                sources,
                db,
                tables_filter,
                &mut dedup_info,
                &object_storage_disks,
            )?;
            self.layout.upload_backup_metadata(meta)?;
        }

        self.layout.wait(false)?;
        Ok(())
    }

    fn backup_access_control(&self, meta: &mut BackupMetadata) -> Result<()> {
        debug!("Backing up access control entities");
        let objects = self.control.access_control_objects()?;
        if objects.is_empty() {
            return Ok(());
        }
        meta.access_control = crate::metadata::AccessControlMetadata::from_objects(&objects);
        self.layout
            .upload_access_control(&meta.name, &self.config.database.access_control_path)
    }

    fn backup_udfs(&self, meta: &mut BackupMetadata) -> Result<()> {
        let definitions = self.control.udf_definitions()?;
        let mut names: Vec<&String> = definitions.keys().collect();
        names.sort();
        for name in names {
            debug!(udf = %name, "Backing up user defined function");
            meta.add_udf(name.clone());
            self.layout
                .upload_udf(&meta.name, name, definitions[name].clone())?;
        }
        Ok(())
    }

    fn backup_database_tables(
        &self,
        meta: &mut BackupMetadata,
        sources: BackupSources,
        db: &DatabaseInfo,
        tables_filter: &[String],
        dedup_info: &mut DedupInfo,
        object_storage_disks: &HashSet<String>,
    ) -> Result<()> {
        let tables = self.control.tables(&db.name, tables_filter)?;

        // Modification timestamps of table schema files, collected up
        // front for optimistic concurrency control: a table altered
        // between this snapshot and its freeze is skipped, not failed.
        let mut mtimes: HashMap<String, SystemTime> = HashMap::new();
        for table in &tables {
            match crate::util::file_mtime(&table.metadata_path) {
                Some(mtime) => {
                    mtimes.insert(table.name.clone(), mtime);
                }
                None => {
                    warn!(
                        db = %table.database,
                        table = %table.name,
                        "Cannot read schema file mtime, skipping table"
                    );
                }
            }
        }

        for table in &tables {
            if !mtimes.contains_key(&table.name) {
                continue;
            }
            self.check_cancelled()?;
            self.backup_table(
                meta,
                sources,
                table,
                mtimes[&table.name],
                dedup_info,
                object_storage_disks,
            )?;
        }
        Ok(())
    }

    fn backup_table(
        &self,
        meta: &mut BackupMetadata,
        sources: BackupSources,
        table: &TableInfo,
        recorded_mtime: SystemTime,
        dedup_info: &mut DedupInfo,
        object_storage_disks: &HashSet<String>,
    ) -> Result<()> {
        debug!(db = %table.database, table = %table.name, "Performing table backup");

        if table.create_statement.is_empty() {
            warn!(
                db = %table.database,
                table = %table.name,
                "Skipping table backup: schema is empty or absent"
            );
            return Ok(());
        }

        let backup_label = meta.sanitized_name();

        // Only merge-tree tables have parts to freeze.
        let frozen_parts = if sources.data && table.is_merge_tree() {
            match self.control.freeze_table(&backup_label, table) {
                Ok(parts) => parts,
                Err(e) => {
                    if self.control.table_exists(&table.database, &table.name)? {
                        return Err(e);
                    }
                    warn!(
                        db = %table.database,
                        table = %table.name,
                        "Table was removed by a user during backup"
                    );
                    return Ok(());
                }
            }
        } else {
            Vec::new()
        };

        // The schema changed while we were freezing; data and metadata
        // would be inconsistent.
        if crate::util::file_mtime(&table.metadata_path) != Some(recorded_mtime) {
            warn!(
                db = %table.database,
                table = %table.name,
                "Table schema was updated or removed during backup, skipping table"
            );
            if let Err(e) = self.control.unfreeze_all(&backup_label) {
                warn!(error = %e, "Failed to release frozen data of skipped table");
            }
            return Ok(());
        }

        meta.add_table(TableMetadata::new(
            &table.database,
            &table.name,
            &table.engine,
            table.uuid.clone(),
        ));
        self.layout.upload_table_create(
            &meta.name,
            &table.database,
            &table.name,
            table.create_statement.clone(),
        )?;

        if sources.data {
            self.backup_frozen_parts(meta, table, frozen_parts, dedup_info, object_storage_disks)?;
        }
        Ok(())
    }

    fn backup_frozen_parts(
        &self,
        meta: &mut BackupMetadata,
        table: &TableInfo,
        frozen_parts: Vec<FrozenPart>,
        dedup_info: &mut DedupInfo,
        object_storage_disks: &HashSet<String>,
    ) -> Result<()> {
        if !table.is_merge_tree() {
            debug!(
                db = %table.database,
                table = %table.name,
                "Skipping table data backup for non merge-tree table"
            );
            return Ok(());
        }

        let mut observer = UploadObserver::new(Duration::from_secs(
            self.config.backup.update_metadata_interval_secs,
        ));
        let table_dedup = dedup_info.table_dedup(&table.database, &table.name);

        for frozen in frozen_parts {
            self.check_cancelled()?;
            debug!(part = %frozen.name, "Working on frozen part");

            if object_storage_disks.contains(&frozen.disk_name) {
                meta.cloud_storage.add_disk(frozen.disk_name.clone());
            }

            if let Some(linked) = dedup::deduplicate_part(&self.layout, &frozen, table_dedup)? {
                self.control.remove_frozen_part(&frozen)?;
                meta.add_part(linked);
            } else {
                let sender = observer.sender();
                let part = PartMetadata::from_frozen_part(&frozen);
                self.layout.upload_data_part(
                    &meta.name,
                    &frozen,
                    Box::new(move |result| {
                        if result.is_ok() {
                            // Receiver outlives the upload jobs.
                            let _ = sender.send(part);
                        }
                    }),
                )?;
            }

            observer.drain(self, meta)?;
        }

        self.layout.wait(false)?;
        observer.drain(self, meta)?;

        if self.config.backup.validate_part_after_upload {
            self.validate_uploaded_parts(meta, &observer.uploaded)?;
        }

        self.control.unfreeze_all(&meta.sanitized_name())?;
        Ok(())
    }

    fn validate_uploaded_parts(
        &self,
        meta: &BackupMetadata,
        uploaded: &[PartMetadata],
    ) -> Result<()> {
        let mut invalid = Vec::new();
        for part in uploaded {
            if !self.layout.check_data_part(&meta.path, part)? {
                warn!(
                    db = %part.database,
                    table = %part.table,
                    part = %part.name,
                    "Uploaded part is broken"
                );
                invalid.push(part.name.clone());
            }
        }
        if !invalid.is_empty() {
            return Err(BackupError::Storage(format!(
                "Uploaded parts are broken: {}",
                invalid.join(", ")
            )));
        }
        Ok(())
    }
}

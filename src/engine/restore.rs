// Restore orchestration - schema restore in dependency order with a
// retry queue, then data restore through the durable restore context

use std::collections::{HashSet, VecDeque};

use tracing::{debug, info, warn};

use crate::control::{schema, DatabaseInfo, TableInfo};
use crate::error::{BackupError, Result};
use crate::metadata::{BackupMetadata, PartState, RestoreContext, TableMetadata};

use super::BackupEngine;

#[derive(Debug, Clone, Default)]
pub struct RestoreOptions {
    /// Databases to restore; None means every database in the backup.
    pub databases: Option<Vec<String>>,
    pub schema_only: bool,
    pub override_replica_name: Option<String>,
    pub force_non_replicated: bool,
    pub cloud_storage_source_bucket: Option<String>,
    pub cloud_storage_source_path: Option<String>,
    pub cloud_storage_source_endpoint: Option<String>,
    pub skip_cloud_storage: bool,
    /// Collect per-table failures instead of aborting on the first.
    pub keep_going: bool,
}

struct RestoreTable {
    database: String,
    name: String,
    engine: String,
    statement: String,
}

impl BackupEngine {
    pub fn restore(&self, backup_name: &str, options: RestoreOptions) -> Result<()> {
        let meta = self.get(backup_name)?;

        // External-disk payloads cannot be resolved without the source
        // bucket the original cluster wrote them to.
        if !options.schema_only
            && !options.skip_cloud_storage
            && (meta.cloud_storage.enabled() || meta.has_object_storage_data())
            && options.cloud_storage_source_bucket.is_none()
        {
            return Err(BackupError::Restore(
                "Cloud storage source bucket must be set to restore a backup with data on \
                 object-storage disks"
                    .to_string(),
            ));
        }

        let databases = match &options.databases {
            Some(requested) => {
                let known = meta.get_databases();
                let missing: Vec<&String> =
                    requested.iter().filter(|db| !known.contains(db)).collect();
                if !missing.is_empty() {
                    return Err(BackupError::Restore(format!(
                        "Required databases were not found in backup metadata: {}",
                        missing
                            .iter()
                            .map(|s| s.as_str())
                            .collect::<Vec<_>>()
                            .join(", ")
                    )));
                }
                requested.clone()
            }
            None => meta.get_databases(),
        };

        let _guard = self.acquire_locks("restore")?;

        info!(backup = %meta.name, "Restoring backup");
        self.restore_udfs(&meta)?;
        self.restore_databases(&meta, &databases)?;
        let failed_tables = self.restore_table_schemas(&meta, &databases, &options)?;

        if options.schema_only {
            debug!("Skipping table data restore for schema-only restore");
            return Ok(());
        }

        let mut context = RestoreContext::new(&self.config.backup.restore_context_path);
        self.restore_data(&meta, &databases, &options, &failed_tables, &mut context)?;

        if self.config.backup.restore_fail_on_attach_error && context.has_failed_parts() {
            return Err(BackupError::Restore(format!(
                "Some parts failed to attach: {}",
                context
                    .failed_parts()
                    .iter()
                    .map(|p| p.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            )));
        }
        Ok(())
    }

    /// Restore access control entities into the database's local
    /// access directory.
    pub fn restore_access_control(&self, backup_name: &str) -> Result<()> {
        let meta = self.get(backup_name)?;
        if meta.access_control.is_empty() {
            info!(backup = %meta.name, "Backup carries no access control entities");
            return Ok(());
        }
        let _guard = self.acquire_locks("restore-access-control")?;
        self.layout
            .download_access_control(&meta, &self.config.database.access_control_path)
    }

    fn restore_udfs(&self, meta: &BackupMetadata) -> Result<()> {
        for udf_name in &meta.user_defined_functions {
            debug!(udf = %udf_name, "Restoring user defined function");
            let statement = self.layout.get_udf_create(meta, udf_name)?;
            self.control.create_udf(&statement)?;
        }
        Ok(())
    }

    fn restore_databases(&self, meta: &BackupMetadata, databases: &[String]) -> Result<()> {
        for db_name in databases {
            let db = database_info(meta, db_name);
            if db.has_embedded_metadata() {
                continue;
            }
            debug!(db = %db_name, "Restoring database");
            let statement = self.layout.get_database_create(meta, db_name)?;
            self.control.create_database(&make_idempotent(&statement))?;
        }
        Ok(())
    }

    /// Restore table schemas in dependency order: plain merge-tree
    /// tables first, then other engines, then distributed tables, then
    /// views. Returns tables whose DDL could not be applied.
    fn restore_table_schemas(
        &self,
        meta: &BackupMetadata,
        databases: &[String],
        options: &RestoreOptions,
    ) -> Result<HashSet<(String, String)>> {
        let force_non_replicated =
            options.force_non_replicated || self.config.backup.force_non_replicated;
        let override_replica_name = options
            .override_replica_name
            .clone()
            .or_else(|| self.config.backup.override_replica_name.clone());

        let mut merge_tree = Vec::new();
        let mut distributed = Vec::new();
        let mut views = Vec::new();
        let mut other = Vec::new();

        for db_name in databases {
            let db = database_info(meta, db_name);
            if db.is_external_db_engine() {
                continue;
            }
            for table in meta.get_tables(db_name) {
                if self.control.table_exists(db_name, &table.name)? {
                    debug!(db = %db_name, table = %table.name, "Table already exists, skipping");
                    continue;
                }

                let statement = self.layout.get_table_create(meta, db_name, &table.name)?;
                let uuid = if db.is_atomic() { table.uuid.clone() } else { None };
                let (statement, engine) = schema::rewrite_table_schema(
                    &statement,
                    &table.engine,
                    force_non_replicated,
                    override_replica_name.as_deref(),
                    uuid.as_deref(),
                );

                let restore_table = RestoreTable {
                    database: db_name.clone(),
                    name: table.name.clone(),
                    engine,
                    statement,
                };
                if schema::is_distributed(&restore_table.engine) {
                    distributed.push(restore_table);
                } else if schema::is_view(&restore_table.engine) {
                    views.push(restore_table);
                } else if schema::is_merge_tree(&restore_table.engine) {
                    merge_tree.push(restore_table);
                } else {
                    other.push(restore_table);
                }
            }
        }

        let ordered: Vec<RestoreTable> = merge_tree
            .into_iter()
            .chain(other)
            .chain(distributed)
            .chain(views)
            .collect();
        self.restore_table_objects(ordered, options.keep_going)
    }

    fn restore_table_objects(
        &self,
        tables: Vec<RestoreTable>,
        keep_going: bool,
    ) -> Result<HashSet<(String, String)>> {
        info!("Restoring tables");
        let mut unprocessed: VecDeque<RestoreTable> = tables.into();
        let mut errors: Vec<(String, String, BackupError)> = Vec::new();

        while let Some(table) = unprocessed.pop_front() {
            match self.restore_table_object(&table) {
                Ok(()) => {
                    errors.clear();
                }
                Err(e) => {
                    debug!(
                        db = %table.database,
                        table = %table.name,
                        error = %e,
                        "Failed to restore table, will retry after restoring other tables"
                    );
                    errors.push((table.database.clone(), table.name.clone(), e));
                    unprocessed.push_back(table);
                    if errors.len() > unprocessed.len() {
                        break;
                    }
                }
            }
        }

        if errors.is_empty() {
            return Ok(HashSet::new());
        }

        let failed: HashSet<(String, String)> = errors
            .iter()
            .map(|(db, table, _)| (db.clone(), table.clone()))
            .collect();
        warn!(
            tables = %failed
                .iter()
                .map(|(db, t)| format!("{}.{}", db, t))
                .collect::<Vec<_>>()
                .join(", "),
            "Failed to restore tables"
        );

        if keep_going {
            return Ok(failed);
        }
        let mut names: Vec<String> = failed.iter().map(|(db, t)| format!("`{}`.`{}`", db, t)).collect();
        names.sort();
        Err(BackupError::Restore(format!(
            "Failed to restore tables: {}",
            names.join(", ")
        )))
    }

    fn restore_table_object(&self, table: &RestoreTable) -> Result<()> {
        // Adopting the existing object id is preferred; fall back to a
        // plain create when the database rejects the attach.
        let attach_statement = schema::to_attach_query(&table.statement);
        let attach_result = self.control.create_table(&attach_statement).and_then(|_| {
            if schema::is_replicated(&table.engine) && !schema::is_materialized_view(&table.engine)
            {
                let info = self.table_info(&table.database, &table.name)?;
                self.control.restore_replica(&info)?;
            }
            Ok(())
        });

        if let Err(attach_error) = attach_result {
            warn!(
                db = %table.database,
                table = %table.name,
                error = %attach_error,
                "Failed to restore table by ATTACH, falling back to CREATE"
            );
            if let Err(create_error) = self.control.create_table(&table.statement) {
                debug!(
                    db = %table.database,
                    table = %table.name,
                    error = %create_error,
                    "Both table restore methods failed, removing the table"
                );
                self.control
                    .drop_table_if_exists(&table.database, &table.name)?;
                return Err(create_error);
            }
        }
        Ok(())
    }

    fn table_info(&self, db_name: &str, table_name: &str) -> Result<TableInfo> {
        self.control
            .tables(db_name, &[table_name.to_string()])?
            .into_iter()
            .next()
            .ok_or_else(|| {
                BackupError::DatabaseControl(format!(
                    "Table not found: {}.{}",
                    db_name, table_name
                ))
            })
    }

    fn restore_data(
        &self,
        meta: &BackupMetadata,
        databases: &[String],
        options: &RestoreOptions,
        failed_tables: &HashSet<(String, String)>,
        context: &mut RestoreContext,
    ) -> Result<()> {
        info!("Restoring tables data");
        for db_name in databases {
            let db = database_info(meta, db_name);
            if db.is_external_db_engine() {
                continue;
            }
            for table_meta in meta.get_tables(db_name) {
                if !schema::is_merge_tree(&table_meta.engine) {
                    continue;
                }
                if failed_tables.contains(&(db_name.clone(), table_meta.name.clone())) {
                    warn!(
                        db = %db_name,
                        table = %table_meta.name,
                        "Skipping data restore of a table whose schema was not restored"
                    );
                    continue;
                }
                self.check_cancelled()?;

                let result = self.restore_table_data(meta, &table_meta, options, context);
                context.dump_state()?;
                if let Err(e) = result {
                    if options.keep_going {
                        warn!(
                            db = %db_name,
                            table = %table_meta.name,
                            error = %e,
                            "Table data restore failed, continuing"
                        );
                        continue;
                    }
                    return Err(e);
                }
            }
        }
        info!("Restoring tables data completed");
        Ok(())
    }

    fn restore_table_data(
        &self,
        meta: &BackupMetadata,
        table_meta: &TableMetadata,
        options: &RestoreOptions,
        context: &mut RestoreContext,
    ) -> Result<()> {
        debug!(db = %table_meta.database, table = %table_meta.name, "Running table data restore");
        let table = self.table_info(&table_meta.database, &table_meta.name)?;
        context.add_table(&table_meta.database, &table_meta.name);

        let mut attach_parts = Vec::new();
        for part in table_meta.get_parts() {
            if context.part_restored(&part) {
                debug!(part = %part.name, "Part already restored, skipping");
                continue;
            }
            if context.part_downloaded(&part) {
                debug!(part = %part.name, "Part already downloaded, only attaching");
                attach_parts.push(part);
                continue;
            }
            if options.skip_cloud_storage && meta.cloud_storage.has_disk(&part.disk_name) {
                debug!(
                    part = %part.name,
                    disk = %part.disk_name,
                    "Skipping part on object-storage disk"
                );
                continue;
            }

            let detached_path =
                self.control
                    .get_detached_part_path(&table, &part.disk_name, &part.name)?;
            match self.layout.download_data_part(meta, &part, &detached_path) {
                Ok(()) => attach_parts.push(part),
                Err(e) => {
                    if options.keep_going {
                        warn!(part = %part.name, error = %e, "Part restore failed, continuing");
                        continue;
                    }
                    return Err(e);
                }
            }
        }

        self.layout.wait(options.keep_going)?;
        for part in &attach_parts {
            context.add_part(part, PartState::Downloaded);
        }

        self.control.chown_detached_parts(&table)?;
        for part in attach_parts {
            debug!(
                db = %table_meta.database,
                table = %table_meta.name,
                part = %part.name,
                "Attaching part"
            );
            match self.control.attach_part(&table, &part.name) {
                Ok(()) => context.add_part(&part, PartState::Restored),
                Err(e) => {
                    warn!(part = %part.name, error = %e, "Attaching part failed");
                    context.add_failed_part(&part, &e);
                    context.add_part(&part, PartState::Invalid);
                }
            }
        }
        Ok(())
    }
}

fn database_info(meta: &BackupMetadata, db_name: &str) -> DatabaseInfo {
    let raw = meta.get_database(db_name);
    DatabaseInfo {
        name: db_name.to_string(),
        engine: raw.and_then(|db| db.engine.clone()),
        metadata_path: raw.and_then(|db| db.metadata_path.clone()),
    }
}

/// Make a CREATE DATABASE statement safe to re-apply.
fn make_idempotent(statement: &str) -> String {
    if statement.contains("IF NOT EXISTS") {
        return statement.to_string();
    }
    statement.replacen("CREATE DATABASE", "CREATE DATABASE IF NOT EXISTS", 1)
}

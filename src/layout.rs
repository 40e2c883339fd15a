// Backup data layout - mapping from logical identifiers to remote
// object keys, and the IO entry points built on the pipeline executor

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::Config;
use crate::encryption::get_encryption;
use crate::error::{BackupError, Result};
use crate::metadata::{BackupMetadata, PartMetadata, BACKUP_META_FNAME};
use crate::pipeline::executor::PipelineExecutor;
use crate::pipeline::pipelines::{self, TransferConfig};
use crate::storage::StorageEngine;
use crate::util::{calc_aligned_files_size, calc_encrypted_size, calc_tarball_size, escape, join_key};

pub struct BackupLayout {
    engine: Arc<StorageEngine>,
    executor: Arc<PipelineExecutor>,
    transfer: TransferConfig,
    path_root: String,
    encryption_chunk_size: u64,
    encryption_metadata_size: u64,
    compress: bool,
}

impl BackupLayout {
    pub fn new(
        config: &Config,
        engine: Arc<StorageEngine>,
        executor: Arc<PipelineExecutor>,
    ) -> Result<Self> {
        let transfer = TransferConfig::from_config(config);
        let encryption_metadata_size = get_encryption(&config.encryption)?.metadata_size();
        Ok(Self {
            engine,
            executor,
            compress: pipelines::compression_enabled(&transfer),
            encryption_chunk_size: config.encryption.chunk_size,
            encryption_metadata_size,
            transfer,
            path_root: config.backup.path_root.trim_matches('/').to_string(),
        })
    }

    pub fn engine(&self) -> Arc<StorageEngine> {
        Arc::clone(&self.engine)
    }

    // Key mapping

    pub fn backup_path(&self, backup_name: &str) -> String {
        join_key(&self.path_root, backup_name)
    }

    fn backup_metadata_path(&self, backup_name: &str) -> String {
        join_key(&self.backup_path(backup_name), BACKUP_META_FNAME)
    }

    fn db_metadata_path(backup_path: &str, db_name: &str) -> String {
        join_key(backup_path, &format!("metadata/{}.sql", escape(db_name)))
    }

    fn table_metadata_path(backup_path: &str, db_name: &str, table_name: &str) -> String {
        join_key(
            backup_path,
            &format!("metadata/{}/{}.sql", escape(db_name), escape(table_name)),
        )
    }

    pub fn part_prefix(backup_path: &str, part: &PartMetadata) -> String {
        join_key(
            backup_path,
            &format!(
                "data/{}/{}/{}",
                escape(&part.database),
                escape(&part.table),
                part.name
            ),
        )
    }

    /// Key of the single tar object of a tarball part.
    pub fn part_tarball_path(backup_path: &str, part: &PartMetadata) -> String {
        format!("{}.tar", Self::part_prefix(backup_path, part))
    }

    fn udf_path(backup_path: &str, udf_name: &str) -> String {
        join_key(backup_path, &format!("udf/{}.sql", escape(udf_name)))
    }

    fn access_control_path(backup_path: &str) -> String {
        join_key(backup_path, "access_control/access_control.tar")
    }

    /// Predicted remote object size of a tarball part after encryption.
    pub fn target_part_size(&self, part: &PartMetadata) -> u64 {
        let tar_size = calc_tarball_size(&part.files, aligned_size(part.size));
        calc_encrypted_size(
            tar_size,
            self.encryption_chunk_size,
            self.encryption_metadata_size,
        )
    }

    // Backup metadata

    pub fn upload_backup_metadata(&self, backup: &BackupMetadata) -> Result<()> {
        let remote_path = self.backup_metadata_path(&backup.name);
        debug!(remote_path, "Uploading backup metadata");
        self.engine
            .put(&remote_path, backup.dump_json(false).as_bytes())
            .map_err(|e| BackupError::Storage(format!("Failed to upload backup metadata: {}", e)))
    }

    pub fn get_backup_metadata(&self, backup_name: &str) -> Result<Option<BackupMetadata>> {
        let remote_path = self.backup_metadata_path(backup_name);
        if !self.engine.exists(&remote_path)? {
            return Ok(None);
        }
        let data = self.engine.get(&remote_path)?;
        let text = String::from_utf8(data)
            .map_err(|_| BackupError::Metadata("Backup metadata is not UTF-8".to_string()))?;
        BackupMetadata::load_json(&text).map(Some)
    }

    pub fn get_backup_names(&self) -> Result<Vec<String>> {
        self.engine.list(&self.path_root, false, false)
    }

    /// All backups sorted newest-first. Backups with unreadable
    /// metadata are logged and skipped.
    pub fn get_backups(&self) -> Result<Vec<BackupMetadata>> {
        let mut backups = Vec::new();
        for name in self.get_backup_names()? {
            match self.get_backup_metadata(&name) {
                Ok(Some(backup)) => backups.push(backup),
                Ok(None) => warn!(backup = %name, "Backup without metadata"),
                Err(e) => warn!(backup = %name, error = %e, "Skipping unreadable backup metadata"),
            }
        }
        backups.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        Ok(backups)
    }

    /// Re-read a backup's metadata from storage.
    pub fn reload_backup(&self, backup: &BackupMetadata) -> Result<BackupMetadata> {
        self.get_backup_metadata(&backup.name)?
            .ok_or_else(|| BackupError::BackupNotFound(backup.name.clone()))
    }

    // Schema objects

    pub fn upload_database_create(
        &self,
        backup_name: &str,
        db_name: &str,
        statement: String,
    ) -> Result<()> {
        let remote_path = Self::db_metadata_path(&self.backup_path(backup_name), db_name);
        debug!(db_name, remote_path, "Uploading database create statement");
        self.submit_upload_data(statement.into_bytes(), remote_path)
    }

    pub fn upload_table_create(
        &self,
        backup_name: &str,
        db_name: &str,
        table_name: &str,
        statement: String,
    ) -> Result<()> {
        let remote_path =
            Self::table_metadata_path(&self.backup_path(backup_name), db_name, table_name);
        debug!(db_name, table_name, remote_path, "Uploading table create statement");
        self.submit_upload_data(statement.into_bytes(), remote_path)
    }

    pub fn get_database_create(&self, backup: &BackupMetadata, db_name: &str) -> Result<String> {
        let remote_path = Self::db_metadata_path(&backup.path, db_name);
        self.download_text(remote_path)
    }

    pub fn get_table_create(
        &self,
        backup: &BackupMetadata,
        db_name: &str,
        table_name: &str,
    ) -> Result<String> {
        let remote_path = Self::table_metadata_path(&backup.path, db_name, table_name);
        self.download_text(remote_path)
    }

    // User-defined functions

    pub fn upload_udf(&self, backup_name: &str, udf_name: &str, statement: String) -> Result<()> {
        let remote_path = Self::udf_path(&self.backup_path(backup_name), udf_name);
        self.submit_upload_data(statement.into_bytes(), remote_path)
    }

    pub fn get_udf_create(&self, backup: &BackupMetadata, udf_name: &str) -> Result<String> {
        self.download_text(Self::udf_path(&backup.path, udf_name))
    }

    // Access control

    pub fn upload_access_control(&self, backup_name: &str, local_dir: &Path) -> Result<()> {
        let remote_path = Self::access_control_path(&self.backup_path(backup_name));
        let engine = Arc::clone(&self.engine);
        let transfer = self.transfer.clone();
        let cancel = self.executor.cancel_flag();
        let dir = local_dir.to_path_buf();
        let compress = self.compress;
        let source_size = dir_size_estimate(&dir)?;

        self.executor.submit(
            format!("upload_access_control({})", remote_path),
            Box::new(move || {
                pipelines::upload_files_tarball_scan(
                    engine,
                    transfer,
                    cancel,
                    dir,
                    Vec::new(),
                    remote_path,
                    source_size,
                    true,
                    compress,
                )
            }),
            None,
        )
    }

    pub fn download_access_control(
        &self,
        backup: &BackupMetadata,
        target_dir: &Path,
    ) -> Result<()> {
        let remote_path = Self::access_control_path(&backup.path);
        pipelines::download_files(
            Arc::clone(&self.engine),
            self.transfer.clone(),
            self.executor.cancel_flag(),
            remote_path,
            target_dir.to_path_buf(),
            true,
            self.compress,
        )
    }

    // Data parts

    /// Upload a frozen part as a single tar object. The produced
    /// PartMetadata is delivered through `on_uploaded` when the
    /// background job completes successfully.
    pub fn upload_data_part(
        &self,
        backup_name: &str,
        frozen: &crate::control::FrozenPart,
        on_uploaded: Box<dyn FnOnce(&Result<()>) + Send>,
    ) -> Result<()> {
        let part = PartMetadata::from_frozen_part(frozen);
        let remote_path = Self::part_tarball_path(&self.backup_path(backup_name), &part);
        debug!(
            part = %frozen.name,
            db = %frozen.database,
            table = %frozen.table,
            remote_path,
            "Uploading data part"
        );

        let files: Vec<PathBuf> = frozen.files.iter().map(PathBuf::from).collect();
        let aligned = calc_aligned_files_size(
            &frozen.files.iter().map(|f| frozen.path.join(f)).collect::<Vec<_>>(),
            crate::util::TAR_BLOCK_SIZE,
        )?;
        let source_size = calc_encrypted_size(
            calc_tarball_size(&frozen.files, aligned),
            self.encryption_chunk_size,
            self.encryption_metadata_size,
        );

        let engine = Arc::clone(&self.engine);
        let transfer = self.transfer.clone();
        let cancel = self.executor.cancel_flag();
        let base_path = frozen.path.clone();
        let compress = self.compress;

        self.executor.submit(
            format!(
                "upload_data_part({}.{} {})",
                frozen.database, frozen.table, frozen.name
            ),
            Box::new(move || {
                pipelines::upload_files_tarball(
                    engine,
                    transfer,
                    cancel,
                    base_path,
                    files,
                    remote_path,
                    source_size,
                    true,
                    compress,
                    false,
                )
            }),
            Some(on_uploaded),
        )
    }

    /// Download a part into the given directory, untarring when the
    /// part is stored as a tarball.
    pub fn download_data_part(
        &self,
        backup: &BackupMetadata,
        part: &PartMetadata,
        target_dir: &Path,
    ) -> Result<()> {
        self.download_data_part_from(&self.engine, backup, part, target_dir)
    }

    /// Same as `download_data_part` but reading through an explicit
    /// engine (used for external-disk restores from a source bucket).
    pub fn download_data_part_from(
        &self,
        engine: &Arc<StorageEngine>,
        backup: &BackupMetadata,
        part: &PartMetadata,
        target_dir: &Path,
    ) -> Result<()> {
        let backup_path = part.link().unwrap_or(&backup.path).to_string();
        std::fs::create_dir_all(target_dir)?;
        debug!(part = %part.name, target = %target_dir.display(), "Downloading data part");

        if part.tarball {
            let remote_path = Self::part_tarball_path(&backup_path, part);
            let engine = Arc::clone(engine);
            let transfer = self.transfer.clone();
            let cancel = self.executor.cancel_flag();
            let target = target_dir.to_path_buf();
            let compress = self.compress;
            return self.executor.submit(
                format!("download_data_part({})", remote_path),
                Box::new(move || {
                    pipelines::download_files(
                        engine, transfer, cancel, remote_path, target, true, compress,
                    )
                }),
                None,
            );
        }

        let prefix = Self::part_prefix(&backup_path, part);
        for file in &part.files {
            let remote_path = join_key(&prefix, file);
            let engine = Arc::clone(engine);
            let transfer = self.transfer.clone();
            let cancel = self.executor.cancel_flag();
            let local_path = target_dir.join(file);
            self.executor.submit(
                format!("download_part_file({})", remote_path),
                Box::new(move || {
                    pipelines::download_file(engine, transfer, cancel, remote_path, local_path, true)
                }),
                None,
            )?;
        }
        Ok(())
    }

    /// Verify that the part's payload is present under `backup_path`.
    pub fn check_data_part(&self, backup_path: &str, part: &PartMetadata) -> Result<bool> {
        if part.tarball {
            let remote_path = Self::part_tarball_path(backup_path, part);
            return self.engine.exists(&remote_path);
        }

        let prefix = Self::part_prefix(backup_path, part);
        let remote_files = self.engine.list(&prefix, true, false)?;
        let missing: Vec<&String> = part
            .files
            .iter()
            .filter(|f| !remote_files.contains(f))
            .collect();
        if !missing.is_empty() {
            warn!(
                prefix,
                missing = %missing.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", "),
                "Some part files were not found"
            );
            return Ok(false);
        }
        Ok(true)
    }

    // Deletion

    /// Delete all objects of a backup.
    pub fn delete_backup(&self, backup_name: &str) -> Result<()> {
        let backup_path = self.backup_path(backup_name);
        debug!(backup_path, "Deleting backup data");
        let keys = self.engine.list(&backup_path, true, true)?;
        self.submit_delete(keys)
    }

    /// Delete the payload objects of the given parts.
    pub fn delete_data_parts(
        &self,
        backup: &BackupMetadata,
        parts: &[PartMetadata],
    ) -> Result<()> {
        let mut keys = Vec::new();
        for part in parts {
            let backup_path = part.link().unwrap_or(&backup.path).to_string();
            if part.tarball {
                keys.push(Self::part_tarball_path(&backup_path, part));
            } else {
                let prefix = Self::part_prefix(&backup_path, part);
                keys.extend(part.files.iter().map(|f| join_key(&prefix, f)));
            }
        }
        self.submit_delete(keys)
    }

    /// Wait for completion of outstanding upload/download jobs.
    pub fn wait(&self, keep_going: bool) -> Result<()> {
        debug!("Waiting for completion of async operations");
        self.executor.wait(keep_going)
    }

    // Helpers

    fn submit_upload_data(&self, data: Vec<u8>, remote_path: String) -> Result<()> {
        let engine = Arc::clone(&self.engine);
        let transfer = self.transfer.clone();
        let cancel = self.executor.cancel_flag();
        let job_id = format!("upload_data({})", remote_path);
        self.executor.submit(
            job_id,
            Box::new(move || pipelines::upload_data(engine, transfer, cancel, data, remote_path, true)),
            None,
        )
    }

    fn submit_delete(&self, keys: Vec<String>) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let engine = Arc::clone(&self.engine);
        self.executor.submit(
            format!("delete_files({} keys)", keys.len()),
            Box::new(move || engine.delete_many(&keys)),
            None,
        )
    }

    fn download_text(&self, remote_path: String) -> Result<String> {
        let data = pipelines::download_data(
            Arc::clone(&self.engine),
            self.transfer.clone(),
            self.executor.cancel_flag(),
            remote_path,
            true,
        )?;
        String::from_utf8(data)
            .map_err(|_| BackupError::Metadata("Stored object is not UTF-8".to_string()))
    }
}

fn aligned_size(size: u64) -> u64 {
    (size + crate::util::TAR_BLOCK_SIZE - 1) & !(crate::util::TAR_BLOCK_SIZE - 1)
}

fn dir_size_estimate(dir: &Path) -> Result<u64> {
    let mut total = 0u64;
    if dir.is_dir() {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                total += dir_size_estimate(&entry.path())?;
            } else {
                total += entry.metadata()?.len() + 2 * crate::util::TAR_BLOCK_SIZE;
            }
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::PartLocation;

    fn sample_part() -> PartMetadata {
        PartMetadata {
            database: "my-db".to_string(),
            table: "events.daily".to_string(),
            name: "all_1_1_0".to_string(),
            checksum: "abc".to_string(),
            size: 100,
            files: vec!["data.bin".to_string()],
            tarball: true,
            disk_name: "default".to_string(),
            location: PartLocation::Owned,
        }
    }

    #[test]
    fn test_part_paths_escape_identifiers() {
        let part = sample_part();
        assert_eq!(
            BackupLayout::part_prefix("backups/b1", &part),
            "backups/b1/data/my%2Ddb/events%2Edaily/all_1_1_0"
        );
        assert_eq!(
            BackupLayout::part_tarball_path("backups/b1", &part),
            "backups/b1/data/my%2Ddb/events%2Edaily/all_1_1_0.tar"
        );
    }

    #[test]
    fn test_metadata_paths() {
        assert_eq!(
            BackupLayout::db_metadata_path("backups/b1", "my-db"),
            "backups/b1/metadata/my%2Ddb.sql"
        );
        assert_eq!(
            BackupLayout::table_metadata_path("backups/b1", "my-db", "t.v1"),
            "backups/b1/metadata/my%2Ddb/t%2Ev1.sql"
        );
        assert_eq!(
            BackupLayout::udf_path("backups/b1", "my_fn"),
            "backups/b1/udf/my_fn.sql"
        );
    }

    #[test]
    fn test_aligned_size() {
        assert_eq!(aligned_size(0), 0);
        assert_eq!(aligned_size(1), 512);
        assert_eq!(aligned_size(512), 512);
        assert_eq!(aligned_size(513), 1024);
    }
}

// Backup deletion and retention - delete obsolete backups while
// preserving parts still referenced through deduplication links

use tracing::{info, warn};

use crate::dedup::{
    collect_dedup_references_for_batch_backup_deletion, references_contain, DedupReferences,
};
use crate::error::{BackupError, Result};
use crate::metadata::{BackupMetadata, BackupState};

use super::BackupEngine;

impl BackupEngine {
    /// Delete the named backup. With `purge_partial`, every
    /// non-CREATED backup is deleted in the same batch.
    pub fn delete(
        &self,
        backup_name: &str,
        purge_partial: bool,
    ) -> Result<(Option<String>, Option<String>)> {
        let _guard = self.acquire_locks("delete")?;

        let mut found = false;
        let mut deleting = Vec::new();
        let mut retained = Vec::new();
        for backup in self.layout.get_backups()? {
            if backup.name == backup_name {
                deleting.push(backup);
                found = true;
                continue;
            }
            if purge_partial && backup.state() != BackupState::Created {
                deleting.push(backup);
            } else {
                retained.push(backup);
            }
        }
        if !found {
            return Err(BackupError::BackupNotFound(backup_name.to_string()));
        }

        let deleting_refs: Vec<&BackupMetadata> = deleting.iter().collect();
        let mut references =
            collect_dedup_references_for_batch_backup_deletion(&retained, &deleting_refs);

        let mut result = (None, None);
        for backup in &deleting {
            let backup_references = references.remove(&backup.name).unwrap_or_default();
            let outcome = self.delete_one(backup, &backup_references)?;
            if backup.name == backup_name {
                result = outcome;
            }
        }
        Ok(result)
    }

    /// Apply the retention policies and delete everything they do not
    /// keep. A backup survives if either policy keeps it.
    pub fn purge(&self) -> Result<(Vec<String>, Option<String>)> {
        let retain_time = self.config.backup.retain_time_secs;
        let mut retain_count = self.config.backup.retain_count;

        if retain_time == 0 && retain_count.is_none() {
            info!("Retain policies are not specified");
            return Ok((Vec::new(), Some("Retain policies are not specified.".to_string())));
        }

        let retain_time_limit = if retain_time > 0 {
            Some(crate::util::now() - chrono::Duration::seconds(retain_time as i64))
        } else {
            None
        };

        let _guard = self.acquire_locks("purge")?;

        let mut retained = Vec::new();
        let mut deleting = Vec::new();
        for backup in self.layout.get_backups()? {
            if let Some(count) = retain_count {
                if count > 0 {
                    info!(
                        backup = %backup.name,
                        state = %backup.state(),
                        "Preserving backup per retain count policy"
                    );
                    if backup.state() == BackupState::Created {
                        retain_count = Some(count - 1);
                    }
                    retained.push(backup);
                    continue;
                }
            }

            if let Some(limit) = retain_time_limit {
                if backup.start_time >= limit {
                    info!(
                        backup = %backup.name,
                        state = %backup.state(),
                        "Preserving backup per retain time policy"
                    );
                    retained.push(backup);
                    continue;
                }
            }

            deleting.push(backup);
        }

        let deleting_refs: Vec<&BackupMetadata> = deleting.iter().collect();
        let mut references =
            collect_dedup_references_for_batch_backup_deletion(&retained, &deleting_refs);

        let mut deleted_names = Vec::new();
        for backup in &deleting {
            let backup_references = references.remove(&backup.name).unwrap_or_default();
            let (deleted, _) = self.delete_one(backup, &backup_references)?;
            if let Some(name) = deleted {
                deleted_names.push(name);
            }
        }
        Ok((deleted_names, None))
    }

    /// Delete one backup. Returns the deleted name, or a message when
    /// the backup was only partially deleted because subsequent
    /// backups link to its parts.
    fn delete_one(
        &self,
        backup_light: &BackupMetadata,
        references: &DedupReferences,
    ) -> Result<(Option<String>, Option<String>)> {
        info!(backup = %backup_light.name, state = %backup_light.state(), "Deleting backup");

        let mut backup = self.layout.reload_backup(backup_light)?;
        backup.set_state(BackupState::Deleting);
        if backup.end_time.is_none() {
            backup.update_end_time();
        }
        self.layout.upload_backup_metadata(&backup)?;

        let result = self.delete_backup_data(&mut backup, references);
        match result {
            Ok(outcome) => {
                self.layout.wait(false)?;
                if !references.is_empty() {
                    backup.set_state(BackupState::PartiallyDeleted);
                    self.layout.upload_backup_metadata(&backup)?;
                }
                Ok(outcome)
            }
            Err(e) => {
                warn!(backup = %backup.name, error = %e, "Delete failed");
                self.layout.wait(true)?;
                backup.set_state(BackupState::Failed);
                self.layout.upload_backup_metadata(&backup)?;
                Err(e)
            }
        }
    }

    fn delete_backup_data(
        &self,
        backup: &mut BackupMetadata,
        references: &DedupReferences,
    ) -> Result<(Option<String>, Option<String>)> {
        // No references: the whole prefix can go away.
        if references.is_empty() {
            info!(backup = %backup.name, "Removing backup data entirely");
            self.layout.delete_backup(&backup.name)?;
            if let Err(e) = self.control.unfreeze_all(&backup.sanitized_name()) {
                warn!(error = %e, "Failed to release frozen snapshot of deleted backup");
            }
            return Ok((Some(backup.name.clone()), None));
        }

        info!(backup = %backup.name, "Removing non-shared backup data parts");
        for db_name in backup.get_databases() {
            for table in backup.get_tables(&db_name) {
                let parts = table.get_parts();
                let removable: Vec<_> = parts
                    .into_iter()
                    .filter(|part| {
                        !references_contain(references, &db_name, &table.name, &part.name)
                    })
                    .collect();
                // Only owned payloads are deleted; linked bytes belong
                // to another backup.
                let owned: Vec<_> = removable
                    .iter()
                    .filter(|part| part.link().is_none())
                    .cloned()
                    .collect();
                self.layout.delete_data_parts(backup, &owned)?;
                backup.remove_parts(&db_name, &table.name, &removable);
            }
        }

        if let Err(e) = self.control.unfreeze_all(&backup.sanitized_name()) {
            warn!(error = %e, "Failed to release frozen snapshot of deleted backup");
        }
        Ok((
            None,
            Some(
                "Backup was partially deleted as its data is in use by subsequent backups per \
                 deduplication settings."
                    .to_string(),
            ),
        ))
    }
}

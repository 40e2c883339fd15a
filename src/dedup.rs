// Data part deduplication - reuse payloads uploaded by prior backups

use std::collections::{HashMap, HashSet};

use chrono::Duration;
use tracing::debug;

use crate::config::BackupConfig;
use crate::control::{schema, DatabaseInfo, FrozenPart};
use crate::error::Result;
use crate::layout::BackupLayout;
use crate::metadata::{BackupMetadata, BackupState, PartLocation, PartMetadata};

/// Information about one data part usable for deduplication.
#[derive(Debug, Clone, PartialEq)]
pub struct PartDedupInfo {
    /// Remote prefix of the backup that owns the bytes.
    pub backup_path: String,
    pub checksum: String,
    pub size: u64,
    pub files: Vec<String>,
    pub tarball: bool,
    pub disk_name: String,
    /// The payload has been confirmed to exist in storage during this
    /// session. Not persisted across process restarts.
    pub verified: bool,
}

pub type TableDedupInfo = HashMap<String, PartDedupInfo>;

#[derive(Debug, Default)]
pub struct DatabaseDedupInfo {
    tables: HashMap<String, TableDedupInfo>,
}

impl DatabaseDedupInfo {
    pub fn table_mut(&mut self, table_name: &str) -> &mut TableDedupInfo {
        self.tables.entry(table_name.to_string()).or_default()
    }

    pub fn table(&self, table_name: &str) -> Option<&TableDedupInfo> {
        self.tables.get(table_name)
    }
}

#[derive(Debug, Default)]
pub struct DedupInfo {
    databases: HashMap<String, DatabaseDedupInfo>,
}

impl DedupInfo {
    pub fn database_mut(&mut self, db_name: &str) -> &mut DatabaseDedupInfo {
        self.databases.entry(db_name.to_string()).or_default()
    }

    pub fn database(&self, db_name: &str) -> Option<&DatabaseDedupInfo> {
        self.databases.get(db_name)
    }

    pub fn table_dedup(&mut self, db_name: &str, table_name: &str) -> &mut TableDedupInfo {
        self.database_mut(db_name).table_mut(table_name)
    }
}

struct DatabaseToHandle {
    replicated_tables_handled: bool,
    nonreplicated_tables_handled: bool,
}

impl DatabaseToHandle {
    fn handled(&self) -> bool {
        self.replicated_tables_handled && self.nonreplicated_tables_handled
    }
}

/// Collect deduplication information from prior backups.
///
/// Candidates are traversed newest-first and cut off at the configured
/// age limit; schema-only backups are never dedup sources.
pub fn collect_dedup_info(
    layout: &BackupLayout,
    config: &BackupConfig,
    current: &BackupMetadata,
    databases: &[DatabaseInfo],
    backups_light: &[BackupMetadata],
) -> Result<DedupInfo> {
    let mut dedup_info = DedupInfo::default();

    // Schema-only backups carry no part bytes to deduplicate against.
    if current.schema_only || !config.deduplicate_parts {
        return Ok(dedup_info);
    }

    let age_limit =
        crate::util::now() - Duration::seconds(config.deduplication_age_limit_secs as i64);

    let mut candidates = Vec::new();
    for backup in backups_light {
        if backup.start_time < age_limit {
            break;
        }
        if backup.schema_only {
            continue;
        }
        candidates.push(backup);
    }

    populate_dedup_info(&mut dedup_info, layout, &current.hostname, &candidates, databases)?;
    Ok(dedup_info)
}

fn populate_dedup_info(
    dedup_info: &mut DedupInfo,
    layout: &BackupLayout,
    hostname: &str,
    candidates: &[&BackupMetadata],
    databases: &[DatabaseInfo],
) -> Result<()> {
    let mut databases_to_handle: HashMap<String, DatabaseToHandle> = databases
        .iter()
        .map(|db| {
            (
                db.name.clone(),
                DatabaseToHandle {
                    replicated_tables_handled: false,
                    nonreplicated_tables_handled: false,
                },
            )
        })
        .collect();
    let candidate_paths: HashSet<String> = candidates.iter().map(|b| b.path.clone()).collect();

    for candidate_light in candidates {
        let candidate = layout.reload_backup(candidate_light)?;

        // Backups produced on other hosts share only replicated data.
        let only_replicated = hostname != candidate.hostname;

        let mut databases_to_iterate = Vec::new();
        for db_name in candidate.get_databases() {
            let state = match databases_to_handle.get_mut(&db_name) {
                Some(state) => state,
                None => continue,
            };
            databases_to_iterate.push((
                db_name.clone(),
                state.replicated_tables_handled,
                state.nonreplicated_tables_handled,
            ));

            if candidate.state() == BackupState::Created {
                state.replicated_tables_handled = true;
                if !only_replicated {
                    state.nonreplicated_tables_handled = true;
                }
                if state.handled() {
                    databases_to_handle.remove(&db_name);
                }
            }
        }

        for (db_name, replicated_handled, nonreplicated_handled) in databases_to_iterate {
            for table in candidate.get_tables(&db_name) {
                let replicated = schema::is_replicated(&table.engine);
                if replicated && replicated_handled {
                    continue;
                }
                if !replicated && (nonreplicated_handled || only_replicated) {
                    continue;
                }

                let table_dedup = dedup_info.table_dedup(&db_name, &table.name);
                for part in table.get_parts() {
                    if table_dedup.contains_key(&part.name) {
                        continue;
                    }

                    let (backup_path, verified) = match part.link() {
                        Some(link) => {
                            // A candidate that itself links to an
                            // ancestor outside the candidate set would
                            // produce a dangling link.
                            if !candidate_paths.contains(link) {
                                continue;
                            }
                            (link.to_string(), true)
                        }
                        None => (candidate.path.clone(), false),
                    };

                    table_dedup.insert(
                        part.name.clone(),
                        PartDedupInfo {
                            backup_path,
                            checksum: part.checksum.clone(),
                            size: part.size,
                            files: part.files.clone(),
                            tarball: part.tarball,
                            disk_name: part.disk_name.clone(),
                            verified,
                        },
                    );
                }
            }
        }

        if databases_to_handle.is_empty() {
            break;
        }
    }
    Ok(())
}

/// Decide whether a frozen part can reuse an existing upload. Returns
/// the linked PartMetadata, or None when the part must be uploaded.
pub fn deduplicate_part(
    layout: &BackupLayout,
    frozen: &FrozenPart,
    table_dedup: &mut TableDedupInfo,
) -> Result<Option<PartMetadata>> {
    debug!(part = %frozen.name, "Looking for deduplication of part");

    let existing = match table_dedup.get_mut(&frozen.name) {
        Some(existing) => existing,
        None => return Ok(None),
    };

    if existing.checksum != frozen.checksum {
        return Ok(None);
    }

    let part = PartMetadata {
        database: frozen.database.clone(),
        table: frozen.table.clone(),
        name: frozen.name.clone(),
        checksum: existing.checksum.clone(),
        size: existing.size,
        files: existing.files.clone(),
        tarball: existing.tarball,
        disk_name: existing.disk_name.clone(),
        location: PartLocation::Linked(existing.backup_path.clone()),
    };

    if !existing.verified {
        if !layout.check_data_part(&existing.backup_path, &part)? {
            debug!(
                part = %frozen.name,
                backup_path = %existing.backup_path,
                "Part found but its data is invalid, skipping"
            );
            return Ok(None);
        }
        existing.verified = true;
    }

    debug!(part = %frozen.name, backup_path = %existing.backup_path, "Part found, reusing");
    Ok(Some(part))
}

pub type TableDedupReferences = HashSet<String>;

pub type DatabaseDedupReferences = HashMap<String, TableDedupReferences>;

/// Parts of one deleting backup that must be preserved, keyed by
/// database and table.
pub type DedupReferences = HashMap<String, DatabaseDedupReferences>;

/// For each deleting backup, collect the parts still referenced by
/// retained backups. A deleting backup with an empty reference set can
/// be removed entirely.
pub fn collect_dedup_references_for_batch_backup_deletion(
    retained: &[BackupMetadata],
    deleting: &[&BackupMetadata],
) -> HashMap<String, DedupReferences> {
    let mut references: HashMap<String, DedupReferences> = HashMap::new();

    let deleting_by_path: HashMap<&str, &str> = deleting
        .iter()
        .map(|b| (b.path.as_str(), b.name.as_str()))
        .collect();

    for backup in retained {
        for part in backup.get_parts() {
            let link = match part.link() {
                Some(link) => link,
                None => continue,
            };
            let deleting_name = match deleting_by_path.get(link) {
                Some(name) => *name,
                None => continue,
            };

            references
                .entry(deleting_name.to_string())
                .or_default()
                .entry(part.database.clone())
                .or_default()
                .entry(part.table.clone())
                .or_default()
                .insert(part.name.clone());
        }
    }

    references
}

/// True when the references contain the given part.
pub fn references_contain(
    references: &DedupReferences,
    database: &str,
    table: &str,
    part_name: &str,
) -> bool {
    references
        .get(database)
        .and_then(|db| db.get(table))
        .map(|parts| parts.contains(part_name))
        .unwrap_or(false)
}

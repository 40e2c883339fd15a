// HTTP adapter for the database control plane
// Talks to the database's HTTP SQL endpoint and to its local data
// directories (for frozen-part enumeration and detached-part fixups).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::DatabaseConfig;
use crate::error::{BackupError, Result};

use super::{
    describe_frozen_dir, AccessControlObject, DatabaseControl, DatabaseInfo, Disk, DiskType,
    FrozenPart, TableInfo,
};

const ZERO_UUID: &str = "00000000-0000-0000-0000-000000000000";

const ACCESS_CONTROL_TABLES: &[(&str, &str)] = &[
    ("system.users", "U"),
    ("system.roles", "R"),
    ("system.quotas", "Q"),
    ("system.row_policies", "P"),
    ("system.settings_profiles", "S"),
];

pub struct HttpDatabaseControl {
    client: reqwest::blocking::Client,
    long_client: reqwest::blocking::Client,
    base_url: String,
    user: Option<String>,
    password: Option<String>,
    owner: Option<(u32, u32)>,
}

#[derive(Deserialize)]
struct DatabaseRow {
    name: String,
    #[serde(default)]
    engine: Option<String>,
    #[serde(default)]
    metadata_path: Option<String>,
}

#[derive(Deserialize)]
struct TableRow {
    database: String,
    name: String,
    engine: String,
    #[serde(default)]
    uuid: Option<String>,
    #[serde(default)]
    create_table_query: String,
    #[serde(default)]
    metadata_path: String,
    #[serde(default)]
    data_paths: Vec<String>,
}

#[derive(Deserialize)]
struct DiskRow {
    name: String,
    path: String,
    #[serde(rename = "type")]
    disk_type: String,
    #[serde(default)]
    cache_path: Option<String>,
}

#[derive(Deserialize)]
struct AclRow {
    id: String,
    name: String,
}

#[derive(Deserialize)]
struct UdfRow {
    name: String,
    create_query: String,
}

#[derive(Deserialize)]
struct VersionRow {
    version: String,
}

impl HttpDatabaseControl {
    pub fn new(config: &DatabaseConfig) -> Result<Self> {
        let build = |timeout: u64| {
            reqwest::blocking::Client::builder()
                .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
                .timeout(Duration::from_secs(timeout))
                .build()
                .map_err(|e| {
                    BackupError::DatabaseControl(format!("Failed to build HTTP client: {}", e))
                })
        };

        let owner = match (&config.owner_user, &config.owner_group) {
            (Some(user), Some(group)) => Some((resolve_uid(user)?, resolve_gid(group)?)),
            _ => None,
        };

        Ok(Self {
            client: build(config.timeout_secs)?,
            long_client: build(config.freeze_timeout_secs.max(config.unfreeze_timeout_secs))?,
            base_url: format!("{}://{}:{}", config.protocol, config.host, config.port),
            user: config.user.clone(),
            password: config.password.clone(),
            owner,
        })
    }

    fn execute_on(&self, client: &reqwest::blocking::Client, query: &str) -> Result<String> {
        debug!(query, "Executing query");
        let mut request = client.post(&self.base_url).body(query.to_string());
        if let Some(user) = &self.user {
            request = request.basic_auth(user, self.password.as_deref());
        }
        let response = request
            .send()
            .map_err(|e| BackupError::DatabaseControl(format!("Query failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .map_err(|e| BackupError::DatabaseControl(format!("Query failed: {}", e)))?;
        if !status.is_success() {
            return Err(BackupError::DatabaseControl(format!(
                "Query failed with {}: {}",
                status,
                body.chars().take(300).collect::<String>()
            )));
        }
        Ok(body)
    }

    fn execute(&self, query: &str) -> Result<String> {
        self.execute_on(&self.client, query)
    }

    fn query_rows<T: for<'de> Deserialize<'de>>(&self, query: &str) -> Result<Vec<T>> {
        let body = self.execute(&format!("{} FORMAT JSONEachRow", query))?;
        body.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line).map_err(|e| {
                    BackupError::DatabaseControl(format!("Malformed query response: {}", e))
                })
            })
            .collect()
    }

    fn table_info(&self, row: TableRow, disks: &HashMap<String, Disk>) -> TableInfo {
        let uuid = row.uuid.filter(|u| u.as_str() != ZERO_UUID);
        let paths_with_disks = row
            .data_paths
            .iter()
            .filter_map(|data_path| {
                // Pick the disk with the longest matching root.
                disks
                    .values()
                    .filter(|disk| data_path.starts_with(&disk.path.to_string_lossy().to_string()))
                    .max_by_key(|disk| disk.path.as_os_str().len())
                    .map(|disk| (PathBuf::from(data_path), disk.name.clone()))
            })
            .collect();

        TableInfo {
            database: row.database,
            name: row.name,
            engine: row.engine,
            uuid,
            create_statement: row.create_table_query,
            metadata_path: PathBuf::from(row.metadata_path),
            paths_with_disks,
        }
    }
}

impl DatabaseControl for HttpDatabaseControl {
    fn version(&self) -> Result<String> {
        let rows: Vec<VersionRow> = self.query_rows("SELECT version() AS version")?;
        rows.into_iter()
            .next()
            .map(|r| r.version)
            .ok_or_else(|| BackupError::DatabaseControl("Empty version response".to_string()))
    }

    fn databases(&self, exclude: &[String]) -> Result<Vec<DatabaseInfo>> {
        let rows: Vec<DatabaseRow> =
            self.query_rows("SELECT name, engine, metadata_path FROM system.databases")?;
        Ok(rows
            .into_iter()
            .filter(|row| !exclude.iter().any(|e| *e == row.name))
            .map(|row| DatabaseInfo {
                name: row.name,
                engine: row.engine,
                metadata_path: row.metadata_path,
            })
            .collect())
    }

    fn tables(&self, db: &str, tables_filter: &[String]) -> Result<Vec<TableInfo>> {
        let disks = self.disks()?;
        let rows: Vec<TableRow> = self.query_rows(&format!(
            "SELECT database, name, engine, toString(uuid) AS uuid, create_table_query, \
             metadata_path, data_paths FROM system.tables WHERE database = '{}'",
            escape_sql(db)
        ))?;

        let mut tables: Vec<TableInfo> = rows
            .into_iter()
            .filter(|row| tables_filter.is_empty() || tables_filter.contains(&row.name))
            .map(|row| self.table_info(row, &disks))
            .collect();

        // Deterministic order for the backup loop: by schema-file
        // modification time, name as tiebreaker.
        tables.sort_by_key(|t| {
            (
                crate::util::file_mtime(&t.metadata_path),
                t.name.clone(),
            )
        });
        Ok(tables)
    }

    fn table_exists(&self, db: &str, table: &str) -> Result<bool> {
        let rows: Vec<serde_json::Value> = self.query_rows(&format!(
            "SELECT 1 AS e FROM system.tables WHERE database = '{}' AND name = '{}'",
            escape_sql(db),
            escape_sql(table)
        ))?;
        Ok(!rows.is_empty())
    }

    fn get_database_schema(&self, db: &str) -> Result<String> {
        self.execute(&format!("SHOW CREATE DATABASE `{}`", db))
            .map(|body| body.trim().replace("\\n", "\n"))
    }

    fn get_table_schema(&self, db: &str, table: &str) -> Result<String> {
        self.execute(&format!("SHOW CREATE TABLE `{}`.`{}`", db, table))
            .map(|body| body.trim().replace("\\n", "\n"))
    }

    fn freeze_table(&self, backup_name: &str, table: &TableInfo) -> Result<Vec<FrozenPart>> {
        self.execute_on(
            &self.long_client,
            &format!(
                "ALTER TABLE `{}`.`{}` FREEZE WITH NAME '{}'",
                table.database, table.name, backup_name
            ),
        )?;

        let disks = self.disks()?;
        let mut parts = Vec::new();
        for (data_path, disk_name) in &table.paths_with_disks {
            let disk = disks.get(disk_name).ok_or_else(|| {
                BackupError::DatabaseControl(format!("Unknown disk: {}", disk_name))
            })?;
            let relative = data_path
                .strip_prefix(&disk.path)
                .map_err(|_| {
                    BackupError::DatabaseControl(format!(
                        "Data path {} is outside disk {}",
                        data_path.display(),
                        disk_name
                    ))
                })?;
            let shadow_dir = disk.path.join("shadow").join(backup_name).join(relative);
            if !shadow_dir.is_dir() {
                continue;
            }

            let mut entries: Vec<_> =
                std::fs::read_dir(&shadow_dir)?.collect::<std::io::Result<Vec<_>>>()?;
            entries.sort_by_key(|e| e.file_name());
            for entry in entries {
                if !entry.file_type()?.is_dir() {
                    continue;
                }
                let part_name = entry.file_name().to_string_lossy().to_string();
                if part_name == "detached" {
                    continue;
                }
                parts.push(describe_frozen_dir(
                    &table.database,
                    &table.name,
                    &part_name,
                    disk_name,
                    &entry.path(),
                )?);
            }
        }
        Ok(parts)
    }

    fn unfreeze_all(&self, backup_name: &str) -> Result<()> {
        self.execute_on(
            &self.long_client,
            &format!("SYSTEM UNFREEZE WITH NAME '{}'", backup_name),
        )
        .map(|_| ())
    }

    fn remove_frozen_part(&self, part: &FrozenPart) -> Result<()> {
        match std::fs::remove_dir_all(&part.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn disks(&self) -> Result<HashMap<String, Disk>> {
        let rows: Vec<DiskRow> =
            self.query_rows("SELECT name, path, type, cache_path FROM system.disks")?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let disk_type = if row.disk_type.eq_ignore_ascii_case("local") {
                    DiskType::Local
                } else {
                    DiskType::ObjectStorage
                };
                (
                    row.name.clone(),
                    Disk {
                        name: row.name,
                        disk_type,
                        path: PathBuf::from(row.path),
                        cache_path: row.cache_path.filter(|p| !p.is_empty()).map(PathBuf::from),
                    },
                )
            })
            .collect())
    }

    fn get_detached_part_path(
        &self,
        table: &TableInfo,
        disk_name: &str,
        part_name: &str,
    ) -> Result<PathBuf> {
        let (data_path, _) = table
            .paths_with_disks
            .iter()
            .find(|(_, disk)| disk == disk_name)
            .ok_or_else(|| {
                BackupError::DatabaseControl(format!(
                    "Table {}.{} has no data on disk {}",
                    table.database, table.name, disk_name
                ))
            })?;
        Ok(data_path.join("detached").join(part_name))
    }

    fn attach_part(&self, table: &TableInfo, part_name: &str) -> Result<()> {
        self.execute(&format!(
            "ALTER TABLE `{}`.`{}` ATTACH PART '{}'",
            table.database, table.name, part_name
        ))
        .map(|_| ())
    }

    fn create_database(&self, statement: &str) -> Result<()> {
        self.execute(statement).map(|_| ())
    }

    fn create_table(&self, statement: &str) -> Result<()> {
        self.execute(statement).map(|_| ())
    }

    fn create_udf(&self, statement: &str) -> Result<()> {
        self.execute(statement).map(|_| ())
    }

    fn drop_table_if_exists(&self, db: &str, table: &str) -> Result<()> {
        self.execute(&format!("DROP TABLE IF EXISTS `{}`.`{}`", db, table))
            .map(|_| ())
    }

    fn restore_replica(&self, table: &TableInfo) -> Result<()> {
        self.execute(&format!(
            "SYSTEM RESTORE REPLICA `{}`.`{}`",
            table.database, table.name
        ))
        .map(|_| ())
    }

    fn chown_detached_parts(&self, table: &TableInfo) -> Result<()> {
        let (uid, gid) = match self.owner {
            Some(owner) => owner,
            None => return Ok(()),
        };
        for (data_path, _) in &table.paths_with_disks {
            let detached = data_path.join("detached");
            if detached.is_dir() {
                chown_recursive(&detached, uid, gid)?;
            }
        }
        Ok(())
    }

    fn access_control_objects(&self) -> Result<Vec<AccessControlObject>> {
        let mut objects = Vec::new();
        for (table, type_tag) in ACCESS_CONTROL_TABLES {
            let rows: Vec<AclRow> = self.query_rows(&format!(
                "SELECT toString(id) AS id, name FROM {} WHERE storage = 'local_directory'",
                table
            ))?;
            objects.extend(rows.into_iter().map(|row| AccessControlObject {
                id: row.id,
                name: row.name,
                type_tag: type_tag.to_string(),
            }));
        }
        Ok(objects)
    }

    fn udf_definitions(&self) -> Result<HashMap<String, String>> {
        let rows: Vec<UdfRow> = self.query_rows(
            "SELECT name, create_query FROM system.functions WHERE origin = 'SQLUserDefined'",
        )?;
        Ok(rows
            .into_iter()
            .map(|row| (row.name, row.create_query))
            .collect())
    }
}

fn escape_sql(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

fn chown_recursive(path: &Path, uid: u32, gid: u32) -> Result<()> {
    std::os::unix::fs::chown(path, Some(uid), Some(gid))?;
    if path.is_dir() {
        for entry in std::fs::read_dir(path)? {
            chown_recursive(&entry?.path(), uid, gid)?;
        }
    }
    Ok(())
}

fn resolve_uid(user: &str) -> Result<u32> {
    if let Ok(uid) = user.parse::<u32>() {
        return Ok(uid);
    }
    let cname = std::ffi::CString::new(user)
        .map_err(|_| BackupError::Configuration(format!("Invalid user name: {}", user)))?;
    let passwd = unsafe { libc::getpwnam(cname.as_ptr()) };
    if passwd.is_null() {
        warn!(user, "Unknown user, keeping current ownership");
        return Err(BackupError::Configuration(format!("Unknown user: {}", user)));
    }
    Ok(unsafe { (*passwd).pw_uid })
}

fn resolve_gid(group: &str) -> Result<u32> {
    if let Ok(gid) = group.parse::<u32>() {
        return Ok(gid);
    }
    let cname = std::ffi::CString::new(group)
        .map_err(|_| BackupError::Configuration(format!("Invalid group name: {}", group)))?;
    let grp = unsafe { libc::getgrnam(cname.as_ptr()) };
    if grp.is_null() {
        warn!(group, "Unknown group, keeping current ownership");
        return Err(BackupError::Configuration(format!("Unknown group: {}", group)));
    }
    Ok(unsafe { (*grp).gr_gid })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_sql() {
        assert_eq!(escape_sql("it's"), "it\\'s");
        assert_eq!(escape_sql("a\\b"), "a\\\\b");
    }

    #[test]
    fn test_resolve_numeric_owner() {
        assert_eq!(resolve_uid("1000").unwrap(), 1000);
        assert_eq!(resolve_gid("1000").unwrap(), 1000);
    }
}

// Backup metadata document - identity, state machine, sizes and the
// databases tree, with the JSON codec for backup_struct.json

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::control::DatabaseInfo;
use crate::error::{BackupError, Result};
use crate::metadata::access::{AccessControlMetadata, AclMetaRecord};
use crate::metadata::cloud_storage::CloudStorageMetadata;
use crate::metadata::part::PartMetadata;
use crate::metadata::table::{RawTableMetadata, TableMetadata};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupState {
    Created,
    Creating,
    Deleting,
    PartiallyDeleted,
    Failed,
}

impl std::fmt::Display for BackupState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            BackupState::Created => "created",
            BackupState::Creating => "creating",
            BackupState::Deleting => "deleting",
            BackupState::PartiallyDeleted => "partially_deleted",
            BackupState::Failed => "failed",
        };
        write!(f, "{}", text)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawDatabaseMetadata {
    #[serde(default)]
    pub engine: Option<String>,
    #[serde(default)]
    pub metadata_path: Option<String>,
    #[serde(default)]
    pub tables: BTreeMap<String, RawTableMetadata>,
}

#[derive(Debug, Clone)]
pub struct BackupMetadata {
    pub name: String,
    /// Remote key prefix of this backup.
    pub path: String,
    pub version: String,
    pub db_version: String,
    pub hostname: String,
    pub time_format: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    /// Total bytes including linked parts.
    pub size: u64,
    /// Bytes actually uploaded by this backup, excluding links.
    pub real_size: u64,
    pub labels: HashMap<String, String>,
    pub schema_only: bool,
    pub user_defined_functions: Vec<String>,
    pub access_control: AccessControlMetadata,
    pub cloud_storage: CloudStorageMetadata,
    /// Object-storage disk name -> revision counter.
    pub object_storage_revisions: BTreeMap<String, u64>,
    state: BackupState,
    databases: BTreeMap<String, RawDatabaseMetadata>,
}

impl BackupMetadata {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        path: &str,
        version: &str,
        db_version: &str,
        time_format: &str,
        hostname: &str,
        labels: HashMap<String, String>,
        schema_only: bool,
    ) -> Self {
        Self {
            name: name.to_string(),
            path: path.to_string(),
            version: version.to_string(),
            db_version: db_version.to_string(),
            hostname: hostname.to_string(),
            time_format: time_format.to_string(),
            start_time: crate::util::now(),
            end_time: None,
            size: 0,
            real_size: 0,
            labels,
            schema_only,
            user_defined_functions: Vec::new(),
            access_control: AccessControlMetadata::default(),
            cloud_storage: CloudStorageMetadata::default(),
            object_storage_revisions: BTreeMap::new(),
            state: BackupState::Creating,
            databases: BTreeMap::new(),
        }
    }

    pub fn state(&self) -> BackupState {
        self.state
    }

    pub fn set_state(&mut self, state: BackupState) {
        self.state = state;
    }

    pub fn update_end_time(&mut self) {
        self.end_time = Some(crate::util::now());
    }

    /// The database places snapshot data under this label; `-` is
    /// replaced to avoid escaping on the database side.
    pub fn sanitized_name(&self) -> String {
        self.name.replace('-', "_")
    }

    pub fn get_databases(&self) -> Vec<String> {
        self.databases.keys().cloned().collect()
    }

    pub fn has_database(&self, db_name: &str) -> bool {
        self.databases.contains_key(db_name)
    }

    pub fn get_database(&self, db_name: &str) -> Option<&RawDatabaseMetadata> {
        self.databases.get(db_name)
    }

    pub fn add_database(&mut self, db: &DatabaseInfo) {
        assert!(!self.databases.contains_key(&db.name));
        self.databases.insert(
            db.name.clone(),
            RawDatabaseMetadata {
                engine: db.engine.clone(),
                metadata_path: db.metadata_path.clone(),
                tables: BTreeMap::new(),
            },
        );
    }

    pub fn get_tables(&self, db_name: &str) -> Vec<TableMetadata> {
        match self.databases.get(db_name) {
            Some(db) => db
                .tables
                .iter()
                .map(|(name, raw)| TableMetadata::from_raw(db_name, name, raw.clone()))
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn get_table(&self, db_name: &str, table_name: &str) -> Option<TableMetadata> {
        self.databases
            .get(db_name)?
            .tables
            .get(table_name)
            .map(|raw| TableMetadata::from_raw(db_name, table_name, raw.clone()))
    }

    pub fn add_table(&mut self, table: TableMetadata) {
        let db = self
            .databases
            .get_mut(&table.database)
            .expect("database is recorded before its tables");
        assert!(!db.tables.contains_key(&table.name));

        for part in table.get_parts() {
            self.size += part.size;
            if part.link().is_none() {
                self.real_size += part.size;
            }
        }

        let name = table.name.clone();
        self.databases
            .get_mut(&table.database)
            .expect("checked above")
            .tables
            .insert(name, table.to_raw());
    }

    pub fn add_part(&mut self, part: PartMetadata) {
        let db_name = part.database.clone();
        let table_name = part.table.clone();
        let size = part.size;
        let linked = part.link().is_some();

        let raw_table = self
            .databases
            .get_mut(&db_name)
            .expect("database is recorded before its parts")
            .tables
            .get_mut(&table_name)
            .expect("table is recorded before its parts");

        let mut table = TableMetadata::from_raw(&db_name, &table_name, raw_table.clone());
        table.add_part(part);
        *raw_table = table.to_raw();

        self.size += size;
        if !linked {
            self.real_size += size;
        }
    }

    pub fn remove_parts(&mut self, db_name: &str, table_name: &str, parts: &[PartMetadata]) {
        let db = match self.databases.get_mut(db_name) {
            Some(db) => db,
            None => return,
        };
        let raw_table = match db.tables.get_mut(table_name) {
            Some(raw) => raw,
            None => return,
        };

        let mut table = TableMetadata::from_raw(db_name, table_name, raw_table.clone());
        for part in parts {
            if let Some(removed) = table.remove_part(&part.name) {
                self.size -= removed.size;
                if removed.link().is_none() {
                    self.real_size -= removed.size;
                }
            }
        }
        *raw_table = table.to_raw();
    }

    /// Data parts of all tables.
    pub fn get_parts(&self) -> Vec<PartMetadata> {
        let mut parts = Vec::new();
        for db_name in self.get_databases() {
            for table in self.get_tables(&db_name) {
                parts.extend(table.get_parts());
            }
        }
        parts
    }

    pub fn find_part(
        &self,
        db_name: &str,
        table_name: &str,
        part_name: &str,
    ) -> Option<PartMetadata> {
        self.get_table(db_name, table_name)?.find_part(part_name)
    }

    pub fn add_udf(&mut self, udf_name: String) {
        if !self.user_defined_functions.contains(&udf_name) {
            self.user_defined_functions.push(udf_name);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn has_object_storage_data(&self) -> bool {
        !self.object_storage_revisions.is_empty()
    }

    fn format_time(&self, value: &DateTime<Utc>) -> String {
        value.format(&self.time_format).to_string()
    }

    fn parse_time(value: &str, time_format: &str) -> Result<DateTime<Utc>> {
        if let Ok(parsed) = DateTime::parse_from_str(value, time_format) {
            return Ok(parsed.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(value, time_format)
            .map(|naive| naive.and_utc())
            .map_err(|e| BackupError::Metadata(format!("Invalid timestamp \"{}\": {}", value, e)))
    }

    /// Serialize the metadata document. A light dump strips the
    /// databases tree and the other bulky sections for cheap listing.
    pub fn dump_json(&self, light: bool) -> String {
        let document = RawDocument {
            databases: if light {
                BTreeMap::new()
            } else {
                self.databases.clone()
            },
            access_controls: if light {
                Some(AccessControlMetadata::default())
            } else {
                Some(self.access_control.clone())
            },
            access_control: None,
            access_control_meta: None,
            user_defined_functions: if light {
                Vec::new()
            } else {
                self.user_defined_functions.clone()
            },
            cloud_storage: self.cloud_storage.clone(),
            meta: RawMeta {
                name: self.name.clone(),
                path: self.path.clone(),
                version: self.version.clone(),
                db_version: self.db_version.clone(),
                hostname: self.hostname.clone(),
                time_format: Some(self.time_format.clone()),
                date_fmt: Some(self.time_format.clone()),
                start_time: self.format_time(&self.start_time),
                end_time: self.end_time.as_ref().map(|t| self.format_time(t)),
                bytes: self.size,
                real_bytes: self.real_size,
                state: self.state,
                labels: self.labels.clone(),
                schema_only: self.schema_only,
                s3_revisions: self.object_storage_revisions.clone(),
            },
        };
        serde_json::to_string(&document).expect("metadata document always serializes")
    }

    pub fn load_json(data: &str) -> Result<BackupMetadata> {
        let document: RawDocument = serde_json::from_str(data)
            .map_err(|e| BackupError::Metadata(format!("Invalid backup metadata: {}", e)))?;
        let meta = document.meta;

        let time_format = meta
            .time_format
            .or(meta.date_fmt)
            .ok_or_else(|| BackupError::Metadata("Missing time format".to_string()))?;

        let start_time = Self::parse_time(&meta.start_time, &time_format)?;
        let end_time = match &meta.end_time {
            Some(value) if !value.is_empty() => Some(Self::parse_time(value, &time_format)?),
            _ => None,
        };

        // The nested access-control object is canonical; the legacy
        // flat fields are still accepted.
        let access_control = match (document.access_controls, document.access_control) {
            (Some(nested), None) => nested,
            (_, Some(legacy_ids)) => AccessControlMetadata::from_legacy(
                legacy_ids,
                document.access_control_meta.unwrap_or_default(),
            ),
            (None, None) => AccessControlMetadata::default(),
        };

        Ok(BackupMetadata {
            name: meta.name,
            path: meta.path,
            version: meta.version,
            db_version: meta.db_version,
            hostname: meta.hostname,
            time_format,
            start_time,
            end_time,
            size: meta.bytes,
            real_size: meta.real_bytes,
            labels: meta.labels,
            schema_only: meta.schema_only,
            user_defined_functions: document.user_defined_functions,
            access_control,
            cloud_storage: document.cloud_storage,
            object_storage_revisions: meta.s3_revisions,
            state: meta.state,
            databases: document.databases,
        })
    }
}

#[derive(Serialize, Deserialize)]
struct RawDocument {
    #[serde(default)]
    databases: BTreeMap<String, RawDatabaseMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    access_controls: Option<AccessControlMetadata>,
    // Legacy flat shape of the access-control section.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    access_control: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    access_control_meta: Option<BTreeMap<String, AclMetaRecord>>,
    #[serde(default)]
    user_defined_functions: Vec<String>,
    #[serde(default)]
    cloud_storage: CloudStorageMetadata,
    meta: RawMeta,
}

#[derive(Serialize, Deserialize)]
struct RawMeta {
    name: String,
    path: String,
    version: String,
    db_version: String,
    hostname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    time_format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    date_fmt: Option<String>,
    start_time: String,
    #[serde(default)]
    end_time: Option<String>,
    bytes: u64,
    real_bytes: u64,
    state: BackupState,
    #[serde(default)]
    labels: HashMap<String, String>,
    #[serde(default)]
    schema_only: bool,
    #[serde(default)]
    s3_revisions: BTreeMap<String, u64>,
}

/// Check the documented size invariants; used by tests and validation.
pub fn check_size_invariants(backup: &BackupMetadata) -> bool {
    let mut size = 0u64;
    let mut real_size = 0u64;
    for part in backup.get_parts() {
        size += part.size;
        if part.link().is_none() {
            real_size += part.size;
        }
    }
    backup.size == size && backup.real_size == real_size && backup.size >= backup.real_size
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::part::PartLocation;

    fn sample_backup() -> BackupMetadata {
        let mut backup = BackupMetadata::new(
            "b1",
            "backups/b1",
            "0.6.0",
            "24.3.1",
            "%Y-%m-%d %H:%M:%S%.6f %z",
            "host-1",
            HashMap::new(),
            false,
        );
        backup.add_database(&DatabaseInfo {
            name: "db".to_string(),
            engine: Some("Atomic".to_string()),
            metadata_path: Some("/data/metadata/db.sql".to_string()),
        });
        backup.add_table(TableMetadata::new("db", "t", "MergeTree", None));
        backup
    }

    fn sample_part(name: &str, location: PartLocation, size: u64) -> PartMetadata {
        PartMetadata {
            database: "db".to_string(),
            table: "t".to_string(),
            name: name.to_string(),
            checksum: "abc".to_string(),
            size,
            files: vec!["data.bin".to_string()],
            tarball: true,
            disk_name: "default".to_string(),
            location,
        }
    }

    #[test]
    fn test_sizes_track_ownership() {
        let mut backup = sample_backup();
        backup.add_part(sample_part("p1", PartLocation::Owned, 100));
        backup.add_part(sample_part("p2", PartLocation::Linked("backups/b0".to_string()), 50));

        assert_eq!(backup.size, 150);
        assert_eq!(backup.real_size, 100);
        assert!(check_size_invariants(&backup));

        let removed = backup.find_part("db", "t", "p2").unwrap();
        backup.remove_parts("db", "t", &[removed]);
        assert_eq!(backup.size, 100);
        assert_eq!(backup.real_size, 100);
    }

    #[test]
    fn test_json_roundtrip() {
        let mut backup = sample_backup();
        backup.add_part(sample_part("p1", PartLocation::Owned, 100));
        backup.set_state(BackupState::Created);
        backup.update_end_time();

        let encoded = backup.dump_json(false);
        let decoded = BackupMetadata::load_json(&encoded).unwrap();

        assert_eq!(decoded.name, "b1");
        assert_eq!(decoded.state(), BackupState::Created);
        assert_eq!(decoded.size, 100);
        assert_eq!(decoded.real_size, 100);
        assert!(decoded.end_time.is_some());
        assert_eq!(decoded.get_parts().len(), 1);
        assert_eq!(
            decoded.start_time.timestamp_micros(),
            backup.start_time.timestamp_micros()
        );
    }

    #[test]
    fn test_light_dump_strips_databases() {
        let mut backup = sample_backup();
        backup.add_part(sample_part("p1", PartLocation::Owned, 100));

        let light = BackupMetadata::load_json(&backup.dump_json(true)).unwrap();
        assert!(light.get_databases().is_empty());
        // Aggregates survive in the light document.
        assert_eq!(light.size, 100);
        assert_eq!(light.state(), BackupState::Creating);
    }

    #[test]
    fn test_reader_ignores_unknown_fields_and_legacy_alias() {
        let raw = r#"{
            "databases": {},
            "future_section": {"x": 1},
            "meta": {
                "name": "old", "path": "backups/old", "version": "1.0",
                "db_version": "21.8", "hostname": "host-1",
                "date_fmt": "%Y-%m-%d %H:%M:%S %z",
                "start_time": "2020-01-01 00:00:00 +0000",
                "end_time": "2020-01-01 01:00:00 +0000",
                "bytes": 10, "real_bytes": 10, "state": "created",
                "unknown_meta_field": true
            }
        }"#;
        let decoded = BackupMetadata::load_json(raw).unwrap();
        assert_eq!(decoded.time_format, "%Y-%m-%d %H:%M:%S %z");
        assert_eq!(decoded.state(), BackupState::Created);
    }

    #[test]
    fn test_legacy_flat_access_control() {
        let raw = r#"{
            "databases": {},
            "access_control": ["id-0"],
            "access_control_meta": {"0": {"name": "admin", "char": "U"}},
            "meta": {
                "name": "old", "path": "backups/old", "version": "1.0",
                "db_version": "21.8", "hostname": "host-1",
                "time_format": "%Y-%m-%d %H:%M:%S %z",
                "start_time": "2020-01-01 00:00:00 +0000",
                "bytes": 0, "real_bytes": 0, "state": "created"
            }
        }"#;
        let decoded = BackupMetadata::load_json(raw).unwrap();
        assert_eq!(decoded.access_control.acl_ids, vec!["id-0"]);
        assert_eq!(decoded.access_control.acl_meta["0"].type_tag, "U");
        assert_eq!(
            decoded.access_control.backup_format,
            crate::metadata::access::BackupStorageFormat::Plain
        );
    }

    #[test]
    fn test_malformed_document_is_metadata_error() {
        assert!(matches!(
            BackupMetadata::load_json("{\"nope\": 1}"),
            Err(BackupError::Metadata(_))
        ));
    }
}

// Backup metadata for a single data part

use serde::{Deserialize, Serialize};

use crate::control::FrozenPart;

/// Ownership of the part payload in remote storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartLocation {
    /// This backup owns the bytes under its own prefix.
    Owned,
    /// The bytes live under the prefix of another backup; only the
    /// metadata belongs to this backup. Deletion must not touch the
    /// linked data.
    Linked(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PartMetadata {
    pub database: String,
    pub table: String,
    pub name: String,
    pub checksum: String,
    /// Payload bytes prior to tarball framing and encryption.
    pub size: u64,
    pub files: Vec<String>,
    /// The payload is stored as a single TAR object.
    pub tarball: bool,
    pub disk_name: String,
    pub location: PartLocation,
}

impl PartMetadata {
    /// Remote prefix of the backup that owns the data, if linked.
    pub fn link(&self) -> Option<&str> {
        match &self.location {
            PartLocation::Owned => None,
            PartLocation::Linked(path) => Some(path),
        }
    }

    pub fn from_frozen_part(frozen: &FrozenPart) -> Self {
        Self {
            database: frozen.database.clone(),
            table: frozen.table.clone(),
            name: frozen.name.clone(),
            checksum: frozen.checksum.clone(),
            size: frozen.size,
            files: frozen.files.clone(),
            tarball: true,
            disk_name: frozen.disk_name.clone(),
            location: PartLocation::Owned,
        }
    }
}

fn default_disk_name() -> String {
    "default".to_string()
}

/// On-disk shape of one part record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawPartMetadata {
    pub checksum: String,
    pub bytes: u64,
    pub files: Vec<String>,
    pub link: Option<String>,
    #[serde(default)]
    pub tarball: bool,
    #[serde(default = "default_disk_name")]
    pub disk_name: String,
}

impl RawPartMetadata {
    pub fn from_part(part: &PartMetadata) -> Self {
        Self {
            checksum: part.checksum.clone(),
            bytes: part.size,
            files: part.files.clone(),
            link: part.link().map(|l| l.to_string()),
            tarball: part.tarball,
            disk_name: part.disk_name.clone(),
        }
    }

    pub fn into_part(self, database: &str, table: &str, name: &str) -> PartMetadata {
        PartMetadata {
            database: database.to_string(),
            table: table.to_string(),
            name: name.to_string(),
            checksum: self.checksum,
            size: self.bytes,
            files: self.files,
            tarball: self.tarball,
            disk_name: self.disk_name,
            location: match self.link {
                Some(path) => PartLocation::Linked(path),
                None => PartLocation::Owned,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part(location: PartLocation) -> PartMetadata {
        PartMetadata {
            database: "db".to_string(),
            table: "t".to_string(),
            name: "all_1_1_0".to_string(),
            checksum: "abc".to_string(),
            size: 1024,
            files: vec!["data.bin".to_string()],
            tarball: true,
            disk_name: "default".to_string(),
            location,
        }
    }

    #[test]
    fn test_link_accessor() {
        assert_eq!(part(PartLocation::Owned).link(), None);
        assert_eq!(
            part(PartLocation::Linked("backups/b1".to_string())).link(),
            Some("backups/b1")
        );
    }

    #[test]
    fn test_raw_roundtrip() {
        let original = part(PartLocation::Linked("backups/b1".to_string()));
        let raw = RawPartMetadata::from_part(&original);
        let restored = raw.into_part("db", "t", "all_1_1_0");
        assert_eq!(restored, original);
    }

    #[test]
    fn test_legacy_record_without_tarball_flag() {
        let raw: RawPartMetadata = serde_json::from_str(
            r#"{"checksum": "abc", "bytes": 10, "files": ["data.bin"], "link": null}"#,
        )
        .unwrap();
        let restored = raw.into_part("db", "t", "p");
        assert!(!restored.tarball);
        assert_eq!(restored.disk_name, "default");
        assert_eq!(restored.location, PartLocation::Owned);
    }
}

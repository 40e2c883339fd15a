// Access control metadata

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::control::AccessControlObject;

/// How access control objects are stored in the backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStorageFormat {
    Plain,
    Tar,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AclMetaRecord {
    pub name: String,
    /// Single-character type tag assigned by the database.
    #[serde(rename = "char")]
    pub type_tag: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccessControlMetadata {
    #[serde(default)]
    pub acl_ids: Vec<String>,
    #[serde(default)]
    pub acl_meta: BTreeMap<String, AclMetaRecord>,
    #[serde(default = "default_format")]
    pub backup_format: BackupStorageFormat,
}

fn default_format() -> BackupStorageFormat {
    BackupStorageFormat::Tar
}

impl Default for AccessControlMetadata {
    fn default() -> Self {
        Self {
            acl_ids: Vec::new(),
            acl_meta: BTreeMap::new(),
            backup_format: BackupStorageFormat::Tar,
        }
    }
}

impl AccessControlMetadata {
    pub fn from_objects(objects: &[AccessControlObject]) -> Self {
        let mut acl_ids = Vec::with_capacity(objects.len());
        let mut acl_meta = BTreeMap::new();
        for (i, object) in objects.iter().enumerate() {
            acl_ids.push(object.id.clone());
            acl_meta.insert(
                i.to_string(),
                AclMetaRecord {
                    name: object.name.clone(),
                    type_tag: object.type_tag.clone(),
                },
            );
        }
        Self {
            acl_ids,
            acl_meta,
            backup_format: BackupStorageFormat::Tar,
        }
    }

    /// Build from the legacy flat document fields (`access_control` id
    /// list plus `access_control_meta` side table).
    pub fn from_legacy(
        acl_ids: Vec<String>,
        acl_meta: BTreeMap<String, AclMetaRecord>,
    ) -> Self {
        Self {
            acl_ids,
            acl_meta,
            backup_format: BackupStorageFormat::Plain,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.acl_ids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_objects_indexes_side_table() {
        let objects = vec![
            AccessControlObject {
                id: "id-0".to_string(),
                name: "admin".to_string(),
                type_tag: "U".to_string(),
            },
            AccessControlObject {
                id: "id-1".to_string(),
                name: "readers".to_string(),
                type_tag: "R".to_string(),
            },
        ];
        let metadata = AccessControlMetadata::from_objects(&objects);
        assert_eq!(metadata.acl_ids, vec!["id-0", "id-1"]);
        assert_eq!(metadata.acl_meta["1"].name, "readers");
        assert_eq!(metadata.backup_format, BackupStorageFormat::Tar);
    }

    #[test]
    fn test_nested_shape_roundtrip() {
        let metadata = AccessControlMetadata::from_objects(&[AccessControlObject {
            id: "id-0".to_string(),
            name: "admin".to_string(),
            type_tag: "U".to_string(),
        }]);
        let encoded = serde_json::to_string(&metadata).unwrap();
        assert!(encoded.contains("\"backup_format\":\"tar\""));
        assert!(encoded.contains("\"char\":\"U\""));
        let decoded: AccessControlMetadata = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, metadata);
    }
}

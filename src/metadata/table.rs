// Backup metadata for a single table

use std::collections::BTreeMap;
use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::metadata::part::{PartMetadata, RawPartMetadata};

#[derive(Debug, Clone)]
pub struct TableMetadata {
    pub database: String,
    pub name: String,
    pub engine: String,
    /// Table uuid, if the database assigns explicit object ids.
    pub uuid: Option<String>,
    parts: BTreeMap<String, RawPartMetadata>,
}

/// On-disk shape of one table record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawTableMetadata {
    pub engine: String,
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub parts: BTreeMap<String, RawPartMetadata>,
}

impl TableMetadata {
    pub fn new(database: &str, name: &str, engine: &str, uuid: Option<String>) -> Self {
        Self {
            database: database.to_string(),
            name: name.to_string(),
            engine: engine.to_string(),
            uuid,
            parts: BTreeMap::new(),
        }
    }

    pub fn get_parts(&self) -> Vec<PartMetadata> {
        self.parts
            .iter()
            .map(|(name, raw)| raw.clone().into_part(&self.database, &self.name, name))
            .collect()
    }

    pub fn get_parts_excluding(&self, excluded: &HashSet<String>) -> Vec<PartMetadata> {
        self.parts
            .iter()
            .filter(|(name, _)| !excluded.contains(*name))
            .map(|(name, raw)| raw.clone().into_part(&self.database, &self.name, name))
            .collect()
    }

    pub fn add_part(&mut self, part: PartMetadata) {
        assert_eq!(part.database, self.database);
        assert_eq!(part.table, self.name);
        assert!(!self.parts.contains_key(&part.name));
        self.parts
            .insert(part.name.clone(), RawPartMetadata::from_part(&part));
    }

    pub fn remove_part(&mut self, part_name: &str) -> Option<PartMetadata> {
        self.parts
            .remove(part_name)
            .map(|raw| raw.into_part(&self.database, &self.name, part_name))
    }

    pub fn find_part(&self, part_name: &str) -> Option<PartMetadata> {
        self.parts
            .get(part_name)
            .map(|raw| raw.clone().into_part(&self.database, &self.name, part_name))
    }

    pub fn to_raw(&self) -> RawTableMetadata {
        RawTableMetadata {
            engine: self.engine.clone(),
            uuid: self.uuid.clone(),
            parts: self.parts.clone(),
        }
    }

    pub fn from_raw(database: &str, name: &str, raw: RawTableMetadata) -> Self {
        Self {
            database: database.to_string(),
            name: name.to_string(),
            engine: raw.engine,
            uuid: raw.uuid,
            parts: raw.parts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::part::PartLocation;

    fn sample_part(name: &str) -> PartMetadata {
        PartMetadata {
            database: "db".to_string(),
            table: "t".to_string(),
            name: name.to_string(),
            checksum: "abc".to_string(),
            size: 100,
            files: vec!["data.bin".to_string()],
            tarball: true,
            disk_name: "default".to_string(),
            location: PartLocation::Owned,
        }
    }

    #[test]
    fn test_add_and_find_parts() {
        let mut table = TableMetadata::new("db", "t", "MergeTree", None);
        table.add_part(sample_part("all_1_1_0"));
        table.add_part(sample_part("all_2_2_0"));

        assert_eq!(table.get_parts().len(), 2);
        assert!(table.find_part("all_1_1_0").is_some());
        assert!(table.find_part("missing").is_none());
    }

    #[test]
    fn test_exclusion() {
        let mut table = TableMetadata::new("db", "t", "MergeTree", None);
        table.add_part(sample_part("all_1_1_0"));
        table.add_part(sample_part("all_2_2_0"));

        let excluded: HashSet<String> = ["all_1_1_0".to_string()].into_iter().collect();
        let remaining = table.get_parts_excluding(&excluded);
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].name, "all_2_2_0");
    }

    #[test]
    #[should_panic]
    fn test_duplicate_part_rejected() {
        let mut table = TableMetadata::new("db", "t", "MergeTree", None);
        table.add_part(sample_part("all_1_1_0"));
        table.add_part(sample_part("all_1_1_0"));
    }
}

// Metadata of backed-up external object-storage disks

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CloudStorageMetadata {
    /// Names of object-storage disks whose data is covered by this
    /// backup.
    #[serde(default)]
    pub disks: Vec<String>,
    #[serde(rename = "encryption", default)]
    pub encrypted: bool,
}

impl CloudStorageMetadata {
    pub fn enabled(&self) -> bool {
        !self.disks.is_empty()
    }

    pub fn encrypt(&mut self) {
        self.encrypted = true;
    }

    pub fn add_disk(&mut self, disk_name: String) {
        if !self.disks.contains(&disk_name) {
            self.disks.push(disk_name);
        }
    }

    pub fn has_disk(&self, disk_name: &str) -> bool {
        self.disks.iter().any(|d| d == disk_name)
    }
}

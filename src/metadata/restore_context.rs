// Durable restore context - lets an interrupted restore resume without
// re-downloading already handled parts

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Result;
use crate::metadata::part::PartMetadata;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartState {
    Downloaded,
    Restored,
    Invalid,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailedPart {
    pub database: String,
    pub table: String,
    pub name: String,
    pub error: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RestoreState {
    #[serde(default)]
    databases: BTreeMap<String, BTreeMap<String, BTreeMap<String, PartState>>>,
    #[serde(default)]
    failed_parts: Vec<FailedPart>,
}

#[derive(Debug)]
pub struct RestoreContext {
    state_file: PathBuf,
    state: RestoreState,
}

impl RestoreContext {
    pub fn new(state_file: &Path) -> Self {
        let state = match std::fs::read_to_string(state_file) {
            Ok(data) => serde_json::from_str(&data).unwrap_or_else(|e| {
                warn!(
                    path = %state_file.display(),
                    error = %e,
                    "Ignoring malformed restore state"
                );
                RestoreState::default()
            }),
            Err(_) => RestoreState::default(),
        };
        Self {
            state_file: state_file.to_path_buf(),
            state,
        }
    }

    pub fn add_table(&mut self, database: &str, table: &str) {
        self.state
            .databases
            .entry(database.to_string())
            .or_default()
            .entry(table.to_string())
            .or_default();
    }

    pub fn add_part(&mut self, part: &PartMetadata, state: PartState) {
        self.state
            .databases
            .entry(part.database.clone())
            .or_default()
            .entry(part.table.clone())
            .or_default()
            .insert(part.name.clone(), state);
    }

    fn part_state(&self, part: &PartMetadata) -> Option<PartState> {
        self.state
            .databases
            .get(&part.database)?
            .get(&part.table)?
            .get(&part.name)
            .copied()
    }

    pub fn part_restored(&self, part: &PartMetadata) -> bool {
        self.part_state(part) == Some(PartState::Restored)
    }

    pub fn part_downloaded(&self, part: &PartMetadata) -> bool {
        self.part_state(part) == Some(PartState::Downloaded)
    }

    pub fn add_failed_part(&mut self, part: &PartMetadata, error: &crate::error::BackupError) {
        self.state.failed_parts.push(FailedPart {
            database: part.database.clone(),
            table: part.table.clone(),
            name: part.name.clone(),
            error: error.to_string(),
        });
    }

    pub fn has_failed_parts(&self) -> bool {
        !self.state.failed_parts.is_empty()
    }

    pub fn failed_parts(&self) -> &[FailedPart] {
        &self.state.failed_parts
    }

    /// Persist the restore state to disk.
    pub fn dump_state(&self) -> Result<()> {
        if let Some(parent) = self.state_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.state_file, serde_json::to_string(&self.state)?)?;
        Ok(())
    }
}

// Backup engine - orchestrates backup, restore, delete and purge.
// Owns the backup state machine and drives the database control plane,
// the deduplication subsystem and the pipeline executor.

mod backup;
mod delete;
mod restore;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::Config;
use crate::control::DatabaseControl;
use crate::error::{BackupError, Result};
use crate::layout::BackupLayout;
use crate::lock::{self, Coordinator, LockGuard};
use crate::metadata::{BackupMetadata, BackupState};
use crate::pipeline::executor::PipelineExecutor;
use crate::storage::get_storage_engine;

pub use backup::{BackupOptions, BackupSources};
pub use restore::RestoreOptions;

pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

pub struct BackupEngine {
    pub(crate) config: Config,
    pub(crate) control: Arc<dyn DatabaseControl>,
    pub(crate) layout: BackupLayout,
    coordinator: Option<Arc<dyn Coordinator>>,
    cancel: Arc<AtomicBool>,
    pub(crate) hostname: String,
}

impl BackupEngine {
    pub fn new(
        config: Config,
        control: Arc<dyn DatabaseControl>,
        coordinator: Option<Arc<dyn Coordinator>>,
    ) -> Result<Self> {
        config.validate()?;
        let storage = get_storage_engine(&config)?;
        let cancel = Arc::new(AtomicBool::new(false));
        let executor = Arc::new(PipelineExecutor::new(
            config.pipeline.workers,
            Arc::clone(&cancel),
        ));
        let layout = BackupLayout::new(&config, storage, executor)?;
        let hostname = hostname();

        Ok(Self {
            config,
            control,
            layout,
            coordinator,
            cancel,
            hostname,
        })
    }

    /// Request cancellation: pipelines drain and exit at the next
    /// suspension point, and the controller checkpoints any CREATING
    /// backup to FAILED before returning.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub(crate) fn check_cancelled(&self) -> Result<()> {
        if self.cancel.load(Ordering::Relaxed) {
            return Err(BackupError::Cancelled);
        }
        Ok(())
    }

    pub(crate) fn acquire_locks(&self, operation: &str) -> Result<LockGuard> {
        lock::acquire(
            &self.config.lock,
            self.coordinator.as_deref(),
            operation,
        )
    }

    /// Get one backup's metadata.
    pub fn get(&self, backup_name: &str) -> Result<BackupMetadata> {
        self.layout
            .get_backup_metadata(backup_name)?
            .ok_or_else(|| BackupError::BackupNotFound(backup_name.to_string()))
    }

    /// List existing backups sorted newest-first, optionally filtered
    /// by state.
    pub fn list(&self, state: Option<BackupState>) -> Result<Vec<BackupMetadata>> {
        let backups = self.layout.get_backups()?;
        Ok(match state {
            Some(state) => backups.into_iter().filter(|b| b.state() == state).collect(),
            None => backups,
        })
    }

    pub fn version(&self) -> &'static str {
        ENGINE_VERSION
    }
}

fn hostname() -> String {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc != 0 {
        return "localhost".to_string();
    }
    let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).to_string()
}

// Command-level locking - per-process advisory flock plus an optional
// distributed lock through the external coordinator

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::time::Duration;

use tracing::debug;

use crate::config::LockConfig;
use crate::error::{BackupError, Result};

/// Distributed lock provider. The coordinator service itself is an
/// external collaborator; implementations wrap its client.
pub trait Coordinator: Send + Sync {
    /// Acquire the named lock, blocking up to `timeout`.
    fn acquire_lock(&self, name: &str, timeout: Duration) -> Result<Box<dyn CoordinatorLock>>;
}

pub trait CoordinatorLock: Send {
    /// Release the lock. Dropping the object must release it as well.
    fn release(&mut self);
}

/// Advisory file lock held for the lifetime of the guard.
struct Flock {
    file: File,
}

impl Flock {
    fn acquire(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| BackupError::Lock(format!("Failed to open {}: {}", path.display(), e)))?;

        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            return Err(BackupError::Lock(format!(
                "Another operation holds the lock at {}",
                path.display()
            )));
        }
        Ok(Self { file })
    }
}

impl Drop for Flock {
    fn drop(&mut self) {
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

/// Guard holding every lock the configuration asks for. Locks are
/// released in reverse order on drop.
pub struct LockGuard {
    _flock: Option<Flock>,
    distributed: Option<Box<dyn CoordinatorLock>>,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(lock) = &mut self.distributed {
            lock.release();
        }
    }
}

/// Acquire the configured locks for one backup/restore command.
/// The distributed lock is skipped when no coordinator is configured.
pub fn acquire(
    config: &LockConfig,
    coordinator: Option<&dyn Coordinator>,
    lock_name: &str,
) -> Result<LockGuard> {
    let flock = if config.flock {
        debug!(path = %config.flock_path.display(), "Acquiring process lock");
        Some(Flock::acquire(&config.flock_path)?)
    } else {
        None
    };

    let distributed = match (config.distributed, coordinator) {
        (true, Some(coordinator)) => {
            debug!(lock_name, "Acquiring distributed lock");
            Some(coordinator.acquire_lock(
                lock_name,
                Duration::from_secs(config.lock_timeout_secs),
            )?)
        }
        _ => None,
    };

    Ok(LockGuard {
        _flock: flock,
        distributed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flock_blocks_second_holder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cmd.lock");

        let first = Flock::acquire(&path).unwrap();
        assert!(Flock::acquire(&path).is_err());
        drop(first);
        assert!(Flock::acquire(&path).is_ok());
    }

    #[test]
    fn test_disabled_locks_are_noop() {
        let config = LockConfig::default();
        let guard = acquire(&config, None, "backup").unwrap();
        drop(guard);
    }

    #[test]
    fn test_lock_error_has_distinct_exit_code() {
        let e = BackupError::Lock("contended".to_string());
        assert_eq!(e.exit_code(), 3);
    }
}

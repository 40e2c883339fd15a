// Storage - object store backends and the retrying engine on top of them

pub mod engine;
pub mod local;
pub mod s3;

use std::fmt;
use std::sync::Arc;

use crate::config::{Config, StorageKind};
use crate::error::Result;

pub use engine::StorageEngine;

/// Classification of a backend failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendErrorKind {
    /// Connection-level failure: reset, DNS, timeout, transient 5xx.
    /// The engine rebuilds the client and retries.
    Transient,
    /// The request was understood and rejected.
    Permanent,
    /// The object does not exist.
    NotFound,
    /// The backend does not support the operation (e.g. bulk delete).
    Unsupported,
}

#[derive(Debug)]
pub struct BackendError {
    pub kind: BackendErrorKind,
    pub message: String,
}

impl BackendError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: BackendErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: BackendErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            kind: BackendErrorKind::NotFound,
            message: message.into(),
        }
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self {
            kind: BackendErrorKind::Unsupported,
            message: message.into(),
        }
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for BackendError {}

impl From<std::io::Error> for BackendError {
    fn from(e: std::io::Error) -> Self {
        let kind = match e.kind() {
            std::io::ErrorKind::NotFound => BackendErrorKind::NotFound,
            std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::Interrupted => BackendErrorKind::Transient,
            _ => BackendErrorKind::Permanent,
        };
        Self {
            kind,
            message: format!("IO error: {}", e),
        }
    }
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Raw object-store operations.
///
/// Implementations are plain clients without retrying; failure handling
/// lives in [`StorageEngine`]. Multipart upload state (part numbers and
/// receipts) is tracked by the backend per upload id; `complete` issues
/// part numbers in ascending order.
pub trait StorageBackend: Send + Sync {
    fn put(&self, key: &str, data: &[u8]) -> BackendResult<()>;
    fn get(&self, key: &str) -> BackendResult<Vec<u8>>;
    /// Ranged read. An empty result means the offset is at or past the
    /// end of the object.
    fn get_range(&self, key: &str, offset: u64, len: u64) -> BackendResult<Vec<u8>>;
    /// List keys under a prefix. Non-recursive listings include
    /// sub-prefixes with a trailing `/`. All results are absolute keys.
    fn list(&self, prefix: &str, recursive: bool) -> BackendResult<Vec<String>>;
    fn exists(&self, key: &str) -> BackendResult<bool>;
    /// Idempotent: deleting a missing key is not an error.
    fn delete(&self, key: &str) -> BackendResult<()>;
    /// Bulk delete. May fail with `Unsupported`, in which case the
    /// engine falls back to per-key deletes.
    fn delete_many(&self, keys: &[String]) -> BackendResult<()>;

    fn create_multipart_upload(&self, key: &str) -> BackendResult<String>;
    fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: &[u8],
    ) -> BackendResult<()>;
    fn complete_multipart_upload(&self, key: &str, upload_id: &str) -> BackendResult<()>;
    fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> BackendResult<()>;
}

/// Builds backend clients. The engine discards and rebuilds the client
/// on connection-level failures.
pub trait BackendFactory: Send + Sync {
    fn create(&self) -> BackendResult<Arc<dyn StorageBackend>>;
}

/// Build the storage engine for the configured backend type.
pub fn get_storage_engine(config: &Config) -> Result<Arc<StorageEngine>> {
    let factory: Arc<dyn BackendFactory> = match config.storage.kind {
        StorageKind::Local => Arc::new(local::LocalBackendFactory::new(
            config.storage.local_root.clone(),
        )),
        StorageKind::S3 => Arc::new(s3::S3BackendFactory::new(
            config.storage.clone(),
            config.main.ca_bundle.clone(),
        )),
    };
    Ok(Arc::new(StorageEngine::new(factory, &config.storage)))
}

// Storage engine - retrying facade over a raw object-store backend
// All public methods retry connection-level failures with exponential
// backoff; the cached client is discarded and rebuilt before the next
// attempt.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::StorageConfig;
use crate::error::{BackupError, Result};

use super::{BackendErrorKind, BackendFactory, BackendResult, StorageBackend};

struct DownloadCursor {
    key: String,
    offset: u64,
}

pub struct StorageEngine {
    factory: Arc<dyn BackendFactory>,
    cached: Mutex<Option<Arc<dyn StorageBackend>>>,
    downloads: Mutex<HashMap<String, DownloadCursor>>,
    rebuilds: AtomicUsize,
    max_attempts: usize,
    retry_base_interval: Duration,
    retry_max_interval: Duration,
    bulk_delete_enabled: bool,
    bulk_delete_chunk_size: usize,
}

impl StorageEngine {
    pub fn new(factory: Arc<dyn BackendFactory>, config: &StorageConfig) -> Self {
        Self {
            factory,
            cached: Mutex::new(None),
            downloads: Mutex::new(HashMap::new()),
            rebuilds: AtomicUsize::new(0),
            max_attempts: config.max_attempts.max(1),
            retry_base_interval: Duration::from_millis(config.retry_base_interval_ms),
            retry_max_interval: Duration::from_millis(config.retry_max_interval_ms.max(1)),
            bulk_delete_enabled: config.bulk_delete_enabled,
            bulk_delete_chunk_size: config.bulk_delete_chunk_size.max(1),
        }
    }

    /// Number of times the cached client was rebuilt after failures.
    pub fn client_rebuilds(&self) -> usize {
        self.rebuilds.load(Ordering::SeqCst)
    }

    fn client(&self) -> BackendResult<Arc<dyn StorageBackend>> {
        let mut cached = self.cached.lock();
        if let Some(client) = cached.as_ref() {
            return Ok(Arc::clone(client));
        }
        let client = self.factory.create()?;
        *cached = Some(Arc::clone(&client));
        Ok(client)
    }

    /// Discard the cached client so the next attempt rebuilds it.
    fn reset_client(&self) {
        self.cached.lock().take();
        self.rebuilds.fetch_add(1, Ordering::SeqCst);
    }

    fn with_retry<T>(
        &self,
        op: &str,
        f: impl Fn(&dyn StorageBackend) -> BackendResult<T>,
    ) -> Result<T> {
        let mut interval = self.retry_base_interval;
        let mut last_error = None;

        for attempt in 1..=self.max_attempts {
            let client = match self.client() {
                Ok(client) => client,
                Err(e) => {
                    if e.kind != BackendErrorKind::Transient || attempt == self.max_attempts {
                        return Err(BackupError::Storage(format!("{}: {}", op, e)));
                    }
                    warn!(op, attempt, error = %e, "Failed to build storage client, retrying");
                    std::thread::sleep(interval);
                    interval = (interval * 2).min(self.retry_max_interval);
                    last_error = Some(e);
                    continue;
                }
            };

            match f(client.as_ref()) {
                Ok(value) => return Ok(value),
                Err(e) if e.kind == BackendErrorKind::Transient && attempt < self.max_attempts => {
                    warn!(op, attempt, error = %e, "Transient storage failure, rebuilding client");
                    self.reset_client();
                    std::thread::sleep(interval);
                    interval = (interval * 2).min(self.retry_max_interval);
                    last_error = Some(e);
                }
                Err(e) => return Err(BackupError::Storage(format!("{}: {}", op, e))),
            }
        }

        Err(BackupError::Storage(format!(
            "{}: retries exhausted: {}",
            op,
            last_error.map(|e| e.message).unwrap_or_default()
        )))
    }

    pub fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        debug!(key, bytes = data.len(), "put");
        self.with_retry("put", |c| c.put(key, data))
    }

    pub fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.with_retry("get", |c| c.get(key))
    }

    pub fn upload_file(&self, local_path: &Path, key: &str) -> Result<()> {
        let data = std::fs::read(local_path)?;
        self.put(key, &data)
    }

    pub fn download_file(&self, key: &str, local_path: &Path) -> Result<()> {
        let data = self.get(key)?;
        if let Some(parent) = local_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(local_path, data)?;
        Ok(())
    }

    pub fn list(&self, prefix: &str, recursive: bool, absolute: bool) -> Result<Vec<String>> {
        let keys = self.with_retry("list", |c| c.list(prefix, recursive))?;
        if absolute {
            return Ok(keys);
        }
        let prefix = prefix.trim_matches('/');
        Ok(keys
            .into_iter()
            .map(|key| {
                key.trim_start_matches(prefix)
                    .trim_matches('/')
                    .to_string()
            })
            .filter(|name| !name.is_empty())
            .collect())
    }

    pub fn exists(&self, key: &str) -> Result<bool> {
        self.with_retry("exists", |c| c.exists(key))
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        self.with_retry("delete", |c| c.delete(key))
    }

    /// Delete objects in chunks of the configured bulk size, falling
    /// back to per-key deletes if the backend rejects bulk requests.
    pub fn delete_many(&self, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        for chunk in keys.chunks(self.bulk_delete_chunk_size) {
            if self.bulk_delete_enabled {
                let outcome = self.with_retry_bulk(chunk);
                match outcome {
                    Ok(()) => continue,
                    Err(unsupported) if unsupported => {
                        debug!("Bulk delete rejected by backend, falling back to per-key deletes");
                    }
                    Err(_) => {
                        return Err(BackupError::Storage(
                            "delete_many: bulk delete failed".to_string(),
                        ))
                    }
                }
            }
            for key in chunk {
                self.delete(key)?;
            }
        }
        Ok(())
    }

    /// Returns Err(true) when the backend does not support bulk delete.
    fn with_retry_bulk(&self, chunk: &[String]) -> std::result::Result<(), bool> {
        let mut interval = self.retry_base_interval;
        for attempt in 1..=self.max_attempts {
            let client = self.client().map_err(|_| false)?;
            match client.delete_many(chunk) {
                Ok(()) => return Ok(()),
                Err(e) if e.kind == BackendErrorKind::Unsupported => return Err(true),
                Err(e) if e.kind == BackendErrorKind::Transient && attempt < self.max_attempts => {
                    warn!(attempt, error = %e, "Transient bulk delete failure, rebuilding client");
                    self.reset_client();
                    std::thread::sleep(interval);
                    interval = (interval * 2).min(self.retry_max_interval);
                }
                Err(_) => return Err(false),
            }
        }
        Err(false)
    }

    pub fn create_multipart_upload(&self, key: &str) -> Result<String> {
        self.with_retry("create_multipart_upload", |c| c.create_multipart_upload(key))
    }

    pub fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: &[u8],
    ) -> Result<()> {
        self.with_retry("upload_part", |c| {
            c.upload_part(key, upload_id, part_number, data)
        })
    }

    pub fn complete_multipart_upload(&self, key: &str, upload_id: &str) -> Result<()> {
        self.with_retry("complete_multipart_upload", |c| {
            c.complete_multipart_upload(key, upload_id)
        })
    }

    /// Best-effort abort of an in-flight multipart upload.
    pub fn abort_multipart_upload(&self, key: &str, upload_id: &str) {
        if let Err(e) = self.with_retry("abort_multipart_upload", |c| {
            c.abort_multipart_upload(key, upload_id)
        }) {
            warn!(key, upload_id, error = %e, "Failed to abort multipart upload");
        }
    }

    pub fn create_multipart_download(&self, key: &str) -> Result<String> {
        if !self.exists(key)? {
            return Err(BackupError::Storage(format!("No such object: {}", key)));
        }
        let download_id = uuid::Uuid::new_v4().to_string();
        self.downloads.lock().insert(
            download_id.clone(),
            DownloadCursor {
                key: key.to_string(),
                offset: 0,
            },
        );
        Ok(download_id)
    }

    /// Read the next part of a multipart download. `Ok(None)` signals
    /// the end of the object.
    pub fn download_part(&self, download_id: &str, max_bytes: u64) -> Result<Option<Vec<u8>>> {
        let (key, offset) = {
            let downloads = self.downloads.lock();
            let cursor = downloads.get(download_id).ok_or_else(|| {
                BackupError::Storage(format!("No such multipart download: {}", download_id))
            })?;
            (cursor.key.clone(), cursor.offset)
        };

        let data = self.with_retry("download_part", |c| c.get_range(&key, offset, max_bytes))?;
        if data.is_empty() {
            return Ok(None);
        }

        if let Some(cursor) = self.downloads.lock().get_mut(download_id) {
            cursor.offset = offset + data.len() as u64;
        }
        Ok(Some(data))
    }

    pub fn complete_multipart_download(&self, download_id: &str) -> Result<()> {
        self.downloads.lock().remove(download_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::BackendError;

    /// Backend that fails a configured number of times per operation.
    struct FlakyBackend {
        inner: super::super::local::LocalBackend,
        failures_left: Arc<AtomicUsize>,
    }

    impl StorageBackend for FlakyBackend {
        fn put(&self, key: &str, data: &[u8]) -> BackendResult<()> {
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(BackendError::transient("connection reset"));
            }
            self.inner.put(key, data)
        }

        fn get(&self, key: &str) -> BackendResult<Vec<u8>> {
            self.inner.get(key)
        }

        fn get_range(&self, key: &str, offset: u64, len: u64) -> BackendResult<Vec<u8>> {
            self.inner.get_range(key, offset, len)
        }

        fn list(&self, prefix: &str, recursive: bool) -> BackendResult<Vec<String>> {
            self.inner.list(prefix, recursive)
        }

        fn exists(&self, key: &str) -> BackendResult<bool> {
            self.inner.exists(key)
        }

        fn delete(&self, key: &str) -> BackendResult<()> {
            self.inner.delete(key)
        }

        fn delete_many(&self, keys: &[String]) -> BackendResult<()> {
            self.inner.delete_many(keys)
        }

        fn create_multipart_upload(&self, key: &str) -> BackendResult<String> {
            self.inner.create_multipart_upload(key)
        }

        fn upload_part(
            &self,
            key: &str,
            upload_id: &str,
            part_number: u32,
            data: &[u8],
        ) -> BackendResult<()> {
            self.inner.upload_part(key, upload_id, part_number, data)
        }

        fn complete_multipart_upload(&self, key: &str, upload_id: &str) -> BackendResult<()> {
            self.inner.complete_multipart_upload(key, upload_id)
        }

        fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> BackendResult<()> {
            self.inner.abort_multipart_upload(key, upload_id)
        }
    }

    struct FlakyFactory {
        root: std::path::PathBuf,
        failures_left: Arc<AtomicUsize>,
    }

    impl BackendFactory for FlakyFactory {
        fn create(&self) -> BackendResult<Arc<dyn StorageBackend>> {
            Ok(Arc::new(FlakyBackend {
                inner: super::super::local::LocalBackend::new(self.root.clone())?,
                failures_left: Arc::clone(&self.failures_left),
            }))
        }
    }

    fn engine_with_failures(
        dir: &tempfile::TempDir,
        failures: usize,
        max_attempts: usize,
    ) -> StorageEngine {
        let config = StorageConfig {
            max_attempts,
            retry_base_interval_ms: 1,
            retry_max_interval_ms: 5,
            ..StorageConfig::default()
        };
        let factory = Arc::new(FlakyFactory {
            root: dir.path().to_path_buf(),
            failures_left: Arc::new(AtomicUsize::new(failures)),
        });
        StorageEngine::new(factory, &config)
    }

    #[test]
    fn test_retries_and_rebuilds_client_on_connection_resets() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with_failures(&dir, 3, 5);

        engine.put("obj", b"payload").unwrap();
        assert_eq!(engine.get("obj").unwrap(), b"payload");
        assert!(engine.client_rebuilds() >= 3);
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with_failures(&dir, 10, 3);

        let result = engine.put("obj", b"payload");
        assert!(matches!(result, Err(BackupError::Storage(_))));
    }

    #[test]
    fn test_multipart_download_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with_failures(&dir, 0, 3);
        engine.put("obj", b"0123456789").unwrap();

        let download_id = engine.create_multipart_download("obj").unwrap();
        assert_eq!(engine.download_part(&download_id, 4).unwrap().unwrap(), b"0123");
        assert_eq!(engine.download_part(&download_id, 4).unwrap().unwrap(), b"4567");
        assert_eq!(engine.download_part(&download_id, 4).unwrap().unwrap(), b"89");
        assert!(engine.download_part(&download_id, 4).unwrap().is_none());
        engine.complete_multipart_download(&download_id).unwrap();
    }

    #[test]
    fn test_relative_listing() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with_failures(&dir, 0, 3);
        engine.put("backups/b1/backup_struct.json", b"{}").unwrap();
        engine.put("backups/b2/backup_struct.json", b"{}").unwrap();

        let names = engine.list("backups", false, false).unwrap();
        assert_eq!(names, vec!["b1".to_string(), "b2".to_string()]);
    }
}

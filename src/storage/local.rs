// Local filesystem object-store backend
// Used for tests and single-host deployments; objects are plain files
// laid out by key under a root directory.

use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use uuid::Uuid;

use super::{BackendError, BackendFactory, BackendResult, StorageBackend};

const MULTIPART_DIR: &str = ".multipart";

pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    pub fn new(root: PathBuf) -> BackendResult<Self> {
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn object_path(&self, key: &str) -> PathBuf {
        self.root.join(key.trim_start_matches('/'))
    }

    fn upload_dir(&self, upload_id: &str) -> PathBuf {
        self.root.join(MULTIPART_DIR).join(upload_id)
    }

    fn collect_keys(&self, dir: &Path, prefix: &str, out: &mut Vec<String>) -> BackendResult<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name == MULTIPART_DIR {
                continue;
            }
            let key = crate::util::join_key(prefix, &name);
            if entry.file_type()?.is_dir() {
                self.collect_keys(&entry.path(), &key, out)?;
            } else {
                out.push(key);
            }
        }
        Ok(())
    }
}

impl StorageBackend for LocalBackend {
    fn put(&self, key: &str, data: &[u8]) -> BackendResult<()> {
        let path = self.object_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, data)?;
        Ok(())
    }

    fn get(&self, key: &str) -> BackendResult<Vec<u8>> {
        fs::read(self.object_path(key)).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                BackendError::not_found(format!("No such object: {}", key))
            } else {
                e.into()
            }
        })
    }

    fn get_range(&self, key: &str, offset: u64, len: u64) -> BackendResult<Vec<u8>> {
        let mut file = fs::File::open(self.object_path(key)).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                BackendError::not_found(format!("No such object: {}", key))
            } else {
                BackendError::from(e)
            }
        })?;
        let size = file.metadata()?.len();
        if offset >= size {
            return Ok(Vec::new());
        }
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len.min(size - offset) as usize];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn list(&self, prefix: &str, recursive: bool) -> BackendResult<Vec<String>> {
        let prefix = prefix.trim_matches('/');
        let dir = self.root.join(prefix);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut keys = Vec::new();
        if recursive {
            self.collect_keys(&dir, prefix, &mut keys)?;
        } else {
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().to_string();
                if name == MULTIPART_DIR {
                    continue;
                }
                let key = crate::util::join_key(prefix, &name);
                if entry.file_type()?.is_dir() {
                    keys.push(format!("{}/", key));
                } else {
                    keys.push(key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn exists(&self, key: &str) -> BackendResult<bool> {
        Ok(self.object_path(key).is_file())
    }

    fn delete(&self, key: &str) -> BackendResult<()> {
        let path = self.object_path(key);
        match fs::remove_file(&path) {
            Ok(()) => {
                // Object stores have no directories; drop empty ones so
                // deleted prefixes disappear from listings.
                let mut parent = path.parent();
                while let Some(dir) = parent {
                    if dir == self.root || fs::remove_dir(dir).is_err() {
                        break;
                    }
                    parent = dir.parent();
                }
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn delete_many(&self, keys: &[String]) -> BackendResult<()> {
        for key in keys {
            self.delete(key)?;
        }
        Ok(())
    }

    fn create_multipart_upload(&self, _key: &str) -> BackendResult<String> {
        let upload_id = Uuid::new_v4().to_string();
        fs::create_dir_all(self.upload_dir(&upload_id))?;
        Ok(upload_id)
    }

    fn upload_part(
        &self,
        _key: &str,
        upload_id: &str,
        part_number: u32,
        data: &[u8],
    ) -> BackendResult<()> {
        let dir = self.upload_dir(upload_id);
        if !dir.is_dir() {
            return Err(BackendError::permanent(format!(
                "No such multipart upload: {}",
                upload_id
            )));
        }
        fs::write(dir.join(format!("{:010}", part_number)), data)?;
        Ok(())
    }

    fn complete_multipart_upload(&self, key: &str, upload_id: &str) -> BackendResult<()> {
        let dir = self.upload_dir(upload_id);
        let mut part_files: Vec<PathBuf> = fs::read_dir(&dir)?
            .map(|e| e.map(|e| e.path()))
            .collect::<std::io::Result<_>>()?;
        part_files.sort();

        let path = self.object_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = fs::File::create(&path)?;
        for part_file in &part_files {
            let data = fs::read(part_file)?;
            out.write_all(&data)?;
        }
        out.sync_all()?;
        fs::remove_dir_all(&dir)?;
        Ok(())
    }

    fn abort_multipart_upload(&self, _key: &str, upload_id: &str) -> BackendResult<()> {
        match fs::remove_dir_all(self.upload_dir(upload_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

pub struct LocalBackendFactory {
    root: PathBuf,
}

impl LocalBackendFactory {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

impl BackendFactory for LocalBackendFactory {
    fn create(&self) -> BackendResult<Arc<dyn StorageBackend>> {
        Ok(Arc::new(LocalBackend::new(self.root.clone())?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> (tempfile::TempDir, LocalBackend) {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path().to_path_buf()).unwrap();
        (dir, backend)
    }

    #[test]
    fn test_put_get_roundtrip() {
        let (_dir, backend) = backend();
        backend.put("backups/b1/meta.json", b"{}").unwrap();
        assert_eq!(backend.get("backups/b1/meta.json").unwrap(), b"{}");
        assert!(backend.exists("backups/b1/meta.json").unwrap());
        assert!(!backend.exists("backups/b1/other.json").unwrap());
    }

    #[test]
    fn test_ranged_get_and_eof() {
        let (_dir, backend) = backend();
        backend.put("obj", b"0123456789").unwrap();
        assert_eq!(backend.get_range("obj", 2, 3).unwrap(), b"234");
        assert_eq!(backend.get_range("obj", 8, 10).unwrap(), b"89");
        assert!(backend.get_range("obj", 10, 4).unwrap().is_empty());
    }

    #[test]
    fn test_list_non_recursive_marks_prefixes() {
        let (_dir, backend) = backend();
        backend.put("backups/b1/meta.json", b"x").unwrap();
        backend.put("backups/b2/meta.json", b"x").unwrap();
        let names = backend.list("backups", false).unwrap();
        assert_eq!(names, vec!["backups/b1/".to_string(), "backups/b2/".to_string()]);
    }

    #[test]
    fn test_delete_is_idempotent() {
        let (_dir, backend) = backend();
        backend.put("obj", b"x").unwrap();
        backend.delete("obj").unwrap();
        backend.delete("obj").unwrap();
        assert!(!backend.exists("obj").unwrap());
    }

    #[test]
    fn test_multipart_assembles_in_part_number_order() {
        let (_dir, backend) = backend();
        let upload_id = backend.create_multipart_upload("obj").unwrap();
        // parts uploaded out of order
        backend.upload_part("obj", &upload_id, 2, b"BBB").unwrap();
        backend.upload_part("obj", &upload_id, 1, b"AAA").unwrap();
        backend.upload_part("obj", &upload_id, 3, b"C").unwrap();
        backend.complete_multipart_upload("obj", &upload_id).unwrap();
        assert_eq!(backend.get("obj").unwrap(), b"AAABBBC");
    }

    #[test]
    fn test_multipart_abort_discards_parts() {
        let (_dir, backend) = backend();
        let upload_id = backend.create_multipart_upload("obj").unwrap();
        backend.upload_part("obj", &upload_id, 1, b"AAA").unwrap();
        backend.abort_multipart_upload("obj", &upload_id).unwrap();
        assert!(!backend.exists("obj").unwrap());
        assert!(backend.list("", true).unwrap().is_empty());
    }
}

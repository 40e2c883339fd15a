// Configuration model - explicit structs with enumerated options
// Unknown keys are rejected at load time; forward compatibility lives in
// the on-disk backup metadata schema, not here.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{BackupError, Result};

const KIB: u64 = 1024;
const MIB: u64 = 1024 * 1024;

/// Top-level configuration for all components.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    pub main: MainConfig,
    pub backup: BackupConfig,
    pub storage: StorageConfig,
    pub encryption: EncryptionConfig,
    pub compression: CompressionConfig,
    pub filesystem: FilesystemConfig,
    pub rate_limiter: RateLimiterConfig,
    pub pipeline: PipelineConfig,
    pub database: DatabaseConfig,
    pub lock: LockConfig,
}

impl Config {
    /// Load configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Config> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| BackupError::Configuration(format!("Failed to read {}: {}", path.display(), e)))?;
        let config: Config = serde_json::from_str(&data)
            .map_err(|e| BackupError::Configuration(format!("Failed to parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.backup.path_root.is_empty() {
            return Err(BackupError::Configuration(
                "backup.path_root is required".to_string(),
            ));
        }
        match self.storage.kind {
            StorageKind::S3 => {
                let creds = &self.storage.credentials;
                if creds.bucket.is_empty() || creds.endpoint_url.is_empty() {
                    return Err(BackupError::Configuration(
                        "storage.credentials.bucket and endpoint_url are required for s3 storage"
                            .to_string(),
                    ));
                }
            }
            StorageKind::Local => {
                if self.storage.local_root.as_os_str().is_empty() {
                    return Err(BackupError::Configuration(
                        "storage.local_root is required for local storage".to_string(),
                    ));
                }
            }
        }
        if let EncryptionKind::Aes256Gcm = self.encryption.kind {
            if self.encryption.key.is_empty() {
                return Err(BackupError::Configuration(
                    "encryption.key is required for aes_256_gcm encryption".to_string(),
                ));
            }
        }
        if self.storage.chunk_size == 0 || self.storage.chunk_size > self.storage.buffer_size {
            return Err(BackupError::Configuration(
                "storage.chunk_size must be non-zero and not greater than storage.buffer_size"
                    .to_string(),
            ));
        }
        if self.encryption.chunk_size == 0 || self.encryption.chunk_size > self.encryption.buffer_size {
            return Err(BackupError::Configuration(
                "encryption.chunk_size must be non-zero and not greater than encryption.buffer_size"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct MainConfig {
    /// CA bundle paths exported to the HTTP client.
    pub ca_bundle: Vec<PathBuf>,
    pub user: Option<String>,
    pub group: Option<String>,
}

impl Default for MainConfig {
    fn default() -> Self {
        Self {
            ca_bundle: Vec::new(),
            user: None,
            group: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BackupConfig {
    /// Remote key prefix all backups live under.
    pub path_root: String,
    pub exclude_dbs: Vec<String>,
    pub deduplicate_parts: bool,
    /// Age limit for dedup candidates, seconds.
    pub deduplication_age_limit_secs: u64,
    /// Minimum interval between backups, seconds. 0 disables the check.
    pub min_interval_secs: u64,
    /// strftime-style format for metadata timestamps.
    pub time_format: String,
    /// Maximum age of backups to keep on purge, seconds. 0 disables the rule.
    pub retain_time_secs: u64,
    /// Number of most recent valid backups to keep on purge.
    pub retain_count: Option<usize>,
    /// User labels recorded into backup metadata.
    pub labels: std::collections::HashMap<String, String>,
    pub keep_frozen_data_on_failure: bool,
    pub override_replica_name: Option<String>,
    pub force_non_replicated: bool,
    pub backup_access_control: bool,
    pub restore_context_path: PathBuf,
    pub validate_part_after_upload: bool,
    pub restore_fail_on_attach_error: bool,
    /// Interval of periodic metadata re-upload during part upload, seconds.
    pub update_metadata_interval_secs: u64,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            path_root: String::new(),
            exclude_dbs: Vec::new(),
            deduplicate_parts: true,
            deduplication_age_limit_secs: 7 * 86400,
            min_interval_secs: 0,
            time_format: "%Y-%m-%d %H:%M:%S%.6f %z".to_string(),
            retain_time_secs: 0,
            retain_count: None,
            labels: std::collections::HashMap::new(),
            keep_frozen_data_on_failure: true,
            override_replica_name: Some("{replica}".to_string()),
            force_non_replicated: false,
            backup_access_control: false,
            restore_context_path: PathBuf::from("/tmp/rusty_backup_restore_state.json"),
            validate_part_after_upload: false,
            restore_fail_on_attach_error: false,
            update_metadata_interval_secs: 300,
        }
    }
}

/// Storage backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    S3,
    Local,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct StorageCredentials {
    pub endpoint_url: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub bucket: String,
    pub region: String,
}

impl Default for StorageCredentials {
    fn default() -> Self {
        Self {
            endpoint_url: String::new(),
            access_key_id: String::new(),
            secret_access_key: String::new(),
            bucket: String::new(),
            region: "us-east-1".to_string(),
        }
    }
}

/// Service that provides proxy connection settings at runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ProxyResolverConfig {
    pub uri: Option<String>,
    pub proxy_port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct StorageConfig {
    #[serde(rename = "type")]
    pub kind: StorageKind,
    pub credentials: StorageCredentials,
    /// Root directory of the local backend.
    pub local_root: PathBuf,
    pub proxy_resolver: ProxyResolverConfig,
    /// Chunk size used when uploading / downloading data, bytes.
    pub chunk_size: u64,
    pub buffer_size: u64,
    /// Maximum number of chunks an object may be split into. If
    /// data_size > chunk_size * max_chunk_count, the chunk size is
    /// multiplied as many times as needed to satisfy the limit.
    pub max_chunk_count: u64,
    pub bulk_delete_enabled: bool,
    pub bulk_delete_chunk_size: usize,
    /// Worker count of the multipart uploading stage.
    pub uploading_threads: usize,
    pub queue_size: usize,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub max_attempts: usize,
    pub retry_base_interval_ms: u64,
    pub retry_max_interval_ms: u64,
    pub verify_tls: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            kind: StorageKind::S3,
            credentials: StorageCredentials::default(),
            local_root: PathBuf::new(),
            proxy_resolver: ProxyResolverConfig::default(),
            chunk_size: 8 * MIB,
            buffer_size: 32 * MIB,
            max_chunk_count: 10_000,
            bulk_delete_enabled: true,
            bulk_delete_chunk_size: 1000,
            uploading_threads: 4,
            queue_size: 10,
            connect_timeout_secs: 10,
            read_timeout_secs: 180,
            max_attempts: 5,
            retry_base_interval_ms: 100,
            retry_max_interval_ms: 30_000,
            verify_tls: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncryptionKind {
    Aes256Gcm,
    Noop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct EncryptionConfig {
    #[serde(rename = "type")]
    pub kind: EncryptionKind,
    /// Hex-encoded 256-bit key.
    pub key: String,
    /// Chunk size used when encrypting / decrypting data, bytes.
    pub chunk_size: u64,
    pub buffer_size: u64,
    pub queue_size: usize,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            kind: EncryptionKind::Aes256Gcm,
            key: String::new(),
            chunk_size: 8 * MIB,
            buffer_size: 32 * MIB,
            queue_size: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionKind {
    Gzip,
    Noop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CompressionConfig {
    #[serde(rename = "type")]
    pub kind: CompressionKind,
    pub level: u32,
    pub queue_size: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            kind: CompressionKind::Gzip,
            level: 6,
            queue_size: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct FilesystemConfig {
    /// Chunk size used when reading from / writing to the filesystem, bytes.
    pub chunk_size: u64,
    pub buffer_size: u64,
    pub queue_size: usize,
}

impl Default for FilesystemConfig {
    fn default() -> Self {
        Self {
            chunk_size: MIB,
            buffer_size: 32 * MIB,
            queue_size: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RateLimiterConfig {
    /// Upper bound of upload traffic, bytes per second. 0 is unlimited.
    pub max_upload_rate: u64,
    /// Wait before the next token-bucket attempt, milliseconds.
    pub retry_interval_ms: u64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_upload_rate: 0,
            retry_interval_ms: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PipelineConfig {
    /// Worker threads executing whole pipelines as background jobs.
    /// 0 means run pipelines in the calling thread.
    pub workers: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get().min(4),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DatabaseConfig {
    pub protocol: String,
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
    pub connect_timeout_secs: u64,
    pub timeout_secs: u64,
    pub freeze_timeout_secs: u64,
    pub unfreeze_timeout_secs: u64,
    /// Local directory holding access control definitions.
    pub access_control_path: PathBuf,
    /// Filesystem owner of restored detached parts.
    pub owner_user: Option<String>,
    pub owner_group: Option<String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            protocol: "http".to_string(),
            host: "localhost".to_string(),
            port: 8123,
            user: None,
            password: None,
            connect_timeout_secs: 10,
            timeout_secs: 90,
            freeze_timeout_secs: 45 * 60,
            unfreeze_timeout_secs: 60 * 60,
            access_control_path: PathBuf::from("/var/lib/rustydb/access"),
            owner_user: None,
            owner_group: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LockConfig {
    pub flock: bool,
    pub flock_path: PathBuf,
    pub distributed: bool,
    pub lock_timeout_secs: u64,
    /// Exit code reported on lock contention.
    pub exitcode: i32,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            flock: false,
            flock_path: PathBuf::from("/tmp/rusty_backup.lock"),
            distributed: false,
            lock_timeout_secs: 60,
            exitcode: 3,
        }
    }
}

/// Parse a human-readable size for tests and tooling (e.g. "8 MiB").
pub fn parse_size(value: &str) -> Option<u64> {
    let value = value.trim();
    let split = value.find(|c: char| !c.is_ascii_digit())?;
    let (num, unit) = value.split_at(split);
    let num: u64 = num.parse().ok()?;
    match unit.trim() {
        "" | "B" => Some(num),
        "KiB" => Some(num * KIB),
        "MiB" => Some(num * MIB),
        "GiB" => Some(num * 1024 * MIB),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_consistent() {
        let config = Config::default();
        assert_eq!(config.storage.chunk_size, 8 * MIB);
        assert!(config.storage.chunk_size <= config.storage.buffer_size);
        assert_eq!(config.backup.deduplication_age_limit_secs, 7 * 86400);
        assert!(config.backup.keep_frozen_data_on_failure);
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let raw = r#"{"backup": {"path_root": "backups", "no_such_option": 1}}"#;
        let parsed: std::result::Result<Config, _> = serde_json::from_str(raw);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_validate_requires_path_root() {
        let config = Config::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("8 MiB"), Some(8 * MIB));
        assert_eq!(parse_size("512"), Some(512));
        assert_eq!(parse_size("1 GiB"), Some(1024 * MIB));
        assert_eq!(parse_size("oops"), None);
    }
}

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Database control error: {0}")]
    DatabaseControl(String),

    #[error("Metadata error: {0}")]
    Metadata(String),

    #[error("Backup not found: {0}")]
    BackupNotFound(String),

    #[error("Deduplication error: {0}")]
    Dedup(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Pipeline error: {0}")]
    Pipeline(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Restore error: {0}")]
    Restore(String),
}

pub type Result<T> = std::result::Result<T, BackupError>;

impl BackupError {
    /// Exit code reported by the CLI for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            BackupError::Lock(_) => 3,
            BackupError::Configuration(_) => 2,
            _ => 1,
        }
    }
}

impl From<serde_json::Error> for BackupError {
    fn from(e: serde_json::Error) -> Self {
        BackupError::Serialization(e.to_string())
    }
}

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Connection error for server {server}: {message}")]
    Connection { server: String, message: String },

    #[error("Dump failed: {0}")]
    Dump(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Storage write failed: {0}")]
    StorageWrite(String),

    #[error("Upload failed: {0}")]
    Upload(String),

    #[error("Metadata store error: {0}")]
    Metadata(String),

    #[error("Backup not found: {0}")]
    NotFound(String),

    #[error("Invalid status transition for backup {id}: {from} -> {to}")]
    InvalidTransition { id: String, from: String, to: String },

    #[error("Another task is already running: {0}")]
    Conflict(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Serde JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),
}

impl BackupError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, BackupError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, BackupError::Conflict(_))
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;

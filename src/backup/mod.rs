//! Backup and restore core: connection brokering, job observability,
//! database selection, artifact storage and path safety.

pub mod connection;
pub mod job;
pub mod naming;
pub mod path_safety;
pub mod runner;
pub mod selector;
pub mod ssh_tunnel;
pub mod storage;
pub mod tester;
pub mod tunnel;

use std::time::Duration;

use self::job::JobStatus;
use self::path_safety::PathRejection;

/// Failures raised by the SSH tunnel provider
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("failed to establish SSH tunnel: {0}")]
    Establish(String),

    #[error("SSH tunnel was not ready after {0:?}")]
    Timeout(Duration),

    #[error("failed to close SSH tunnel: {0}")]
    Close(String),

    #[error("unsupported SSH configuration: {0}")]
    Unsupported(String),
}

/// Error type for backup, restore and artifact retrieval operations
#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unsafe path: {0}")]
    UnsafePath(#[from] PathRejection),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Unsupported storage type: {0}")]
    UnsupportedStorageType(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Dump command failed: {0}")]
    Dump(String),

    #[error("Snapshot not found")]
    SnapshotNotFound,

    #[error("Artifact not found: {0}")]
    ArtifactNotFound(String),

    #[error("Invalid job transition from {from} to {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },
}

impl From<sqlx::Error> for BackupError {
    fn from(error: sqlx::Error) -> Self {
        BackupError::Database(error.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for BackupError {
    fn from(error: sqlx::migrate::MigrateError) -> Self {
        BackupError::Database(error.to_string())
    }
}

/// Result type for backup operations
pub type Result<T> = std::result::Result<T, BackupError>;

//! Error types for the backup, recovery, and scheduling engines.

use std::path::PathBuf;

use thiserror::Error;

use strata_core::model::RestoreInfo;
use strata_core::DatabaseError;

/// Errors from the external snapshot/restore tool.
#[derive(Debug, Error)]
pub enum ToolError {
    /// The program could not be started.
    #[error("failed to run {program}: {source}")]
    Spawn {
        /// Program name.
        program: String,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The program exited unsuccessfully.
    #[error("{program} exited with {}: {stderr}", exit_label(.code))]
    Failed {
        /// Program name.
        program: String,
        /// Exit code, `None` when killed by a signal.
        code: Option<i32>,
        /// Captured standard error.
        stderr: String,
    },

    /// The requested mode is not supported by this tool.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {}", code),
        None => "signal".to_string(),
    }
}

/// Errors from remote object storage.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Object store error.
    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    /// Local file error while staging an object.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid storage configuration.
    #[error("invalid storage configuration: {0}")]
    InvalidConfig(String),
}

/// Errors from the artifact catalog.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// Sled error.
    #[error("catalog storage error: {0}")]
    Storage(#[from] sled::Error),

    /// Encoding or decoding failed.
    #[error("catalog serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Backup engine errors.
#[derive(Debug, Error)]
pub enum BackupError {
    /// The snapshot job failed; the backup is recorded as failed.
    #[error("backup {backup_id} failed: {message}")]
    BackupFailed {
        /// Backup id.
        backup_id: String,
        /// Failure reason (tool stderr or IO error).
        message: String,
    },

    /// No backup with this id.
    #[error("backup not found: {0}")]
    NotFound(String),

    /// Artifact file error.
    #[error("artifact I/O error for backup {backup_id}: {source}")]
    Io {
        /// Backup id.
        backup_id: String,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The backup directory could not be created.
    #[error("cannot prepare backup directory {}: {source}", .path.display())]
    Directory {
        /// Backup directory.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Catalog error.
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    /// Remote storage error.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Recovery engine errors.
#[derive(Debug, Error)]
pub enum RecoveryError {
    /// The backup did not verify; the target was not touched.
    #[error("restore {} aborted, target left untouched: {}", .0.restore_id, failure(.0))]
    VerificationFailed(Box<RestoreInfo>),

    /// The restore tool or an administrative statement failed.
    #[error("restore {} of backup {} failed: {}", .0.restore_id, .0.backup_id, failure(.0))]
    RestoreFailed(Box<RestoreInfo>),

    /// A clone could not be completed by either strategy.
    #[error("clone {} of {} into {} failed: {}", .0.restore_id, .0.backup_id, .0.target_database, failure(.0))]
    CloneFailed(Box<RestoreInfo>),

    /// Point-in-time recovery needs continuous log archiving, which is not configured.
    #[error("point-in-time recovery is not configured: continuous transaction log archiving is required")]
    PitrNotConfigured,

    /// Backup engine error.
    #[error(transparent)]
    Backup(#[from] BackupError),

    /// Database administration error.
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),
}

fn failure(info: &RestoreInfo) -> &str {
    info.error_message.as_deref().unwrap_or("unknown error")
}

impl RecoveryError {
    /// The failed restore record, when the error carries one.
    pub fn restore_info(&self) -> Option<&RestoreInfo> {
        match self {
            RecoveryError::VerificationFailed(info)
            | RecoveryError::RestoreFailed(info)
            | RecoveryError::CloneFailed(info) => Some(info),
            _ => None,
        }
    }
}

/// Scheduler errors.
#[derive(Debug, Error)]
pub enum ScheduleError {
    /// The interval cannot be turned into a run time.
    #[error("unsupported schedule interval: {0}")]
    UnsupportedInterval(String),

    /// No schedule with this name.
    #[error("schedule not found: {0}")]
    NotFound(String),

    /// The scheduler is already running.
    #[error("scheduler is already running")]
    AlreadyRunning,

    /// A manually triggered backup failed.
    #[error(transparent)]
    Backup(#[from] BackupError),
}

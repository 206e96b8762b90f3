//! Migration-specific error types.

use std::path::PathBuf;

use thiserror::Error;

use crate::error::DatabaseError;

/// Migration-specific errors.
///
/// Every variant tied to a single migration carries its version.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// A definition is malformed (empty version, empty description, bad file layout).
    #[error("invalid migration definition: {0}")]
    InvalidDefinition(String),

    /// Two loaded definitions share a version.
    #[error("duplicate migration version: {0}")]
    DuplicateVersion(String),

    /// The pre-check rejected the migration; the batch was aborted.
    #[error("pre-check failed for migration {version}: {reason}")]
    PreCheckFailed {
        /// Migration version.
        version: String,
        /// Why the check failed.
        reason: String,
    },

    /// The post-check rejected the migration; its transaction was rolled back.
    #[error("post-check failed for migration {version}: {reason}")]
    PostCheckFailed {
        /// Migration version.
        version: String,
        /// Why the check failed.
        reason: String,
    },

    /// `up` (or committing it) failed.
    #[error("migration {version} failed: {source}")]
    Apply {
        /// Migration version.
        version: String,
        /// Underlying database error.
        #[source]
        source: DatabaseError,
    },

    /// `down` (or committing it) failed.
    #[error("rollback of migration {version} failed: {source}")]
    Rollback {
        /// Migration version.
        version: String,
        /// Underlying database error.
        #[source]
        source: DatabaseError,
    },

    /// A ledger row has no loaded definition, so it cannot be rolled back.
    #[error("migration {0} is recorded in the ledger but no definition is loaded")]
    MissingDefinition(String),

    /// A ledger row could not be decoded.
    #[error("corrupt ledger row for migration {version}: {reason}")]
    CorruptLedger {
        /// Migration version.
        version: String,
        /// What was wrong with the row.
        reason: String,
    },

    /// Reading migration files failed.
    #[error("failed to read migrations from {path}: {source}")]
    Io {
        /// Path being read.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Ledger access failed.
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),
}

impl MigrationError {
    /// Version of the migration this error concerns, if any.
    pub fn version(&self) -> Option<&str> {
        match self {
            MigrationError::DuplicateVersion(version) | MigrationError::MissingDefinition(version) => {
                Some(version)
            }
            MigrationError::PreCheckFailed { version, .. }
            | MigrationError::PostCheckFailed { version, .. }
            | MigrationError::Apply { version, .. }
            | MigrationError::Rollback { version, .. }
            | MigrationError::CorruptLedger { version, .. } => Some(version),
            _ => None,
        }
    }
}

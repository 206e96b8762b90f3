//! Core error types.

use thiserror::Error;

/// Database access errors.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// SQLite driver error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// PostgreSQL driver error.
    #[cfg(feature = "postgres")]
    #[error("postgres error: {0}")]
    Postgres(#[from] sqlx::Error),

    /// A statement failed for a reason reported by the caller.
    #[error("statement failed: {0}")]
    Statement(String),

    /// A column could not be read as the requested type.
    #[error("column {column} has unexpected type: expected {expected}")]
    ColumnType {
        /// Column name or index.
        column: String,
        /// Expected type name.
        expected: &'static str,
    },

    /// A column was requested that the row does not contain.
    #[error("column not found: {0}")]
    ColumnNotFound(String),

    /// The transaction was already committed or rolled back.
    #[error("transaction already finished")]
    TransactionFinished,

    /// Invalid connection parameters.
    #[error("invalid connection parameters: {0}")]
    InvalidConnection(String),

    /// Operation not supported by this driver.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// A blocking driver call panicked or was cancelled.
    #[error("database worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

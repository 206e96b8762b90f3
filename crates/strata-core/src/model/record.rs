//! Migration ledger rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A row of the migration ledger: one successfully applied migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    /// Migration version (primary key).
    pub version: String,
    /// Description copied from the definition.
    pub description: String,
    /// Author copied from the definition.
    pub author: String,
    /// When the migration was committed.
    pub applied_at: DateTime<Utc>,
    /// Duration of `up`.
    pub execution_time_ms: u64,
    /// Hex SHA-256 of the rendered operations, for drift detection.
    pub checksum: Option<String>,
}

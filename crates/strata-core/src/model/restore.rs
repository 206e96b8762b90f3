//! Restore and clone records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// State of a restore or clone operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreStatus {
    /// Created, nothing done yet.
    Pending,
    /// Verification passed, target being rebuilt.
    InProgress,
    /// Target rebuilt.
    Completed,
    /// Aborted; see `error_message`.
    Failed,
}

impl std::fmt::Display for RestoreStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RestoreStatus::Pending => write!(f, "pending"),
            RestoreStatus::InProgress => write!(f, "in_progress"),
            RestoreStatus::Completed => write!(f, "completed"),
            RestoreStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Record of one restore or clone operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreInfo {
    /// Unique id of this operation.
    pub restore_id: String,
    /// Source backup id. For clones, the source database name.
    pub backup_id: String,
    /// Source database, for clones.
    #[serde(default)]
    pub source_database: Option<String>,
    /// Database being rebuilt.
    pub target_database: String,
    /// Current state.
    pub status: RestoreStatus,
    /// When the operation started.
    pub started_at: DateTime<Utc>,
    /// When the operation reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// Failure reason.
    pub error_message: Option<String>,
}

impl RestoreInfo {
    /// Create a pending restore of `backup_id` into `target_database`.
    pub fn new(
        restore_id: impl Into<String>,
        backup_id: impl Into<String>,
        target_database: impl Into<String>,
    ) -> Self {
        Self {
            restore_id: restore_id.into(),
            backup_id: backup_id.into(),
            source_database: None,
            target_database: target_database.into(),
            status: RestoreStatus::Pending,
            started_at: Utc::now(),
            completed_at: None,
            error_message: None,
        }
    }

    /// Create a pending clone of `source` into `target`.
    pub fn clone_of(restore_id: impl Into<String>, source: &str, target: &str) -> Self {
        let mut info = Self::new(restore_id, source, target);
        info.source_database = Some(source.to_string());
        info
    }

    /// Mark as running.
    pub fn start(&mut self) {
        self.status = RestoreStatus::InProgress;
    }

    /// Mark as completed.
    pub fn complete(&mut self) {
        self.status = RestoreStatus::Completed;
        self.completed_at = Some(Utc::now());
    }

    /// Mark as failed.
    pub fn fail(&mut self, message: impl Into<String>) {
        self.status = RestoreStatus::Failed;
        self.completed_at = Some(Utc::now());
        self.error_message = Some(message.into());
    }

    /// Whether the operation finished, successfully or not.
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, RestoreStatus::Completed | RestoreStatus::Failed)
    }
}

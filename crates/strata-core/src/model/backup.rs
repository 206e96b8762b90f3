//! Backup artifact metadata.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Kind of backup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupType {
    /// Complete logical snapshot.
    #[default]
    Full,
    /// Changes since the previous backup of any type.
    Incremental,
    /// Changes since the previous full backup.
    Differential,
    /// Archived transaction log segment.
    TransactionLog,
}

impl BackupType {
    /// All backup types, in declaration order.
    pub const ALL: [BackupType; 4] = [
        BackupType::Full,
        BackupType::Incremental,
        BackupType::Differential,
        BackupType::TransactionLog,
    ];

    /// Stable lowercase name, used in file names and remote keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupType::Full => "full",
            BackupType::Incremental => "incremental",
            BackupType::Differential => "differential",
            BackupType::TransactionLog => "transaction_log",
        }
    }
}

impl std::fmt::Display for BackupType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a backup type name is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown backup type '{0}'")]
pub struct ParseBackupTypeError(pub String);

impl FromStr for BackupType {
    type Err = ParseBackupTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "full" => Ok(BackupType::Full),
            "incremental" => Ok(BackupType::Incremental),
            "differential" => Ok(BackupType::Differential),
            "transaction_log" | "wal" => Ok(BackupType::TransactionLog),
            _ => Err(ParseBackupTypeError(s.to_string())),
        }
    }
}

/// Lifecycle state of a backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    /// Allocated, tool not started.
    Pending,
    /// Snapshot tool running.
    InProgress,
    /// Artifact written and checksummed.
    Completed,
    /// Snapshot tool failed.
    Failed,
    /// Artifact no longer matches its checksum.
    Corrupted,
}

impl std::fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackupStatus::Pending => write!(f, "pending"),
            BackupStatus::InProgress => write!(f, "in_progress"),
            BackupStatus::Completed => write!(f, "completed"),
            BackupStatus::Failed => write!(f, "failed"),
            BackupStatus::Corrupted => write!(f, "corrupted"),
        }
    }
}

/// Metadata of one backup artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupInfo {
    /// Globally unique id (UUID v4).
    pub backup_id: String,
    /// Kind of backup.
    pub backup_type: BackupType,
    /// Current state.
    pub status: BackupStatus,
    /// When the job started.
    pub started_at: DateTime<Utc>,
    /// When the job reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// Artifact size.
    pub size_bytes: u64,
    /// Local artifact location.
    pub file_path: PathBuf,
    /// Hex SHA-256 of the artifact.
    pub checksum: Option<String>,
    /// Whether the tool compressed the artifact.
    pub compression: bool,
    /// Whether the artifact is encrypted.
    pub encryption: bool,
    /// Free-form metadata (`error`, `remote_key`, `database`, ...).
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl BackupInfo {
    /// Metadata key holding the failure reason.
    pub const ERROR_KEY: &'static str = "error";
    /// Metadata key holding the remote object key.
    pub const REMOTE_KEY: &'static str = "remote_key";
    /// Metadata key overriding the retention window for this backup.
    pub const RETENTION_KEY: &'static str = "retention_days";

    /// Create a record for a job that is starting now.
    pub fn in_progress(
        backup_id: impl Into<String>,
        backup_type: BackupType,
        file_path: impl Into<PathBuf>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            backup_id: backup_id.into(),
            backup_type,
            status: BackupStatus::InProgress,
            started_at,
            completed_at: None,
            size_bytes: 0,
            file_path: file_path.into(),
            checksum: None,
            compression: false,
            encryption: false,
            metadata: BTreeMap::new(),
        }
    }

    /// Mark the backup completed.
    pub fn complete(&mut self, size_bytes: u64, checksum: impl Into<String>, at: DateTime<Utc>) {
        self.status = BackupStatus::Completed;
        self.size_bytes = size_bytes;
        self.checksum = Some(checksum.into());
        self.completed_at = Some(at);
    }

    /// Mark the backup failed.
    pub fn fail(&mut self, error: impl Into<String>, at: DateTime<Utc>) {
        self.status = BackupStatus::Failed;
        self.completed_at = Some(at);
        self.metadata.insert(Self::ERROR_KEY.to_string(), error.into());
    }

    /// Whether the record can no longer change (except by deletion).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            BackupStatus::Completed | BackupStatus::Failed | BackupStatus::Corrupted
        )
    }

    /// Whether the backup completed successfully.
    pub fn is_completed(&self) -> bool {
        self.status == BackupStatus::Completed
    }

    /// Remote object key, if uploaded.
    pub fn remote_key(&self) -> Option<&str> {
        self.metadata.get(Self::REMOTE_KEY).map(String::as_str)
    }

    /// Retention override, if the backup carries one.
    pub fn retention_days(&self) -> Option<u32> {
        self.metadata
            .get(Self::RETENTION_KEY)
            .and_then(|days| days.parse().ok())
    }

    /// Failure reason, if failed.
    pub fn error(&self) -> Option<&str> {
        self.metadata.get(Self::ERROR_KEY).map(String::as_str)
    }

    /// Artifact file name.
    pub fn file_name(&self) -> Option<String> {
        self.file_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
    }

    /// Age of the backup relative to `now`.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.started_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> BackupInfo {
        BackupInfo::in_progress(
            "b1",
            BackupType::Full,
            "/tmp/backup_full_20240101_000000_b1.dump",
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        )
    }

    #[test]
    fn test_backup_type_parse_and_display() {
        for backup_type in BackupType::ALL {
            assert_eq!(backup_type.to_string().parse::<BackupType>().unwrap(), backup_type);
        }
        assert_eq!("Transaction-Log".parse::<BackupType>().unwrap(), BackupType::TransactionLog);
        assert!("nightly".parse::<BackupType>().is_err());
    }

    #[test]
    fn test_backup_type_serde_names() {
        let json = serde_json::to_string(&BackupType::TransactionLog).unwrap();
        assert_eq!(json, "\"transaction_log\"");
    }

    #[test]
    fn test_backup_lifecycle_complete() {
        let mut info = sample();
        assert_eq!(info.status, BackupStatus::InProgress);
        assert!(!info.is_terminal());

        let done = Utc.with_ymd_and_hms(2024, 1, 1, 0, 5, 0).unwrap();
        info.complete(1024, "abc", done);
        assert!(info.is_completed());
        assert!(info.is_terminal());
        assert_eq!(info.size_bytes, 1024);
        assert_eq!(info.checksum.as_deref(), Some("abc"));
        assert_eq!(info.completed_at, Some(done));
    }

    #[test]
    fn test_backup_lifecycle_fail() {
        let mut info = sample();
        info.fail("pg_dump exited with 1", Utc::now());
        assert_eq!(info.status, BackupStatus::Failed);
        assert_eq!(info.error(), Some("pg_dump exited with 1"));
        assert!(info.is_terminal());
    }

    #[test]
    fn test_retention_override() {
        let mut info = sample();
        assert_eq!(info.retention_days(), None);
        info.metadata.insert(BackupInfo::RETENTION_KEY.to_string(), "28".to_string());
        assert_eq!(info.retention_days(), Some(28));
    }

    #[test]
    fn test_file_name_and_age() {
        let info = sample();
        assert_eq!(info.file_name().as_deref(), Some("backup_full_20240101_000000_b1.dump"));
        let later = Utc.with_ymd_and_hms(2024, 1, 3, 0, 0, 0).unwrap();
        assert_eq!(info.age(later).num_days(), 2);
    }
}

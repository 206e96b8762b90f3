//! Backup engine: creates, lists, verifies, and expires backup artifacts.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use strata_core::model::{BackupInfo, BackupStatus, BackupType};
use strata_core::{BackupConfig, ConnectionParams};

use crate::catalog::BackupCatalog;
use crate::error::BackupError;
use crate::retention::RetentionPolicy;
use crate::storage::ObjectStorage;
use crate::tool::{DumpRequest, SnapshotTool};

const ARTIFACT_PREFIX: &str = "backup_";
const ARTIFACT_SUFFIX: &str = ".dump";
const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Directory under `backup_dir` holding the catalog database.
pub const CATALOG_DIR: &str = "catalog";

/// File name of an artifact: `backup_<type>_<YYYYMMDD_HHMMSS>_<id>.dump`.
pub fn artifact_name(backup_type: BackupType, started_at: DateTime<Utc>, backup_id: &str) -> String {
    format!(
        "{}{}_{}_{}{}",
        ARTIFACT_PREFIX,
        backup_type.as_str(),
        started_at.format(TIMESTAMP_FORMAT),
        backup_id,
        ARTIFACT_SUFFIX
    )
}

/// Parse an artifact file name back into type, start time, and id.
pub fn parse_artifact_name(name: &str) -> Option<(BackupType, DateTime<Utc>, String)> {
    let rest = name.strip_prefix(ARTIFACT_PREFIX)?.strip_suffix(ARTIFACT_SUFFIX)?;

    for backup_type in BackupType::ALL {
        let Some(rest) = rest
            .strip_prefix(backup_type.as_str())
            .and_then(|r| r.strip_prefix('_'))
        else {
            continue;
        };
        // YYYYMMDD_HHMMSS is 15 characters, followed by `_<id>`.
        let (timestamp, id) = (rest.get(..15)?, rest.get(15..)?);
        let id = id.strip_prefix('_').filter(|id| !id.is_empty())?;
        let started_at = NaiveDateTime::parse_from_str(timestamp, TIMESTAMP_FORMAT)
            .ok()?
            .and_utc();
        return Some((backup_type, started_at, id.to_string()));
    }
    None
}

/// Per-type backup statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TypeStatistics {
    pub count: usize,
    pub total_size_bytes: u64,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

impl TypeStatistics {
    fn record(&mut self, info: &BackupInfo) {
        self.count += 1;
        self.total_size_bytes += info.size_bytes;
        self.oldest = Some(self.oldest.map_or(info.started_at, |t| t.min(info.started_at)));
        self.newest = Some(self.newest.map_or(info.started_at, |t| t.max(info.started_at)));
    }
}

/// Aggregate view of all known backups.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BackupStatistics {
    pub total_backups: usize,
    pub completed_backups: usize,
    pub failed_backups: usize,
    pub total_size_bytes: u64,
    pub oldest_backup: Option<DateTime<Utc>>,
    pub newest_backup: Option<DateTime<Utc>>,
    pub by_type: BTreeMap<BackupType, TypeStatistics>,
}

/// Size and hex SHA-256 of a file, read in chunks.
pub(crate) async fn file_digest(path: &Path) -> std::io::Result<(u64, String)> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((size, hex::encode(hasher.finalize())))
}

/// Creates and manages backup artifacts.
///
/// Backups run under a shared lock and retention cleanup under an exclusive
/// one, so cleanup never observes a half-written artifact.
pub struct BackupManager {
    config: BackupConfig,
    connection: ConnectionParams,
    tool: Arc<dyn SnapshotTool>,
    remote: Option<Arc<dyn ObjectStorage>>,
    catalog: BackupCatalog,
    cleanup_lock: RwLock<()>,
}

impl BackupManager {
    /// Create a manager. The catalog is opened under `<backup_dir>/catalog`.
    pub fn new(
        config: BackupConfig,
        connection: ConnectionParams,
        tool: Arc<dyn SnapshotTool>,
    ) -> Result<Self, BackupError> {
        std::fs::create_dir_all(&config.backup_dir).map_err(|source| BackupError::Directory {
            path: config.backup_dir.clone(),
            source,
        })?;
        let catalog = BackupCatalog::open_path(&config.backup_dir.join(CATALOG_DIR))?;
        Ok(Self::with_parts(config, connection, tool, catalog))
    }

    fn with_parts(
        config: BackupConfig,
        connection: ConnectionParams,
        tool: Arc<dyn SnapshotTool>,
        catalog: BackupCatalog,
    ) -> Self {
        Self {
            config,
            connection,
            tool,
            remote: None,
            catalog,
            cleanup_lock: RwLock::new(()),
        }
    }

    /// Also store artifacts in remote object storage.
    pub fn with_remote(mut self, remote: Arc<dyn ObjectStorage>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Use a specific catalog.
    pub fn with_catalog(mut self, catalog: BackupCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    pub fn connection(&self) -> &ConnectionParams {
        &self.connection
    }

    pub fn catalog(&self) -> &BackupCatalog {
        &self.catalog
    }

    fn remote_prefix(&self) -> String {
        self.config
            .remote
            .as_ref()
            .map(|r| r.prefix.trim_matches('/').to_string())
            .unwrap_or_default()
    }

    /// Remote key of an artifact: `<prefix>/<type>/<file name>`.
    pub fn remote_key(&self, backup_type: BackupType, file_name: &str) -> String {
        let prefix = self.remote_prefix();
        if prefix.is_empty() {
            format!("{}/{}", backup_type.as_str(), file_name)
        } else {
            format!("{}/{}/{}", prefix, backup_type.as_str(), file_name)
        }
    }

    /// Take a backup of the configured database.
    pub async fn create_backup(&self, backup_type: BackupType) -> Result<BackupInfo, BackupError> {
        self.create_backup_with_retention(backup_type, None).await
    }

    /// Take a backup that carries its own retention window.
    #[tracing::instrument(skip(self), fields(database = %self.connection.database))]
    pub async fn create_backup_with_retention(
        &self,
        backup_type: BackupType,
        retention_days: Option<u32>,
    ) -> Result<BackupInfo, BackupError> {
        let _shared = self.cleanup_lock.read().await;

        let backup_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let path = self
            .config
            .backup_dir
            .join(artifact_name(backup_type, started_at, &backup_id));

        let mut info = BackupInfo::in_progress(&backup_id, backup_type, &path, started_at);
        info.compression = self.config.compression;
        info.encryption = self.config.encryption;
        info.metadata
            .insert("database".to_string(), self.connection.database.clone());
        if let Some(days) = retention_days {
            info.metadata
                .insert(BackupInfo::RETENTION_KEY.to_string(), days.to_string());
        }
        self.catalog.save_backup(&info)?;
        info!(backup_id = %backup_id, path = %path.display(), "starting backup");

        let request = DumpRequest {
            connection: self.connection.clone(),
            backup_type,
            destination: path.clone(),
            compression_level: self.config.effective_compression_level(),
            parallel_jobs: self.config.parallel_jobs,
        };

        let outcome = match self.tool.dump(&request).await {
            Ok(()) => file_digest(&path).await.map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };

        let (size, checksum) = match outcome {
            Ok(digest) => digest,
            Err(message) => {
                error!(backup_id = %backup_id, error = %message, "backup failed");
                info.fail(message.clone(), Utc::now());
                self.catalog.save_backup(&info)?;
                remove_file_if_exists(&path).await;
                return Err(BackupError::BackupFailed { backup_id, message });
            }
        };

        info.complete(size, checksum, Utc::now());
        self.catalog.save_backup(&info)?;

        if let Some(remote) = &self.remote {
            let key = self.remote_key(backup_type, &info.file_name().unwrap_or_default());
            match remote.upload(&path, &key).await {
                Ok(()) => {
                    info.metadata.insert(BackupInfo::REMOTE_KEY.to_string(), key);
                }
                Err(e) => {
                    warn!(backup_id = %backup_id, error = %e, "upload to remote storage failed");
                    info.metadata
                        .insert("upload_error".to_string(), e.to_string());
                }
            }
            self.catalog.save_backup(&info)?;
        }

        info!(
            backup_id = %backup_id,
            size_bytes = info.size_bytes,
            "backup completed"
        );
        Ok(info)
    }

    /// Known backups, newest first.
    ///
    /// Merges the catalog with artifacts found in the backup directory and in
    /// remote storage. Artifacts without a catalog entry are described from
    /// their file names.
    pub async fn list_backups(
        &self,
        backup_type: Option<BackupType>,
        limit: Option<usize>,
    ) -> Result<Vec<BackupInfo>, BackupError> {
        let mut by_id: BTreeMap<String, BackupInfo> = self
            .catalog
            .list_backups()?
            .into_iter()
            .map(|info| (info.backup_id.clone(), info))
            .collect();

        for info in self.scan_directory().await {
            by_id.entry(info.backup_id.clone()).or_insert(info);
        }

        if let Some(remote) = &self.remote {
            match remote.list(&self.remote_prefix()).await {
                Ok(keys) => {
                    for key in keys {
                        let name = key.rsplit('/').next().unwrap_or(&key).to_string();
                        let local = self.config.backup_dir.join(&name);
                        let Some(mut info) = self.describe_artifact(&name, local) else {
                            continue;
                        };
                        by_id.entry(info.backup_id.clone()).or_insert_with(|| {
                            info.metadata.insert(BackupInfo::REMOTE_KEY.to_string(), key.clone());
                            info
                        });
                    }
                }
                Err(e) => warn!(error = %e, "failed to list remote backups"),
            }
        }

        let mut backups: Vec<BackupInfo> = by_id
            .into_values()
            .filter(|info| backup_type.map_or(true, |t| info.backup_type == t))
            .collect();
        backups.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        if let Some(limit) = limit {
            backups.truncate(limit);
        }
        Ok(backups)
    }

    fn describe_artifact(&self, name: &str, path: PathBuf) -> Option<BackupInfo> {
        let (backup_type, started_at, backup_id) = parse_artifact_name(name)?;
        let mut info = BackupInfo::in_progress(backup_id, backup_type, path, started_at);
        info.status = BackupStatus::Completed;
        info.compression = self.config.compression;
        Some(info)
    }

    async fn scan_directory(&self) -> Vec<BackupInfo> {
        let mut found = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.config.backup_dir).await {
            Ok(entries) => entries,
            Err(e) => {
                debug!(error = %e, "backup directory not readable");
                return found;
            }
        };

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "failed to scan backup directory");
                    break;
                }
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(mut info) = self.describe_artifact(&name, entry.path()) else {
                continue;
            };
            if let Ok(meta) = entry.metadata().await {
                info.size_bytes = meta.len();
            }
            found.push(info);
        }
        found
    }

    /// Look up a backup by id.
    pub async fn get_backup(&self, backup_id: &str) -> Result<Option<BackupInfo>, BackupError> {
        if let Some(info) = self.catalog.get_backup(backup_id)? {
            return Ok(Some(info));
        }
        Ok(self
            .list_backups(None, None)
            .await?
            .into_iter()
            .find(|info| info.backup_id == backup_id))
    }

    /// Check that a backup's artifact is present, matches its recorded
    /// checksum, and is readable by the snapshot tool.
    ///
    /// Returns `Ok(false)` for any integrity problem; errors are reserved for
    /// unknown ids and catalog failures.
    #[tracing::instrument(skip(self))]
    pub async fn verify_backup(&self, backup_id: &str) -> Result<bool, BackupError> {
        let info = self
            .get_backup(backup_id)
            .await?
            .ok_or_else(|| BackupError::NotFound(backup_id.to_string()))?;

        if !info.is_completed() {
            warn!(status = %info.status, "backup is not completed");
            return Ok(false);
        }

        let path = info.file_path.clone();
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            let key = info
                .remote_key()
                .map(str::to_string)
                .or_else(|| {
                    self.remote
                        .as_ref()
                        .map(|_| self.remote_key(info.backup_type, &info.file_name().unwrap_or_default()))
                });
            match (&self.remote, key) {
                (Some(remote), Some(key)) => {
                    if let Err(e) = remote.download(&key, &path).await {
                        warn!(key = %key, error = %e, "artifact missing locally and download failed");
                        return Ok(false);
                    }
                    info!(key = %key, "downloaded artifact for verification");
                }
                _ => {
                    warn!(path = %path.display(), "artifact missing");
                    return Ok(false);
                }
            }
        }

        if let Some(expected) = &info.checksum {
            match file_digest(&path).await {
                Ok((_, actual)) if actual == *expected => {}
                Ok((_, actual)) => {
                    warn!(expected = %expected, actual = %actual, "checksum mismatch");
                    return Ok(false);
                }
                Err(e) => {
                    warn!(error = %e, "failed to read artifact");
                    return Ok(false);
                }
            }
        }

        match self.tool.list_contents(&path).await {
            Ok(entries) => {
                info!(entries = entries.len(), "backup verified");
                Ok(true)
            }
            Err(e) => {
                warn!(error = %e, "snapshot tool rejected artifact");
                Ok(false)
            }
        }
    }

    /// Delete a backup's local artifact, remote copy, and catalog entry.
    ///
    /// Returns `false` when the id is unknown.
    pub async fn delete_backup(&self, backup_id: &str) -> Result<bool, BackupError> {
        let _shared = self.cleanup_lock.read().await;
        let Some(info) = self.get_backup(backup_id).await? else {
            warn!(backup_id, "backup not found");
            return Ok(false);
        };
        self.remove_artifacts(&info).await?;
        Ok(true)
    }

    async fn remove_artifacts(&self, info: &BackupInfo) -> Result<(), BackupError> {
        match tokio::fs::remove_file(&info.file_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(BackupError::Io {
                    backup_id: info.backup_id.clone(),
                    source,
                })
            }
        }

        if let Some(remote) = &self.remote {
            let key = info
                .remote_key()
                .map(str::to_string)
                .unwrap_or_else(|| self.remote_key(info.backup_type, &info.file_name().unwrap_or_default()));
            remote.delete(&key).await?;
        }

        self.catalog.remove_backup(&info.backup_id)?;
        info!(backup_id = %info.backup_id, "deleted backup");
        Ok(())
    }

    /// Apply the retention policy. Returns the number of deleted backups.
    ///
    /// Waits for in-flight backups and blocks new ones while it runs.
    #[tracing::instrument(skip(self))]
    pub async fn cleanup_old_backups(&self) -> Result<usize, BackupError> {
        let _exclusive = self.cleanup_lock.write().await;

        let backups = self.list_backups(None, None).await?;
        let policy = RetentionPolicy::from(&self.config);
        let expired = policy.select_expired(&backups, Utc::now());

        let mut deleted = 0;
        for info in expired {
            match self.remove_artifacts(info).await {
                Ok(()) => deleted += 1,
                Err(e) => warn!(backup_id = %info.backup_id, error = %e, "failed to delete expired backup"),
            }
        }

        info!(deleted, retained = backups.len() - deleted, "cleanup finished");
        Ok(deleted)
    }

    /// Totals over every known backup.
    pub async fn get_backup_statistics(&self) -> Result<BackupStatistics, BackupError> {
        let backups = self.list_backups(None, None).await?;
        let mut stats = BackupStatistics {
            total_backups: backups.len(),
            ..Default::default()
        };

        for info in &backups {
            match info.status {
                BackupStatus::Completed => stats.completed_backups += 1,
                BackupStatus::Failed | BackupStatus::Corrupted => stats.failed_backups += 1,
                BackupStatus::Pending | BackupStatus::InProgress => {}
            }
            stats.total_size_bytes += info.size_bytes;
            stats.oldest_backup = Some(stats.oldest_backup.map_or(info.started_at, |t| t.min(info.started_at)));
            stats.newest_backup = Some(stats.newest_backup.map_or(info.started_at, |t| t.max(info.started_at)));
            stats.by_type.entry(info.backup_type).or_default().record(info);
        }

        Ok(stats)
    }
}

async fn remove_file_if_exists(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to remove partial artifact");
        }
    }
}

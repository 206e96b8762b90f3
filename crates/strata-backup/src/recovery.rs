//! Recovery engine: restore, clone, and post-restore checks.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};
use uuid::Uuid;

use strata_core::model::{BackupInfo, BackupType, RestoreInfo};
use strata_core::{ConnectionParams, DatabaseAdmin};

use crate::backup::BackupManager;
use crate::error::{BackupError, RecoveryError};
use crate::tool::{DumpRequest, RestoreRequest, SnapshotTool};

/// Removes a temporary artifact when dropped.
struct TempArtifact {
    path: PathBuf,
}

impl TempArtifact {
    fn new(dir: &Path) -> Self {
        Self {
            path: dir.join(format!("clone_{}.dump.tmp", Uuid::new_v4())),
        }
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempArtifact {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "failed to remove temporary artifact"),
        }
    }
}

/// Restores backups and clones databases.
pub struct RecoveryManager {
    backups: Arc<BackupManager>,
    admin: Arc<dyn DatabaseAdmin>,
    tool: Arc<dyn SnapshotTool>,
    connection: ConnectionParams,
}

impl RecoveryManager {
    pub fn new(
        backups: Arc<BackupManager>,
        admin: Arc<dyn DatabaseAdmin>,
        tool: Arc<dyn SnapshotTool>,
        connection: ConnectionParams,
    ) -> Self {
        Self {
            backups,
            admin,
            tool,
            connection,
        }
    }

    fn record(&self, info: &RestoreInfo) -> Result<(), RecoveryError> {
        self.backups
            .catalog()
            .save_restore(info)
            .map_err(BackupError::from)?;
        Ok(())
    }

    /// Mark `info` failed and record it. A catalog error here is logged so
    /// the caller still returns the failed record.
    fn record_failure(&self, info: &mut RestoreInfo, message: String) {
        error!(restore_id = %info.restore_id, error = %message, "operation failed");
        info.fail(message);
        if let Err(e) = self.record(info) {
            warn!(restore_id = %info.restore_id, error = %e, "failed to record failure");
        }
    }

    /// Restore a backup into `target` (the configured database by default).
    ///
    /// The backup is verified first; an unverifiable backup never touches the
    /// target. With `clean`, an existing target is dropped and recreated.
    #[tracing::instrument(skip_all, fields(backup_id = %backup_id, database = ?target, clean = clean))]
    pub async fn restore_database(
        &self,
        backup_id: &str,
        target: Option<&str>,
        clean: bool,
    ) -> Result<RestoreInfo, RecoveryError> {
        let target = target.unwrap_or(&self.connection.database).to_string();
        let mut restore = RestoreInfo::new(Uuid::new_v4().to_string(), backup_id, &target);
        restore.start();
        self.record(&restore)?;

        let backup = match self.verified_backup(backup_id).await {
            Ok(backup) => backup,
            Err(message) => {
                self.record_failure(&mut restore, message);
                return Err(RecoveryError::VerificationFailed(Box::new(restore)));
            }
        };

        if let Err(message) = self.replace_and_restore(&target, &backup.file_path, clean).await {
            self.record_failure(&mut restore, message);
            return Err(RecoveryError::RestoreFailed(Box::new(restore)));
        }

        restore.complete();
        self.record(&restore)?;
        info!(restore_id = %restore.restore_id, database = %target, "restore completed");
        Ok(restore)
    }

    /// The backup record, once its artifact has passed verification.
    async fn verified_backup(&self, backup_id: &str) -> Result<BackupInfo, String> {
        match self.backups.verify_backup(backup_id).await {
            Ok(true) => {}
            Ok(false) | Err(BackupError::NotFound(_)) => {
                return Err(format!("backup {} failed verification", backup_id));
            }
            Err(e) => return Err(format!("backup {} could not be verified: {}", backup_id, e)),
        }
        match self.backups.get_backup(backup_id).await {
            Ok(Some(backup)) => Ok(backup),
            Ok(None) => Err(format!("backup {} not found", backup_id)),
            Err(e) => Err(format!("backup {} could not be loaded: {}", backup_id, e)),
        }
    }

    /// Optionally recreate `target`, then restore `source` into it.
    async fn replace_and_restore(&self, target: &str, source: &Path, clean: bool) -> Result<(), String> {
        if clean {
            if self.admin.database_exists(target).await.map_err(|e| e.to_string())? {
                self.admin.drop_database(target).await.map_err(|e| e.to_string())?;
                info!(database = %target, "dropped existing database");
            }
            self.admin
                .create_database(target, None)
                .await
                .map_err(|e| e.to_string())?;
        }

        let request = RestoreRequest {
            connection: self.connection.with_database(target),
            source: source.to_path_buf(),
            parallel_jobs: self.backups.config().parallel_jobs,
        };
        self.tool.restore(&request).await.map_err(|e| e.to_string())
    }

    /// Copy `source` into a new database `target`.
    ///
    /// `target` must not exist. Tries a server-side template copy first and
    /// falls back to dumping `source` into a temporary artifact and restoring
    /// it into a freshly created `target`.
    #[tracing::instrument(skip_all, fields(source = %source, database = %target))]
    pub async fn clone_database(&self, source: &str, target: &str) -> Result<RestoreInfo, RecoveryError> {
        let mut clone = RestoreInfo::clone_of(Uuid::new_v4().to_string(), source, target);
        clone.start();
        self.record(&clone)?;

        match self.admin.database_exists(target).await {
            Ok(false) => {}
            Ok(true) => {
                self.record_failure(&mut clone, format!("target database {} already exists", target));
                return Err(RecoveryError::CloneFailed(Box::new(clone)));
            }
            Err(e) => {
                self.record_failure(&mut clone, e.to_string());
                return Err(RecoveryError::CloneFailed(Box::new(clone)));
            }
        }

        match self.admin.create_database(target, Some(source)).await {
            Ok(()) => {
                info!("cloned database from template");
                clone.complete();
                self.record(&clone)?;
                return Ok(clone);
            }
            Err(e) => warn!(error = %e, "template clone failed, falling back to dump and restore"),
        }

        if let Err(message) = self.clone_via_artifact(source, target).await {
            self.record_failure(&mut clone, message);
            return Err(RecoveryError::CloneFailed(Box::new(clone)));
        }

        clone.complete();
        self.record(&clone)?;
        info!("cloned database via dump and restore");
        Ok(clone)
    }

    async fn clone_via_artifact(&self, source: &str, target: &str) -> Result<(), String> {
        let config = self.backups.config();
        tokio::fs::create_dir_all(&config.backup_dir)
            .await
            .map_err(|e| e.to_string())?;
        let artifact = TempArtifact::new(&config.backup_dir);

        let dump = DumpRequest {
            connection: self.connection.with_database(source),
            backup_type: BackupType::Full,
            destination: artifact.path().to_path_buf(),
            compression_level: config.effective_compression_level(),
            parallel_jobs: config.parallel_jobs,
        };
        self.tool.dump(&dump).await.map_err(|e| e.to_string())?;
        self.admin
            .create_database(target, None)
            .await
            .map_err(|e| e.to_string())?;
        self.replace_and_restore(target, artifact.path(), false).await
    }

    /// Whether `database` holds at least one schema object after a restore.
    pub async fn verify_restore(&self, database: &str) -> Result<bool, RecoveryError> {
        let objects = self.admin.count_schema_objects(database).await?;
        info!(database, objects, "restore check");
        Ok(objects > 0)
    }

    /// Point-in-time recovery. Requires continuous transaction log archiving,
    /// which this deployment does not provide, so it always fails.
    pub async fn point_in_time_recovery(
        &self,
        target_time: DateTime<Utc>,
        target_database: Option<&str>,
    ) -> Result<RestoreInfo, RecoveryError> {
        warn!(%target_time, database = ?target_database, "point-in-time recovery requested");
        Err(RecoveryError::PitrNotConfigured)
    }

    /// Every recorded restore and clone, oldest first.
    pub fn restore_history(&self) -> Result<Vec<RestoreInfo>, RecoveryError> {
        Ok(self
            .backups
            .catalog()
            .list_restores()
            .map_err(BackupError::from)?)
    }
}

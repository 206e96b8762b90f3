//! Test doubles shared by the integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use strata_backup::{
    BackupCatalog, BackupManager, DumpRequest, Notifier, RestoreRequest, SnapshotTool, ToolError,
};
use strata_core::{BackupConfig, BackupType, ConnectionParams, DatabaseAdmin, DatabaseError};

pub const MAGIC: &[u8] = b"PGDMP";

/// Writes small fake dumps and records restores.
#[derive(Default)]
pub struct FakeTool {
    pub fail_dump: AtomicBool,
    /// Fail dumps of this type only.
    pub fail_type: Mutex<Option<BackupType>>,
    /// Runtime time each dump takes.
    pub dump_delay: Mutex<Option<Duration>>,
    pub fail_restore: AtomicBool,
    pub dumps: Mutex<Vec<String>>,
    pub restores: Mutex<Vec<String>>,
}

#[async_trait]
impl SnapshotTool for FakeTool {
    async fn dump(&self, request: &DumpRequest) -> Result<(), ToolError> {
        self.dumps.lock().push(request.connection.database.clone());
        let delay = *self.dump_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let fail_type = *self.fail_type.lock();
        if self.fail_dump.load(Ordering::SeqCst) || fail_type == Some(request.backup_type) {
            return Err(ToolError::Failed {
                program: "pg_dump".to_string(),
                code: Some(1),
                stderr: "connection refused".to_string(),
            });
        }
        let mut content = MAGIC.to_vec();
        content.extend_from_slice(
            format!(
                "\n{}\n{}\ntable users\ntable orders\n",
                request.connection.database, request.backup_type
            )
            .as_bytes(),
        );
        tokio::fs::write(&request.destination, content)
            .await
            .map_err(|source| ToolError::Spawn {
                program: "pg_dump".to_string(),
                source,
            })
    }

    async fn restore(&self, request: &RestoreRequest) -> Result<(), ToolError> {
        self.restores.lock().push(request.connection.database.clone());
        if self.fail_restore.load(Ordering::SeqCst) {
            return Err(ToolError::Failed {
                program: "pg_restore".to_string(),
                code: Some(1),
                stderr: "relation already exists".to_string(),
            });
        }
        Ok(())
    }

    async fn list_contents(&self, artifact: &Path) -> Result<Vec<String>, ToolError> {
        let content = tokio::fs::read(artifact).await.map_err(|source| ToolError::Spawn {
            program: "pg_restore".to_string(),
            source,
        })?;
        if !content.starts_with(MAGIC) {
            return Err(ToolError::Failed {
                program: "pg_restore".to_string(),
                code: Some(1),
                stderr: "input file does not appear to be a valid archive".to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&content)
            .lines()
            .filter(|line| line.starts_with("table "))
            .map(str::to_string)
            .collect())
    }
}

/// Records administrative calls.
#[derive(Default)]
pub struct FakeAdmin {
    pub calls: Mutex<Vec<String>>,
    pub existing: Mutex<Vec<String>>,
    pub reject_template: AtomicBool,
    pub objects: Mutex<u64>,
}

impl FakeAdmin {
    pub fn with_database(name: &str) -> Self {
        let admin = Self::default();
        admin.existing.lock().push(name.to_string());
        admin
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl DatabaseAdmin for FakeAdmin {
    async fn database_exists(&self, name: &str) -> Result<bool, DatabaseError> {
        self.calls.lock().push(format!("exists {}", name));
        Ok(self.existing.lock().iter().any(|db| db == name))
    }

    async fn create_database(&self, name: &str, template: Option<&str>) -> Result<(), DatabaseError> {
        match template {
            Some(template) => {
                self.calls.lock().push(format!("create {} from {}", name, template));
                if self.reject_template.load(Ordering::SeqCst) {
                    return Err(DatabaseError::Statement(format!(
                        "source database \"{}\" is being accessed by other users",
                        template
                    )));
                }
            }
            None => self.calls.lock().push(format!("create {}", name)),
        }
        self.existing.lock().push(name.to_string());
        Ok(())
    }

    async fn drop_database(&self, name: &str) -> Result<(), DatabaseError> {
        self.calls.lock().push(format!("drop {}", name));
        self.existing.lock().retain(|db| db != name);
        Ok(())
    }

    async fn count_schema_objects(&self, name: &str) -> Result<u64, DatabaseError> {
        self.calls.lock().push(format!("count {}", name));
        Ok(*self.objects.lock())
    }
}

/// Collects notifications.
#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, subject: &str, message: &str) {
        self.sent.lock().push((subject.to_string(), message.to_string()));
    }
}

pub struct TestContext {
    pub dir: tempfile::TempDir,
    pub tool: Arc<FakeTool>,
}

impl TestContext {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
            tool: Arc::new(FakeTool::default()),
        }
    }

    pub fn config(&self) -> BackupConfig {
        BackupConfig::new(self.dir.path().join("backups"))
    }

    pub fn connection() -> ConnectionParams {
        ConnectionParams::new("localhost", 5432, "app", "shop")
    }

    pub fn manager(&self, config: BackupConfig) -> BackupManager {
        BackupManager::new(config, Self::connection(), self.tool.clone())
            .unwrap()
            .with_catalog(BackupCatalog::temporary().unwrap())
    }
}

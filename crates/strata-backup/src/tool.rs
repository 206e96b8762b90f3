//! External snapshot and restore tools.
//!
//! The engines never shell out directly; they go through [`SnapshotTool`].
//! [`PgTools`] drives `pg_dump`/`pg_restore`.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use strata_core::model::BackupType;
use strata_core::ConnectionParams;

use crate::error::ToolError;

/// Parameters of a dump.
#[derive(Debug, Clone)]
pub struct DumpRequest {
    /// Database to dump.
    pub connection: ConnectionParams,
    /// Kind of backup being taken.
    pub backup_type: BackupType,
    /// Artifact path to write.
    pub destination: PathBuf,
    /// Compression level (0 disables compression).
    pub compression_level: u32,
    /// Parallel jobs, where the tool supports them. [`PgTools`] dumps to a
    /// single file and ignores it.
    pub parallel_jobs: u32,
}

/// Parameters of a restore.
#[derive(Debug, Clone)]
pub struct RestoreRequest {
    /// Database to restore into.
    pub connection: ConnectionParams,
    /// Artifact to read.
    pub source: PathBuf,
    /// Parallel jobs.
    pub parallel_jobs: u32,
}

/// A tool that writes and reads logical database snapshots.
#[async_trait]
pub trait SnapshotTool: Send + Sync {
    /// Write a snapshot of `request.connection` to `request.destination`.
    async fn dump(&self, request: &DumpRequest) -> Result<(), ToolError>;

    /// Restore `request.source` into `request.connection`.
    async fn restore(&self, request: &RestoreRequest) -> Result<(), ToolError>;

    /// List the table of contents of an artifact. Fails on unreadable artifacts.
    async fn list_contents(&self, artifact: &Path) -> Result<Vec<String>, ToolError>;
}

/// `pg_dump`/`pg_restore` driver.
///
/// Full, incremental, and differential backups are all taken as custom-format
/// logical dumps; the type only labels the artifact. Transaction log backups
/// need WAL archiving and are rejected.
///
/// `pg_dump` can only run parallel jobs with the directory format, and a
/// backup artifact is a single checksummed file, so dumps run with one job.
/// `parallel_jobs` is passed to `pg_restore --jobs`, which reads custom-format
/// archives in parallel.
#[derive(Debug, Clone)]
pub struct PgTools {
    pg_dump: PathBuf,
    pg_restore: PathBuf,
}

impl Default for PgTools {
    fn default() -> Self {
        Self {
            pg_dump: PathBuf::from("pg_dump"),
            pg_restore: PathBuf::from("pg_restore"),
        }
    }
}

impl PgTools {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a specific `pg_dump` binary.
    pub fn with_pg_dump(mut self, path: impl Into<PathBuf>) -> Self {
        self.pg_dump = path.into();
        self
    }

    /// Use a specific `pg_restore` binary.
    pub fn with_pg_restore(mut self, path: impl Into<PathBuf>) -> Self {
        self.pg_restore = path.into();
        self
    }

    fn connection_args(connection: &ConnectionParams) -> Vec<String> {
        vec![
            format!("--host={}", connection.host),
            format!("--port={}", connection.port),
            format!("--username={}", connection.user),
            "--no-password".to_string(),
        ]
    }

    fn dump_args(request: &DumpRequest) -> Vec<String> {
        let mut args = Self::connection_args(&request.connection);
        args.push("--format=custom".to_string());
        args.push(format!("--compress={}", request.compression_level.min(9)));
        args.push(format!("--file={}", request.destination.display()));
        args.push(request.connection.database.clone());
        args
    }

    fn restore_args(request: &RestoreRequest) -> Vec<String> {
        let mut args = Self::connection_args(&request.connection);
        args.push(format!("--dbname={}", request.connection.database));
        args.push(format!("--jobs={}", request.parallel_jobs.max(1)));
        args.push("--no-owner".to_string());
        args.push(request.source.display().to_string());
        args
    }
}

/// Run `program` to completion, capturing output.
async fn run(
    program: &Path,
    args: &[String],
    password: Option<&str>,
) -> Result<String, ToolError> {
    let name = program.display().to_string();
    debug!(program = %name, ?args, "running external tool");

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(password) = password {
        command.env("PGPASSWORD", password);
    }

    let output = command.output().await.map_err(|source| ToolError::Spawn {
        program: name.clone(),
        source,
    })?;

    if !output.status.success() {
        return Err(ToolError::Failed {
            program: name,
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[async_trait]
impl SnapshotTool for PgTools {
    async fn dump(&self, request: &DumpRequest) -> Result<(), ToolError> {
        if request.backup_type == BackupType::TransactionLog {
            return Err(ToolError::Unsupported(
                "transaction log backups require WAL archiving".to_string(),
            ));
        }
        run(
            &self.pg_dump,
            &Self::dump_args(request),
            request.connection.password.as_deref(),
        )
        .await?;
        info!(
            database = %request.connection.database,
            destination = %request.destination.display(),
            "pg_dump finished"
        );
        Ok(())
    }

    async fn restore(&self, request: &RestoreRequest) -> Result<(), ToolError> {
        run(
            &self.pg_restore,
            &Self::restore_args(request),
            request.connection.password.as_deref(),
        )
        .await?;
        info!(
            database = %request.connection.database,
            source = %request.source.display(),
            "pg_restore finished"
        );
        Ok(())
    }

    async fn list_contents(&self, artifact: &Path) -> Result<Vec<String>, ToolError> {
        let args = vec!["--list".to_string(), artifact.display().to_string()];
        let stdout = run(&self.pg_restore, &args, None).await?;
        Ok(stdout
            .lines()
            .filter(|line| !line.trim().is_empty() && !line.starts_with(';'))
            .map(str::to_string)
            .collect())
    }
}

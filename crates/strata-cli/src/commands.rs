//! Subcommand definitions and dispatch.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};
use tracing::info;

use strata_backup::{
    BackupManager, ObjectStoreStorage, PgTools, RecoveryManager, Scheduler, SnapshotTool,
};
use strata_core::db::{PostgresAdmin, PostgresDatabase};
use strata_core::migration::{load_sql_directory, Migrator, MigratorConfig};
use strata_core::{
    BackupConfig, BackupType, ConnectionParams, Database, ScheduleConfig, ScheduleInterval,
    SqliteDatabase,
};

use crate::formatter::{self, OutputFormat};

/// Top-level commands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Apply pending migrations
    Migrate {
        #[command(flatten)]
        source: MigrationSource,
        /// Stop after this version
        #[arg(long)]
        target: Option<String>,
    },
    /// Revert applied migrations newer than a version
    Rollback {
        #[command(flatten)]
        source: MigrationSource,
        /// Version to roll back to (exclusive)
        #[arg(long)]
        target: String,
    },
    /// Show applied, pending, and drifted migrations
    Status {
        #[command(flatten)]
        source: MigrationSource,
    },
    /// Manage backups
    #[command(subcommand)]
    Backup(BackupCommand),
    /// Restore a backup
    Restore {
        /// Backup id
        backup_id: String,
        /// Database to restore into (defaults to the connected database)
        #[arg(long)]
        target: Option<String>,
        /// Restore into the existing target instead of dropping and recreating it
        #[arg(long)]
        no_clean: bool,
    },
    /// Copy a database
    Clone {
        /// Source database
        source: String,
        /// New database
        target: String,
    },
    /// Check that a restored database has a schema
    VerifyRestore {
        /// Database name
        database: String,
    },
    /// List past restores and clones
    History,
    /// Run backup schedules
    #[command(subcommand)]
    Schedule(ScheduleCommand),
}

#[derive(Args, Debug)]
pub struct MigrationSource {
    /// Directory of `<version>_<name>/{up,down}.sql` migrations
    #[arg(long, default_value = "migrations")]
    pub dir: PathBuf,
    /// Ledger table name
    #[arg(long, default_value = strata_core::migration::DEFAULT_LEDGER_TABLE)]
    pub ledger_table: String,
}

#[derive(Subcommand, Debug)]
pub enum BackupCommand {
    /// Take a backup now
    Create {
        /// Backup type (defaults to the configured type)
        #[arg(long = "type")]
        backup_type: Option<BackupType>,
    },
    /// List backups, newest first
    List {
        #[arg(long = "type")]
        backup_type: Option<BackupType>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Verify a backup's checksum and readability
    Verify { backup_id: String },
    /// Delete a backup
    Delete { backup_id: String },
    /// Apply the retention policy
    Cleanup,
    /// Show backup statistics
    Stats,
}

#[derive(Subcommand, Debug)]
pub enum ScheduleCommand {
    /// Run schedules until interrupted
    Run {
        /// Add the standard daily, hourly, and weekly schedules
        #[arg(long)]
        defaults: bool,
        /// Extra schedule as `name=type@interval`, e.g. `nightly=full@daily`
        #[arg(long = "schedule", value_parser = parse_schedule)]
        schedules: Vec<(String, ScheduleConfig)>,
    },
}

fn parse_schedule(raw: &str) -> Result<(String, ScheduleConfig), String> {
    let (name, spec) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name=type@interval, got '{}'", raw))?;
    let (backup_type, interval) = spec
        .split_once('@')
        .ok_or_else(|| format!("expected type@interval, got '{}'", spec))?;
    let backup_type: BackupType = backup_type.parse().map_err(|e| format!("{}", e))?;
    let interval: ScheduleInterval = interval.parse().map_err(|e| format!("{}", e))?;
    Ok((name.trim().to_string(), ScheduleConfig::new(backup_type, interval, 0)))
}

/// Shared inputs for every command.
pub struct AppContext {
    pub database_url: Option<String>,
    pub config: BackupConfig,
    pub format: OutputFormat,
    pub pg_dump: Option<PathBuf>,
    pub pg_restore: Option<PathBuf>,
}

impl AppContext {
    fn database_url(&self) -> Result<&str> {
        self.database_url
            .as_deref()
            .context("no database given: pass --database-url or set DATABASE_URL")
    }

    fn connection(&self) -> Result<ConnectionParams> {
        Ok(ConnectionParams::from_url(self.database_url()?)?)
    }

    async fn database(&self) -> Result<Arc<dyn Database>> {
        let url = self.database_url()?;
        if let Some(path) = sqlite_path(url) {
            return Ok(Arc::new(SqliteDatabase::open(path)?));
        }
        let params = ConnectionParams::from_url(url)?;
        Ok(Arc::new(PostgresDatabase::connect(&params, 2).await?))
    }

    fn tool(&self) -> Arc<dyn SnapshotTool> {
        let mut tools = PgTools::new();
        if let Some(path) = &self.pg_dump {
            tools = tools.with_pg_dump(path);
        }
        if let Some(path) = &self.pg_restore {
            tools = tools.with_pg_restore(path);
        }
        Arc::new(tools)
    }

    fn backups(&self) -> Result<Arc<BackupManager>> {
        let mut manager = BackupManager::new(self.config.clone(), self.connection()?, self.tool())?;
        if let Some(remote) = &self.config.remote {
            manager = manager.with_remote(Arc::new(ObjectStoreStorage::s3(remote)?));
        }
        Ok(Arc::new(manager))
    }

    fn recovery(&self) -> Result<RecoveryManager> {
        let connection = self.connection()?;
        Ok(RecoveryManager::new(
            self.backups()?,
            Arc::new(PostgresAdmin::new(connection.clone())),
            self.tool(),
            connection,
        ))
    }

    async fn migrator(&self, source: &MigrationSource) -> Result<Migrator> {
        let migrations = load_sql_directory(&source.dir)
            .with_context(|| format!("loading migrations from {}", source.dir.display()))?;
        info!(count = migrations.len(), dir = %source.dir.display(), "loaded migrations");
        let config = MigratorConfig::default().with_ledger_table(source.ledger_table.clone());
        Ok(Migrator::new(self.database().await?, migrations, config))
    }
}

/// `sqlite:` URLs and bare paths select the SQLite driver.
fn sqlite_path(url: &str) -> Option<&Path> {
    if let Some(rest) = url.strip_prefix("sqlite://").or_else(|| url.strip_prefix("sqlite:")) {
        return Some(Path::new(rest));
    }
    (!url.contains("://")).then(|| Path::new(url))
}

/// Execute `command`.
pub async fn run(command: Command, ctx: &AppContext) -> Result<()> {
    let format = ctx.format;
    match command {
        Command::Migrate { source, target } => {
            let report = ctx.migrator(&source).await?.migrate(target.as_deref()).await?;
            println!("{}", formatter::format_migrate_report(format, &report));
        }
        Command::Rollback { source, target } => {
            let reverted = ctx.migrator(&source).await?.rollback(&target).await?;
            println!("{}", formatter::format_list(format, "reverted", &reverted));
        }
        Command::Status { source } => {
            let report = ctx.migrator(&source).await?.status().await?;
            println!("{}", formatter::format_migration_status(format, &report));
        }
        Command::Backup(command) => run_backup(command, ctx).await?,
        Command::Restore {
            backup_id,
            target,
            no_clean,
        } => {
            let restore = ctx
                .recovery()?
                .restore_database(&backup_id, target.as_deref(), !no_clean)
                .await?;
            println!("{}", formatter::format_restore(format, &restore));
        }
        Command::Clone { source, target } => {
            let clone = ctx.recovery()?.clone_database(&source, &target).await?;
            println!("{}", formatter::format_restore(format, &clone));
        }
        Command::VerifyRestore { database } => {
            if !ctx.recovery()?.verify_restore(&database).await? {
                bail!("database {} has no schema objects", database);
            }
            println!("database {} looks restored", database);
        }
        Command::History => {
            let restores = ctx.recovery()?.restore_history()?;
            println!("{}", formatter::format_restores(format, &restores));
        }
        Command::Schedule(ScheduleCommand::Run {
            defaults,
            schedules,
        }) => run_scheduler(ctx, defaults, schedules).await?,
    }
    Ok(())
}

async fn run_backup(command: BackupCommand, ctx: &AppContext) -> Result<()> {
    let format = ctx.format;
    let backups = ctx.backups()?;
    match command {
        BackupCommand::Create { backup_type } => {
            let backup_type = backup_type.unwrap_or(ctx.config.backup_type);
            let info = backups.create_backup(backup_type).await?;
            println!("{}", formatter::format_backup(format, &info));
        }
        BackupCommand::List { backup_type, limit } => {
            let list = backups.list_backups(backup_type, limit).await?;
            println!("{}", formatter::format_backups(format, &list));
        }
        BackupCommand::Verify { backup_id } => {
            if !backups.verify_backup(&backup_id).await? {
                bail!("backup {} failed verification", backup_id);
            }
            println!("backup {} verified", backup_id);
        }
        BackupCommand::Delete { backup_id } => {
            if !backups.delete_backup(&backup_id).await? {
                bail!("backup not found: {}", backup_id);
            }
            println!("deleted backup {}", backup_id);
        }
        BackupCommand::Cleanup => {
            let deleted = backups.cleanup_old_backups().await?;
            println!("deleted {} expired backup(s)", deleted);
        }
        BackupCommand::Stats => {
            let stats = backups.get_backup_statistics().await?;
            println!("{}", formatter::format_statistics(format, &stats));
        }
    }
    Ok(())
}

async fn run_scheduler(
    ctx: &AppContext,
    defaults: bool,
    schedules: Vec<(String, ScheduleConfig)>,
) -> Result<()> {
    let scheduler = Scheduler::new(ctx.backups()?);
    if defaults {
        scheduler.create_default_schedules();
    }
    for (name, mut schedule) in schedules {
        schedule.retention_days = ctx.config.retention_days;
        scheduler.add_schedule(name, schedule);
    }
    if scheduler.schedules().is_empty() {
        bail!("no schedules: pass --defaults or --schedule name=type@interval");
    }

    scheduler.start()?;
    tokio::signal::ctrl_c().await.context("waiting for ctrl+c")?;
    info!("shutdown requested, waiting for running backups");
    scheduler.stop().await;
    Ok(())
}

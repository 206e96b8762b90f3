//! Strata command-line tool.
//!
//! Runs schema migrations, takes and restores backups, and drives the backup
//! scheduler.

mod commands;
mod formatter;

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use commands::{AppContext, Command};
use formatter::OutputFormat;
use strata_core::BackupConfig;

/// Strata database lifecycle tool
#[derive(Parser, Debug)]
#[command(name = "strata")]
#[command(version, about = "Database migrations, backups, and restores")]
pub struct Cli {
    /// Database URL (`postgres://...`, or a SQLite path for migrations)
    #[arg(long, env = "DATABASE_URL", global = true)]
    pub database_url: Option<String>,

    /// Backup configuration file (JSON)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Backup directory, overriding the configuration file
    #[arg(long, env = "STRATA_BACKUP_DIR", global = true)]
    pub backup_dir: Option<PathBuf>,

    /// Retention window in days, overriding the configuration file
    #[arg(long, global = true)]
    pub retention_days: Option<u32>,

    /// Output format
    #[arg(long, default_value = "table", value_enum, global = true)]
    pub format: OutputFormat,

    /// Path to pg_dump
    #[arg(long, global = true)]
    pub pg_dump: Option<PathBuf>,

    /// Path to pg_restore
    #[arg(long, global = true)]
    pub pg_restore: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    fn backup_config(&self) -> Result<BackupConfig> {
        let mut config = match &self.config {
            Some(path) => BackupConfig::from_json_file(path)?,
            None => BackupConfig::default(),
        };
        if let Some(dir) = &self.backup_dir {
            config.backup_dir = dir.clone();
        }
        if let Some(days) = self.retention_days {
            config.retention_days = days;
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "strata=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = cli.backup_config()?;
    tracing::debug!(backup_dir = %config.backup_dir.display(), retention_days = config.retention_days, "configuration loaded");

    let ctx = AppContext {
        database_url: cli.database_url,
        config,
        format: cli.format,
        pg_dump: cli.pg_dump,
        pg_restore: cli.pg_restore,
    };
    commands::run(cli.command, &ctx).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_overrides() {
        let cli = Cli::try_parse_from([
            "strata",
            "--backup-dir",
            "/srv/backups",
            "--retention-days",
            "3",
            "backup",
            "list",
            "--type",
            "incremental",
        ])
        .unwrap();
        let config = cli.backup_config().unwrap();
        assert_eq!(config.backup_dir, PathBuf::from("/srv/backups"));
        assert_eq!(config.retention_days, 3);
    }

    #[test]
    fn test_restore_is_clean_by_default() {
        let cli = Cli::try_parse_from(["strata", "restore", "b-1"]).unwrap();
        assert!(matches!(cli.command, Command::Restore { no_clean: false, .. }));

        let cli = Cli::try_parse_from(["strata", "restore", "b-1", "--no-clean"]).unwrap();
        assert!(matches!(cli.command, Command::Restore { no_clean: true, .. }));
    }
}

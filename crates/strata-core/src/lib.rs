//! Strata Core - artifact model, database abstraction, and migration engine.
//!
//! This crate provides the pieces shared by every Strata component: the data
//! model, configuration types, database drivers, and schema migrations.

pub mod config;
pub mod db;
pub mod error;
pub mod migration;
pub mod model;

pub use config::{BackupConfig, ConfigError, ConnectionParams, RemoteConfig};
pub use db::{Database, DatabaseAdmin, Dialect, Executor, Row, SqlValue, SqliteDatabase, Transaction};
pub use error::DatabaseError;
pub use migration::{
    load_sql_directory, Migration, MigrationError, MigrationOps, MigrationRegistry, Migrator,
    MigratorConfig, SqlMigration,
};
pub use model::{
    BackupInfo, BackupStatus, BackupType, MigrationRecord, RestoreInfo, RestoreStatus,
    ScheduleConfig, ScheduleInterval,
};

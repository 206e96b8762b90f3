//! Migration engine for Strata.
//!
//! Versioned schema changes with explicit dependencies, applied one
//! transaction at a time:
//! - Definitions are registered explicitly ([`MigrationRegistry`]) or loaded
//!   from a directory of SQL files ([`load_sql_directory`])
//! - A migration runs only after each of its dependencies has been applied
//! - `up` and its ledger row commit together; `down` and the row deletion
//!   commit together
//! - Pre/post checks guard each migration and abort the batch on failure
//!
//! # Example
//!
//! ```ignore
//! use strata_core::migration::{Migration, Migrator, MigratorConfig, SqlMigration};
//!
//! let users = Migration::new(
//!     "20240101_000000",
//!     "create users",
//!     SqlMigration::new(["CREATE TABLE users (id BIGINT PRIMARY KEY)"], ["DROP TABLE users"]),
//! )?;
//! let orders = Migration::new("20240102_000000", "create orders", orders_sql)?
//!     .depends_on("20240101_000000");
//!
//! let migrator = Migrator::new(db, vec![users, orders], MigratorConfig::default());
//! let report = migrator.migrate(None).await?;
//! ```

mod definition;
mod error;
mod ledger;
mod migrator;
mod plan;
mod registry;

pub use definition::{Migration, MigrationOps, SqlMigration};
pub use error::MigrationError;
pub use ledger::DEFAULT_LEDGER_TABLE;
pub use migrator::{
    MigrateReport, MigrationStatusReport, Migrator, MigratorConfig, PendingMigration,
};
pub use plan::{BlockedMigration, PendingPlan};
pub use registry::{load_sql_directory, MigrationRegistry};

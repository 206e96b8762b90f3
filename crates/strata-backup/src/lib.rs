//! Strata Backup - backup, restore, and scheduled backup automation.
//!
//! - [`BackupManager`] takes checksummed snapshots through a [`SnapshotTool`],
//!   records them in a [`BackupCatalog`], and optionally mirrors them to
//!   remote [`ObjectStorage`].
//! - [`RecoveryManager`] restores verified backups and clones databases.
//! - [`Scheduler`] runs periodic backups and daily retention cleanup.

pub mod backup;
pub mod catalog;
pub mod error;
pub mod notify;
pub mod recovery;
pub mod retention;
pub mod scheduler;
pub mod storage;
pub mod tool;

pub use backup::{BackupManager, BackupStatistics, TypeStatistics};
pub use catalog::BackupCatalog;
pub use error::{BackupError, CatalogError, RecoveryError, ScheduleError, StorageError, ToolError};
pub use notify::{LogNotifier, Notifier};
pub use recovery::RecoveryManager;
pub use retention::RetentionPolicy;
pub use scheduler::{next_run, Clock, Scheduler, SystemClock, TimerClock, FAILURE_BACKOFF};
pub use storage::{ObjectStorage, ObjectStoreStorage};
pub use tool::{DumpRequest, PgTools, RestoreRequest, SnapshotTool};

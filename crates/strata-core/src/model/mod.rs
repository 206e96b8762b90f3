//! Artifact model: the data that flows between the engines.
//!
//! These are plain data types. Behaviour lives in the migration engine and in
//! the `strata-backup` crate.

mod backup;
mod record;
mod restore;
mod schedule;

pub use backup::{BackupInfo, BackupStatus, BackupType, ParseBackupTypeError};
pub use record::MigrationRecord;
pub use restore::{RestoreInfo, RestoreStatus};
pub use schedule::{ParseIntervalError, ScheduleConfig, ScheduleInterval};

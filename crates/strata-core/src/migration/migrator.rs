//! Migration executor: applies and reverts migrations against a database.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::definition::Migration;
use super::error::MigrationError;
use super::ledger::{Ledger, DEFAULT_LEDGER_TABLE};
use super::plan::{resolve, BlockedMigration, PendingPlan};
use crate::db::Database;
use crate::error::DatabaseError;
use crate::model::MigrationRecord;

/// Migrator configuration.
#[derive(Debug, Clone)]
pub struct MigratorConfig {
    /// Name of the ledger table.
    pub ledger_table: String,
}

impl Default for MigratorConfig {
    fn default() -> Self {
        Self {
            ledger_table: DEFAULT_LEDGER_TABLE.to_string(),
        }
    }
}

impl MigratorConfig {
    /// Use a different ledger table.
    pub fn with_ledger_table(mut self, table: impl Into<String>) -> Self {
        self.ledger_table = table.into();
        self
    }
}

/// Result of a `migrate` call.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MigrateReport {
    /// Ledger rows written, in apply order.
    pub applied: Vec<MigrationRecord>,
    /// Migrations skipped because of unmet dependencies.
    pub blocked: Vec<BlockedMigration>,
}

impl MigrateReport {
    /// Whether nothing was applied.
    pub fn is_noop(&self) -> bool {
        self.applied.is_empty()
    }
}

/// A definition that is not yet applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingMigration {
    pub version: String,
    pub description: String,
    /// Empty when the migration would run on the next `migrate`.
    pub unmet_dependencies: Vec<String>,
}

/// Inspection view of the ledger against loaded definitions.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MigrationStatusReport {
    /// Ledger rows ordered by version.
    pub applied: Vec<MigrationRecord>,
    /// Unapplied definitions ordered by version.
    pub pending: Vec<PendingMigration>,
    /// Ledger rows whose definition is no longer loaded.
    pub missing: Vec<MigrationRecord>,
    /// Versions whose recorded checksum differs from the loaded definition.
    pub drifted: Vec<String>,
}

impl MigrationStatusReport {
    /// Whether the ledger and definitions disagree.
    pub fn has_discrepancies(&self) -> bool {
        !self.missing.is_empty() || !self.drifted.is_empty()
    }
}

/// Brings a database schema to a target version.
///
/// Each migration runs in its own transaction together with its ledger
/// write. Batches are serialized: two `migrate`/`rollback` calls on the same
/// migrator never overlap.
pub struct Migrator {
    db: Arc<dyn Database>,
    migrations: Vec<Migration>,
    ledger: Ledger,
    batch_lock: Mutex<()>,
}

impl Migrator {
    /// Create a migrator over `migrations`.
    pub fn new(db: Arc<dyn Database>, migrations: Vec<Migration>, config: MigratorConfig) -> Self {
        Self {
            db,
            migrations,
            ledger: Ledger::new(config.ledger_table),
            batch_lock: Mutex::new(()),
        }
    }

    /// Build the version-ordered definition map.
    ///
    /// Fails on the first duplicated version.
    pub fn load(&self) -> Result<BTreeMap<String, Migration>, MigrationError> {
        let mut definitions = BTreeMap::new();
        for migration in &self.migrations {
            let version = migration.version().to_string();
            if definitions.insert(version.clone(), migration.clone()).is_some() {
                return Err(MigrationError::DuplicateVersion(version));
            }
        }
        Ok(definitions)
    }

    async fn applied_records(&self) -> Result<Vec<MigrationRecord>, MigrationError> {
        self.ledger.ensure(self.db.as_ref()).await?;
        self.ledger.applied(self.db.as_ref()).await
    }

    /// Compute what `migrate(target_version)` would apply.
    pub async fn pending(&self, target_version: Option<&str>) -> Result<PendingPlan, MigrationError> {
        let definitions = self.load()?;
        let applied = versions(&self.applied_records().await?);
        Ok(resolve(&definitions, &applied, target_version))
    }

    /// Apply pending migrations up to `target_version` (all when `None`).
    ///
    /// Stops at the first failure; migrations committed before it stay
    /// applied.
    #[tracing::instrument(skip(self))]
    pub async fn migrate(&self, target_version: Option<&str>) -> Result<MigrateReport, MigrationError> {
        let _batch = self.batch_lock.lock().await;

        let definitions = self.load()?;
        let applied = versions(&self.applied_records().await?);
        let plan = resolve(&definitions, &applied, target_version);

        for blocked in &plan.blocked {
            warn!(
                version = %blocked.version,
                unmet = ?blocked.unmet,
                "migration blocked by unmet dependencies"
            );
        }

        if plan.is_empty() {
            info!(table = self.ledger.table(), "no pending migrations");
            return Ok(MigrateReport {
                applied: Vec::new(),
                blocked: plan.blocked,
            });
        }

        let mut report = MigrateReport {
            applied: Vec::with_capacity(plan.pending.len()),
            blocked: plan.blocked,
        };
        for migration in &plan.pending {
            let record = self.apply_one(migration).await?;
            report.applied.push(record);
        }

        info!(count = report.applied.len(), "migrations applied");
        Ok(report)
    }

    async fn apply_one(&self, migration: &Migration) -> Result<MigrationRecord, MigrationError> {
        let version = migration.version();
        let apply_err = |source: DatabaseError| MigrationError::Apply {
            version: version.to_string(),
            source,
        };

        let mut tx = self.db.begin().await.map_err(apply_err)?;
        let ops = migration.ops();

        match ops.pre_check(tx.as_executor()).await {
            Ok(true) => {}
            Ok(false) => {
                return Err(MigrationError::PreCheckFailed {
                    version: version.to_string(),
                    reason: "pre-check returned false".to_string(),
                })
            }
            Err(e) => {
                return Err(MigrationError::PreCheckFailed {
                    version: version.to_string(),
                    reason: e.to_string(),
                })
            }
        }

        let started = Instant::now();
        ops.up(tx.as_executor()).await.map_err(apply_err)?;
        let execution_time_ms = started.elapsed().as_millis() as u64;

        let record = MigrationRecord {
            version: version.to_string(),
            description: migration.description().to_string(),
            author: migration.author().to_string(),
            applied_at: Utc::now(),
            execution_time_ms,
            checksum: Some(migration.checksum()),
        };
        self.ledger
            .insert(tx.as_executor(), &record)
            .await
            .map_err(apply_err)?;

        let post = match ops.post_check(tx.as_executor()).await {
            Ok(true) => None,
            Ok(false) => Some("post-check returned false".to_string()),
            Err(e) => Some(e.to_string()),
        };
        if let Some(reason) = post {
            if let Err(e) = tx.rollback().await {
                warn!(version, error = %e, "explicit rollback failed");
            }
            return Err(MigrationError::PostCheckFailed {
                version: version.to_string(),
                reason,
            });
        }

        tx.commit().await.map_err(apply_err)?;
        info!(
            version = %record.version,
            description = %record.description,
            execution_time_ms,
            "applied migration"
        );
        Ok(record)
    }

    /// Revert every applied migration with a version greater than `target_version`,
    /// newest first. Returns the reverted versions.
    ///
    /// All affected versions must have a loaded definition; otherwise nothing
    /// is reverted. A failing `down` stops the batch and leaves the remaining
    /// ledger rows intact.
    #[tracing::instrument(skip(self))]
    pub async fn rollback(&self, target_version: &str) -> Result<Vec<String>, MigrationError> {
        let _batch = self.batch_lock.lock().await;

        let definitions = self.load()?;
        let records = self.applied_records().await?;

        let mut to_revert = Vec::new();
        for record in records.iter().rev().filter(|r| r.version.as_str() > target_version) {
            let migration = definitions
                .get(&record.version)
                .ok_or_else(|| MigrationError::MissingDefinition(record.version.clone()))?;
            to_revert.push(migration);
        }

        let mut reverted = Vec::with_capacity(to_revert.len());
        for migration in to_revert {
            self.revert_one(migration).await?;
            reverted.push(migration.version().to_string());
        }

        info!(count = reverted.len(), target_version, "rollback finished");
        Ok(reverted)
    }

    async fn revert_one(&self, migration: &Migration) -> Result<(), MigrationError> {
        let version = migration.version();
        let rollback_err = |source: DatabaseError| MigrationError::Rollback {
            version: version.to_string(),
            source,
        };

        let mut tx = self.db.begin().await.map_err(rollback_err)?;
        migration
            .ops()
            .down(tx.as_executor())
            .await
            .map_err(rollback_err)?;
        self.ledger
            .remove(tx.as_executor(), version)
            .await
            .map_err(rollback_err)?;
        tx.commit().await.map_err(rollback_err)?;

        info!(version, "reverted migration");
        Ok(())
    }

    /// Compare the ledger with the loaded definitions.
    pub async fn status(&self) -> Result<MigrationStatusReport, MigrationError> {
        let definitions = self.load()?;
        let records = self.applied_records().await?;
        let plan = resolve(&definitions, &versions(&records), None);

        let mut pending: Vec<PendingMigration> = plan
            .pending
            .iter()
            .map(|m| PendingMigration {
                version: m.version().to_string(),
                description: m.description().to_string(),
                unmet_dependencies: Vec::new(),
            })
            .collect();
        for blocked in plan.blocked {
            let description = definitions
                .get(&blocked.version)
                .map(|m| m.description().to_string())
                .unwrap_or_default();
            pending.push(PendingMigration {
                version: blocked.version,
                description,
                unmet_dependencies: blocked.unmet,
            });
        }
        pending.sort_by(|a, b| a.version.cmp(&b.version));

        let mut report = MigrationStatusReport {
            pending,
            ..Default::default()
        };
        for record in records {
            match definitions.get(&record.version) {
                None => {
                    warn!(version = %record.version, "applied migration has no definition");
                    report.missing.push(record.clone());
                }
                Some(migration) => {
                    if let Some(recorded) = &record.checksum {
                        if *recorded != migration.checksum() {
                            report.drifted.push(record.version.clone());
                        }
                    }
                }
            }
            report.applied.push(record);
        }

        Ok(report)
    }
}

fn versions(records: &[MigrationRecord]) -> BTreeSet<String> {
    records.iter().map(|r| r.version.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Executor, SqliteDatabase};
    use crate::migration::{MigrationOps, SqlMigration};
    use async_trait::async_trait;

    fn db() -> Arc<dyn Database> {
        Arc::new(SqliteDatabase::open_in_memory().unwrap())
    }

    fn table_migration(version: &str, table: &str) -> Migration {
        Migration::new(
            version,
            format!("create {}", table),
            SqlMigration::new(
                [format!("CREATE TABLE {} (id INTEGER PRIMARY KEY)", table)],
                [format!("DROP TABLE {}", table)],
            ),
        )
        .unwrap()
    }

    async fn table_names(db: &Arc<dyn Database>) -> Vec<String> {
        db.query(
            "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
            &[],
        )
        .await
        .unwrap()
        .iter()
        .map(|row| row.text("name").unwrap())
        .collect()
    }

    #[tokio::test]
    async fn test_duplicate_version_fails_load() {
        let migrator = Migrator::new(
            db(),
            vec![table_migration("v1", "a"), table_migration("v1", "b")],
            MigratorConfig::default(),
        );
        assert!(matches!(migrator.load(), Err(MigrationError::DuplicateVersion(v)) if v == "v1"));
        assert!(migrator.migrate(None).await.is_err());
    }

    #[tokio::test]
    async fn test_migrate_twice_is_noop() {
        let db = db();
        let migrator = Migrator::new(db.clone(), vec![table_migration("v1", "users")], MigratorConfig::default());

        let first = migrator.migrate(None).await.unwrap();
        assert_eq!(first.applied.len(), 1);
        assert_eq!(first.applied[0].version, "v1");

        let second = migrator.migrate(None).await.unwrap();
        assert!(second.is_noop());
        assert!(table_names(&db).await.contains(&"users".to_string()));
    }

    #[tokio::test]
    async fn test_post_check_failure_rolls_back() {
        let db = db();
        let failing = Migration::new(
            "v1",
            "create users",
            SqlMigration::new(["CREATE TABLE users (id INTEGER)"], ["DROP TABLE users"])
                .with_post_check("SELECT 0"),
        )
        .unwrap();
        let migrator = Migrator::new(db.clone(), vec![failing], MigratorConfig::default());

        let err = migrator.migrate(None).await.unwrap_err();
        assert!(matches!(err, MigrationError::PostCheckFailed { ref version, .. } if version == "v1"));
        assert!(!table_names(&db).await.contains(&"users".to_string()));
        assert!(migrator.status().await.unwrap().applied.is_empty());
    }

    #[tokio::test]
    async fn test_up_failure_reports_version() {
        let broken = Migration::new("v2", "broken", SqlMigration::new(["CREATE TABLE"], [""])).unwrap();
        let migrator = Migrator::new(
            db(),
            vec![table_migration("v1", "a"), broken],
            MigratorConfig::default(),
        );

        let err = migrator.migrate(None).await.unwrap_err();
        assert_eq!(err.version(), Some("v2"));
        let status = migrator.status().await.unwrap();
        assert_eq!(status.applied.len(), 1);
        assert_eq!(status.pending.len(), 1);
    }

    struct FailingDown;

    #[async_trait]
    impl MigrationOps for FailingDown {
        async fn up(&self, tx: &mut dyn Executor) -> Result<(), DatabaseError> {
            tx.execute("CREATE TABLE sticky (id INTEGER)", &[]).await?;
            Ok(())
        }

        async fn down(&self, _tx: &mut dyn Executor) -> Result<(), DatabaseError> {
            Err(DatabaseError::Statement("cannot drop sticky".into()))
        }

        fn render(&self) -> String {
            "sticky".to_string()
        }
    }

    #[tokio::test]
    async fn test_rollback_stops_at_failing_down() {
        let db = db();
        let migrator = Migrator::new(
            db.clone(),
            vec![
                table_migration("v1", "a"),
                Migration::new("v2", "sticky", FailingDown).unwrap(),
                table_migration("v3", "c"),
            ],
            MigratorConfig::default(),
        );
        migrator.migrate(None).await.unwrap();

        let err = migrator.rollback("").await.unwrap_err();
        assert!(matches!(err, MigrationError::Rollback { ref version, .. } if version == "v2"));

        let applied: Vec<String> = migrator
            .status()
            .await
            .unwrap()
            .applied
            .into_iter()
            .map(|r| r.version)
            .collect();
        assert_eq!(applied, vec!["v1", "v2"]);
        assert!(!table_names(&db).await.contains(&"c".to_string()));
    }

    #[tokio::test]
    async fn test_rollback_requires_definitions() {
        let db = db();
        Migrator::new(db.clone(), vec![table_migration("v1", "a")], MigratorConfig::default())
            .migrate(None)
            .await
            .unwrap();

        let without = Migrator::new(db.clone(), Vec::new(), MigratorConfig::default());
        assert!(matches!(
            without.rollback("").await,
            Err(MigrationError::MissingDefinition(v)) if v == "v1"
        ));

        let status = without.status().await.unwrap();
        assert_eq!(status.missing.len(), 1);
        assert!(status.has_discrepancies());
    }

    #[tokio::test]
    async fn test_status_reports_drift_and_blocked() {
        let db = db();
        Migrator::new(db.clone(), vec![table_migration("v1", "a")], MigratorConfig::default())
            .migrate(None)
            .await
            .unwrap();

        let edited = Migration::new(
            "v1",
            "create a",
            SqlMigration::new(["CREATE TABLE a (id TEXT)"], ["DROP TABLE a"]),
        )
        .unwrap();
        let blocked = table_migration("v3", "c").depends_on("v2");
        let migrator = Migrator::new(db, vec![edited, blocked], MigratorConfig::default());

        let status = migrator.status().await.unwrap();
        assert_eq!(status.drifted, vec!["v1".to_string()]);
        assert_eq!(status.pending.len(), 1);
        assert_eq!(status.pending[0].unmet_dependencies, vec!["v2".to_string()]);
    }

    #[tokio::test]
    async fn test_custom_ledger_table() {
        let db = db();
        let migrator = Migrator::new(
            db.clone(),
            vec![table_migration("v1", "a")],
            MigratorConfig::default().with_ledger_table("app_migrations"),
        );
        migrator.migrate(None).await.unwrap();
        let tables = table_names(&db).await;
        assert!(tables.contains(&"app_migrations".to_string()));
        assert!(!tables.contains(&"schema_migrations".to_string()));
    }
}

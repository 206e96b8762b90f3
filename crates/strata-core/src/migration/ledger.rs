//! Persistent record of applied migrations.
//!
//! The ledger lives in the target database itself, so writes to it share the
//! transaction of the migration they describe.

use chrono::{DateTime, Utc};

use super::error::MigrationError;
use crate::db::{quote_ident, Database, Executor, Row, SqlValue};
use crate::error::DatabaseError;
use crate::model::MigrationRecord;

/// Default ledger table name.
pub const DEFAULT_LEDGER_TABLE: &str = "schema_migrations";

/// Access to the ledger table.
#[derive(Debug, Clone)]
pub(crate) struct Ledger {
    table: String,
}

impl Ledger {
    pub(crate) fn new(table: impl Into<String>) -> Self {
        Self { table: table.into() }
    }

    pub(crate) fn table(&self) -> &str {
        &self.table
    }

    /// Create the table and its index if they do not exist.
    pub(crate) async fn ensure(&self, db: &dyn Database) -> Result<(), MigrationError> {
        let table = quote_ident(&self.table);
        let create = format!(
            "CREATE TABLE IF NOT EXISTS {table} (\n\
             \x20   version TEXT PRIMARY KEY,\n\
             \x20   description TEXT NOT NULL,\n\
             \x20   author TEXT NOT NULL,\n\
             \x20   applied_at TEXT NOT NULL,\n\
             \x20   execution_time_ms {bigint} NOT NULL,\n\
             \x20   checksum TEXT\n\
             )",
            table = table,
            bigint = db.dialect().bigint(),
        );
        db.execute(&create, &[]).await?;

        let index = format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} (applied_at)",
            quote_ident(&format!("idx_{}_applied_at", self.table)),
            table
        );
        db.execute(&index, &[]).await?;
        Ok(())
    }

    /// All ledger rows ordered by version.
    pub(crate) async fn applied(&self, db: &dyn Database) -> Result<Vec<MigrationRecord>, MigrationError> {
        let sql = format!(
            "SELECT version, description, author, applied_at, execution_time_ms, checksum \
             FROM {} ORDER BY version",
            quote_ident(&self.table)
        );
        db.query(&sql, &[])
            .await?
            .iter()
            .map(decode_record)
            .collect()
    }

    /// Insert a row inside the caller's transaction.
    pub(crate) async fn insert(
        &self,
        tx: &mut dyn Executor,
        record: &MigrationRecord,
    ) -> Result<(), DatabaseError> {
        let dialect = tx.dialect();
        let placeholders: Vec<String> = (1..=6).map(|i| dialect.placeholder(i)).collect();
        let sql = format!(
            "INSERT INTO {} (version, description, author, applied_at, execution_time_ms, checksum) \
             VALUES ({})",
            quote_ident(&self.table),
            placeholders.join(", ")
        );
        let params = [
            SqlValue::from(record.version.as_str()),
            SqlValue::from(record.description.as_str()),
            SqlValue::from(record.author.as_str()),
            SqlValue::from(record.applied_at.to_rfc3339()),
            SqlValue::Integer(i64::try_from(record.execution_time_ms).unwrap_or(i64::MAX)),
            SqlValue::from(record.checksum.clone()),
        ];
        tx.execute(&sql, &params).await?;
        Ok(())
    }

    /// Delete a row inside the caller's transaction.
    pub(crate) async fn remove(&self, tx: &mut dyn Executor, version: &str) -> Result<u64, DatabaseError> {
        let sql = format!(
            "DELETE FROM {} WHERE version = {}",
            quote_ident(&self.table),
            tx.dialect().placeholder(1)
        );
        tx.execute(&sql, &[SqlValue::from(version)]).await
    }
}

fn decode_record(row: &Row) -> Result<MigrationRecord, MigrationError> {
    let version = row.text("version")?;
    let applied_at = row.text("applied_at")?;
    let applied_at = DateTime::parse_from_rfc3339(&applied_at)
        .map_err(|e| MigrationError::CorruptLedger {
            version: version.clone(),
            reason: format!("applied_at '{}': {}", applied_at, e),
        })?
        .with_timezone(&Utc);

    Ok(MigrationRecord {
        description: row.text("description")?,
        author: row.text("author")?,
        applied_at,
        execution_time_ms: row.integer("execution_time_ms")?.max(0) as u64,
        checksum: row.opt_text("checksum")?,
        version,
    })
}

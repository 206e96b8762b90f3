//! Migration definitions.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::error::MigrationError;
use crate::db::Executor;
use crate::error::DatabaseError;

/// The executable part of a migration.
///
/// Every method runs inside the transaction the migrator opened for this
/// migration, so anything done here is rolled back together with the ledger
/// write when a later step fails.
#[async_trait]
pub trait MigrationOps: Send + Sync {
    /// Apply the change.
    async fn up(&self, tx: &mut dyn Executor) -> Result<(), DatabaseError>;

    /// Revert the change.
    async fn down(&self, tx: &mut dyn Executor) -> Result<(), DatabaseError>;

    /// Guard evaluated before `up`. Returning `false` aborts the batch.
    async fn pre_check(&self, _tx: &mut dyn Executor) -> Result<bool, DatabaseError> {
        Ok(true)
    }

    /// Guard evaluated after `up`. Returning `false` rolls the migration back.
    async fn post_check(&self, _tx: &mut dyn Executor) -> Result<bool, DatabaseError> {
        Ok(true)
    }

    /// Stable textual rendering of the operations, used for drift detection.
    fn render(&self) -> String;
}

/// A versioned schema change.
///
/// Identity fields are fixed at construction; only builder methods that
/// consume the value can add an author or dependencies.
#[derive(Clone)]
pub struct Migration {
    version: String,
    description: String,
    author: String,
    dependencies: BTreeSet<String>,
    ops: Arc<dyn MigrationOps>,
}

impl Migration {
    /// Create a migration. `version` and `description` must be non-empty.
    pub fn new(
        version: impl Into<String>,
        description: impl Into<String>,
        ops: impl MigrationOps + 'static,
    ) -> Result<Self, MigrationError> {
        Self::from_arc(version, description, Arc::new(ops))
    }

    /// Create a migration from shared operations.
    pub fn from_arc(
        version: impl Into<String>,
        description: impl Into<String>,
        ops: Arc<dyn MigrationOps>,
    ) -> Result<Self, MigrationError> {
        let version = version.into().trim().to_string();
        let description = description.into().trim().to_string();

        if version.is_empty() {
            return Err(MigrationError::InvalidDefinition(
                "migration version must not be empty".to_string(),
            ));
        }
        if description.is_empty() {
            return Err(MigrationError::InvalidDefinition(format!(
                "migration {} has an empty description",
                version
            )));
        }

        Ok(Self {
            version,
            description,
            author: String::new(),
            dependencies: BTreeSet::new(),
            ops,
        })
    }

    /// Set the author.
    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = author.into();
        self
    }

    /// Add a dependency on another migration version.
    pub fn depends_on(mut self, version: impl Into<String>) -> Self {
        self.dependencies.insert(version.into());
        self
    }

    /// Add several dependencies.
    pub fn with_dependencies<I, S>(mut self, versions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(versions.into_iter().map(Into::into));
        self
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn author(&self) -> &str {
        &self.author
    }

    /// Versions that must be applied before this one.
    pub fn dependencies(&self) -> &BTreeSet<String> {
        &self.dependencies
    }

    pub(crate) fn ops(&self) -> &dyn MigrationOps {
        self.ops.as_ref()
    }

    /// Hex SHA-256 of the rendered operations.
    pub fn checksum(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.version.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.ops.render().as_bytes());
        hex::encode(hasher.finalize())
    }
}

impl std::fmt::Debug for Migration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migration")
            .field("version", &self.version)
            .field("description", &self.description)
            .field("author", &self.author)
            .field("dependencies", &self.dependencies)
            .finish_non_exhaustive()
    }
}

/// Migration operations written as plain SQL.
///
/// Statements run in order. A check query passes when its first row's first
/// column is truthy; an empty result fails the check.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SqlMigration {
    up: Vec<String>,
    down: Vec<String>,
    pre_check: Option<String>,
    post_check: Option<String>,
}

impl SqlMigration {
    /// Create from `up` and `down` statement lists.
    pub fn new<U, D>(up: U, down: D) -> Self
    where
        U: IntoIterator,
        U::Item: Into<String>,
        D: IntoIterator,
        D::Item: Into<String>,
    {
        Self {
            up: up.into_iter().map(Into::into).collect(),
            down: down.into_iter().map(Into::into).collect(),
            pre_check: None,
            post_check: None,
        }
    }

    /// Set the query evaluated before `up`.
    pub fn with_pre_check(mut self, query: impl Into<String>) -> Self {
        self.pre_check = Some(query.into());
        self
    }

    /// Set the query evaluated after `up`.
    pub fn with_post_check(mut self, query: impl Into<String>) -> Self {
        self.post_check = Some(query.into());
        self
    }
}

async fn run_all(tx: &mut dyn Executor, statements: &[String]) -> Result<(), DatabaseError> {
    for statement in statements {
        if statement.trim().is_empty() {
            continue;
        }
        tx.execute(statement, &[]).await?;
    }
    Ok(())
}

async fn run_check(tx: &mut dyn Executor, query: Option<&str>) -> Result<bool, DatabaseError> {
    let Some(query) = query else {
        return Ok(true);
    };
    let rows = tx.query(query, &[]).await?;
    Ok(rows
        .first()
        .and_then(|row| row.get(0))
        .map(|value| value.is_truthy())
        .unwrap_or(false))
}

#[async_trait]
impl MigrationOps for SqlMigration {
    async fn up(&self, tx: &mut dyn Executor) -> Result<(), DatabaseError> {
        run_all(tx, &self.up).await
    }

    async fn down(&self, tx: &mut dyn Executor) -> Result<(), DatabaseError> {
        run_all(tx, &self.down).await
    }

    async fn pre_check(&self, tx: &mut dyn Executor) -> Result<bool, DatabaseError> {
        run_check(tx, self.pre_check.as_deref()).await
    }

    async fn post_check(&self, tx: &mut dyn Executor) -> Result<bool, DatabaseError> {
        run_check(tx, self.post_check.as_deref()).await
    }

    fn render(&self) -> String {
        let mut out = String::new();
        for (label, statements) in [("up", &self.up), ("down", &self.down)] {
            out.push_str("-- ");
            out.push_str(label);
            out.push('\n');
            for statement in statements {
                out.push_str(statement.trim());
                out.push('\n');
            }
        }
        if let Some(check) = &self.pre_check {
            out.push_str("-- pre_check\n");
            out.push_str(check.trim());
            out.push('\n');
        }
        if let Some(check) = &self.post_check {
            out.push_str("-- post_check\n");
            out.push_str(check.trim());
            out.push('\n');
        }
        out
    }
}

//! Database abstraction used by the migration and recovery engines.
//!
//! The engines never talk to a driver directly. They go through three seams:
//!
//! - [`Database`]: a shared handle that can run autocommit statements and
//!   open transactions.
//! - [`Transaction`]: a scoped unit of work. Dropping an unfinished
//!   transaction rolls it back, so every exit path is covered.
//! - [`DatabaseAdmin`]: administrative statements (create/drop database)
//!   needed for restore and clone.
//!
//! Two drivers are provided: [`SqliteDatabase`] (always available) and
//! `PostgresDatabase`/`PostgresAdmin` behind the `postgres` feature.

mod sqlite;
#[cfg(feature = "postgres")]
mod postgres;

pub use sqlite::{SqliteDatabase, SqliteTransaction};
#[cfg(feature = "postgres")]
pub use postgres::{PostgresAdmin, PostgresDatabase, PostgresTransaction};

use async_trait::async_trait;

use crate::error::DatabaseError;

/// A single bound parameter or column value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    /// SQL NULL.
    Null,
    /// 64-bit integer.
    Integer(i64),
    /// Double precision float.
    Real(f64),
    /// UTF-8 text.
    Text(String),
    /// Boolean.
    Bool(bool),
}

impl SqlValue {
    /// Interpret the value as a check result.
    ///
    /// Non-zero numbers, `true`, and the texts `t`/`true`/`1` are truthy.
    pub fn is_truthy(&self) -> bool {
        match self {
            SqlValue::Null => false,
            SqlValue::Integer(i) => *i != 0,
            SqlValue::Real(f) => *f != 0.0,
            SqlValue::Bool(b) => *b,
            SqlValue::Text(s) => matches!(s.trim().to_ascii_lowercase().as_str(), "t" | "true" | "1"),
        }
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        SqlValue::Text(value)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::Integer(value)
    }
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        SqlValue::Bool(value)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

/// A result row.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<SqlValue>,
}

impl Row {
    /// Create a row from column names and values.
    pub fn new(columns: Vec<String>, values: Vec<SqlValue>) -> Self {
        Self { columns, values }
    }

    /// Column names in select order.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Number of values in the row.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the row has no values.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Get a value by index.
    pub fn get(&self, index: usize) -> Option<&SqlValue> {
        self.values.get(index)
    }

    /// Get a value by column name.
    pub fn get_named(&self, name: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .position(|c| c == name)
            .and_then(|idx| self.values.get(idx))
    }

    fn value(&self, name: &str) -> Result<&SqlValue, DatabaseError> {
        self.get_named(name)
            .ok_or_else(|| DatabaseError::ColumnNotFound(name.to_string()))
    }

    /// Read a non-null text column.
    pub fn text(&self, name: &str) -> Result<String, DatabaseError> {
        match self.value(name)? {
            SqlValue::Text(s) => Ok(s.clone()),
            _ => Err(DatabaseError::ColumnType {
                column: name.to_string(),
                expected: "text",
            }),
        }
    }

    /// Read a nullable text column.
    pub fn opt_text(&self, name: &str) -> Result<Option<String>, DatabaseError> {
        match self.value(name)? {
            SqlValue::Null => Ok(None),
            SqlValue::Text(s) => Ok(Some(s.clone())),
            _ => Err(DatabaseError::ColumnType {
                column: name.to_string(),
                expected: "text",
            }),
        }
    }

    /// Read a non-null integer column.
    pub fn integer(&self, name: &str) -> Result<i64, DatabaseError> {
        match self.value(name)? {
            SqlValue::Integer(i) => Ok(*i),
            _ => Err(DatabaseError::ColumnType {
                column: name.to_string(),
                expected: "integer",
            }),
        }
    }
}

/// SQL dialect, used to render placeholders and DDL differences.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// SQLite (`?1`, `?2`, ...).
    Sqlite,
    /// PostgreSQL (`$1`, `$2`, ...).
    Postgres,
}

impl Dialect {
    /// Render the 1-based positional placeholder `index`.
    pub fn placeholder(&self, index: usize) -> String {
        match self {
            Dialect::Sqlite => format!("?{}", index),
            Dialect::Postgres => format!("${}", index),
        }
    }

    /// Type name used for 64-bit integer columns.
    pub fn bigint(&self) -> &'static str {
        match self {
            Dialect::Sqlite => "INTEGER",
            Dialect::Postgres => "BIGINT",
        }
    }
}

/// Quote an SQL identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Anything that can run statements: a transaction or a connection.
#[async_trait]
pub trait Executor: Send {
    /// The dialect of the underlying driver.
    fn dialect(&self) -> Dialect;

    /// Execute a statement and return the number of affected rows.
    ///
    /// Without parameters the text may contain several statements.
    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64, DatabaseError>;

    /// Run a query and collect its rows.
    async fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, DatabaseError>;
}

/// An open transaction.
///
/// Implementations roll back when dropped without [`Transaction::commit`].
#[async_trait]
pub trait Transaction: Executor {
    /// View the transaction as a plain executor.
    fn as_executor(&mut self) -> &mut dyn Executor;

    /// Commit the transaction.
    async fn commit(self: Box<Self>) -> Result<(), DatabaseError>;

    /// Roll the transaction back explicitly.
    async fn rollback(self: Box<Self>) -> Result<(), DatabaseError>;
}

/// A shared database handle.
#[async_trait]
pub trait Database: Send + Sync {
    /// The dialect of the underlying driver.
    fn dialect(&self) -> Dialect;

    /// Execute an autocommit statement.
    async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64, DatabaseError>;

    /// Run an autocommit query.
    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, DatabaseError>;

    /// Acquire a connection and open a transaction on it.
    async fn begin(&self) -> Result<Box<dyn Transaction>, DatabaseError>;
}

/// Administrative operations on whole databases.
#[async_trait]
pub trait DatabaseAdmin: Send + Sync {
    /// Whether a database with this name exists.
    async fn database_exists(&self, name: &str) -> Result<bool, DatabaseError>;

    /// Create a database, optionally as a copy of `template`.
    async fn create_database(&self, name: &str, template: Option<&str>)
        -> Result<(), DatabaseError>;

    /// Drop a database if it exists.
    async fn drop_database(&self, name: &str) -> Result<(), DatabaseError>;

    /// Count user schema objects (tables) in a database.
    async fn count_schema_objects(&self, name: &str) -> Result<u64, DatabaseError>;
}

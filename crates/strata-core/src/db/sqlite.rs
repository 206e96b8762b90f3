//! SQLite driver built on rusqlite.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::types::{ToSqlOutput, Value, ValueRef};
use rusqlite::Connection;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::warn;

use super::{Database, Dialect, Executor, Row, SqlValue, Transaction};
use crate::error::DatabaseError;

impl rusqlite::ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlValue::Null => ToSqlOutput::Owned(Value::Null),
            SqlValue::Integer(i) => ToSqlOutput::Owned(Value::Integer(*i)),
            SqlValue::Real(f) => ToSqlOutput::Owned(Value::Real(*f)),
            SqlValue::Bool(b) => ToSqlOutput::Owned(Value::Integer(i64::from(*b))),
            SqlValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
        })
    }
}

impl From<ValueRef<'_>> for SqlValue {
    fn from(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => SqlValue::Null,
            ValueRef::Integer(i) => SqlValue::Integer(i),
            ValueRef::Real(f) => SqlValue::Real(f),
            ValueRef::Text(bytes) => SqlValue::Text(String::from_utf8_lossy(bytes).into_owned()),
            ValueRef::Blob(bytes) => SqlValue::Text(hex::encode(bytes)),
        }
    }
}

fn execute_on(conn: &Connection, sql: &str, params: &[SqlValue]) -> Result<u64, DatabaseError> {
    if params.is_empty() {
        conn.execute_batch(sql)?;
        return Ok(conn.changes() as u64);
    }
    let affected = conn.execute(sql, rusqlite::params_from_iter(params.iter()))?;
    Ok(affected as u64)
}

fn query_on(conn: &Connection, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, DatabaseError> {
    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let mut rows = stmt.query(rusqlite::params_from_iter(params.iter()))?;

    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut values = Vec::with_capacity(columns.len());
        for idx in 0..columns.len() {
            values.push(SqlValue::from(row.get_ref(idx)?));
        }
        out.push(Row::new(columns.clone(), values));
    }
    Ok(out)
}

/// SQLite database handle.
///
/// SQLite allows a single writer, so the handle owns one connection. A
/// transaction keeps the connection locked until it is committed, rolled
/// back, or dropped. Statements run on the blocking pool.
#[derive(Clone)]
pub struct SqliteDatabase {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteDatabase {
    /// Open (or create) a database file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DatabaseError> {
        let conn = Connection::open(path)?;
        Ok(Self::from_connection(conn))
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self, DatabaseError> {
        let conn = Connection::open_in_memory()?;
        Ok(Self::from_connection(conn))
    }

    /// Wrap an existing connection.
    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }
}

/// Run `f` against the locked connection on the blocking pool and hand the
/// guard back.
async fn with_conn<T, F>(
    conn: OwnedMutexGuard<Connection>,
    f: F,
) -> Result<(OwnedMutexGuard<Connection>, Result<T, DatabaseError>), DatabaseError>
where
    T: Send + 'static,
    F: FnOnce(&Connection) -> Result<T, DatabaseError> + Send + 'static,
{
    Ok(tokio::task::spawn_blocking(move || {
        let result = f(&*conn);
        (conn, result)
    })
    .await?)
}

#[async_trait]
impl Database for SqliteDatabase {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64, DatabaseError> {
        let conn = Arc::clone(&self.conn).lock_owned().await;
        let (sql, params) = (sql.to_string(), params.to_vec());
        with_conn(conn, move |conn| execute_on(conn, &sql, &params)).await?.1
    }

    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, DatabaseError> {
        let conn = Arc::clone(&self.conn).lock_owned().await;
        let (sql, params) = (sql.to_string(), params.to_vec());
        with_conn(conn, move |conn| query_on(conn, &sql, &params)).await?.1
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>, DatabaseError> {
        let conn = Arc::clone(&self.conn).lock_owned().await;
        let (conn, begun) = with_conn(conn, |conn| Ok(conn.execute_batch("BEGIN")?)).await?;
        begun?;
        Ok(Box::new(SqliteTransaction { conn: Some(conn) }))
    }
}

/// An open SQLite transaction.
pub struct SqliteTransaction {
    conn: Option<OwnedMutexGuard<Connection>>,
}

impl SqliteTransaction {
    async fn run<T, F>(&mut self, f: F) -> Result<T, DatabaseError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, DatabaseError> + Send + 'static,
    {
        let conn = self.conn.take().ok_or(DatabaseError::TransactionFinished)?;
        let (conn, result) = with_conn(conn, f).await?;
        self.conn = Some(conn);
        result
    }

    async fn finish(&mut self, statement: &'static str) -> Result<(), DatabaseError> {
        let conn = self.conn.take().ok_or(DatabaseError::TransactionFinished)?;
        with_conn(conn, move |conn| Ok(conn.execute_batch(statement)?)).await?.1
    }
}

#[async_trait]
impl Executor for SqliteTransaction {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64, DatabaseError> {
        let (sql, params) = (sql.to_string(), params.to_vec());
        self.run(move |conn| execute_on(conn, &sql, &params)).await
    }

    async fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, DatabaseError> {
        let (sql, params) = (sql.to_string(), params.to_vec());
        self.run(move |conn| query_on(conn, &sql, &params)).await
    }
}

#[async_trait]
impl Transaction for SqliteTransaction {
    fn as_executor(&mut self) -> &mut dyn Executor {
        self
    }

    async fn commit(self: Box<Self>) -> Result<(), DatabaseError> {
        let mut this = self;
        this.finish("COMMIT").await
    }

    async fn rollback(self: Box<Self>) -> Result<(), DatabaseError> {
        let mut this = self;
        this.finish("ROLLBACK").await
    }
}

impl Drop for SqliteTransaction {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Err(error) = conn.execute_batch("ROLLBACK") {
                warn!(%error, "failed to roll back abandoned transaction");
            }
        }
    }
}

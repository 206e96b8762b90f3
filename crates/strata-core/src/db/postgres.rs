//! PostgreSQL driver built on sqlx.

use async_trait::async_trait;
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{Column, Connection, PgConnection, PgPool, Postgres, Row as _, TypeInfo, ValueRef};
use tracing::info;

use super::{quote_ident, Database, DatabaseAdmin, Dialect, Executor, Row, SqlValue, Transaction};
use crate::config::ConnectionParams;
use crate::error::DatabaseError;

fn bind_all<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    params: &'q [SqlValue],
) -> Query<'q, Postgres, PgArguments> {
    for param in params {
        query = match param {
            SqlValue::Null => query.bind(None::<String>),
            SqlValue::Integer(i) => query.bind(*i),
            SqlValue::Real(f) => query.bind(*f),
            SqlValue::Text(s) => query.bind(s.as_str()),
            SqlValue::Bool(b) => query.bind(*b),
        };
    }
    query
}

fn decode_row(row: &PgRow) -> Result<Row, DatabaseError> {
    let mut columns = Vec::with_capacity(row.columns().len());
    let mut values = Vec::with_capacity(row.columns().len());

    for (idx, column) in row.columns().iter().enumerate() {
        columns.push(column.name().to_string());

        if row.try_get_raw(idx)?.is_null() {
            values.push(SqlValue::Null);
            continue;
        }

        let value = match column.type_info().name() {
            "INT2" => SqlValue::Integer(i64::from(row.try_get::<i16, _>(idx)?)),
            "INT4" => SqlValue::Integer(i64::from(row.try_get::<i32, _>(idx)?)),
            "INT8" => SqlValue::Integer(row.try_get::<i64, _>(idx)?),
            "FLOAT4" => SqlValue::Real(f64::from(row.try_get::<f32, _>(idx)?)),
            "FLOAT8" => SqlValue::Real(row.try_get::<f64, _>(idx)?),
            "BOOL" => SqlValue::Bool(row.try_get::<bool, _>(idx)?),
            "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" => SqlValue::Text(row.try_get::<String, _>(idx)?),
            other => {
                return Err(DatabaseError::Unsupported(format!(
                    "column {} has unsupported type {}",
                    column.name(),
                    other
                )))
            }
        };
        values.push(value);
    }

    Ok(Row::new(columns, values))
}

async fn execute_on(
    conn: &mut PgConnection,
    sql: &str,
    params: &[SqlValue],
) -> Result<u64, DatabaseError> {
    let result = if params.is_empty() {
        sqlx::Executor::execute(conn, sqlx::raw_sql(sql)).await?
    } else {
        bind_all(sqlx::query(sql), params).execute(conn).await?
    };
    Ok(result.rows_affected())
}

async fn query_on(
    conn: &mut PgConnection,
    sql: &str,
    params: &[SqlValue],
) -> Result<Vec<Row>, DatabaseError> {
    let rows = bind_all(sqlx::query(sql), params).fetch_all(conn).await?;
    rows.iter().map(decode_row).collect()
}

/// PostgreSQL database handle backed by a connection pool.
#[derive(Clone)]
pub struct PostgresDatabase {
    pool: PgPool,
}

impl PostgresDatabase {
    /// Connect a pool to the database described by `params`.
    pub async fn connect(params: &ConnectionParams, max_connections: u32) -> Result<Self, DatabaseError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(&params.to_url())
            .await?;
        info!(host = %params.host, database = %params.database, "connected to postgres");
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Database for PostgresDatabase {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64, DatabaseError> {
        let mut conn = self.pool.acquire().await?;
        execute_on(&mut *conn, sql, params).await
    }

    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, DatabaseError> {
        let mut conn = self.pool.acquire().await?;
        query_on(&mut *conn, sql, params).await
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>, DatabaseError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PostgresTransaction { tx: Some(tx) }))
    }
}

/// An open PostgreSQL transaction. sqlx rolls back on drop.
pub struct PostgresTransaction {
    tx: Option<sqlx::Transaction<'static, Postgres>>,
}

impl PostgresTransaction {
    fn conn(&mut self) -> Result<&mut PgConnection, DatabaseError> {
        match self.tx.as_mut() {
            Some(tx) => Ok(&mut **tx),
            None => Err(DatabaseError::TransactionFinished),
        }
    }
}

#[async_trait]
impl Executor for PostgresTransaction {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64, DatabaseError> {
        execute_on(self.conn()?, sql, params).await
    }

    async fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, DatabaseError> {
        query_on(self.conn()?, sql, params).await
    }
}

#[async_trait]
impl Transaction for PostgresTransaction {
    fn as_executor(&mut self) -> &mut dyn Executor {
        self
    }

    async fn commit(self: Box<Self>) -> Result<(), DatabaseError> {
        let mut this = self;
        let tx = this.tx.take().ok_or(DatabaseError::TransactionFinished)?;
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), DatabaseError> {
        let mut this = self;
        let tx = this.tx.take().ok_or(DatabaseError::TransactionFinished)?;
        tx.rollback().await?;
        Ok(())
    }
}

/// Administrative access to a PostgreSQL cluster.
///
/// Statements run against the maintenance database (`postgres` by default)
/// because a database cannot be dropped while connected to it.
pub struct PostgresAdmin {
    params: ConnectionParams,
    maintenance_database: String,
}

impl PostgresAdmin {
    /// Create an admin handle for the cluster described by `params`.
    pub fn new(params: ConnectionParams) -> Self {
        Self {
            params,
            maintenance_database: "postgres".to_string(),
        }
    }

    /// Use a different maintenance database.
    pub fn with_maintenance_database(mut self, name: impl Into<String>) -> Self {
        self.maintenance_database = name.into();
        self
    }

    async fn connect_to(&self, database: &str) -> Result<PgConnection, DatabaseError> {
        let url = self.params.with_database(database).to_url();
        Ok(PgConnection::connect(&url).await?)
    }
}

#[async_trait]
impl DatabaseAdmin for PostgresAdmin {
    async fn database_exists(&self, name: &str) -> Result<bool, DatabaseError> {
        let mut conn = self.connect_to(&self.maintenance_database).await?;
        let row: Option<(i32,)> = sqlx::query_as("SELECT 1 FROM pg_database WHERE datname = $1")
            .bind(name)
            .fetch_optional(&mut conn)
            .await?;
        Ok(row.is_some())
    }

    async fn create_database(
        &self,
        name: &str,
        template: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let mut conn = self.connect_to(&self.maintenance_database).await?;
        let sql = match template {
            Some(template) => format!(
                "CREATE DATABASE {} TEMPLATE {}",
                quote_ident(name),
                quote_ident(template)
            ),
            None => format!("CREATE DATABASE {}", quote_ident(name)),
        };
        sqlx::Executor::execute(&mut conn, sqlx::raw_sql(&sql)).await?;
        info!(database = name, template, "created database");
        Ok(())
    }

    async fn drop_database(&self, name: &str) -> Result<(), DatabaseError> {
        let mut conn = self.connect_to(&self.maintenance_database).await?;
        let sql = format!("DROP DATABASE IF EXISTS {}", quote_ident(name));
        sqlx::Executor::execute(&mut conn, sqlx::raw_sql(&sql)).await?;
        info!(database = name, "dropped database");
        Ok(())
    }

    async fn count_schema_objects(&self, name: &str) -> Result<u64, DatabaseError> {
        let mut conn = self.connect_to(name).await?;
        let (count,): (i64,) = sqlx::query_as(
            "SELECT count(*) FROM information_schema.tables \
             WHERE table_schema NOT IN ('pg_catalog', 'information_schema')",
        )
        .fetch_one(&mut conn)
        .await?;
        Ok(count.max(0) as u64)
    }
}

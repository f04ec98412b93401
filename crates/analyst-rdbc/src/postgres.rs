//! PostgreSQL backend implementation for analyst-rdbc
//!
//! Provides PostgreSQL-specific implementations:
//! - Connection and prepared statements
//! - Transactions, each on a client of its own
//! - Lazy row streams over `query_raw`

use async_trait::async_trait;
use futures::StreamExt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_postgres::types::{ToSql, Type};
use tracing::{error, warn};

use crate::connection::{
    Connection, ConnectionConfig, ConnectionFactory, DatabaseType, PreparedStatement, RowStream,
    Transaction,
};
use crate::dialect::{PostgresDialect, SqlDialect};
use crate::error::{Error, Result};
use crate::types::{Row, Value};

type BoxedParam = Box<dyn ToSql + Sync + Send>;

/// Convert an analyst Value to a tokio-postgres compatible parameter
fn value_to_sql(value: &Value) -> BoxedParam {
    match value {
        Value::Null => Box::new(Option::<String>::None),
        Value::Bool(b) => Box::new(*b),
        Value::Int8(n) => Box::new(i16::from(*n)), // PostgreSQL has no 1-byte integer
        Value::Int16(n) => Box::new(*n),
        Value::Int32(n) => Box::new(*n),
        Value::Int64(n) => Box::new(*n),
        Value::Float32(n) => Box::new(*n),
        Value::Float64(n) => Box::new(*n),
        Value::String(s) => Box::new(s.clone()),
        Value::Bytes(b) => Box::new(b.clone()),
        Value::Date(d) => Box::new(*d),
        Value::DateTime(dt) => Box::new(*dt),
        Value::DateTimeTz(dt) => Box::new(*dt),
        Value::Json(j) => Box::new(j.clone()),
    }
}

fn param_refs(boxed: &[BoxedParam]) -> Vec<&(dyn ToSql + Sync)> {
    boxed.iter().map(|b| b.as_ref() as &(dyn ToSql + Sync)).collect()
}

fn decode<'a, T>(row: &'a tokio_postgres::Row, idx: usize, wrap: fn(T) -> Value) -> Result<Value>
where
    T: tokio_postgres::types::FromSql<'a>,
{
    row.try_get::<_, Option<T>>(idx)
        .map(|v| v.map(wrap).unwrap_or(Value::Null))
        .map_err(|e| Error::type_conversion(e.to_string()))
}

/// Convert a PostgreSQL value to an analyst Value
fn pg_value_to_value(row: &tokio_postgres::Row, idx: usize, pg_type: &Type) -> Result<Value> {
    match *pg_type {
        Type::BOOL => decode(row, idx, Value::Bool),
        Type::CHAR => decode(row, idx, Value::Int8),
        Type::INT2 => decode(row, idx, Value::Int16),
        Type::INT4 => decode(row, idx, Value::Int32),
        Type::INT8 => decode(row, idx, Value::Int64),
        Type::FLOAT4 => decode(row, idx, Value::Float32),
        Type::FLOAT8 => decode(row, idx, Value::Float64),
        Type::VARCHAR | Type::TEXT | Type::BPCHAR | Type::NAME => {
            decode(row, idx, Value::String)
        }
        Type::BYTEA => decode(row, idx, Value::Bytes),
        Type::DATE => decode(row, idx, Value::Date),
        Type::TIMESTAMP => decode(row, idx, Value::DateTime),
        Type::TIMESTAMPTZ => decode(row, idx, Value::DateTimeTz),
        Type::JSON | Type::JSONB => decode(row, idx, Value::Json),
        ref other => decode(row, idx, Value::String).map_err(|_| {
            Error::type_conversion(format!("unsupported PostgreSQL type '{}'", other.name()))
        }),
    }
}

/// Convert a tokio-postgres row to an analyst Row
fn pg_row_to_row(pg_row: &tokio_postgres::Row) -> Result<Row> {
    let columns: Vec<String> = pg_row
        .columns()
        .iter()
        .map(|c| c.name().to_string())
        .collect();

    let values = pg_row
        .columns()
        .iter()
        .enumerate()
        .map(|(i, col)| pg_value_to_value(pg_row, i, col.type_()))
        .collect::<Result<Vec<_>>>()?;

    Ok(Row::new(columns, values))
}

fn transaction_error(e: tokio_postgres::Error) -> Error {
    Error::transaction_with_source(e.to_string(), e)
}

/// Shared client plus the closed flag
#[derive(Clone)]
struct PgHandle {
    client: Arc<tokio_postgres::Client>,
    closed: Arc<AtomicBool>,
}

impl PgHandle {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(Error::connection("connection is closed"));
        }
        Ok(())
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.ensure_open()?;
        let boxed: Vec<BoxedParam> = params.iter().map(value_to_sql).collect();
        self.client
            .execute(sql, &param_refs(&boxed))
            .await
            .map_err(|e| Error::query_with_sql(e.to_string(), sql))
    }

    async fn prepare(&self, sql: &str) -> Result<Box<dyn PreparedStatement>> {
        self.ensure_open()?;
        let statement = self
            .client
            .prepare(sql)
            .await
            .map_err(|e| Error::query_with_sql(e.to_string(), sql))?;

        Ok(Box::new(PgPreparedStatement {
            handle: self.clone(),
            statement,
            sql: sql.to_string(),
        }))
    }
}

impl PgHandle {
    fn new(client: tokio_postgres::Client) -> Self {
        Self {
            client: Arc::new(client),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// Connect one client and spawn its connection task
async fn connect_client(config: &tokio_postgres::Config) -> Result<tokio_postgres::Client> {
    let (client, connection) = config
        .connect(tokio_postgres::NoTls)
        .await
        .map_err(|e| Error::connection_with_source("failed to connect", e))?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            error!("PostgreSQL connection error: {}", e);
        }
    });
    Ok(client)
}

/// PostgreSQL connection implementation
///
/// Keeps the config so every transaction can open its own session.
pub struct PgConnection {
    handle: PgHandle,
    config: tokio_postgres::Config,
}

impl PgConnection {
    /// Create a new connection from a tokio-postgres client and the config it was opened with
    pub fn new(client: tokio_postgres::Client, config: tokio_postgres::Config) -> Self {
        Self {
            handle: PgHandle::new(client),
            config,
        }
    }

    /// Get the underlying client
    pub fn client(&self) -> &tokio_postgres::Client {
        &self.handle.client
    }
}

#[async_trait]
impl Connection for PgConnection {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.handle.ensure_open()?;
        let boxed: Vec<BoxedParam> = params.iter().map(value_to_sql).collect();
        let pg_rows = self
            .handle
            .client
            .query(sql, &param_refs(&boxed))
            .await
            .map_err(|e| Error::query_with_sql(e.to_string(), sql))?;

        pg_rows.iter().map(pg_row_to_row).collect()
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.handle.execute(sql, params).await
    }

    async fn prepare(&self, sql: &str) -> Result<Box<dyn PreparedStatement>> {
        self.handle.prepare(sql).await
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        self.handle.ensure_open()?;
        let session = PgHandle::new(connect_client(&self.config).await?);
        session
            .client
            .batch_execute("BEGIN")
            .await
            .map_err(transaction_error)?;

        Ok(Box::new(PgTransaction {
            handle: session,
            finished: AtomicBool::new(false),
        }))
    }

    async fn query_stream(&self, sql: &str, params: &[Value]) -> Result<Pin<Box<dyn RowStream>>> {
        self.handle.ensure_open()?;

        // Prepare first so the column names are known even for empty results.
        let statement = self
            .handle
            .client
            .prepare(sql)
            .await
            .map_err(|e| Error::query_with_sql(e.to_string(), sql))?;
        let columns: Vec<String> = statement
            .columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect();

        let boxed: Vec<BoxedParam> = params.iter().map(value_to_sql).collect();
        let rows = self
            .handle
            .client
            .query_raw(&statement, boxed.iter().map(|p| &**p as &dyn ToSql))
            .await
            .map_err(|e| Error::query_with_sql(e.to_string(), sql))?;

        Ok(Box::pin(PgRowStream {
            columns,
            sql: sql.to_string(),
            rows: Box::pin(rows),
        }))
    }

    async fn is_valid(&self) -> bool {
        if self.handle.closed.load(Ordering::Relaxed) {
            return false;
        }
        self.handle.client.simple_query("SELECT 1").await.is_ok()
    }

    async fn close(&self) -> Result<()> {
        self.handle.closed.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn dialect(&self) -> &dyn SqlDialect {
        &PostgresDialect
    }
}

/// Rows pulled from the server as the consumer asks for them
pub struct PgRowStream {
    columns: Vec<String>,
    sql: String,
    rows: Pin<Box<tokio_postgres::RowStream>>,
}

impl RowStream for PgRowStream {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    fn next(&mut self) -> Pin<Box<dyn Future<Output = Result<Option<Row>>> + Send + '_>> {
        Box::pin(async move {
            match self.rows.next().await {
                Some(Ok(pg_row)) => pg_row_to_row(&pg_row).map(Some),
                Some(Err(e)) => Err(Error::query_with_sql(e.to_string(), &self.sql)),
                None => Ok(None),
            }
        })
    }
}

/// PostgreSQL prepared statement
pub struct PgPreparedStatement {
    handle: PgHandle,
    statement: tokio_postgres::Statement,
    sql: String,
}

#[async_trait]
impl PreparedStatement for PgPreparedStatement {
    async fn execute(&self, params: &[Value]) -> Result<u64> {
        self.handle.ensure_open()?;
        let boxed: Vec<BoxedParam> = params.iter().map(value_to_sql).collect();
        self.handle
            .client
            .execute(&self.statement, &param_refs(&boxed))
            .await
            .map_err(|e| Error::query_with_sql(e.to_string(), &self.sql))
    }

    fn sql(&self) -> &str {
        &self.sql
    }
}

/// PostgreSQL transaction on a client of its own
///
/// Dropping it unfinished drops the client, and the server rolls back.
pub struct PgTransaction {
    handle: PgHandle,
    finished: AtomicBool,
}

#[async_trait]
impl Transaction for PgTransaction {
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.handle.execute(sql, params).await
    }

    async fn prepare(&self, sql: &str) -> Result<Box<dyn PreparedStatement>> {
        self.handle.prepare(sql).await
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.handle
            .client
            .batch_execute("COMMIT")
            .await
            .map_err(transaction_error)?;
        self.finished.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.handle
            .client
            .batch_execute("ROLLBACK")
            .await
            .map_err(transaction_error)?;
        self.finished.store(true, Ordering::Relaxed);
        Ok(())
    }
}

impl Drop for PgTransaction {
    fn drop(&mut self) {
        if !self.finished.load(Ordering::Relaxed) {
            warn!("PostgreSQL transaction dropped without commit or rollback");
        }
    }
}

/// PostgreSQL connection factory
#[derive(Debug, Clone, Default)]
pub struct PgConnectionFactory;

#[async_trait]
impl ConnectionFactory for PgConnectionFactory {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
        let mut pg_config: tokio_postgres::Config = config
            .url
            .parse()
            .map_err(|e| Error::connection_with_source("invalid PostgreSQL connection string", e))?;
        pg_config.connect_timeout(Duration::from_millis(config.connect_timeout_ms));
        if let Some(name) = &config.application_name {
            pg_config.application_name(name);
        }

        let client = connect_client(&pg_config).await?;
        Ok(Box::new(PgConnection::new(client, pg_config)))
    }

    fn database_type(&self) -> DatabaseType {
        DatabaseType::PostgreSQL
    }
}

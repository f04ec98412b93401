//! SQLite backend implementation for analyst-rdbc
//!
//! rusqlite is synchronous, so every call runs on the blocking pool with the
//! connection behind a mutex. A `SqliteConnection` keeps one shared handle
//! for plain queries and opens a session of its own for every transaction,
//! so two writers on one database never share a `BEGIN`. SQLite still lets
//! only one of them write at a time: a second transaction waits in
//! `BEGIN IMMEDIATE` for up to the busy timeout.
//!
//! `:memory:` opens a named `memdb` database so sessions see the same tables
//! as the shared handle. File databases are switched to WAL, which keeps
//! readers going while a session writes.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::connection::{
    Connection, ConnectionConfig, ConnectionFactory, DatabaseType, PreparedStatement, RowStream,
    Transaction,
};
use crate::dialect::{SqlDialect, SqliteDialect};
use crate::error::{Error, Result};
use crate::types::{Row, Value};

/// Rows a cursor decodes ahead of its consumer
const CURSOR_READ_AHEAD: usize = 64;

static MEMORY_DATABASES: AtomicU64 = AtomicU64::new(0);

/// Convert an analyst Value to an owned SQLite value
fn value_to_sqlite(value: &Value) -> rusqlite::types::Value {
    use rusqlite::types::Value as Sql;

    match value {
        Value::Null => Sql::Null,
        Value::Bool(b) => Sql::Integer(i64::from(*b)),
        Value::Int8(n) => Sql::Integer(i64::from(*n)),
        Value::Int16(n) => Sql::Integer(i64::from(*n)),
        Value::Int32(n) => Sql::Integer(i64::from(*n)),
        Value::Int64(n) => Sql::Integer(*n),
        Value::Float32(n) => Sql::Real(f64::from(*n)),
        Value::Float64(n) => Sql::Real(*n),
        Value::String(s) => Sql::Text(s.clone()),
        Value::Bytes(b) => Sql::Blob(b.clone()),
        Value::Date(d) => Sql::Text(d.format("%Y-%m-%d").to_string()),
        Value::DateTime(dt) => Sql::Text(dt.format("%Y-%m-%d %H:%M:%S%.f").to_string()),
        Value::DateTimeTz(dt) => Sql::Text(dt.to_rfc3339()),
        Value::Json(j) => Sql::Text(j.to_string()),
    }
}

/// Convert a borrowed SQLite value to an analyst Value
fn sqlite_to_value(value: rusqlite::types::ValueRef<'_>) -> Result<Value> {
    use rusqlite::types::ValueRef;

    match value {
        ValueRef::Null => Ok(Value::Null),
        ValueRef::Integer(n) => Ok(Value::Int64(n)),
        ValueRef::Real(n) => Ok(Value::Float64(n)),
        ValueRef::Text(bytes) => std::str::from_utf8(bytes)
            .map(|s| Value::String(s.to_owned()))
            .map_err(|e| Error::type_conversion(format!("TEXT column is not valid UTF-8: {}", e))),
        ValueRef::Blob(bytes) => Ok(Value::Bytes(bytes.to_vec())),
    }
}

fn decode_row(row: &rusqlite::Row<'_>, columns: &[String]) -> Result<Row> {
    let values = (0..columns.len())
        .map(|idx| {
            row.get_ref(idx)
                .map_err(|e| Error::type_conversion(e.to_string()))
                .and_then(sqlite_to_value)
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Row::new(columns.to_vec(), values))
}

fn query_error(e: rusqlite::Error, sql: &str) -> Error {
    Error::Query {
        message: e.to_string(),
        sql: Some(sql.to_string()),
        source: Some(Box::new(e)),
    }
}

fn transaction_error(e: rusqlite::Error) -> Error {
    Error::transaction_with_source(e.to_string(), e)
}

fn worker_error(e: tokio::task::JoinError) -> Error {
    Error::internal(format!("sqlite worker failed: {}", e))
}

/// Open one session on `target` with the busy timeout applied
async fn open_database(target: String, busy_timeout: Duration) -> Result<rusqlite::Connection> {
    tokio::task::spawn_blocking(move || {
        let conn = rusqlite::Connection::open(&target)
            .map_err(|e| Error::connection_with_source(format!("failed to open {}", target), e))?;
        conn.busy_timeout(busy_timeout)
            .map_err(|e| Error::connection_with_source("failed to set busy timeout", e))?;
        Ok(conn)
    })
    .await
    .map_err(worker_error)?
}

/// Step a query on the blocking pool, handing rows to `rows_tx`
///
/// Reports the column names (or the prepare error) through `ready` first.
/// Returns as soon as the receiver is gone, which finalizes the statement.
fn run_cursor(
    conn: &rusqlite::Connection,
    sql: &str,
    params: Vec<rusqlite::types::Value>,
    ready: oneshot::Sender<Result<Vec<String>>>,
    rows_tx: mpsc::Sender<Result<Row>>,
) {
    let mut stmt = match conn.prepare_cached(sql) {
        Ok(stmt) => stmt,
        Err(e) => {
            ready.send(Err(query_error(e, sql))).ok();
            return;
        }
    };
    let columns: Vec<String> = stmt
        .column_names()
        .into_iter()
        .map(String::from)
        .collect();
    let mut rows = match stmt.query(rusqlite::params_from_iter(params.iter())) {
        Ok(rows) => rows,
        Err(e) => {
            ready.send(Err(query_error(e, sql))).ok();
            return;
        }
    };
    if ready.send(Ok(columns.clone())).is_err() {
        return;
    }

    loop {
        let item = match rows.next() {
            Ok(Some(row)) => decode_row(row, &columns),
            Ok(None) => return,
            Err(e) => Err(query_error(e, sql)),
        };
        let failed = item.is_err();
        if rows_tx.blocking_send(item).is_err() {
            debug!("SQLite cursor released early");
            return;
        }
        if failed {
            return;
        }
    }
}

/// Shared handle to one rusqlite connection
#[derive(Clone)]
struct SqliteHandle {
    conn: Arc<Mutex<rusqlite::Connection>>,
    closed: Arc<AtomicBool>,
}

impl SqliteHandle {
    fn new(conn: rusqlite::Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(Error::connection("connection is closed"));
        }
        Ok(())
    }

    /// Run a closure against the connection on the blocking pool
    async fn run<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.ensure_open()?;
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await
        .map_err(worker_error)?
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        let sql = sql.to_string();
        let params: Vec<rusqlite::types::Value> = params.iter().map(value_to_sqlite).collect();
        self.run(move |conn| {
            let mut stmt = conn.prepare_cached(&sql).map_err(|e| query_error(e, &sql))?;
            let affected = stmt
                .execute(rusqlite::params_from_iter(params.iter()))
                .map_err(|e| query_error(e, &sql))?;
            Ok(affected as u64)
        })
        .await
    }

    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let sql = sql.to_string();
        let params: Vec<rusqlite::types::Value> = params.iter().map(value_to_sqlite).collect();
        self.run(move |conn| {
            let mut stmt = conn.prepare_cached(&sql).map_err(|e| query_error(e, &sql))?;
            let columns: Vec<String> = stmt
                .column_names()
                .into_iter()
                .map(String::from)
                .collect();
            let mut rows = stmt
                .query(rusqlite::params_from_iter(params.iter()))
                .map_err(|e| query_error(e, &sql))?;

            let mut decoded = Vec::new();
            while let Some(row) = rows.next().map_err(|e| query_error(e, &sql))? {
                decoded.push(decode_row(row, &columns)?);
            }
            Ok(decoded)
        })
        .await
    }

    /// Open a cursor that holds the connection until the stream is dropped
    async fn cursor(&self, sql: &str, params: &[Value]) -> Result<SqliteRowStream> {
        self.ensure_open()?;
        let sql = sql.to_string();
        let params: Vec<rusqlite::types::Value> = params.iter().map(value_to_sqlite).collect();
        let (ready_tx, ready_rx) = oneshot::channel();
        let (rows_tx, rows_rx) = mpsc::channel(CURSOR_READ_AHEAD);

        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock();
            run_cursor(&guard, &sql, params, ready_tx, rows_tx);
        });

        let columns = ready_rx
            .await
            .map_err(|_| Error::internal("sqlite cursor ended before reporting columns"))??;
        Ok(SqliteRowStream {
            columns,
            rows: rows_rx,
        })
    }

    async fn prepare(&self, sql: &str) -> Result<Box<dyn PreparedStatement>> {
        let owned = sql.to_string();
        self.run(move |conn| {
            conn.prepare_cached(&owned)
                .map(|_| ())
                .map_err(|e| query_error(e, &owned))
        })
        .await?;

        Ok(Box::new(SqliteStatement {
            handle: self.clone(),
            sql: sql.to_string(),
        }))
    }
}

/// SQLite connection implementation
pub struct SqliteConnection {
    handle: SqliteHandle,
    /// What rusqlite opens for every session
    target: String,
    busy_timeout: Duration,
}

impl SqliteConnection {
    /// Target opened by this connection and its transaction sessions
    pub fn target(&self) -> &str {
        &self.target
    }
}

#[async_trait]
impl Connection for SqliteConnection {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.handle.query(sql, params).await
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.handle.execute(sql, params).await
    }

    async fn prepare(&self, sql: &str) -> Result<Box<dyn PreparedStatement>> {
        self.handle.prepare(sql).await
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        self.handle.ensure_open()?;
        let session =
            SqliteHandle::new(open_database(self.target.clone(), self.busy_timeout).await?);
        session
            .run(|conn| {
                conn.execute_batch("BEGIN IMMEDIATE")
                    .map_err(transaction_error)
            })
            .await?;

        Ok(Box::new(SqliteTransaction {
            handle: session,
            finished: AtomicBool::new(false),
        }))
    }

    async fn query_stream(&self, sql: &str, params: &[Value]) -> Result<Pin<Box<dyn RowStream>>> {
        let stream = self.handle.cursor(sql, params).await?;
        Ok(Box::pin(stream))
    }

    async fn is_valid(&self) -> bool {
        self.handle
            .run(|conn| {
                conn.query_row("SELECT 1", [], |_| Ok(()))
                    .map_err(|e| query_error(e, "SELECT 1"))
            })
            .await
            .is_ok()
    }

    async fn close(&self) -> Result<()> {
        self.handle.closed.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn dialect(&self) -> &dyn SqlDialect {
        &SqliteDialect
    }
}

/// Rows read lazily from a cursor on the blocking pool
///
/// Dropping the stream ends the cursor and releases the shared connection.
pub struct SqliteRowStream {
    columns: Vec<String>,
    rows: mpsc::Receiver<Result<Row>>,
}

impl RowStream for SqliteRowStream {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    fn next(&mut self) -> Pin<Box<dyn Future<Output = Result<Option<Row>>> + Send + '_>> {
        Box::pin(async move { self.rows.recv().await.transpose() })
    }
}

/// SQLite prepared statement
///
/// Backed by rusqlite's statement cache, so the SQL is compiled once per
/// connection and reused on every execute.
pub struct SqliteStatement {
    handle: SqliteHandle,
    sql: String,
}

#[async_trait]
impl PreparedStatement for SqliteStatement {
    async fn execute(&self, params: &[Value]) -> Result<u64> {
        self.handle.execute(&self.sql, params).await
    }

    fn sql(&self) -> &str {
        &self.sql
    }
}

/// SQLite transaction on a session of its own
///
/// Dropping it unfinished closes the session, which rolls back.
pub struct SqliteTransaction {
    handle: SqliteHandle,
    finished: AtomicBool,
}

#[async_trait]
impl Transaction for SqliteTransaction {
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.handle.execute(sql, params).await
    }

    async fn prepare(&self, sql: &str) -> Result<Box<dyn PreparedStatement>> {
        self.handle.prepare(sql).await
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.handle
            .run(|conn| conn.execute_batch("COMMIT").map_err(transaction_error))
            .await?;
        self.finished.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.handle
            .run(|conn| conn.execute_batch("ROLLBACK").map_err(transaction_error))
            .await?;
        self.finished.store(true, Ordering::Relaxed);
        Ok(())
    }
}

impl Drop for SqliteTransaction {
    fn drop(&mut self) {
        if !self.finished.load(Ordering::Relaxed) {
            warn!("SQLite transaction dropped without commit or rollback");
        }
    }
}

/// Strip an optional `sqlite://` / `sqlite:` scheme from a connection string
fn database_path(url: &str) -> &str {
    url.strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))
        .unwrap_or(url)
}

fn is_memory_path(path: &str) -> bool {
    path.is_empty() || path == ":memory:"
}

/// Name a fresh in-memory database that several sessions can open
fn memory_target() -> String {
    let id = MEMORY_DATABASES.fetch_add(1, Ordering::Relaxed);
    format!("file:/analyst-memory-{}?vfs=memdb", id)
}

/// SQLite connection factory
#[derive(Debug, Clone, Default)]
pub struct SqliteConnectionFactory;

#[async_trait]
impl ConnectionFactory for SqliteConnectionFactory {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
        let path = database_path(&config.url);
        let in_memory = is_memory_path(path);
        let target = if in_memory {
            memory_target()
        } else {
            path.to_string()
        };
        let busy_timeout = Duration::from_millis(config.connect_timeout_ms);

        let handle = SqliteHandle::new(open_database(target.clone(), busy_timeout).await?);
        if !in_memory {
            let wal = handle
                .run(|conn| {
                    conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get::<_, String>(0))
                        .map_err(|e| query_error(e, "PRAGMA journal_mode=WAL"))
                })
                .await;
            match wal {
                Ok(mode) => debug!(journal_mode = %mode, "SQLite database opened"),
                Err(e) => warn!("Keeping the default journal mode: {}", e),
            }
        }

        Ok(Box::new(SqliteConnection {
            handle,
            target,
            busy_timeout,
        }))
    }

    fn database_type(&self) -> DatabaseType {
        DatabaseType::SQLite
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory() -> Box<dyn Connection> {
        SqliteConnectionFactory
            .connect(&ConnectionConfig::new(":memory:"))
            .await
            .unwrap()
    }

    #[test]
    fn test_database_path() {
        assert_eq!(database_path("sqlite:///tmp/a.db"), "/tmp/a.db");
        assert_eq!(database_path("sqlite::memory:"), ":memory:");
        assert_eq!(database_path("data.db"), "data.db");
        assert!(is_memory_path(database_path("sqlite::memory:")));
        assert_ne!(memory_target(), memory_target());
    }

    #[test]
    fn test_value_to_sqlite() {
        use rusqlite::types::Value as Sql;
        assert_eq!(value_to_sqlite(&Value::Bool(true)), Sql::Integer(1));
        assert_eq!(value_to_sqlite(&Value::Int16(7)), Sql::Integer(7));
        assert_eq!(
            value_to_sqlite(&Value::String("x".into())),
            Sql::Text("x".into())
        );
    }

    #[test]
    fn test_invalid_utf8_text_is_conversion_error() {
        let err = sqlite_to_value(rusqlite::types::ValueRef::Text(&[0xff, 0xfe])).unwrap_err();
        assert_eq!(err.category(), crate::error::ErrorCategory::TypeConversion);
    }

    #[tokio::test]
    async fn test_execute_and_query() {
        let conn = memory().await;
        conn.execute("CREATE TABLE t (id INTEGER, name TEXT, data BLOB)", &[])
            .await
            .unwrap();
        let inserted = conn
            .execute(
                "INSERT INTO t (id, name, data) VALUES (?, ?, ?)",
                &[
                    Value::Int32(1),
                    Value::from("one"),
                    Value::Bytes(b"raw".to_vec()),
                ],
            )
            .await
            .unwrap();
        assert_eq!(inserted, 1);

        let rows = conn
            .query("SELECT id, name, data FROM t WHERE id = ?", &[Value::Int64(1)])
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].columns(), &["id", "name", "data"]);
        assert_eq!(rows[0].get(0), Some(&Value::Int64(1)));
        assert_eq!(rows[0].get(1), Some(&Value::String("one".into())));
        assert_eq!(rows[0].get(2), Some(&Value::Bytes(b"raw".to_vec())));
    }

    #[tokio::test]
    async fn test_query_stream_reports_columns_without_rows() {
        let conn = memory().await;
        conn.execute("CREATE TABLE empty (a INTEGER, b TEXT)", &[])
            .await
            .unwrap();

        let mut stream = conn.query_stream("SELECT a, b FROM empty", &[]).await.unwrap();
        assert_eq!(stream.columns(), &["a".to_string(), "b".to_string()]);
        assert!(stream.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_transaction_rollback_discards_rows() {
        let conn = memory().await;
        conn.execute("CREATE TABLE t (id INTEGER)", &[]).await.unwrap();

        let tx = conn.begin().await.unwrap();
        let stmt = tx.prepare("INSERT INTO t (id) VALUES (?)").await.unwrap();
        stmt.execute(&[Value::Int64(1)]).await.unwrap();
        tx.rollback().await.unwrap();

        let rows = conn.query("SELECT id FROM t", &[]).await.unwrap();
        assert!(rows.is_empty());

        let tx = conn.begin().await.unwrap();
        tx.execute("INSERT INTO t (id) VALUES (?)", &[Value::Int64(2)])
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let rows = conn.query("SELECT id FROM t", &[]).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_prepare_rejects_invalid_sql() {
        let conn = memory().await;
        let err = conn.prepare("INSERT INTO missing (a) VALUES (?)").await.err().unwrap();
        assert_eq!(err.category(), crate::error::ErrorCategory::Query);
    }

    #[tokio::test]
    async fn test_closed_connection_is_invalid() {
        let conn = memory().await;
        assert!(conn.is_valid().await);
        conn.close().await.unwrap();
        assert!(!conn.is_valid().await);
    }

    #[tokio::test]
    async fn test_memory_connections_are_separate_databases() {
        let a = memory().await;
        let b = memory().await;
        a.execute("CREATE TABLE only_a (id INTEGER)", &[]).await.unwrap();
        assert!(b.query("SELECT id FROM only_a", &[]).await.is_err());
    }

    #[tokio::test]
    async fn test_transactions_use_their_own_sessions() {
        let conn = memory().await;
        conn.execute("CREATE TABLE t (id INTEGER)", &[]).await.unwrap();

        let tx = conn.begin().await.unwrap();
        tx.execute("INSERT INTO t (id) VALUES (1)", &[]).await.unwrap();

        // the second writer waits in BEGIN IMMEDIATE until the first commits
        let (sibling, committed) = tokio::join!(conn.begin(), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            tx.commit().await
        });
        committed.unwrap();
        let sibling = sibling.unwrap();
        sibling
            .execute("INSERT INTO t (id) VALUES (2)", &[])
            .await
            .unwrap();
        sibling.rollback().await.unwrap();

        let rows = conn.query("SELECT id FROM t", &[]).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_stream_reads_lazily_and_releases_connection() {
        let conn = memory().await;
        conn.execute("CREATE TABLE t (n INTEGER)", &[]).await.unwrap();

        // an endless result set only works if rows are pulled on demand
        let endless = "WITH RECURSIVE seq(n) AS (SELECT 1 UNION ALL SELECT n + 1 FROM seq) \
                       SELECT n FROM seq";
        let mut stream = tokio::time::timeout(Duration::from_secs(5), conn.query_stream(endless, &[]))
            .await
            .expect("query_stream read the whole result set")
            .unwrap();
        assert_eq!(stream.columns(), &["n".to_string()]);
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.get(0), Some(&Value::Int64(1)));
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.get(0), Some(&Value::Int64(2)));
        drop(stream);

        let inserted = tokio::time::timeout(
            Duration::from_secs(5),
            conn.execute("INSERT INTO t (n) VALUES (0)", &[]),
        )
        .await
        .expect("cursor still holds the connection")
        .unwrap();
        assert_eq!(inserted, 1);
    }

    #[tokio::test]
    async fn test_query_stream_reports_prepare_errors() {
        let conn = memory().await;
        let err = conn
            .query_stream("SELECT * FROM missing", &[])
            .await
            .err()
            .unwrap();
        assert_eq!(err.category(), crate::error::ErrorCategory::Query);
        assert!(conn.is_valid().await);
    }
}

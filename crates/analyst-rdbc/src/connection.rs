//! Connection traits for analyst-rdbc
//!
//! Core abstractions for database connectivity:
//! - Connection: query execution on a shared handle
//! - PreparedStatement: parameterized statements executed many times
//! - Transaction: explicit begin/commit/rollback
//! - RowStream: cursor-style row iteration with column metadata

use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;

use crate::dialect::SqlDialect;
use crate::error::Result;
use crate::types::{Row, Value};

/// A connection to a database
///
/// Connections handed out by the driver manager are shared between every
/// adapter that asks for the same driver and URL, so implementations must
/// tolerate concurrent calls.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Execute a query that returns rows
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>>;

    /// Execute a statement that modifies data, returns affected row count
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64>;

    /// Prepare a statement for repeated execution
    async fn prepare(&self, sql: &str) -> Result<Box<dyn PreparedStatement>>;

    /// Begin a transaction on a session of its own
    ///
    /// Statements run through the returned transaction never share a
    /// session with the connection or with other transactions.
    async fn begin(&self) -> Result<Box<dyn Transaction>>;

    /// Execute a query and stream results, reading rows as they are asked for
    async fn query_stream(&self, sql: &str, params: &[Value]) -> Result<Pin<Box<dyn RowStream>>>;

    /// Check if connection is valid/alive
    async fn is_valid(&self) -> bool;

    /// Close the connection
    async fn close(&self) -> Result<()>;

    /// SQL dialect spoken by this connection
    fn dialect(&self) -> &dyn SqlDialect;
}

/// A prepared statement
#[async_trait]
pub trait PreparedStatement: Send + Sync {
    /// Execute the prepared statement with given parameters
    async fn execute(&self, params: &[Value]) -> Result<u64>;

    /// Get the SQL string
    fn sql(&self) -> &str;
}

/// A database transaction
///
/// `commit` and `rollback` consume the transaction. A transaction shared
/// between several writers is held as `Arc<dyn Transaction>`; only the
/// owner of the boxed value can end it.
#[async_trait]
pub trait Transaction: Send + Sync {
    /// Execute a statement inside the transaction
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64>;

    /// Prepare a statement bound to this transaction
    async fn prepare(&self, sql: &str) -> Result<Box<dyn PreparedStatement>>;

    /// Commit the transaction
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Rollback the transaction
    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Streaming row iterator
///
/// The stream owns its cursor; dropping it releases the cursor on every
/// exit path.
pub trait RowStream: Send + Unpin {
    /// Column names of the result set, known before the first row
    fn columns(&self) -> &[String];

    /// Get the next row
    fn next(&mut self) -> Pin<Box<dyn Future<Output = Result<Option<Row>>> + Send + '_>>;
}

/// Row stream over an already materialized result set
pub struct VecRowStream {
    columns: Vec<String>,
    rows: std::vec::IntoIter<Result<Row>>,
}

impl VecRowStream {
    /// Create a stream from decoded rows
    pub fn new(columns: Vec<String>, rows: Vec<Row>) -> Self {
        Self::from_results(columns, rows.into_iter().map(Ok).collect())
    }

    /// Create a stream where individual rows may have failed to decode
    pub fn from_results(columns: Vec<String>, rows: Vec<Result<Row>>) -> Self {
        Self {
            columns,
            rows: rows.into_iter(),
        }
    }
}

impl RowStream for VecRowStream {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    fn next(&mut self) -> Pin<Box<dyn Future<Output = Result<Option<Row>>> + Send + '_>> {
        Box::pin(async move { self.rows.next().transpose() })
    }
}

/// Configuration for creating connections
#[derive(Clone)]
pub struct ConnectionConfig {
    /// Connection URL or driver-specific connection string
    pub url: String,
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Application name (shown in pg_stat_activity, etc)
    pub application_name: Option<String>,
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("url", &redact_url(&self.url))
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("application_name", &self.application_name)
            .finish()
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            connect_timeout_ms: 10_000,
            application_name: Some("analyst".into()),
        }
    }
}

impl ConnectionConfig {
    /// Create configuration with just a URL
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Set connection timeout
    pub fn with_connect_timeout(mut self, ms: u64) -> Self {
        self.connect_timeout_ms = ms;
        self
    }

    /// Set application name
    pub fn with_application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = Some(name.into());
        self
    }
}

/// Redact the password of a URL-shaped connection string.
///
/// Strings that are not URLs (file paths, key=value strings) are returned
/// unchanged unless they carry a `password=` pair.
pub fn redact_url(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(mut parsed) if parsed.password().is_some() => {
            let _ = parsed.set_password(Some("***"));
            parsed.to_string()
        }
        Ok(_) => url.to_string(),
        Err(_) if url.to_ascii_lowercase().contains("password=") => "***".to_string(),
        Err(_) => url.to_string(),
    }
}

/// Factory for creating connections
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Create a new connection
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Connection>>;

    /// Get the database type
    fn database_type(&self) -> DatabaseType;
}

/// Database type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatabaseType {
    /// PostgreSQL
    PostgreSQL,
    /// SQLite
    SQLite,
    /// Unknown/custom
    Unknown,
}

impl std::fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PostgreSQL => write!(f, "PostgreSQL"),
            Self::SQLite => write!(f, "SQLite"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

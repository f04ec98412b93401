//! Driver manager for analyst-rdbc
//!
//! Keeps one open connection per `(driver, connection string)` and hands the
//! same handle to every adapter that asks for that key. The manager is an
//! explicit value: build one per process (or per run) and inject it into the
//! adapters.
//!
//! # Example
//!
//! ```rust,ignore
//! use analyst_rdbc::prelude::*;
//!
//! let drivers = Arc::new(DriverManager::new());
//! let conn = drivers.connection("sqlite", "/tmp/warehouse.db").await?;
//! let rows = conn.query("SELECT 1", &[]).await?;
//! ```

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::connection::{redact_url, Connection, ConnectionConfig, ConnectionFactory};
use crate::error::{Error, Result};

/// Cache key: lower-cased driver name plus the verbatim connection string
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ConnectionKey {
    driver: String,
    url: String,
}

/// Driver manager statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriverStats {
    /// Connections opened through a factory
    pub connections_opened: u64,
    /// Requests served from the cache
    pub cache_hits: u64,
    /// Connection attempts that failed
    pub connect_failures: u64,
}

/// Atomic driver statistics
#[derive(Debug, Default)]
struct AtomicDriverStats {
    connections_opened: AtomicU64,
    cache_hits: AtomicU64,
    connect_failures: AtomicU64,
}

impl AtomicDriverStats {
    fn snapshot(&self) -> DriverStats {
        DriverStats {
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
        }
    }
}

/// Registry of connection factories plus a cache of open connections
pub struct DriverManager {
    factories: RwLock<HashMap<String, Arc<dyn ConnectionFactory>>>,
    connections: tokio::sync::Mutex<HashMap<ConnectionKey, Arc<dyn Connection>>>,
    connect_timeout_ms: u64,
    stats: AtomicDriverStats,
}

impl Default for DriverManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DriverManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverManager")
            .field("drivers", &self.drivers())
            .field("stats", &self.stats())
            .finish()
    }
}

impl DriverManager {
    /// Create a manager with every backend compiled into this build
    pub fn new() -> Self {
        let manager = Self::empty();

        #[cfg(feature = "sqlite")]
        manager.register("sqlite", Arc::new(crate::sqlite::SqliteConnectionFactory));
        #[cfg(feature = "sqlite")]
        manager.register("sqlite3", Arc::new(crate::sqlite::SqliteConnectionFactory));

        #[cfg(feature = "postgres")]
        manager.register("postgres", Arc::new(crate::postgres::PgConnectionFactory));
        #[cfg(feature = "postgres")]
        manager.register("postgresql", Arc::new(crate::postgres::PgConnectionFactory));

        manager
    }

    /// Create a manager without any registered driver
    pub fn empty() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
            connections: tokio::sync::Mutex::new(HashMap::new()),
            connect_timeout_ms: ConnectionConfig::default().connect_timeout_ms,
            stats: AtomicDriverStats::default(),
        }
    }

    /// Set the timeout applied to new connections
    pub fn with_connect_timeout(mut self, ms: u64) -> Self {
        self.connect_timeout_ms = ms;
        self
    }

    /// Register (or replace) the factory used for a driver name
    pub fn register(&self, driver: impl Into<String>, factory: Arc<dyn ConnectionFactory>) {
        let driver = driver.into().to_lowercase();
        debug!(driver = %driver, database = %factory.database_type(), "Registered driver");
        self.factories.write().insert(driver, factory);
    }

    /// Registered driver names, sorted
    pub fn drivers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Whether a driver name is known
    pub fn supports(&self, driver: &str) -> bool {
        self.factories.read().contains_key(&driver.to_lowercase())
    }

    /// Get the shared connection for `(driver, url)`, connecting on first use
    ///
    /// Concurrent first requests for the same key connect only once.
    pub async fn connection(&self, driver: &str, url: &str) -> Result<Arc<dyn Connection>> {
        let key = ConnectionKey {
            driver: driver.to_lowercase(),
            url: url.to_string(),
        };

        let mut connections = self.connections.lock().await;
        if let Some(conn) = connections.get(&key) {
            self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Arc::clone(conn));
        }

        let factory = self
            .factories
            .read()
            .get(&key.driver)
            .cloned()
            .ok_or_else(|| Error::config(format!("unknown driver '{}'", driver)))?;

        let config = ConnectionConfig::new(url).with_connect_timeout(self.connect_timeout_ms);
        let conn: Arc<dyn Connection> = match factory.connect(&config).await {
            Ok(conn) => Arc::from(conn),
            Err(e) => {
                self.stats.connect_failures.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };

        self.stats.connections_opened.fetch_add(1, Ordering::Relaxed);
        info!(driver = %key.driver, url = %redact_url(url), "Opened database connection");
        connections.insert(key, Arc::clone(&conn));
        Ok(conn)
    }

    /// Connect (or reuse) and check the connection is alive
    pub async fn ping(&self, driver: &str, url: &str) -> Result<()> {
        let conn = self.connection(driver, url).await?;
        if conn.is_valid().await {
            Ok(())
        } else {
            Err(Error::connection(format!(
                "{} connection to {} is not usable",
                driver,
                redact_url(url)
            )))
        }
    }

    /// Number of cached connections
    pub async fn open_connections(&self) -> usize {
        self.connections.lock().await.len()
    }

    /// Get manager statistics
    pub fn stats(&self) -> DriverStats {
        self.stats.snapshot()
    }

    /// Close and forget every cached connection
    pub async fn close_all(&self) -> Result<()> {
        let drained: Vec<_> = self.connections.lock().await.drain().collect();
        for (key, conn) in drained {
            debug!(driver = %key.driver, "Closing database connection");
            conn.close().await?;
        }
        Ok(())
    }
}

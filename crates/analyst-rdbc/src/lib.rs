//! # analyst-rdbc
//!
//! Relational database connectivity for the analyst ETL engine.
//!
//! This crate provides a small, uniform interface over the SQL backends the
//! engine reads from and writes to.
//!
//! ## Features
//!
//! - **Connection traits**: query, execute, prepare and transactions behind `dyn Connection`
//! - **Driver manager**: one shared connection per `(driver, connection string)`
//! - **SQL dialects**: placeholder style and INSERT generation per backend
//! - **Row streams**: cursor-style iteration with column names known up front
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use analyst_rdbc::prelude::*;
//!
//! let drivers = DriverManager::new();
//! let conn = drivers.connection("sqlite", "warehouse.db").await?;
//!
//! let mut rows = conn.query_stream("SELECT id, name FROM users", &[]).await?;
//! while let Some(row) = rows.next().await? {
//!     println!("{:?}", row.values());
//! }
//! ```
//!
//! ## Feature Flags
//!
//! - `sqlite` (default) - SQLite support via rusqlite (bundled)
//! - `postgres` - PostgreSQL support via tokio-postgres
//! - `testing` - in-memory mock connections for downstream tests
//! - `full` - All backends enabled

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod connection;
pub mod dialect;
pub mod driver;
pub mod error;
pub mod types;

// Backend implementations (conditionally compiled)
#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    // Error types
    pub use crate::error::{Error, ErrorCategory, Result};

    // Value and type system
    pub use crate::types::{Row, Value};

    // Connection traits and config
    pub use crate::connection::{
        redact_url, Connection, ConnectionConfig, ConnectionFactory, DatabaseType,
        PreparedStatement, RowStream, Transaction, VecRowStream,
    };

    // Dialect types
    pub use crate::dialect::{dialect_for, GenericDialect, PostgresDialect, SqlDialect, SqliteDialect};

    // Driver manager
    pub use crate::driver::{DriverManager, DriverStats};

    #[cfg(feature = "sqlite")]
    pub use crate::sqlite::{SqliteConnection, SqliteConnectionFactory};

    #[cfg(feature = "postgres")]
    pub use crate::postgres::{PgConnection, PgConnectionFactory};
}

pub use error::{Error, Result};
pub use types::Value;

//! # analyst-engine
//!
//! Streaming stage engine for the analyst ETL tool.
//!
//! A stage reads rows from one [`Source`] and fans them out to any number of
//! [`Destination`]s over a bounded [`Stream`]. Workers run as separate tokio
//! tasks, share a cooperative [`Stopper`] and report through a leveled
//! [`Logger`]. Scalars can be carried from one stage to the next through the
//! [`ParameterTable`].
//!
//! ```text
//!                      ┌──────────────┐
//!                 ┌───▶│ Destination  │  (alias "")
//! ┌──────────┐    │    └──────────────┘
//! │  Source  │──Stream
//! └──────────┘    │    ┌──────────────┐
//!                 └───▶│ Destination  │  (alias "audit")
//!                      └──────────────┘
//! ```
//!
//! ## Running a manifest
//!
//! ```rust,ignore
//! use analyst_engine::prelude::*;
//!
//! let manifest = Manifest::from_file("etl.yaml")?;
//! let drivers = Arc::new(DriverManager::new());
//! let (logger, drain) = Logger::spawn(manifest.settings.log_level, ConsoleSink::stdout());
//!
//! let runner = StageRunner::new(manifest.settings.clone(), manifest.resolver(drivers)?, logger);
//! let report = runner.run_all(&manifest.descriptors()?).await?;
//! drop(runner);
//! drain.finish().await;
//! ```
//!
//! ## Feature Flags
//!
//! - `sqlite` (default) - SQLite connections
//! - `postgres` - PostgreSQL connections

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
pub mod connector;
pub mod error;
pub mod logger;
pub mod parameter_destination;
pub mod parameters;
pub mod resolver;
pub mod runner;
pub mod scalar;
pub mod sql;
pub mod stage;
pub mod stdout;
pub mod stopper;
pub mod stream;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{EngineSettings, Manifest, StageConfig};
    pub use crate::connector::{Destination, Outcome, Source};
    pub use crate::error::{EngineError, ParameterError, Result, StreamError};
    pub use crate::logger::{ConsoleSink, Event, Level, LogDrain, LogSink, Logger, TracingSink};
    pub use crate::parameter_destination::ParameterTableDestination;
    pub use crate::parameters::ParameterTable;
    pub use crate::resolver::{ConnectionSpec, Pipeline, Resolver, Stage};
    pub use crate::runner::{RunReport, StageReport, StageRunner};
    pub use crate::scalar::{Row, Scalar};
    pub use crate::sql::{SqlDestination, SqlDestinationConfig, SqlSource, SqlSourceConfig};
    pub use crate::stage::{OptionValue, SourceDescriptor, StageDescriptor, StageKind};
    pub use crate::stdout::{OutputFormat, StdoutDestination};
    pub use crate::stopper::Stopper;
    pub use crate::stream::{Consumer, Next, Producer, Stream};

    pub use analyst_rdbc::driver::DriverManager;
    pub use std::sync::Arc;
}

pub use connector::{Destination, Outcome, Source};
pub use error::{EngineError, Result};
pub use parameters::ParameterTable;
pub use scalar::{Row, Scalar};
pub use stopper::Stopper;
pub use stream::Stream;

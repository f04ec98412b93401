//! Turns stage descriptors into runnable stages
//!
//! Supported shapes:
//! - `FROM CONNECTION x` with the body as SQL, optional `PARAMETERS = "a,b"`
//!   naming parameters bound positionally
//! - `INTO CONNECTION y` with `TABLE = "t"`, `INTO GLOBAL` with optional
//!   `GLOBALS = "a,b"`, or no destination (stdout, `FORMAT = "json"`)
//! - `global` stages declaring the names in `DECLARE` (or the stage name)

use analyst_rdbc::driver::DriverManager;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::connector::{Destination, Source};
use crate::error::{EngineError, ParameterError, Result};
use crate::parameter_destination::ParameterTableDestination;
use crate::parameters::ParameterTable;
use crate::scalar::Scalar;
use crate::sql::{SqlDestination, SqlDestinationConfig, SqlSource, SqlSourceConfig};
use crate::stage::{SourceDescriptor, StageDescriptor, StageKind};
use crate::stdout::{OutputFormat, StdoutDestination};

/// Option holding the destination table
pub const OPT_TABLE: &str = "TABLE";
/// Option listing query parameter names
pub const OPT_PARAMETERS: &str = "PARAMETERS";
/// Option listing parameter destination targets
pub const OPT_GLOBALS: &str = "GLOBALS";
/// Option listing names declared by a global stage
pub const OPT_DECLARE: &str = "DECLARE";
/// Option selecting the stdout format
pub const OPT_FORMAT: &str = "FORMAT";

/// Named database connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSpec {
    /// Driver name
    pub driver: String,
    /// Driver-specific connection string
    pub url: String,
}

impl ConnectionSpec {
    /// Create a connection spec
    pub fn new(driver: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            driver: driver.into(),
            url: url.into(),
        }
    }
}

/// A source with its destinations, ready to run
pub struct Pipeline {
    /// Stage name (also the stream name)
    pub name: String,
    /// Row producer
    pub source: Arc<dyn Source>,
    /// Row consumers, each on its own alias
    pub destinations: Vec<Arc<dyn Destination>>,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("source", &self.source.name())
            .field(
                "destinations",
                &self.destinations.iter().map(|d| d.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Runnable stage
#[derive(Debug)]
pub enum Stage {
    /// Declare parameters
    Declare {
        /// Stage name
        name: String,
        /// Names to declare
        parameters: Vec<String>,
    },
    /// Stream rows from a source into destinations
    Pipeline(Pipeline),
}

impl Stage {
    /// Stage name
    pub fn name(&self) -> &str {
        match self {
            Self::Declare { name, .. } => name,
            Self::Pipeline(p) => &p.name,
        }
    }
}

/// Builds stages from descriptors
pub struct Resolver {
    drivers: Arc<DriverManager>,
    parameters: Arc<ParameterTable>,
    connections: HashMap<String, ConnectionSpec>,
}

impl Resolver {
    /// Create a resolver without named connections
    pub fn new(drivers: Arc<DriverManager>, parameters: Arc<ParameterTable>) -> Self {
        Self {
            drivers,
            parameters,
            connections: HashMap::new(),
        }
    }

    /// Add a named connection
    pub fn with_connection(mut self, name: impl Into<String>, spec: ConnectionSpec) -> Self {
        self.connections.insert(name.into(), spec);
        self
    }

    /// Add several named connections
    pub fn with_connections(mut self, connections: HashMap<String, ConnectionSpec>) -> Self {
        self.connections.extend(connections);
        self
    }

    /// Parameter table shared by resolved stages
    pub fn parameters(&self) -> &Arc<ParameterTable> {
        &self.parameters
    }

    /// Driver manager shared by resolved stages
    pub fn drivers(&self) -> &Arc<DriverManager> {
        &self.drivers
    }

    /// Resolve one stage against the current parameter table
    ///
    /// Query parameters are read now, so resolve a stage only after the
    /// stages that set its parameters have run.
    pub fn resolve(&self, desc: &StageDescriptor) -> Result<Stage> {
        if desc.kind == StageKind::Global {
            return Ok(Stage::Declare {
                name: desc.name.clone(),
                parameters: declared_names(desc),
            });
        }

        let declared: HashSet<String> = self.parameters.names().into_iter().collect();
        self.check_pipeline(desc, &declared)?;
        self.build_pipeline(desc).map(Stage::Pipeline)
    }

    /// Check every stage without running anything
    ///
    /// Declarations made by earlier global stages are taken into account.
    pub fn validate(&self, stages: &[StageDescriptor]) -> Result<()> {
        let mut declared: HashSet<String> = self.parameters.names().into_iter().collect();
        let mut names = HashSet::new();
        for desc in stages {
            if !names.insert(desc.name.as_str()) {
                return Err(EngineError::config(format!(
                    "duplicate stage name '{}'",
                    desc.name
                )));
            }
            if desc.kind == StageKind::Global {
                for name in declared_names(desc) {
                    let key = name.to_uppercase();
                    if !declared.insert(key.clone()) {
                        return Err(ParameterError::AlreadyDeclared(key).into());
                    }
                }
            } else {
                self.check_pipeline(desc, &declared)?;
            }
        }
        Ok(())
    }

    /// Connect to every connection the stages use and check it responds
    pub async fn ping(&self, stages: &[StageDescriptor]) -> Result<()> {
        let used: BTreeSet<&str> = stages
            .iter()
            .flat_map(|d| d.sources.iter().chain(d.destination.iter()))
            .filter_map(|s| match s {
                SourceDescriptor::Connection(name) => Some(name.as_str()),
                _ => None,
            })
            .collect();

        for name in used {
            let spec = self.connection(name)?;
            debug!(connection = %name, driver = %spec.driver, "Pinging connection");
            self.drivers.ping(&spec.driver, &spec.url).await?;
        }
        Ok(())
    }

    fn connection(&self, name: &str) -> Result<&ConnectionSpec> {
        let spec = self
            .connections
            .get(name)
            .ok_or_else(|| EngineError::config(format!("unknown connection '{}'", name)))?;
        if !self.drivers.supports(&spec.driver) {
            return Err(EngineError::config(format!(
                "connection '{}' uses unknown driver '{}'",
                name, spec.driver
            )));
        }
        Ok(spec)
    }

    fn check_pipeline(&self, desc: &StageDescriptor, declared: &HashSet<String>) -> Result<()> {
        let stage = &desc.name;
        let source = match desc.sources.as_slice() {
            [source] => source,
            other => {
                return Err(EngineError::config(format!(
                    "stage '{}' needs exactly one source, found {}",
                    stage,
                    other.len()
                )))
            }
        };
        match source {
            SourceDescriptor::Connection(name) => {
                self.connection(name)?;
            }
            other => {
                return Err(EngineError::unsupported(format!(
                    "stage '{}' reads from {}",
                    stage, other
                )))
            }
        }
        if desc.body.trim().is_empty() {
            return Err(EngineError::config(format!("stage '{}' has no query", stage)));
        }
        for param in desc.list_option(OPT_PARAMETERS).unwrap_or_default() {
            if !declared.contains(&param.to_uppercase()) {
                return Err(EngineError::config(format!(
                    "stage '{}' uses undeclared parameter '{}'",
                    stage, param
                )));
            }
        }

        match &desc.destination {
            None => {
                output_format(desc)?;
            }
            Some(SourceDescriptor::Connection(name)) => {
                self.connection(name)?;
                table_option(desc)?;
            }
            Some(SourceDescriptor::Global) => {
                let targets = desc.list_option(OPT_GLOBALS).unwrap_or_default();
                if let Some(missing) = targets.iter().find(|t| !declared.contains(&t.to_uppercase())) {
                    return Err(EngineError::config(format!(
                        "stage '{}' writes undeclared parameter '{}'",
                        stage, missing
                    )));
                }
                if targets.is_empty() && declared.is_empty() {
                    return Err(EngineError::config(format!(
                        "stage '{}' writes into globals but none are declared",
                        stage
                    )));
                }
            }
            Some(other) => {
                return Err(EngineError::unsupported(format!(
                    "stage '{}' writes into {}",
                    stage, other
                )))
            }
        }
        Ok(())
    }

    fn build_pipeline(&self, desc: &StageDescriptor) -> Result<Pipeline> {
        let source: Arc<dyn Source> = match desc.sources.first() {
            Some(SourceDescriptor::Connection(name)) => {
                let spec = self.connection(name)?;
                let config = SqlSourceConfig::new(&desc.name, &spec.driver, &spec.url, &desc.body)
                    .with_params(self.query_params(desc)?);
                Arc::new(SqlSource::new(config, Arc::clone(&self.drivers)))
            }
            _ => {
                return Err(EngineError::unsupported(format!(
                    "stage '{}' has no connection source",
                    desc.name
                )))
            }
        };

        let destination: Arc<dyn Destination> = match &desc.destination {
            None => Arc::new(StdoutDestination::new(&desc.name, output_format(desc)?)),
            Some(SourceDescriptor::Connection(name)) => {
                let spec = self.connection(name)?;
                let config = SqlDestinationConfig::new(
                    &desc.name,
                    &spec.driver,
                    &spec.url,
                    table_option(desc)?,
                );
                Arc::new(SqlDestination::new(config, Arc::clone(&self.drivers)))
            }
            Some(SourceDescriptor::Global) => {
                let targets = desc
                    .list_option(OPT_GLOBALS)
                    .unwrap_or_else(|| self.parameters.names());
                Arc::new(ParameterTableDestination::new(
                    &desc.name,
                    Arc::clone(&self.parameters),
                    targets,
                ))
            }
            Some(other) => {
                return Err(EngineError::unsupported(format!(
                    "stage '{}' writes into {}",
                    desc.name, other
                )))
            }
        };

        Ok(Pipeline {
            name: desc.name.clone(),
            source,
            destinations: vec![destination],
        })
    }

    fn query_params(&self, desc: &StageDescriptor) -> Result<Vec<Scalar>> {
        desc.list_option(OPT_PARAMETERS)
            .unwrap_or_default()
            .iter()
            .map(|name| {
                self.parameters.get(name).ok_or_else(|| {
                    EngineError::config(format!(
                        "stage '{}' uses parameter '{}' which has no value",
                        desc.name, name
                    ))
                })
            })
            .collect()
    }
}

fn declared_names(desc: &StageDescriptor) -> Vec<String> {
    desc.list_option(OPT_DECLARE)
        .filter(|names| !names.is_empty())
        .unwrap_or_else(|| vec![desc.name.clone()])
}

fn table_option(desc: &StageDescriptor) -> Result<String> {
    desc.option(OPT_TABLE)
        .map(|v| v.as_string())
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| EngineError::config(format!("stage '{}' needs a TABLE option", desc.name)))
}

fn output_format(desc: &StageDescriptor) -> Result<OutputFormat> {
    match desc.option(OPT_FORMAT) {
        None => Ok(OutputFormat::default()),
        Some(v) => v
            .as_string()
            .parse()
            .map_err(|e: String| EngineError::config(format!("stage '{}': {}", desc.name, e))),
    }
}

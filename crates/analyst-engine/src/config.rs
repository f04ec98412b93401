//! Engine settings and the YAML manifest
//!
//! ```yaml
//! settings:
//!   stream_capacity: 100
//!   log_level: info
//! connections:
//!   warehouse: { driver: sqlite, url: "${WAREHOUSE_DB:-warehouse.db}" }
//! globals: [ last_id ]
//! stages:
//!   - name: max_id
//!     from: [ { connection: warehouse } ]
//!     body: SELECT max(id) AS last_id FROM orders
//!     into: global
//!   - name: recent
//!     from: [ { connection: warehouse } ]
//!     body: SELECT * FROM orders WHERE id > ?
//!     options: { PARAMETERS: last_id, FORMAT: json }
//! ```

use analyst_rdbc::driver::DriverManager;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use crate::error::{EngineError, Result};
use crate::logger::Level;
use crate::parameters::ParameterTable;
use crate::resolver::{ConnectionSpec, Resolver};
use crate::stage::{OptionValue, SourceDescriptor, StageDescriptor, StageKind, StageOption};
use crate::stream::{DEFAULT_STOP_POLL_INTERVAL, DEFAULT_STREAM_CAPACITY};

/// Pre-compiled regex for environment variable expansion
/// Pattern: ${VAR} or ${VAR:-default}
static ENV_VAR_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*)(?::-([^}]*))?\}")
        .expect("env var regex pattern is invalid - this is a bug")
});

/// Runtime settings shared by every stage
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct EngineSettings {
    /// Buffer capacity per consumer
    #[serde(default = "default_stream_capacity")]
    pub stream_capacity: usize,

    /// How often waiting workers re-check the stopper (milliseconds)
    #[serde(default = "default_stop_poll_interval_ms")]
    pub stop_poll_interval_ms: u64,

    /// Minimum level of rendered events
    #[serde(default)]
    pub log_level: Level,

    /// Stop the other workers of a stage when one fails
    #[serde(default = "default_stop_on_failure")]
    pub stop_on_failure: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            stream_capacity: default_stream_capacity(),
            stop_poll_interval_ms: default_stop_poll_interval_ms(),
            log_level: Level::default(),
            stop_on_failure: default_stop_on_failure(),
        }
    }
}

impl EngineSettings {
    /// Stop poll interval as a duration
    pub fn stop_poll_interval(&self) -> Duration {
        Duration::from_millis(self.stop_poll_interval_ms)
    }

    /// Set the per-consumer buffer capacity
    pub fn with_stream_capacity(mut self, capacity: usize) -> Self {
        self.stream_capacity = capacity;
        self
    }

    /// Set the stop poll interval
    pub fn with_stop_poll_interval(mut self, interval: Duration) -> Self {
        self.stop_poll_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set whether a failing worker stops its siblings
    pub fn with_stop_on_failure(mut self, stop: bool) -> Self {
        self.stop_on_failure = stop;
        self
    }
}

fn default_stream_capacity() -> usize {
    DEFAULT_STREAM_CAPACITY
}

fn default_stop_poll_interval_ms() -> u64 {
    DEFAULT_STOP_POLL_INTERVAL.as_millis() as u64
}

fn default_stop_on_failure() -> bool {
    true
}

/// Inline table form of a stage input or output
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SourceRefTable {
    /// Named connection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<String>,
    /// Script file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
    /// Other block
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block: Option<String>,
}

/// Stage input or output as written in the manifest
///
/// Either the keyword `global` or a table with exactly one of
/// `connection`, `script` or `block`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum SourceRef {
    /// Bare keyword
    Keyword(String),
    /// Inline table
    Table(SourceRefTable),
}

impl TryFrom<&SourceRef> for SourceDescriptor {
    type Error = EngineError;

    fn try_from(source: &SourceRef) -> Result<Self> {
        match source {
            SourceRef::Keyword(word) if word.eq_ignore_ascii_case("global") => Ok(Self::Global),
            SourceRef::Keyword(word) => Err(EngineError::config(format!(
                "unknown source keyword '{}'",
                word
            ))),
            SourceRef::Table(table) => match (&table.connection, &table.script, &table.block) {
                (Some(name), None, None) => Ok(Self::Connection(name.clone())),
                (None, Some(path), None) => Ok(Self::Script(path.clone())),
                (None, None, Some(name)) => Ok(Self::Block(name.clone())),
                _ => Err(EngineError::config(
                    "a source needs exactly one of 'connection', 'script' or 'block'",
                )),
            },
        }
    }
}

/// One stage as written in the manifest
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct StageConfig {
    /// Unique stage name
    pub name: String,

    /// Stage kind
    #[serde(default)]
    pub kind: StageKind,

    /// External reference
    #[serde(default, rename = "extern", skip_serializing_if = "Option::is_none")]
    pub extern_ref: Option<String>,

    /// Inputs
    #[serde(default)]
    pub from: Vec<SourceRef>,

    /// Body (the query for SQL sources)
    #[serde(default)]
    pub body: String,

    /// Output; stdout when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub into: Option<SourceRef>,

    /// `KEY: value` options
    #[serde(default)]
    pub options: BTreeMap<String, OptionValue>,
}

impl StageConfig {
    /// Convert into a stage descriptor
    pub fn to_descriptor(&self) -> Result<StageDescriptor> {
        let in_stage = |e: EngineError| EngineError::config(format!("stage '{}': {}", self.name, e));
        let sources = self
            .from
            .iter()
            .map(SourceDescriptor::try_from)
            .collect::<Result<Vec<_>>>()
            .map_err(in_stage)?;
        let destination = self
            .into
            .as_ref()
            .map(SourceDescriptor::try_from)
            .transpose()
            .map_err(in_stage)?;

        Ok(StageDescriptor {
            name: self.name.clone(),
            kind: self.kind,
            extern_ref: self.extern_ref.clone(),
            sources,
            body: self.body.clone(),
            destination,
            options: self
                .options
                .iter()
                .map(|(key, value)| StageOption {
                    key: key.clone(),
                    value: value.clone(),
                })
                .collect(),
        })
    }
}

/// Root of a manifest file
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    /// Engine settings
    #[serde(default)]
    pub settings: EngineSettings,

    /// Named connections
    #[serde(default)]
    pub connections: HashMap<String, ConnectionSpec>,

    /// Parameters declared before the first stage
    #[serde(default)]
    pub globals: Vec<String>,

    /// Stages, run in order
    #[serde(default)]
    pub stages: Vec<StageConfig>,
}

impl Manifest {
    /// Load a manifest from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse a manifest from YAML text, expanding environment variables
    pub fn parse(content: &str) -> Result<Self> {
        let expanded = Self::expand_env_vars(content);
        let manifest: Self = serde_yaml::from_str(&expanded)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Expand environment variables in the format ${VAR} or ${VAR:-default}
    pub fn expand_env_vars(content: &str) -> String {
        ENV_VAR_REGEX
            .replace_all(content, |caps: &regex::Captures| {
                let var_name = &caps[1];
                let default = caps.get(2).map(|m| m.as_str());

                std::env::var(var_name).unwrap_or_else(|_| default.unwrap_or("").to_string())
            })
            .to_string()
    }

    /// Check structure: settings, connection drivers, unique stage names
    pub fn validate(&self) -> Result<()> {
        if self.settings.stream_capacity == 0 {
            return Err(EngineError::config("stream_capacity must be at least 1"));
        }
        if self.settings.stop_poll_interval_ms == 0 {
            return Err(EngineError::config("stop_poll_interval_ms must be at least 1"));
        }

        for (name, conn) in &self.connections {
            if conn.driver.trim().is_empty() {
                return Err(EngineError::config(format!(
                    "connection '{}' must have a driver",
                    name
                )));
            }
        }

        let mut names = HashSet::new();
        for stage in &self.stages {
            if stage.name.trim().is_empty() {
                return Err(EngineError::config("every stage needs a name"));
            }
            if !names.insert(stage.name.as_str()) {
                return Err(EngineError::config(format!(
                    "duplicate stage name '{}'",
                    stage.name
                )));
            }
            stage.to_descriptor()?;
        }
        Ok(())
    }

    /// Stage descriptors in run order
    pub fn descriptors(&self) -> Result<Vec<StageDescriptor>> {
        self.stages.iter().map(StageConfig::to_descriptor).collect()
    }

    /// Build a resolver with a fresh parameter table holding the manifest globals
    pub fn resolver(&self, drivers: Arc<DriverManager>) -> Result<Resolver> {
        let parameters = Arc::new(ParameterTable::new());
        for name in &self.globals {
            parameters.declare(name)?;
        }
        Ok(Resolver::new(drivers, parameters).with_connections(self.connections.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"
connections:
  warehouse: { driver: sqlite, url: ":memory:" }
globals: [ last_id ]
stages:
  - name: max_id
    from: [ { connection: warehouse } ]
    body: SELECT max(id) FROM orders
    into: global
  - name: copy
    kind: query
    from: [ { connection: warehouse } ]
    body: SELECT * FROM orders WHERE id > ?
    into: { connection: warehouse }
    options: { TABLE: archive, PARAMETERS: last_id, BATCH: 10 }
"#;

    #[test]
    fn test_parse_manifest() {
        let manifest = Manifest::parse(MANIFEST).unwrap();
        assert_eq!(manifest.settings, EngineSettings::default());
        assert_eq!(manifest.connections["warehouse"].driver, "sqlite");

        let stages = manifest.descriptors().unwrap();
        assert_eq!(stages.len(), 2);
        assert_eq!(stages[0].destination, Some(SourceDescriptor::Global));
        assert_eq!(
            stages[1].sources,
            vec![SourceDescriptor::Connection("warehouse".into())]
        );
        assert_eq!(stages[1].option("table").map(|v| v.as_string()), Some("archive".into()));
        assert_eq!(stages[1].option("batch"), Some(&OptionValue::Number(10.0)));
    }

    #[test]
    fn test_settings_defaults_and_overrides() {
        let manifest =
            Manifest::parse("settings: { stream_capacity: 5, log_level: warn }").unwrap();
        assert_eq!(manifest.settings.stream_capacity, 5);
        assert_eq!(manifest.settings.log_level, Level::Warning);
        assert_eq!(manifest.settings.stop_poll_interval(), Duration::from_millis(50));
        assert!(manifest.settings.stop_on_failure);

        assert!(Manifest::parse("settings: { stream_capacity: 0 }").is_err());
    }

    #[test]
    fn test_env_expansion() {
        std::env::set_var("ANALYST_TEST_DB_URL", "/tmp/analyst.db");
        let expanded = Manifest::expand_env_vars("a: ${ANALYST_TEST_DB_URL}");
        assert_eq!(expanded, "a: /tmp/analyst.db");

        let expanded = Manifest::expand_env_vars("b: ${ANALYST_TEST_UNSET_VAR:-fallback}");
        assert_eq!(expanded, "b: fallback");

        let expanded = Manifest::expand_env_vars("c: ${ANALYST_TEST_UNSET_VAR}");
        assert_eq!(expanded, "c: ");
    }

    #[test]
    fn test_bad_source_refs() {
        let bad = r#"
stages:
  - name: s
    from: [ { connection: a, block: b } ]
"#;
        assert!(Manifest::parse(bad).unwrap_err().to_string().contains("exactly one"));

        let bad = r#"
stages:
  - name: s
    from: [ somewhere ]
"#;
        assert!(Manifest::parse(bad).is_err());

        let dup = r#"
stages:
  - name: s
  - name: s
"#;
        assert!(Manifest::parse(dup).unwrap_err().to_string().contains("duplicate"));
    }

    #[test]
    fn test_resolver_declares_globals() {
        let manifest = Manifest::parse(MANIFEST).unwrap();
        let resolver = manifest.resolver(Arc::new(DriverManager::new())).unwrap();
        assert!(resolver.parameters().is_declared("LAST_ID"));
        resolver.validate(&manifest.descriptors().unwrap()).unwrap();
    }
}

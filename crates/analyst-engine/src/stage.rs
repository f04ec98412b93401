//! Stage descriptors
//!
//! A descriptor is the parsed form of one stage in a script: where its rows
//! come from, the body to run there, where they go and a bag of options.
//! Descriptors are turned into runnable stages by the
//! [`Resolver`](crate::resolver::Resolver).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stage kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    /// Query rows from a source into a destination
    #[default]
    Query,
    /// Run a script body
    Script,
    /// Declare parameters
    Global,
    /// Run a query for checking only
    Test,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Query => write!(f, "query"),
            Self::Script => write!(f, "script"),
            Self::Global => write!(f, "global"),
            Self::Test => write!(f, "test"),
        }
    }
}

/// Where rows are read from or written to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceDescriptor {
    /// A script file
    Script(String),
    /// A named database connection
    Connection(String),
    /// Another block of the same script
    Block(String),
    /// The parameter table
    Global,
}

impl fmt::Display for SourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Script(path) => write!(f, "script '{}'", path),
            Self::Connection(name) => write!(f, "connection '{}'", name),
            Self::Block(name) => write!(f, "block '{}'", name),
            Self::Global => write!(f, "global"),
        }
    }
}

/// Option value: quoted string or number
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    /// Number literal
    Number(f64),
    /// Quoted string
    Str(String),
}

impl OptionValue {
    /// String form (numbers are rendered)
    pub fn as_string(&self) -> String {
        match self {
            Self::Str(s) => s.clone(),
            Self::Number(n) => n.to_string(),
        }
    }

    /// Numeric form, parsing strings when possible
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Str(s) => s.trim().parse().ok(),
        }
    }
}

/// `KEY = value` stage option
#[derive(Debug, Clone, PartialEq)]
pub struct StageOption {
    /// Option key (case-insensitive)
    pub key: String,
    /// Option value
    pub value: OptionValue,
}

/// One stage of a script
#[derive(Debug, Clone, PartialEq)]
pub struct StageDescriptor {
    /// Stage name
    pub name: String,
    /// Stage kind
    pub kind: StageKind,
    /// External reference (`EXTERN`)
    pub extern_ref: Option<String>,
    /// Inputs
    pub sources: Vec<SourceDescriptor>,
    /// Body executed against the source
    pub body: String,
    /// Output
    pub destination: Option<SourceDescriptor>,
    /// Options
    pub options: Vec<StageOption>,
}

impl StageDescriptor {
    /// Create a descriptor of `kind` with no sources or options
    pub fn new(name: impl Into<String>, kind: StageKind) -> Self {
        Self {
            name: name.into(),
            kind,
            extern_ref: None,
            sources: Vec::new(),
            body: String::new(),
            destination: None,
            options: Vec::new(),
        }
    }

    /// Add a source
    pub fn from(mut self, source: SourceDescriptor) -> Self {
        self.sources.push(source);
        self
    }

    /// Set the body
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Set the destination
    pub fn into_destination(mut self, destination: SourceDescriptor) -> Self {
        self.destination = Some(destination);
        self
    }

    /// Add an option
    pub fn with_option(mut self, key: impl Into<String>, value: OptionValue) -> Self {
        self.options.push(StageOption {
            key: key.into(),
            value,
        });
        self
    }

    /// Look up an option (case-insensitive key; the last occurrence wins)
    pub fn option(&self, key: &str) -> Option<&OptionValue> {
        self.options
            .iter()
            .rev()
            .find(|o| o.key.eq_ignore_ascii_case(key))
            .map(|o| &o.value)
    }

    /// Comma-separated option split into trimmed, non-empty items
    pub fn list_option(&self, key: &str) -> Option<Vec<String>> {
        self.option(key).map(|value| {
            value
                .as_string()
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        })
    }
}

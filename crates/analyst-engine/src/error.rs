//! Error types for analyst-engine
//!
//! Workers never return these: a Source or Destination reports its failure
//! through the Logger and hands back an [`Outcome`](crate::Outcome). The
//! types here are for the synchronous surfaces (stream wiring, parameter
//! declarations, stage resolution and manifest loading).

use thiserror::Error;

/// Result type alias for analyst-engine
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors raised while wiring a [`Stream`](crate::Stream)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[allow(missing_docs)]
pub enum StreamError {
    /// Columns were already recorded for this stream
    #[error("columns already set for stream '{0}'")]
    ColumnsAlreadySet(String),

    /// A row was sent before the columns were recorded
    #[error("stream '{0}' has no columns yet")]
    ColumnsNotSet(String),

    /// The producer endpoint was already handed out
    #[error("producer for stream '{0}' already taken")]
    ProducerTaken(String),

    /// A consumer with this alias is already registered
    #[error("consumer '{alias}' already registered on stream '{stream}'")]
    DuplicateConsumer { stream: String, alias: String },

    /// Registration attempted after the producer started
    #[error("cannot register consumer '{alias}': stream '{stream}' already started")]
    AlreadyStarted { stream: String, alias: String },

    /// No consumer registered under this alias
    #[error("no consumer '{alias}' on stream '{stream}'")]
    UnknownConsumer { stream: String, alias: String },

    /// The consumer endpoint was already handed out
    #[error("consumer '{alias}' on stream '{stream}' already taken")]
    ConsumerTaken { stream: String, alias: String },
}

/// Errors raised by the [`ParameterTable`](crate::ParameterTable)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParameterError {
    /// The name is already declared
    #[error("parameter '{0}' already declared")]
    AlreadyDeclared(String),

    /// The name was never declared
    #[error("parameter '{0}' is not declared")]
    Undeclared(String),
}

/// Main error type for analyst-engine
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum EngineError {
    /// Configuration error (unknown connection, missing option, bad manifest)
    #[error("configuration error: {0}")]
    Config(String),

    /// The stage descriptor uses something this engine cannot run
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Row width does not match the stream columns
    #[error("expected {expected} columns but got {actual}")]
    Shape { expected: usize, actual: usize },

    /// A row arrived before the stream had columns
    #[error("received a row before columns were set")]
    MissingColumns,

    /// A database value could not be decoded
    #[error("decode error: {0}")]
    Decode(String),

    /// Stream wiring error
    #[error(transparent)]
    Stream(#[from] StreamError),

    /// Parameter table error
    #[error(transparent)]
    Parameter(#[from] ParameterError),

    /// Database error
    #[error(transparent)]
    Database(#[from] analyst_rdbc::Error),

    /// Manifest could not be parsed
    #[error("manifest error: {0}")]
    Manifest(#[from] serde_yaml::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create an unsupported error
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported(message.into())
    }

    /// Whether the error comes from the stage definition rather than runtime
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::Unsupported(_) | Self::Parameter(_) | Self::Manifest(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_error_display() {
        let err = StreamError::DuplicateConsumer {
            stream: "q".into(),
            alias: "out".into(),
        };
        assert_eq!(
            err.to_string(),
            "consumer 'out' already registered on stream 'q'"
        );
    }

    #[test]
    fn test_shape_display() {
        let err = EngineError::Shape {
            expected: 2,
            actual: 3,
        };
        assert_eq!(err.to_string(), "expected 2 columns but got 3");
    }

    #[test]
    fn test_is_config() {
        assert!(EngineError::config("x").is_config());
        assert!(EngineError::from(ParameterError::Undeclared("A".into())).is_config());
        assert!(!EngineError::MissingColumns.is_config());
    }
}

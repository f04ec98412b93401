//! Source and Destination execution contract
//!
//! A stage runs one Source and any number of Destinations concurrently over
//! a shared [`Stream`]. Workers report problems through the [`Logger`] and
//! return an [`Outcome`] for the runner.
//!
//! Source contract:
//! 1. take the producer, then set the stream columns before the first row
//! 2. check the stopper before every row; if raised, close and return
//!    [`Outcome::Cancelled`] with a Warning, never an Error event
//! 3. on any unrecoverable error emit exactly one Error event, close the
//!    stream and return [`Outcome::Failed`]
//!
//! Destination contract:
//! 1. take the consumer for [`Destination::alias`] and read until closed
//! 2. check every row's width against the stream columns
//! 3. on stop, abandon work in progress and return [`Outcome::Cancelled`]
//! 4. finalize (commit, flush) only on clean exhaustion

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

use crate::logger::Logger;
use crate::stopper::Stopper;
use crate::stream::Stream;

/// How a worker finished
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// Ran to the end of its input
    Completed,
    /// Observed the stopper and bailed out
    Cancelled,
    /// Hit an unrecoverable error (details were logged)
    Failed,
}

impl Outcome {
    /// Whether this outcome is a failure
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Produces the rows of a stage
#[async_trait]
pub trait Source: Send + Sync {
    /// Name used as the event source
    fn name(&self) -> &str;

    /// Drive the stream to completion
    async fn open(&self, stream: Arc<Stream>, logger: Logger, stopper: Stopper) -> Outcome;
}

/// Consumes the rows of a stage
#[async_trait]
pub trait Destination: Send + Sync {
    /// Name used as the event source
    fn name(&self) -> &str;

    /// Consumer alias on the stream
    fn alias(&self) -> &str {
        ""
    }

    /// Drain the stream to completion
    async fn open(&self, stream: Arc<Stream>, logger: Logger, stopper: Stopper) -> Outcome;
}

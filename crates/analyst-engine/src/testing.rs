//! In-memory Source and Destination for exercising stages
//!
//! # Example
//!
//! ```rust,ignore
//! use analyst_engine::testing::*;
//!
//! let source = MemorySource::new("numbers", vec!["n".into()])
//!     .with_rows((0..10).map(|n| vec![Scalar::Int(n)]).collect());
//! let sink = MemoryDestination::new("out");
//! // ... run both over one stream ...
//! assert_eq!(sink.rows().len(), 10);
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use crate::connector::{Destination, Outcome, Source};
use crate::logger::Logger;
use crate::scalar::Row;
use crate::stopper::Stopper;
use crate::stream::{Next, Stream};

/// Source that replays a fixed set of rows
#[derive(Debug, Clone)]
pub struct MemorySource {
    name: String,
    columns: Vec<String>,
    rows: Vec<Row>,
    delay: Option<Duration>,
    fail_after: Option<usize>,
}

impl MemorySource {
    /// Create a source with columns and no rows
    pub fn new(name: impl Into<String>, columns: Vec<String>) -> Self {
        Self {
            name: name.into(),
            columns,
            rows: Vec::new(),
            delay: None,
            fail_after: None,
        }
    }

    /// Set the rows to emit
    pub fn with_rows(mut self, rows: Vec<Row>) -> Self {
        self.rows = rows;
        self
    }

    /// Sleep before every row
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail after emitting `rows` rows
    pub fn fail_after(mut self, rows: usize) -> Self {
        self.fail_after = Some(rows);
        self
    }
}

#[async_trait]
impl Source for MemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&self, stream: Arc<Stream>, logger: Logger, stopper: Stopper) -> Outcome {
        let mut producer = match stream.producer() {
            Ok(p) => p,
            Err(e) => {
                logger.error(&self.name, e.to_string()).await;
                return Outcome::Failed;
            }
        };
        if let Err(e) = stream.set_columns(self.columns.clone()) {
            logger.error(&self.name, e.to_string()).await;
            return Outcome::Failed;
        }

        for (idx, row) in self.rows.iter().enumerate() {
            if stopper.is_stopped() {
                logger.warn(&self.name, "memory source stopped").await;
                return Outcome::Cancelled;
            }
            if self.fail_after == Some(idx) {
                logger.error(&self.name, "injected failure").await;
                return Outcome::Failed;
            }
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if let Err(e) = producer.send(row.clone()).await {
                logger.error(&self.name, e.to_string()).await;
                return Outcome::Failed;
            }
        }
        producer.close();
        Outcome::Completed
    }
}

/// Destination that collects every row it reads
#[derive(Debug, Clone, Default)]
pub struct MemoryDestination {
    name: String,
    alias: String,
    delay: Option<Duration>,
    rows: Arc<Mutex<Vec<Row>>>,
}

impl MemoryDestination {
    /// Create a destination on the default consumer
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Read from a named consumer
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = alias.into();
        self
    }

    /// Sleep after every row
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Rows collected so far (clones share them)
    pub fn rows(&self) -> Vec<Row> {
        self.rows.lock().clone()
    }
}

#[async_trait]
impl Destination for MemoryDestination {
    fn name(&self) -> &str {
        &self.name
    }

    fn alias(&self) -> &str {
        &self.alias
    }

    async fn open(&self, stream: Arc<Stream>, logger: Logger, stopper: Stopper) -> Outcome {
        let mut consumer = match stream.consumer(&self.alias) {
            Ok(c) => c,
            Err(e) => {
                logger.error(&self.name, e.to_string()).await;
                return Outcome::Failed;
            }
        };

        loop {
            match consumer.next(&stopper).await {
                Next::Row(row) => {
                    if let Err(e) = stream.check_row(&row) {
                        logger.error(&self.name, e.to_string()).await;
                        return Outcome::Failed;
                    }
                    self.rows.lock().push(row.as_ref().clone());
                    if let Some(delay) = self.delay {
                        tokio::time::sleep(delay).await;
                    }
                }
                Next::Closed => return Outcome::Completed,
                Next::Stopped => {
                    logger.warn(&self.name, "memory destination stopped").await;
                    return Outcome::Cancelled;
                }
            }
        }
    }
}

/// Cloneable in-memory writer
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl SharedBuffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Contents as UTF-8 (lossy)
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.bytes.lock()).into_owned()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.bytes.lock().extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

//! Fan-out row stream for one stage run
//!
//! A [`Stream`] has exactly one [`Producer`] and any number of named
//! [`Consumer`]s. Every consumer gets its own bounded buffer and sees every
//! row, in production order, from the first one on. Consumers must be
//! registered before the producer is taken.
//!
//! The producer hands each row to every live buffer in registration order
//! before `send` returns, so when a full buffer makes it wait, the slowest
//! consumer sets the pace for everyone. A consumer that drops its endpoint
//! leaves the broadcast set.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{EngineError, StreamError};
use crate::scalar::Row;
use crate::stopper::Stopper;

/// Default buffer capacity per consumer
pub const DEFAULT_STREAM_CAPACITY: usize = 100;

/// Default interval at which a waiting consumer re-checks the stopper
pub const DEFAULT_STOP_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Default)]
struct Registry {
    started: bool,
    senders: Vec<(String, mpsc::Sender<Arc<Row>>)>,
    receivers: HashMap<String, Option<mpsc::Receiver<Arc<Row>>>>,
}

/// Row conduit between one Source and its Destinations
pub struct Stream {
    name: String,
    capacity: usize,
    poll_interval: Duration,
    columns: Arc<OnceLock<Vec<String>>>,
    registry: Mutex<Registry>,
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("columns", &self.columns.get())
            .finish()
    }
}

impl Stream {
    /// Create a stream with default capacity and poll interval
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capacity: DEFAULT_STREAM_CAPACITY,
            poll_interval: DEFAULT_STOP_POLL_INTERVAL,
            columns: Arc::new(OnceLock::new()),
            registry: Mutex::new(Registry::default()),
        }
    }

    /// Set the per-consumer buffer capacity (at least 1)
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Set how often a waiting consumer re-checks the stopper
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Stream name (the stage name)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Per-consumer buffer capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Record the column names; only the first call wins
    pub fn set_columns(&self, columns: Vec<String>) -> Result<(), StreamError> {
        self.columns
            .set(columns)
            .map_err(|_| StreamError::ColumnsAlreadySet(self.name.clone()))
    }

    /// Column names, once set
    pub fn columns(&self) -> Option<&[String]> {
        self.columns.get().map(Vec::as_slice)
    }

    /// Check a row against the column count, returning the columns
    pub fn check_row(&self, row: &Row) -> Result<&[String], EngineError> {
        let columns = self.columns().ok_or(EngineError::MissingColumns)?;
        if columns.len() != row.len() {
            return Err(EngineError::Shape {
                expected: columns.len(),
                actual: row.len(),
            });
        }
        Ok(columns)
    }

    /// Create the buffer for a consumer alias
    pub fn register(&self, alias: &str) -> Result<(), StreamError> {
        let mut registry = self.registry.lock();
        if registry.started {
            return Err(StreamError::AlreadyStarted {
                stream: self.name.clone(),
                alias: alias.to_string(),
            });
        }
        if registry.receivers.contains_key(alias) {
            return Err(StreamError::DuplicateConsumer {
                stream: self.name.clone(),
                alias: alias.to_string(),
            });
        }

        let (tx, rx) = mpsc::channel(self.capacity);
        registry.senders.push((alias.to_string(), tx));
        registry.receivers.insert(alias.to_string(), Some(rx));
        debug!(stream = %self.name, consumer = %alias, "Registered consumer");
        Ok(())
    }

    /// Registered consumer aliases in registration order
    pub fn consumers(&self) -> Vec<String> {
        self.registry
            .lock()
            .senders
            .iter()
            .map(|(alias, _)| alias.clone())
            .collect()
    }

    /// Take the write side; freezes the consumer registry
    pub fn producer(&self) -> Result<Producer, StreamError> {
        let mut registry = self.registry.lock();
        if registry.started {
            return Err(StreamError::ProducerTaken(self.name.clone()));
        }
        registry.started = true;

        Ok(Producer {
            stream: self.name.clone(),
            columns: Arc::clone(&self.columns),
            consumers: std::mem::take(&mut registry.senders),
            sent: 0,
        })
    }

    /// Take the read side registered for `alias`
    pub fn consumer(&self, alias: &str) -> Result<Consumer, StreamError> {
        let mut registry = self.registry.lock();
        match registry.receivers.get_mut(alias) {
            None => Err(StreamError::UnknownConsumer {
                stream: self.name.clone(),
                alias: alias.to_string(),
            }),
            Some(slot) => match slot.take() {
                None => Err(StreamError::ConsumerTaken {
                    stream: self.name.clone(),
                    alias: alias.to_string(),
                }),
                Some(rx) => Ok(Consumer {
                    alias: alias.to_string(),
                    rx,
                    poll_interval: self.poll_interval,
                    received: 0,
                }),
            },
        }
    }
}

/// Write side of a [`Stream`]
///
/// Dropping it closes the stream: consumers drain what is buffered, then
/// see [`Next::Closed`].
pub struct Producer {
    stream: String,
    columns: Arc<OnceLock<Vec<String>>>,
    consumers: Vec<(String, mpsc::Sender<Arc<Row>>)>,
    sent: u64,
}

impl Producer {
    /// Broadcast one row to every live consumer
    ///
    /// Waits while any consumer buffer is full.
    pub async fn send(&mut self, row: Row) -> Result<(), StreamError> {
        if self.columns.get().is_none() {
            return Err(StreamError::ColumnsNotSet(self.stream.clone()));
        }

        let row = Arc::new(row);
        let mut idx = 0;
        while idx < self.consumers.len() {
            if self.consumers[idx].1.send(Arc::clone(&row)).await.is_err() {
                let (alias, _) = self.consumers.remove(idx);
                debug!(stream = %self.stream, consumer = %alias, "Consumer gone, removed from broadcast");
            } else {
                idx += 1;
            }
        }
        self.sent += 1;
        Ok(())
    }

    /// Rows sent so far
    pub fn rows_sent(&self) -> u64 {
        self.sent
    }

    /// Number of consumers still receiving
    pub fn live_consumers(&self) -> usize {
        self.consumers.len()
    }

    /// Close the stream
    pub fn close(self) {
        debug!(stream = %self.stream, rows = self.sent, "Producer closed");
    }
}

/// Result of [`Consumer::next`]
#[derive(Debug, Clone, PartialEq)]
pub enum Next {
    /// The next row
    Row(Arc<Row>),
    /// The producer closed and every buffered row was delivered
    Closed,
    /// The stopper was raised
    Stopped,
}

/// Read side of a [`Stream`] for one alias
#[derive(Debug)]
pub struct Consumer {
    alias: String,
    rx: mpsc::Receiver<Arc<Row>>,
    poll_interval: Duration,
    received: u64,
}

impl Consumer {
    /// Alias this endpoint was registered under
    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Rows received so far
    pub fn rows_received(&self) -> u64 {
        self.received
    }

    /// Wait for the next row
    ///
    /// The stopper is checked before each row, again every poll interval
    /// while waiting, and once more when the stream turns out closed.
    pub async fn next(&mut self, stopper: &Stopper) -> Next {
        loop {
            if stopper.is_stopped() {
                return Next::Stopped;
            }
            match tokio::time::timeout(self.poll_interval, self.rx.recv()).await {
                Ok(Some(row)) => {
                    self.received += 1;
                    return Next::Row(row);
                }
                // A stop raised while the producer was closing wins over the close.
                Ok(None) if stopper.is_stopped() => return Next::Stopped,
                Ok(None) => return Next::Closed,
                Err(_) => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scalar::Scalar;

    fn row(n: i64) -> Row {
        vec![Scalar::Int(n)]
    }

    #[test]
    fn test_columns_set_once() {
        let stream = Stream::new("s");
        assert!(stream.columns().is_none());
        stream.set_columns(vec!["a".into()]).unwrap();
        assert_eq!(
            stream.set_columns(vec!["b".into()]),
            Err(StreamError::ColumnsAlreadySet("s".into()))
        );
        assert_eq!(stream.columns(), Some(&["a".to_string()][..]));
    }

    #[test]
    fn test_registration_rules() {
        let stream = Stream::new("s");
        stream.register("").unwrap();
        stream.register("audit").unwrap();
        assert!(matches!(
            stream.register("audit"),
            Err(StreamError::DuplicateConsumer { .. })
        ));
        assert_eq!(stream.consumers(), vec!["".to_string(), "audit".to_string()]);

        let _producer = stream.producer().unwrap();
        assert!(matches!(
            stream.producer(),
            Err(StreamError::ProducerTaken(_))
        ));
        assert!(matches!(
            stream.register("late"),
            Err(StreamError::AlreadyStarted { .. })
        ));

        assert!(stream.consumer("").is_ok());
        assert!(matches!(
            stream.consumer(""),
            Err(StreamError::ConsumerTaken { .. })
        ));
        assert!(matches!(
            stream.consumer("nope"),
            Err(StreamError::UnknownConsumer { .. })
        ));
    }

    #[test]
    fn test_check_row() {
        let stream = Stream::new("s");
        assert!(matches!(
            stream.check_row(&row(1)),
            Err(EngineError::MissingColumns)
        ));
        stream.set_columns(vec!["a".into(), "b".into()]).unwrap();
        assert!(matches!(
            stream.check_row(&row(1)),
            Err(EngineError::Shape {
                expected: 2,
                actual: 1
            })
        ));
    }

    #[tokio::test]
    async fn test_send_requires_columns() {
        let stream = Stream::new("s");
        let mut producer = stream.producer().unwrap();
        assert_eq!(
            producer.send(row(1)).await,
            Err(StreamError::ColumnsNotSet("s".into()))
        );
    }

    #[tokio::test]
    async fn test_buffered_rows_survive_close() {
        let stream = Stream::new("s");
        stream.register("").unwrap();
        stream.set_columns(vec!["n".into()]).unwrap();
        let mut producer = stream.producer().unwrap();
        let mut consumer = stream.consumer("").unwrap();
        let stopper = Stopper::new();

        producer.send(row(1)).await.unwrap();
        producer.send(row(2)).await.unwrap();
        producer.close();

        assert_eq!(consumer.next(&stopper).await, Next::Row(Arc::new(row(1))));
        assert_eq!(consumer.next(&stopper).await, Next::Row(Arc::new(row(2))));
        assert_eq!(consumer.next(&stopper).await, Next::Closed);
        assert_eq!(consumer.rows_received(), 2);
    }

    #[tokio::test]
    async fn test_dropped_consumer_leaves_broadcast() {
        let stream = Stream::new("s").with_capacity(1);
        stream.register("a").unwrap();
        stream.register("b").unwrap();
        stream.set_columns(vec!["n".into()]).unwrap();
        let mut producer = stream.producer().unwrap();
        drop(stream.consumer("a").unwrap());
        let mut b = stream.consumer("b").unwrap();

        producer.send(row(1)).await.unwrap();
        assert_eq!(producer.live_consumers(), 1);
        assert_eq!(b.next(&Stopper::new()).await, Next::Row(Arc::new(row(1))));
    }

    #[tokio::test]
    async fn test_waiting_consumer_sees_stop() {
        let stream = Stream::new("s").with_poll_interval(Duration::from_millis(5));
        stream.register("").unwrap();
        let _producer = stream.producer().unwrap();
        let mut consumer = stream.consumer("").unwrap();

        let stopper = Stopper::new();
        let trigger = stopper.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.stop();
        });

        assert_eq!(consumer.next(&stopper).await, Next::Stopped);
    }
}

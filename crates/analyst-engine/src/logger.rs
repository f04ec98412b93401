//! Leveled event log for pipeline workers
//!
//! Workers push [`Event`]s into a bounded queue. One background task per
//! logger drains the queue, drops events below the minimum level and hands
//! the rest to a [`LogSink`].
//!
//! ```rust,ignore
//! let (logger, drain) = Logger::spawn(Level::Info, ConsoleSink::stdout());
//! logger.info("orders", "SQL source opened").await;
//! drop(logger);
//! drain.finish().await;
//! ```

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Capacity of the event queue
pub const LOG_QUEUE_CAPACITY: usize = 256;

const TIME_FORMAT: &str = "%H:%M:%S";

/// Event severity; the ordering is only used for filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    /// Row-level detail
    Trace,
    /// Lifecycle messages
    #[default]
    Info,
    /// Cancellation and recoverable trouble
    #[serde(alias = "warn")]
    Warning,
    /// Worker failures
    Error,
}

impl Level {
    /// Upper-case tag used in console output
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Trace => "TRACE",
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for Level {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown log level '{}'", other)),
        }
    }
}

/// One log event
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// When the event was created
    pub time: DateTime<Local>,
    /// Name of the emitting worker
    pub source: String,
    /// Severity
    pub level: Level,
    /// Message text
    pub message: String,
}

impl Event {
    /// Create an event stamped with the current time
    pub fn new(source: impl Into<String>, level: Level, message: impl Into<String>) -> Self {
        Self {
            time: Local::now(),
            source: source.into(),
            level,
            message: message.into(),
        }
    }
}

/// Console line: `[LEVEL] HH:MM:SS - (source) message`
pub fn format_event(event: &Event) -> String {
    format!(
        "[{}] {} - ({}) {}",
        event.level.tag(),
        event.time.format(TIME_FORMAT),
        event.source,
        event.message
    )
}

/// Destination for drained events
pub trait LogSink: Send + 'static {
    /// Render one event that passed the level filter
    fn emit(&mut self, event: &Event);

    /// Called once after the last event
    fn flush(&mut self) {}
}

/// Writes one formatted line per event
pub struct ConsoleSink {
    out: Box<dyn Write + Send>,
}

impl ConsoleSink {
    /// Console sink on standard output
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }

    /// Console sink on any writer
    pub fn new(out: impl Write + Send + 'static) -> Self {
        Self { out: Box::new(out) }
    }
}

impl LogSink for ConsoleSink {
    fn emit(&mut self, event: &Event) {
        if let Err(e) = writeln!(self.out, "{}", format_event(event)) {
            tracing::warn!("Failed to write log event: {}", e);
        }
    }

    fn flush(&mut self) {
        if let Err(e) = self.out.flush() {
            tracing::warn!("Failed to flush log sink: {}", e);
        }
    }
}

/// Re-emits events through `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn emit(&mut self, event: &Event) {
        let source = event.source.as_str();
        let message = event.message.as_str();
        match event.level {
            Level::Trace => tracing::trace!(source, "{}", message),
            Level::Info => tracing::info!(source, "{}", message),
            Level::Warning => tracing::warn!(source, "{}", message),
            Level::Error => tracing::error!(source, "{}", message),
        }
    }
}

/// Collects events in memory
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<Event>>>,
}

impl MemorySink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything collected so far
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// Collected events at `level`
    pub fn at_level(&self, level: Level) -> Vec<Event> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.level == level)
            .cloned()
            .collect()
    }

    /// Number of collected Error events
    pub fn error_count(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.level == Level::Error)
            .count()
    }
}

impl LogSink for MemorySink {
    fn emit(&mut self, event: &Event) {
        self.events.lock().push(event.clone());
    }
}

/// Handle used by workers to emit events
#[derive(Debug, Clone)]
pub struct Logger {
    tx: mpsc::Sender<Event>,
}

/// The drain task of a [`Logger`]
#[derive(Debug)]
pub struct LogDrain {
    handle: JoinHandle<()>,
}

impl Logger {
    /// Start a drain task rendering events at or above `min_level` to `sink`
    pub fn spawn(min_level: Level, mut sink: impl LogSink) -> (Self, LogDrain) {
        let (tx, mut rx) = mpsc::channel::<Event>(LOG_QUEUE_CAPACITY);
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if event.level >= min_level {
                    sink.emit(&event);
                }
            }
            sink.flush();
        });
        (Self { tx }, LogDrain { handle })
    }

    /// Raw write side of the event queue
    pub fn sender(&self) -> mpsc::Sender<Event> {
        self.tx.clone()
    }

    /// Queue an event; waits while the queue is full
    pub async fn log(&self, source: &str, level: Level, message: impl Into<String>) {
        if self.tx.send(Event::new(source, level, message)).await.is_err() {
            tracing::debug!(source, "Log drain closed, event dropped");
        }
    }

    /// Queue a Trace event
    pub async fn trace(&self, source: &str, message: impl Into<String>) {
        self.log(source, Level::Trace, message).await;
    }

    /// Queue an Info event
    pub async fn info(&self, source: &str, message: impl Into<String>) {
        self.log(source, Level::Info, message).await;
    }

    /// Queue a Warning event
    pub async fn warn(&self, source: &str, message: impl Into<String>) {
        self.log(source, Level::Warning, message).await;
    }

    /// Queue an Error event
    pub async fn error(&self, source: &str, message: impl Into<String>) {
        self.log(source, Level::Error, message).await;
    }
}

impl LogDrain {
    /// Wait until every [`Logger`] handle is dropped and all events are rendered
    pub async fn finish(self) {
        if let Err(e) = self.handle.await {
            tracing::error!("Log drain task failed: {}", e);
        }
    }
}

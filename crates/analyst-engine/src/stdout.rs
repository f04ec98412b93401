//! Stdout destination
//!
//! Prints the rows of a stage for inspection.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::str::FromStr;
use std::sync::Arc;

use crate::connector::{Destination, Outcome};
use crate::logger::Logger;
use crate::scalar::Row;
use crate::stopper::Stopper;
use crate::stream::{Next, Stream};

/// Output format for stdout destination
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Space separated values
    #[default]
    Text,
    /// Tab-separated values
    Tsv,
    /// One JSON object per row
    Json,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "tsv" => Ok(Self::Tsv),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown output format '{}'", other)),
        }
    }
}

impl OutputFormat {
    fn separator(&self) -> &'static str {
        match self {
            Self::Tsv => "\t",
            _ => " ",
        }
    }

    /// Header line, if the format has one
    pub fn header(&self, columns: &[String]) -> Option<String> {
        match self {
            Self::Json => None,
            _ => Some(columns.join(self.separator())),
        }
    }

    /// Render one row
    pub fn render(&self, columns: &[String], row: &Row) -> String {
        match self {
            Self::Json => {
                let object: serde_json::Map<String, serde_json::Value> = columns
                    .iter()
                    .cloned()
                    .zip(row.iter().map(|v| v.to_json()))
                    .collect();
                serde_json::Value::Object(object).to_string()
            }
            _ => row
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join(self.separator()),
        }
    }
}

/// Destination that prints rows
pub struct StdoutDestination {
    name: String,
    alias: String,
    format: OutputFormat,
    out: Mutex<Box<dyn Write + Send>>,
}

impl StdoutDestination {
    /// Print to standard output
    pub fn new(name: impl Into<String>, format: OutputFormat) -> Self {
        Self::with_writer(name, format, std::io::stdout())
    }

    /// Print to any writer
    pub fn with_writer(
        name: impl Into<String>,
        format: OutputFormat,
        out: impl Write + Send + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            alias: String::new(),
            format,
            out: Mutex::new(Box::new(out)),
        }
    }

    /// Read from a named consumer
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = alias.into();
        self
    }

    /// Output format
    pub fn format(&self) -> OutputFormat {
        self.format
    }

    fn write_line(&self, line: &str) -> std::io::Result<()> {
        writeln!(self.out.lock(), "{}", line)
    }
}

#[async_trait]
impl Destination for StdoutDestination {
    fn name(&self) -> &str {
        &self.name
    }

    fn alias(&self) -> &str {
        &self.alias
    }

    async fn open(&self, stream: Arc<Stream>, logger: Logger, stopper: Stopper) -> Outcome {
        let name = self.name.as_str();
        let mut consumer = match stream.consumer(&self.alias) {
            Ok(c) => c,
            Err(e) => {
                logger.error(name, e.to_string()).await;
                return Outcome::Failed;
            }
        };

        let mut header_written = false;
        loop {
            let row = match consumer.next(&stopper).await {
                Next::Row(row) => row,
                Next::Closed => break,
                Next::Stopped => {
                    logger.warn(name, "Stdout destination aborted").await;
                    return Outcome::Cancelled;
                }
            };
            let columns = match stream.check_row(&row) {
                Ok(columns) => columns,
                Err(e) => {
                    logger.error(name, e.to_string()).await;
                    return Outcome::Failed;
                }
            };

            let mut result = Ok(());
            if !header_written {
                header_written = true;
                if let Some(header) = self.format.header(columns) {
                    result = self.write_line(&header);
                }
            }
            let result = result.and_then(|_| self.write_line(&self.format.render(columns, &row)));
            if let Err(e) = result {
                logger.error(name, format!("write failed: {}", e)).await;
                return Outcome::Failed;
            }
        }

        let flushed = self.out.lock().flush();
        if let Err(e) = flushed {
            logger.error(name, format!("flush failed: {}", e)).await;
            return Outcome::Failed;
        }
        logger
            .trace(name, format!("Printed {} rows", consumer.rows_received()))
            .await;
        Outcome::Completed
    }
}

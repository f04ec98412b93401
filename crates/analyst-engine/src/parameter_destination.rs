//! Destination that stores the last row of a stage into the parameter table
//!
//! Stream columns are matched to target names with the parameter table's
//! case fold, so a column matches exactly the targets it could set. When no
//! column name matches any target, targets are aligned to columns by
//! position instead. Only the last row read before the stream closes is
//! applied; a stopped run applies nothing.

use async_trait::async_trait;
use std::sync::Arc;

use crate::connector::{Destination, Outcome};
use crate::error::ParameterError;
use crate::logger::Logger;
use crate::parameters::{fold, ParameterTable};
use crate::stopper::Stopper;
use crate::stream::{Next, Stream};

/// Writes the latest row into declared parameters
pub struct ParameterTableDestination {
    name: String,
    alias: String,
    table: Arc<ParameterTable>,
    targets: Vec<String>,
}

impl ParameterTableDestination {
    /// Create a destination writing `targets` into `table`
    pub fn new(name: impl Into<String>, table: Arc<ParameterTable>, targets: Vec<String>) -> Self {
        Self {
            name: name.into(),
            alias: String::new(),
            table,
            targets,
        }
    }

    /// Read from a named consumer
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = alias.into();
        self
    }

    /// Target parameter names
    pub fn targets(&self) -> &[String] {
        &self.targets
    }

    /// Pair each target with the column index feeding it
    pub fn assignments(&self, columns: &[String]) -> Vec<(String, usize)> {
        let folded: Vec<String> = columns.iter().map(|c| fold(c)).collect();
        let by_name: Vec<(String, usize)> = self
            .targets
            .iter()
            .filter_map(|target| {
                let target_key = fold(target);
                folded
                    .iter()
                    .position(|c| *c == target_key)
                    .map(|idx| (target.clone(), idx))
            })
            .collect();
        if !by_name.is_empty() {
            return by_name;
        }

        self.targets
            .iter()
            .take(columns.len())
            .cloned()
            .enumerate()
            .map(|(idx, target)| (target, idx))
            .collect()
    }
}

#[async_trait]
impl Destination for ParameterTableDestination {
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

        let mut last = None;
        loop {
            match consumer.next(&stopper).await {
                Next::Row(row) => {
                    if let Err(e) = stream.check_row(&row) {
                        logger.error(name, e.to_string()).await;
                        return Outcome::Failed;
                    }
                    logger.trace(name, format!("Row {:?}", row)).await;
                    last = Some(row);
                }
                Next::Closed => break,
                Next::Stopped => {
                    logger.warn(name, "Parameter destination aborted").await;
                    return Outcome::Cancelled;
                }
            }
        }

        let (Some(row), Some(columns)) = (last, stream.columns()) else {
            logger.info(name, "No rows, parameters left unchanged").await;
            return Outcome::Completed;
        };

        let assignments = self.assignments(columns);
        if let Some((target, _)) = assignments
            .iter()
            .find(|(target, _)| !self.table.is_declared(target))
        {
            let err = ParameterError::Undeclared(fold(target));
            logger.error(name, err.to_string()).await;
            return Outcome::Failed;
        }

        for (target, idx) in &assignments {
            if let Err(e) = self.table.set(target, row[*idx].clone()) {
                logger.error(name, e.to_string()).await;
                return Outcome::Failed;
            }
        }
        logger
            .info(name, format!("Set {} parameters", assignments.len()))
            .await;
        Outcome::Completed
    }
}

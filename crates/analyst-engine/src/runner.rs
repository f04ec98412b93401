//! Stage runner
//!
//! Runs stages one after another. For a pipeline stage it builds the
//! [`Stream`], registers one consumer per destination alias, spawns the
//! source and every destination as separate tasks sharing one [`Stopper`]
//! and waits for all of them. When `stop_on_failure` is set, the first
//! failing worker raises the stopper so its siblings bail out. A worker
//! that panics counts as failed.

use futures::future::join_all;
use futures::FutureExt;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::EngineSettings;
use crate::connector::Outcome;
use crate::error::Result;
use crate::logger::Logger;
use crate::resolver::{Pipeline, Resolver, Stage};
use crate::stage::StageDescriptor;
use crate::stopper::Stopper;
use crate::stream::Stream;

/// How one worker of a stage finished
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerReport {
    /// Worker name
    pub name: String,
    /// Whether the worker was the source
    pub is_source: bool,
    /// Outcome
    pub outcome: Outcome,
}

/// Result of running one stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageReport {
    /// Stage name
    pub name: String,
    /// One entry per worker; empty for declaration stages
    pub workers: Vec<WorkerReport>,
}

impl StageReport {
    /// Overall outcome: failed beats cancelled beats completed
    pub fn outcome(&self) -> Outcome {
        let outcomes = self.workers.iter().map(|w| w.outcome);
        if outcomes.clone().any(|o| o == Outcome::Failed) {
            Outcome::Failed
        } else if outcomes.clone().any(|o| o == Outcome::Cancelled) {
            Outcome::Cancelled
        } else {
            Outcome::Completed
        }
    }

    /// Whether any worker failed
    pub fn is_failed(&self) -> bool {
        self.outcome().is_failed()
    }
}

impl fmt::Display for StageReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.outcome())?;
        for worker in &self.workers {
            let role = if worker.is_source { "source" } else { "destination" };
            write!(f, "\n  {} {}: {}", role, worker.name, worker.outcome)?;
        }
        Ok(())
    }
}

/// Result of running a list of stages
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    /// Reports of the stages that ran, in order
    pub stages: Vec<StageReport>,
    /// Stages skipped after a failure
    pub skipped: Vec<String>,
}

impl RunReport {
    /// Whether any stage failed
    pub fn is_failed(&self) -> bool {
        self.stages.iter().any(StageReport::is_failed)
    }
}

/// Executes stages with shared settings, resolver and logger
pub struct StageRunner {
    settings: EngineSettings,
    resolver: Resolver,
    logger: Logger,
}

impl StageRunner {
    /// Create a runner
    pub fn new(settings: EngineSettings, resolver: Resolver, logger: Logger) -> Self {
        Self {
            settings,
            resolver,
            logger,
        }
    }

    /// Engine settings
    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Resolver used for every stage
    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    /// Run stages in order, stopping after the first failed one
    ///
    /// Each stage is resolved right before it runs so that it sees the
    /// parameters written by the stages before it.
    pub async fn run_all(&self, stages: &[StageDescriptor]) -> Result<RunReport> {
        let mut report = RunReport::default();
        for (idx, desc) in stages.iter().enumerate() {
            let stage = self.run_stage(desc).await?;
            let failed = stage.is_failed();
            report.stages.push(stage);
            if failed {
                report.skipped = stages[idx + 1..].iter().map(|d| d.name.clone()).collect();
                if !report.skipped.is_empty() {
                    warn!(stage = %desc.name, skipped = report.skipped.len(), "Stage failed, skipping the rest");
                }
                break;
            }
        }
        Ok(report)
    }

    /// Resolve and run one stage
    pub async fn run_stage(&self, desc: &StageDescriptor) -> Result<StageReport> {
        match self.resolver.resolve(desc)? {
            Stage::Declare { name, parameters } => {
                for param in &parameters {
                    self.resolver.parameters().declare(param)?;
                }
                debug!(stage = %name, parameters = ?parameters, "Declared parameters");
                Ok(StageReport {
                    name,
                    workers: Vec::new(),
                })
            }
            Stage::Pipeline(pipeline) => self.run_pipeline(pipeline).await,
        }
    }

    /// Run the source and destinations of a pipeline to completion
    pub async fn run_pipeline(&self, pipeline: Pipeline) -> Result<StageReport> {
        let Pipeline {
            name,
            source,
            destinations,
        } = pipeline;
        let started = Instant::now();

        let stream = Arc::new(
            Stream::new(&name)
                .with_capacity(self.settings.stream_capacity)
                .with_poll_interval(self.settings.stop_poll_interval()),
        );
        for dest in &destinations {
            stream.register(dest.alias())?;
        }

        let stopper = Stopper::new();
        let mut workers = Vec::with_capacity(destinations.len() + 1);
        let mut tasks = Vec::with_capacity(destinations.len() + 1);

        for dest in destinations {
            workers.push((dest.name().to_string(), false));
            let (worker_stream, logger, worker_stopper) =
                (Arc::clone(&stream), self.logger.clone(), stopper.clone());
            tasks.push(self.supervise(
                dest.name().to_string(),
                stopper.clone(),
                async move { dest.open(worker_stream, logger, worker_stopper).await },
            ));
        }

        workers.push((source.name().to_string(), true));
        let (worker_stream, logger, worker_stopper) =
            (Arc::clone(&stream), self.logger.clone(), stopper.clone());
        tasks.push(self.supervise(
            source.name().to_string(),
            stopper,
            async move { source.open(worker_stream, logger, worker_stopper).await },
        ));

        let results = join_all(tasks).await;

        let mut report = StageReport {
            name: name.clone(),
            workers: Vec::with_capacity(results.len()),
        };
        for ((worker, is_source), result) in workers.into_iter().zip(results) {
            let outcome = match result {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(stage = %name, worker = %worker, "Worker task failed: {}", e);
                    self.logger
                        .error(&worker, format!("worker task failed: {}", e))
                        .await;
                    Outcome::Failed
                }
            };
            report.workers.push(WorkerReport {
                name: worker,
                is_source,
                outcome,
            });
        }

        info!(
            stage = %name,
            outcome = %report.outcome(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Stage finished"
        );
        Ok(report)
    }

    fn supervise<F>(&self, worker: String, stopper: Stopper, work: F) -> JoinHandle<Outcome>
    where
        F: Future<Output = Outcome> + Send + 'static,
    {
        let stop_on_failure = self.settings.stop_on_failure;
        let logger = self.logger.clone();
        tokio::spawn(async move {
            let outcome = match AssertUnwindSafe(work).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(panic) => {
                    let reason = panic_message(panic.as_ref());
                    error!(worker = %worker, "Worker panicked: {}", reason);
                    logger
                        .error(&worker, format!("worker panicked: {}", reason))
                        .await;
                    Outcome::Failed
                }
            };
            if outcome.is_failed() && stop_on_failure {
                debug!(worker = %worker, "Worker failed, stopping its stage");
                stopper.stop();
            }
            outcome
        })
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

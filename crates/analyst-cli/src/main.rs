//! analyst - run ETL stage manifests
//!
//! # Usage
//!
//! ```bash
//! # Check a manifest
//! analyst validate etl.yaml
//!
//! # Check a manifest and connect to every database it uses
//! analyst validate etl.yaml --ping
//!
//! # Run every stage in order
//! analyst -v run etl.yaml
//! ```
//!
//! Stage events go to stderr; rows printed by stages without a destination
//! go to stdout.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use analyst_engine::prelude::*;

#[derive(Parser)]
#[command(name = "analyst")]
#[command(version, about = "Streaming ETL stage engine")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a manifest without running any stage
    Validate {
        /// Path to the manifest
        manifest: PathBuf,
        /// Also connect to every connection the stages use
        #[arg(long)]
        ping: bool,
    },
    /// Run every stage of a manifest in order
    Run {
        /// Path to the manifest
        manifest: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Validate { manifest, ping } => validate(&manifest, ping).await,
        Commands::Run { manifest } => run(&manifest).await,
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr),
        )
        .init();
}

fn load_manifest(path: &Path) -> Result<Manifest> {
    Manifest::from_file(path)
        .with_context(|| format!("Failed to load manifest from {}", path.display()))
}

async fn validate(path: &Path, ping: bool) -> Result<()> {
    let manifest = load_manifest(path)?;
    let stages = manifest.descriptors()?;
    let drivers = Arc::new(DriverManager::new());
    let resolver = manifest.resolver(Arc::clone(&drivers))?;

    resolver.validate(&stages).context("Manifest is not runnable")?;
    if ping {
        resolver
            .ping(&stages)
            .await
            .context("Connection check failed")?;
        drivers.close_all().await?;
    }

    println!("✓ Manifest valid!\n");

    println!("Connections:");
    let mut names: Vec<_> = manifest.connections.keys().collect();
    names.sort();
    for name in names {
        let conn = &manifest.connections[name];
        let status = if ping { " (reachable)" } else { "" };
        println!(
            "  {} [{}] {}{}",
            name,
            conn.driver,
            analyst_rdbc::connection::redact_url(&conn.url),
            status
        );
    }
    println!();

    if !manifest.globals.is_empty() {
        println!("Globals: {}", manifest.globals.join(", "));
        println!();
    }

    println!("Stages:");
    for stage in &stages {
        let from: Vec<String> = stage.sources.iter().map(ToString::to_string).collect();
        let into = stage
            .destination
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "stdout".to_string());
        if stage.kind == StageKind::Global {
            println!("  {} ({})", stage.name, stage.kind);
        } else {
            println!("  {} ({}): {} -> {}", stage.name, stage.kind, from.join(", "), into);
        }
    }
    Ok(())
}

async fn run(path: &Path) -> Result<()> {
    let manifest = load_manifest(path)?;
    let stages = manifest.descriptors()?;
    let drivers = Arc::new(DriverManager::new());
    let resolver = manifest.resolver(Arc::clone(&drivers))?;
    resolver.validate(&stages).context("Manifest is not runnable")?;

    info!(manifest = %path.display(), stages = stages.len(), "Running manifest");
    let (logger, drain) = Logger::spawn(
        manifest.settings.log_level,
        ConsoleSink::new(std::io::stderr()),
    );
    let runner = StageRunner::new(manifest.settings.clone(), resolver, logger);
    let result = runner.run_all(&stages).await;

    // Every logger handle must be gone before the drain can finish.
    drop(runner);
    drain.finish().await;
    if let Err(e) = drivers.close_all().await {
        warn!("Failed to close connections: {}", e);
    }

    let report = result?;
    for stage in &report.stages {
        info!("{}", stage);
    }
    if !report.skipped.is_empty() {
        warn!("Skipped stages: {}", report.skipped.join(", "));
    }
    if report.is_failed() {
        let failed: Vec<&str> = report
            .stages
            .iter()
            .filter(|s| s.is_failed())
            .map(|s| s.name.as_str())
            .collect();
        anyhow::bail!("Stage failed: {}", failed.join(", "));
    }
    info!("All {} stages completed", report.stages.len());
    Ok(())
}

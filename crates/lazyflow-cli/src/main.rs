#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![doc = include_str!("../README.md")]

mod config;
mod pipeline;

use std::process;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::Cli;
use crate::pipeline::Pipeline;

// Tracing target constants
pub const TRACING_TARGET_STARTUP: &str = "lazyflow_cli::startup";
pub const TRACING_TARGET_SHUTDOWN: &str = "lazyflow_cli::shutdown";
pub const TRACING_TARGET_CONFIG: &str = "lazyflow_cli::config";
pub const TRACING_TARGET_PIPELINE: &str = "lazyflow_cli::pipeline";

#[tokio::main]
async fn main() {
    let Err(error) = run().await else {
        tracing::info!(
            target: TRACING_TARGET_SHUTDOWN,
            "application terminated successfully"
        );
        process::exit(0);
    };

    if tracing::enabled!(tracing::Level::ERROR) {
        tracing::error!(
            target: TRACING_TARGET_SHUTDOWN,
            error = %error,
            "application terminated with error"
        );
    } else {
        eprintln!("Error: {error:#}");
    }

    process::exit(1);
}

/// Main application entry point.
async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing();
    log_startup_info();
    cli.log();
    cli.validate()?;

    let pipeline = Pipeline::build(cli.graph.clone(), &cli.pipeline)?;
    let report = pipeline.run(&cli.pipeline).await?;

    if let Some(path) = &cli.pipeline.snapshot {
        pipeline.write_snapshot(path)?;
    }

    let summary = pipeline.summary(report);
    let json = serde_json::to_string_pretty(&summary).context("failed to encode the summary")?;
    println!("{json}");

    pipeline.graph().finalize();
    Ok(())
}

/// Initializes tracing with environment-based filtering.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Logs startup information.
fn log_startup_info() {
    tracing::info!(
        target: TRACING_TARGET_STARTUP,
        version = env!("CARGO_PKG_VERSION"),
        "starting lazyflow"
    );

    tracing::debug!(
        target: TRACING_TARGET_STARTUP,
        pid = process::id(),
        arch = std::env::consts::ARCH,
        os = std::env::consts::OS,
        "build information"
    );
}

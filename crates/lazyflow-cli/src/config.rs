//! Command-line configuration.
//!
//! ```text
//! Cli
//! ├── graph: GraphConfig        # workers, cache budget, eviction tuning
//! └── pipeline: PipelineConfig  # array shape, sigma, blocks, tiles, deadline
//! ```
//!
//! Every option can also be set through its `LAZYFLOW_*` environment
//! variable. Use `--help` to list them.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result as AnyhowResult, anyhow};
use clap::{Args, Parser};
use lazyflow_runtime::GraphConfig;
use serde::{Deserialize, Serialize};

use crate::TRACING_TARGET_CONFIG;

/// Complete command-line configuration.
#[derive(Debug, Clone, Parser, Serialize, Deserialize)]
#[command(name = "lazyflow")]
#[command(about = "Smooth a synthetic array through a lazy, block-cached pipeline")]
#[command(version)]
pub struct Cli {
    /// Worker pool and cache memory settings.
    #[clap(flatten)]
    pub graph: GraphConfig,

    /// Pipeline and request settings.
    #[clap(flatten)]
    pub pipeline: PipelineConfig,
}

impl Cli {
    /// Validates every configuration group.
    pub fn validate(&self) -> AnyhowResult<()> {
        self.graph.validate().context("invalid graph configuration")?;
        self.pipeline
            .validate()
            .context("invalid pipeline configuration")?;
        Ok(())
    }

    /// Logs the configuration.
    pub fn log(&self) {
        tracing::info!(
            target: TRACING_TARGET_CONFIG,
            workers = self.graph.num_workers,
            soft_max_memory = self.graph.soft_max_memory,
            cache_ceiling = self.graph.cache_memory_ceiling(),
            "graph configuration"
        );
        self.pipeline.log();
    }
}

/// Shape of the demo pipeline and of the requests issued against it.
#[derive(Debug, Clone, Args, Serialize, Deserialize)]
#[must_use = "config does nothing unless you use it"]
pub struct PipelineConfig {
    /// Shape of the synthetic source array, comma separated.
    ///
    /// A three-dimensional shape is treated as `y,x,channel`; channels are
    /// not smoothed into each other.
    #[arg(long, env = "LAZYFLOW_SHAPE", value_delimiter = ',', default_value = "256,256,3")]
    pub shape: Vec<usize>,

    /// Standard deviation of the Gaussian filter.
    #[arg(long, env = "LAZYFLOW_SIGMA", default_value_t = 2.0)]
    pub sigma: f64,

    /// Block shape of the cache. One value applies to every axis.
    #[arg(long, env = "LAZYFLOW_BLOCK", value_delimiter = ',', default_value = "64")]
    pub block: Vec<usize>,

    /// Tile shape of the requests. One value applies to every axis.
    #[arg(long, env = "LAZYFLOW_TILE", value_delimiter = ',', default_value = "100")]
    pub tile: Vec<usize>,

    /// How many times every tile is requested.
    #[arg(long, env = "LAZYFLOW_REPEAT", default_value_t = 2)]
    pub repeat: usize,

    /// Deadline for each tile in milliseconds. Tiles that miss it are
    /// canceled.
    #[arg(long = "timeout-ms", env = "LAZYFLOW_TIMEOUT_MS")]
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// Writes a JSON snapshot of the graph, cache included, to this path.
    #[arg(long, env = "LAZYFLOW_SNAPSHOT")]
    #[serde(default)]
    pub snapshot: Option<PathBuf>,
}

impl PipelineConfig {
    /// Validates the pipeline settings.
    pub fn validate(&self) -> AnyhowResult<()> {
        if self.shape.is_empty() || self.shape.contains(&0) {
            return Err(anyhow!(
                "shape {:?} is invalid; every axis needs at least one element",
                self.shape
            ));
        }
        if !(self.sigma.is_finite() && self.sigma > 0.0) {
            return Err(anyhow!("sigma {} is invalid; it must be positive", self.sigma));
        }
        for (name, sizes) in [("block", &self.block), ("tile", &self.tile)] {
            if sizes.len() != 1 && sizes.len() != self.shape.len() {
                return Err(anyhow!(
                    "{name} {sizes:?} needs one value or one per axis of {:?}",
                    self.shape
                ));
            }
            if sizes.contains(&0) {
                return Err(anyhow!("{name} {sizes:?} has an empty axis"));
            }
        }
        if self.repeat == 0 {
            return Err(anyhow!("repeat must be at least 1"));
        }
        Ok(())
    }

    /// The per-tile deadline, if any.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Tile shape with one entry per axis.
    #[must_use]
    pub fn tile_shape(&self) -> Vec<usize> {
        match self.tile.as_slice() {
            [size] => vec![*size; self.shape.len()],
            sizes => sizes.to_vec(),
        }
    }

    fn log(&self) {
        tracing::info!(
            target: TRACING_TARGET_CONFIG,
            shape = ?self.shape,
            sigma = self.sigma,
            block = ?self.block,
            tile = ?self.tile,
            repeat = self.repeat,
            timeout_ms = ?self.timeout_ms,
            snapshot = ?self.snapshot,
            "pipeline configuration"
        );
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            shape: vec![256, 256, 3],
            sigma: 2.0,
            block: vec![64],
            tile: vec![100],
            repeat: 2,
            timeout_ms: None,
            snapshot: None,
        }
    }
}

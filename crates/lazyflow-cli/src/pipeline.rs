//! The demo pipeline and the tiled request loop driving it.

use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result as AnyhowResult};
use lazyflow_core::{AxisTag, Roi};
use lazyflow_operators::{ArraySource, BlockCache, GaussianSmoothing};
use lazyflow_runtime::{Graph, GraphConfig, MemoryStats, Op, SchedulerStats};
use ndarray::{ArrayD, Dimension, IxDyn};
use serde::Serialize;

use crate::TRACING_TARGET_PIPELINE;
use crate::config::PipelineConfig;

/// `ArraySource -> GaussianSmoothing -> BlockCache` on one graph.
pub struct Pipeline {
    graph: Graph,
    source: Op<ArraySource>,
    cache: Op<BlockCache>,
}

/// Outcome of [`Pipeline::run`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub rounds: usize,
    pub tiles: usize,
    pub completed: usize,
    /// Tiles canceled after missing their deadline.
    pub timed_out: usize,
    /// Source executions over the whole run.
    pub source_executions: usize,
    /// Sum of every value delivered, per round.
    pub checksums: Vec<f64>,
    pub elapsed_ms: u128,
}

/// Everything printed at the end of a run.
#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    pub run: RunReport,
    pub scheduler: SchedulerStats,
    pub memory: MemoryStats,
    pub cached_blocks: usize,
}

impl Pipeline {
    /// Starts a graph and connects the three stages.
    pub fn build(graph: GraphConfig, config: &PipelineConfig) -> AnyhowResult<Self> {
        let graph = Graph::new(graph).context("failed to start the graph")?;

        let mut source = ArraySource::new(synthetic(&config.shape));
        if let Some(tags) = axis_tags(config.shape.len()) {
            source = source.with_axis_tags(tags);
        }
        let source = graph.add_named_operator("source", source)?;
        let blur = graph.add_named_operator("blur", GaussianSmoothing::new(config.sigma))?;
        let cache = graph.add_named_operator("cache", BlockCache::new(config.block.clone()))?;

        blur.input(GaussianSmoothing::INPUT)
            .connect(source.output(ArraySource::OUTPUT))
            .context("failed to connect the smoothing stage")?;
        cache
            .input(BlockCache::INPUT)
            .connect(blur.output(GaussianSmoothing::OUTPUT))
            .context("failed to connect the cache stage")?;

        tracing::info!(
            target: TRACING_TARGET_PIPELINE,
            shape = ?config.shape,
            radius = blur.operator().radius(),
            block = ?cache.operator().block_shape(),
            "pipeline built"
        );
        Ok(Self {
            graph,
            source,
            cache,
        })
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Requests every tile `config.repeat` times.
    ///
    /// All tiles of a round are submitted up front and then awaited in
    /// order. A tile that misses the deadline is canceled; an execution
    /// error aborts the run.
    pub async fn run(&self, config: &PipelineConfig) -> AnyhowResult<RunReport> {
        let tiles = tiles(&config.shape, &config.tile_shape());
        let output = self.cache.output(BlockCache::OUTPUT);
        let started = Instant::now();
        let executions = self.source.operator().executions();
        let mut report = RunReport {
            rounds: config.repeat,
            tiles: tiles.len(),
            ..RunReport::default()
        };

        for round in 0..config.repeat {
            let requests = tiles
                .iter()
                .map(|tile| output.get(tile.clone()))
                .collect::<Result<Vec<_>, _>>()?;
            for request in &requests {
                request.submit();
            }

            let mut checksum = 0.0;
            for (tile, request) in tiles.iter().zip(requests) {
                let data = match config.timeout() {
                    Some(deadline) => match tokio::time::timeout(deadline, request.wait()).await {
                        Ok(result) => result,
                        Err(_) => {
                            let canceled = request.cancel();
                            tracing::warn!(
                                target: TRACING_TARGET_PIPELINE,
                                round,
                                tile = %tile,
                                canceled,
                                "tile missed its deadline"
                            );
                            report.timed_out += 1;
                            continue;
                        }
                    },
                    None => request.wait().await,
                };
                let data = data.with_context(|| format!("tile {tile} failed"))?;
                checksum += data.to_f64().sum();
                report.completed += 1;
            }

            tracing::info!(
                target: TRACING_TARGET_PIPELINE,
                round,
                checksum,
                cached_blocks = self.cache.operator().cached_blocks(),
                "round finished"
            );
            report.checksums.push(checksum);
        }

        report.source_executions = self.source.operator().executions() - executions;
        report.elapsed_ms = started.elapsed().as_millis();
        Ok(report)
    }

    /// Collects run, scheduler and memory statistics.
    pub fn summary(&self, run: RunReport) -> Summary {
        Summary {
            run,
            scheduler: self.graph.stats(),
            memory: self.graph.memory_stats(),
            cached_blocks: self.cache.operator().cached_blocks(),
        }
    }

    /// Dumps the graph and writes it to `path` as JSON.
    pub fn write_snapshot(&self, path: &Path) -> AnyhowResult<()> {
        let json = self
            .graph
            .dump()
            .and_then(|snapshot| snapshot.to_json())
            .context("failed to record the graph")?;
        std::fs::write(path, json)
            .with_context(|| format!("failed to write snapshot to {}", path.display()))?;
        tracing::info!(
            target: TRACING_TARGET_PIPELINE,
            path = %path.display(),
            "snapshot written"
        );
        Ok(())
    }
}

/// Splits `shape` into tiles of at most `tile`, row-major.
pub fn tiles(shape: &[usize], tile: &[usize]) -> Vec<Roi> {
    let mut tiles = vec![Roi::full(&[])];
    for (axis, (&extent, &size)) in shape.iter().zip(tile).enumerate() {
        let starts: Vec<usize> = (0..extent).step_by(size.max(1)).collect();
        tiles = tiles
            .into_iter()
            .flat_map(|prefix| {
                starts.iter().filter_map(move |&start| {
                    let stop = (start + size).min(extent);
                    prefix.insert_axis(axis, start as i64, stop as i64).ok()
                })
            })
            .collect();
    }
    tiles
}

/// Smooth-ish test pattern with values in `0..256`.
fn synthetic(shape: &[usize]) -> ArrayD<f32> {
    ArrayD::from_shape_fn(IxDyn(shape), |index| {
        let mut value = 0usize;
        for (axis, &i) in index.slice().iter().enumerate() {
            value += (i / 8 + axis) * (axis + 1) * 37;
        }
        (value % 256) as f32
    })
}

fn axis_tags(ndim: usize) -> Option<Vec<AxisTag>> {
    match ndim {
        2 => Some(vec![AxisTag::Y, AxisTag::X]),
        3 => Some(vec![AxisTag::Y, AxisTag::X, AxisTag::C]),
        _ => None,
    }
}

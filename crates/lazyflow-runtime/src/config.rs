//! Graph configuration.

#[cfg(feature = "config")]
use clap::Args;
use derive_builder::Builder;
use lazyflow_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// Default soft memory ceiling (4 GiB).
pub const DEFAULT_SOFT_MAX_MEMORY: u64 = 4 * 1024 * 1024 * 1024;

/// Default share of the soft ceiling that caches may hold.
pub const DEFAULT_CACHE_MEMORY_FRACTION: f64 = 0.5;

/// Default number of cache hits between two hit-count decays.
pub const DEFAULT_HIT_DECAY_INTERVAL: u64 = 30;

/// Default multiplier applied to hit counts on decay.
pub const DEFAULT_HIT_DECAY_FACTOR: f64 = 0.2;

/// Default size below which a cache is never asked to free memory.
pub const DEFAULT_MIN_EVICTABLE_SIZE: u64 = 1024;

/// Default ratio between an allocation and the memory freed to make room.
pub const DEFAULT_EVICTION_MULTIPLIER: u64 = 3;

/// Worker count derived from the number of CPUs.
///
/// Small machines get one extra worker so a blocked request does not stall
/// everything; larger machines leave one core to the host program.
pub fn default_num_workers() -> usize {
    let cpus = num_cpus::get();
    match cpus {
        0..=2 => cpus + 1,
        3 => cpus,
        _ => cpus - 1,
    }
}

/// Configuration of a [`Graph`].
///
/// Passed explicitly to [`Graph::new`]; there is no process-wide default
/// besides [`GraphConfig::default`].
///
/// [`Graph`]: crate::Graph
/// [`Graph::new`]: crate::Graph::new
#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
#[builder(setter(into), build_fn(validate = "Self::validate"))]
#[cfg_attr(feature = "config", derive(Args))]
#[serde(default)]
pub struct GraphConfig {
    /// Number of worker threads.
    #[builder(default = "default_num_workers()")]
    #[cfg_attr(
        feature = "config",
        arg(long = "workers", env = "LAZYFLOW_WORKERS", default_value_t = default_num_workers())
    )]
    pub num_workers: usize,

    /// Soft memory ceiling in bytes.
    #[builder(default = "DEFAULT_SOFT_MAX_MEMORY")]
    #[cfg_attr(
        feature = "config",
        arg(long = "soft-max-memory", env = "LAZYFLOW_SOFT_MAX_MEMORY", default_value_t = DEFAULT_SOFT_MAX_MEMORY)
    )]
    pub soft_max_memory: u64,

    /// Share of the soft ceiling available to caches.
    #[builder(default = "DEFAULT_CACHE_MEMORY_FRACTION")]
    #[cfg_attr(
        feature = "config",
        arg(long = "cache-memory-fraction", env = "LAZYFLOW_CACHE_MEMORY_FRACTION", default_value_t = DEFAULT_CACHE_MEMORY_FRACTION)
    )]
    pub cache_memory_fraction: f64,

    /// Cache hits between two hit-count decays.
    #[builder(default = "DEFAULT_HIT_DECAY_INTERVAL")]
    #[cfg_attr(
        feature = "config",
        arg(long = "hit-decay-interval", env = "LAZYFLOW_HIT_DECAY_INTERVAL", default_value_t = DEFAULT_HIT_DECAY_INTERVAL)
    )]
    pub hit_decay_interval: u64,

    /// Multiplier applied to every hit count on decay.
    #[builder(default = "DEFAULT_HIT_DECAY_FACTOR")]
    #[cfg_attr(
        feature = "config",
        arg(long = "hit-decay-factor", env = "LAZYFLOW_HIT_DECAY_FACTOR", default_value_t = DEFAULT_HIT_DECAY_FACTOR)
    )]
    pub hit_decay_factor: f64,

    /// Caches holding at most this many bytes are skipped by eviction.
    #[builder(default = "DEFAULT_MIN_EVICTABLE_SIZE")]
    #[cfg_attr(
        feature = "config",
        arg(long = "min-evictable-size", env = "LAZYFLOW_MIN_EVICTABLE_SIZE", default_value_t = DEFAULT_MIN_EVICTABLE_SIZE)
    )]
    pub min_evictable_size: u64,

    /// An allocation of `n` bytes that overflows the cache ceiling asks for
    /// `n * eviction_multiplier` bytes to be freed (clamped to 20%..50% of
    /// the ceiling).
    #[builder(default = "DEFAULT_EVICTION_MULTIPLIER")]
    #[cfg_attr(
        feature = "config",
        arg(long = "eviction-multiplier", env = "LAZYFLOW_EVICTION_MULTIPLIER", default_value_t = DEFAULT_EVICTION_MULTIPLIER)
    )]
    pub eviction_multiplier: u64,

    /// Log operator wrapping at info level.
    #[builder(default)]
    #[cfg_attr(feature = "config", arg(long = "verbose-wrapping", env = "LAZYFLOW_VERBOSE_WRAPPING"))]
    pub verbose_wrapping: bool,

    /// Log cache eviction at info level.
    #[builder(default)]
    #[cfg_attr(feature = "config", arg(long = "verbose-memory", env = "LAZYFLOW_VERBOSE_MEMORY"))]
    pub verbose_memory: bool,
}

impl GraphConfig {
    /// Returns a builder.
    pub fn builder() -> GraphConfigBuilder {
        GraphConfigBuilder::default()
    }

    /// Soft ceiling for memory held by caches.
    pub fn cache_memory_ceiling(&self) -> u64 {
        (self.soft_max_memory as f64 * self.cache_memory_fraction) as u64
    }

    /// Sets the number of workers.
    #[must_use]
    pub fn with_num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    /// Sets the soft memory ceiling.
    #[must_use]
    pub fn with_soft_max_memory(mut self, bytes: u64) -> Self {
        self.soft_max_memory = bytes;
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        check(
            self.num_workers,
            self.cache_memory_fraction,
            self.hit_decay_factor,
            self.hit_decay_interval,
        )
        .map_err(Error::InvalidConfig)
    }
}

impl GraphConfigBuilder {
    fn validate(&self) -> Result<(), String> {
        let defaults = GraphConfig::default();
        check(
            self.num_workers.unwrap_or(defaults.num_workers),
            self.cache_memory_fraction
                .unwrap_or(defaults.cache_memory_fraction),
            self.hit_decay_factor.unwrap_or(defaults.hit_decay_factor),
            self.hit_decay_interval.unwrap_or(defaults.hit_decay_interval),
        )
    }
}

fn check(
    num_workers: usize,
    cache_fraction: f64,
    decay_factor: f64,
    decay_interval: u64,
) -> Result<(), String> {
    if num_workers == 0 {
        return Err("num_workers must be at least 1".into());
    }
    if !(cache_fraction > 0.0 && cache_fraction <= 1.0) {
        return Err("cache_memory_fraction must be in (0, 1]".into());
    }
    if !(0.0..=1.0).contains(&decay_factor) {
        return Err("hit_decay_factor must be in [0, 1]".into());
    }
    if decay_interval == 0 {
        return Err("hit_decay_interval must be at least 1".into());
    }
    Ok(())
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            num_workers: default_num_workers(),
            soft_max_memory: DEFAULT_SOFT_MAX_MEMORY,
            cache_memory_fraction: DEFAULT_CACHE_MEMORY_FRACTION,
            hit_decay_interval: DEFAULT_HIT_DECAY_INTERVAL,
            hit_decay_factor: DEFAULT_HIT_DECAY_FACTOR,
            min_evictable_size: DEFAULT_MIN_EVICTABLE_SIZE,
            eviction_multiplier: DEFAULT_EVICTION_MULTIPLIER,
            verbose_wrapping: false,
            verbose_memory: false,
        }
    }
}

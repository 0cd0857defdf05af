//! The graph: owner of operators, the worker pool and the cache budget.
//!
//! A [`Graph`] is a cheap, clonable handle. The last handle to go away
//! stops the worker pool; [`Graph::finalize`] does so explicitly.

mod memory;

use std::fmt;
use std::sync::Arc;

use lazyflow_core::{Error, Result};
use parking_lot::{ReentrantMutex, ReentrantMutexGuard, RwLock};

pub use self::memory::{CacheMemory, MemoryManager, MemoryStats};
use crate::config::GraphConfig;
use crate::id::OperatorId;
use crate::operator::{Op, Operator, OperatorHandle, OperatorNode};
use crate::scheduler::{Scheduler, SchedulerShared, SchedulerStats};

/// Tracing target for graph operations.
const TRACING_TARGET: &str = "lazyflow_runtime::graph";

/// A dataflow session.
#[derive(Clone)]
pub struct Graph {
    inner: Arc<GraphInner>,
}

pub(crate) struct GraphInner {
    config: GraphConfig,
    scheduler: Scheduler,
    memory: MemoryManager,
    operators: RwLock<Vec<Arc<OperatorNode>>>,
    topology: ReentrantMutex<()>,
}

impl Graph {
    /// Validates `config` and starts the worker pool.
    pub fn new(config: GraphConfig) -> Result<Self> {
        config.validate()?;
        let scheduler = Scheduler::start(config.num_workers)?;
        let memory = MemoryManager::new(&config);

        tracing::info!(
            target: TRACING_TARGET,
            num_workers = config.num_workers,
            cache_ceiling = memory.ceiling(),
            "graph started"
        );

        Ok(Self {
            inner: Arc::new(GraphInner {
                config,
                scheduler,
                memory,
                operators: RwLock::new(Vec::new()),
                topology: ReentrantMutex::new(()),
            }),
        })
    }

    /// Creates a graph with the default configuration.
    pub fn with_defaults() -> Result<Self> {
        Self::new(GraphConfig::default())
    }

    pub(crate) fn from_inner(inner: Arc<GraphInner>) -> Self {
        Self { inner }
    }

    pub fn config(&self) -> &GraphConfig {
        &self.inner.config
    }

    /// The cache memory manager shared by every cache of this graph.
    pub fn memory(&self) -> &MemoryManager {
        &self.inner.memory
    }

    pub(crate) fn scheduler(&self) -> &Arc<SchedulerShared> {
        self.inner.scheduler.shared()
    }

    /// Serializes topology changes. Reentrant, so a connect may run setup
    /// code that connects further slots.
    pub(crate) fn lock_topology(&self) -> ReentrantMutexGuard<'_, ()> {
        self.inner.topology.lock()
    }

    /// Adds an operator named after its type.
    pub fn add_operator<T: Operator>(&self, operator: T) -> Result<Op<T>> {
        let name = operator.type_name().to_owned();
        self.add_named_operator(name, operator)
    }

    /// Adds an operator under `name`.
    ///
    /// Operators without inputs are configured right away.
    pub fn add_named_operator<T: Operator>(
        &self,
        name: impl Into<String>,
        operator: T,
    ) -> Result<Op<T>> {
        let operator = Arc::new(operator);
        let handle = self.insert_node(operator.clone(), OperatorId::new(), name.into())?;
        Ok(Op::new(handle, operator))
    }

    pub(crate) fn insert_node(
        &self,
        operator: Arc<dyn Operator>,
        id: OperatorId,
        name: String,
    ) -> Result<OperatorHandle> {
        let _topology = self.lock_topology();
        let node = OperatorNode::create(Arc::downgrade(&self.inner), operator, id, name, None)?;
        self.inner.operators.write().push(node.clone());
        tracing::debug!(
            target: TRACING_TARGET,
            operator = %node.name(),
            id = %node.id(),
            "operator added"
        );
        if let Err(err) = node.configure() {
            self.inner
                .operators
                .write()
                .retain(|other| !Arc::ptr_eq(other, &node));
            return Err(err);
        }
        Ok(OperatorHandle::from_node(node))
    }

    /// Disconnects every slot of `operator` and drops it from the graph.
    pub fn remove_operator(&self, operator: &OperatorHandle) -> Result<()> {
        let _topology = self.lock_topology();
        let node = operator.node();
        let removed = {
            let mut operators = self.inner.operators.write();
            let before = operators.len();
            operators.retain(|other| !Arc::ptr_eq(other, node));
            before != operators.len()
        };
        if !removed {
            return Err(Error::InvalidConfig(format!(
                "operator `{}` is not part of this graph",
                node.name()
            )));
        }
        node.detach_all()?;
        tracing::debug!(
            target: TRACING_TARGET,
            operator = %node.name(),
            id = %node.id(),
            "operator removed"
        );
        Ok(())
    }

    /// Top-level operators in insertion order.
    pub fn operators(&self) -> Vec<OperatorHandle> {
        self.inner
            .operators
            .read()
            .iter()
            .cloned()
            .map(OperatorHandle::from_node)
            .collect()
    }

    pub fn operator(&self, id: OperatorId) -> Option<OperatorHandle> {
        self.inner
            .operators
            .read()
            .iter()
            .find(|node| node.id() == id)
            .cloned()
            .map(OperatorHandle::from_node)
    }

    pub fn stats(&self) -> SchedulerStats {
        self.scheduler().stats()
    }

    pub fn memory_stats(&self) -> MemoryStats {
        self.inner.memory.stats()
    }

    /// Pauses the worker pool.
    ///
    /// Nested requests already running are driven to completion, queued
    /// root requests are held and completion callbacks are deferred until
    /// [`resume`](Self::resume). Must not be called from inside an
    /// operator.
    pub fn suspend(&self) -> Result<()> {
        self.scheduler().suspend()?;
        tracing::info!(target: TRACING_TARGET, "graph suspended");
        Ok(())
    }

    /// Restarts a suspended worker pool.
    pub fn resume(&self) {
        self.scheduler().resume();
        tracing::info!(target: TRACING_TARGET, "graph resumed");
    }

    pub fn is_suspended(&self) -> bool {
        self.scheduler().is_suspended()
    }

    /// Stops the worker pool for good.
    ///
    /// Queued requests are canceled and later submissions fail with
    /// [`Error::Shutdown`].
    pub fn finalize(&self) {
        self.inner.scheduler.stop();
        tracing::info!(target: TRACING_TARGET, "graph finalized");
    }
}

impl Drop for GraphInner {
    fn drop(&mut self) {
        self.scheduler.stop();
    }
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graph")
            .field("num_workers", &self.inner.config.num_workers)
            .field("operators", &self.inner.operators.read().len())
            .field("suspended", &self.is_suspended())
            .finish()
    }
}

#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![doc = include_str!("../README.md")]

pub mod cache;
mod config;
mod graph;
mod id;
pub mod operator;
pub mod request;
mod scheduler;
pub mod slot;
pub mod snapshot;

#[cfg(test)]
mod testing;

#[doc(hidden)]
pub mod prelude;

pub use config::{GraphConfig, GraphConfigBuilder, GraphConfigBuilderError, default_num_workers};
pub use graph::{CacheMemory, Graph, MemoryManager, MemoryStats};
pub use id::{CacheId, DirtyCallbackId, OperatorId, RequestId};
pub use lazyflow_core::{Buffer, DType, Error, ErrorKind, MetaInfo, Result, Roi};
pub use operator::{ExecuteContext, Op, Operator, OperatorContext, OperatorHandle};
pub use request::{Request, RequestOutcome, RequestState, Wait};
pub use scheduler::SchedulerStats;
pub use slot::{InputKey, InputSlot, OutputKey, OutputSlot, SlotDef};

/// Tracing target for runtime operations.
pub const TRACING_TARGET: &str = "lazyflow_runtime";

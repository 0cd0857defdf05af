//! Prelude module for convenient imports.
//!
//! This module re-exports commonly used types for ergonomic imports:
//!
//! ```rust
//! use lazyflow_runtime::prelude::*;
//! ```

pub use lazyflow_core::prelude::*;

pub use crate::config::GraphConfig;
pub use crate::graph::{CacheMemory, Graph, MemoryManager};
pub use crate::id::{CacheId, OperatorId};
pub use crate::operator::{ExecuteContext, Op, Operator, OperatorContext, OperatorHandle};
pub use crate::request::{Request, RequestOutcome, RequestState};
pub use crate::slot::{InputKey, InputSlot, OutputKey, OutputSlot, SlotDef};

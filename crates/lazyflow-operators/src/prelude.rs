//! Prelude module for convenient imports.
//!
//! ```rust
//! use lazyflow_operators::prelude::*;
//! ```

pub use lazyflow_runtime::prelude::*;

pub use crate::{
    ArraySource, BlockCache, Crop, GaussianSmoothing, ListSource, Piper, Sum, operator_registry,
};

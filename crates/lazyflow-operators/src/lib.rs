#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![doc = include_str!("../README.md")]

mod cache;
mod crop;
mod piper;
mod smoothing;
mod source;
mod sum;

#[cfg(test)]
mod scenarios;

#[doc(hidden)]
pub mod prelude;

use lazyflow_core::Buffer;
use lazyflow_runtime::snapshot::OperatorRegistry;

pub use cache::{BlockCache, DEFAULT_BLOCK_SIZE};
pub use crop::Crop;
pub use piper::Piper;
pub use smoothing::{GaussianSmoothing, gaussian_filter, gaussian_kernel, gaussian_radius};
pub use source::{ArraySource, ListSource};
pub use sum::Sum;

/// Tracing target for operator execution.
pub const TRACING_TARGET: &str = "lazyflow_operators";

/// Registers every operator of this crate under its type name, so that
/// snapshots of graphs built from them can be reconstructed.
pub fn register_operators(registry: &mut OperatorRegistry) -> &mut OperatorRegistry {
    registry
        .register_serde::<ArraySource>("ArraySource")
        .register("ListSource", |params| {
            let arrays: Vec<Buffer> = serde_json::from_value(params.clone())?;
            Ok(ListSource::new(arrays))
        })
        .register_serde::<Piper>("Piper")
        .register_serde::<Crop>("Crop")
        .register_serde::<GaussianSmoothing>("GaussianSmoothing")
        .register_serde::<Sum>("Sum")
        .register_serde::<BlockCache>("BlockCache")
}

/// A registry holding every operator of this crate.
pub fn operator_registry() -> OperatorRegistry {
    let mut registry = OperatorRegistry::new();
    register_operators(&mut registry);
    registry
}

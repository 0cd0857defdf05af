#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![doc = include_str!("../README.md")]

mod buffer;
mod error;
mod meta;
mod roi;

#[doc(hidden)]
pub mod prelude;

pub use buffer::Buffer;
pub use error::{Error, ErrorKind, Result};
pub use meta::{AxisTag, DType, MetaInfo};
pub use roi::Roi;

/// Tracing target for core operations.
pub const TRACING_TARGET: &str = "lazyflow_core";

//! Prelude module for convenient imports.
//!
//! ```rust
//! use lazyflow_core::prelude::*;
//! ```

pub use crate::buffer::Buffer;
pub use crate::error::{Error, ErrorKind, Result};
pub use crate::meta::{AxisTag, DType, MetaInfo};
pub use crate::roi::Roi;

//! Typed ports of operators.
//!
//! - [`InputSlot`]: has at most one upstream partner or a literal value
//! - [`OutputSlot`]: fans out to any number of dependent inputs
//! - [`SlotDef`], [`InputKey`], [`OutputKey`]: declarations and typed keys
//!
//! Slots with a level above zero are ordered lists of slots one level lower.
//! Connecting slots of different levels vectorizes the lower-level operator
//! instead of failing.

mod input;
mod key;
mod output;

pub(crate) use input::{InputEvent, InputSource};
pub use input::InputSlot;
pub use key::{InputKey, OutputKey, SlotDef};
pub use output::OutputSlot;

/// Tracing target for slot operations.
const TRACING_TARGET: &str = "lazyflow_runtime::slot";

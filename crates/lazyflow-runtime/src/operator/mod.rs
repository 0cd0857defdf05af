//! The operator contract and the graph nodes that host operators.
//!
//! An [`Operator`] declares its slots, derives output metadata from input
//! metadata in [`Operator::setup`], computes regions in
//! [`Operator::execute`] and maps input invalidation to output invalidation
//! in [`Operator::notify_dirty`]. The graph wraps every operator into a node
//! that owns the slots; when an input receives data of a higher level than
//! declared, the node becomes a vectorized wrapper hosting one inner node
//! per element.

mod context;
mod handle;
mod node;
mod vectorize;

use std::sync::Arc;

use async_trait::async_trait;
use lazyflow_core::{Buffer, Result, Roi};
use serde_json::Value;

pub use context::{ExecuteContext, OperatorContext};
pub use handle::{Op, OperatorHandle};
pub(crate) use node::OperatorNode;

use crate::slot::{InputSlot, OutputSlot, SlotDef};

/// Tracing target for operator lifecycle events.
const TRACING_TARGET: &str = "lazyflow_runtime::operator";

/// A computation node.
///
/// Implementations hold only their own parameters; slots live in the graph
/// and are reached through the contexts passed to every method.
///
/// # Example
///
/// ```ignore
/// #[derive(Clone)]
/// struct Invert;
///
/// #[async_trait::async_trait]
/// impl Operator for Invert {
///     fn type_name(&self) -> &'static str { "Invert" }
///     fn input_slots(&self) -> &'static [SlotDef] { &[SlotDef::new("Input")] }
///     fn output_slots(&self) -> &'static [SlotDef] { &[SlotDef::new("Output")] }
///
///     fn setup(&self, ctx: &OperatorContext<'_>) -> Result<()> {
///         ctx.outputs()[0].set_meta(&ctx.inputs()[0].meta());
///         Ok(())
///     }
///
///     async fn execute(&self, ctx: &ExecuteContext, _: &OutputSlot, roi: &Roi, out: &mut Buffer) -> Result<()> {
///         let data = ctx.inputs()[0].get(roi.clone())?.wait().await?;
///         out.assign(&data)?;
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Operator: OperatorClone + Send + Sync + 'static {
    /// Name used to look the operator up when reconstructing a snapshot.
    fn type_name(&self) -> &'static str;

    /// Declared input slots, in index order.
    fn input_slots(&self) -> &'static [SlotDef];

    /// Declared output slots, in index order.
    fn output_slots(&self) -> &'static [SlotDef];

    /// Derives output metadata from input metadata.
    ///
    /// Called whenever all inputs are ready and one of them changed. May
    /// resize multi-outputs. Must not request data.
    fn setup(&self, ctx: &OperatorContext<'_>) -> Result<()>;

    /// Computes `roi` of `output` into `destination`.
    ///
    /// `destination` already has the shape of `roi` and the output dtype.
    /// Input data is obtained by creating and awaiting requests on the
    /// inputs; errors from awaited requests propagate with `?`.
    async fn execute(
        &self,
        ctx: &ExecuteContext,
        output: &OutputSlot,
        roi: &Roi,
        destination: &mut Buffer,
    ) -> Result<()>;

    /// Maps a dirty region of `input` to dirty regions of the outputs.
    ///
    /// The default marks every output dirty over its full extent.
    fn notify_dirty(&self, ctx: &OperatorContext<'_>, input: &InputSlot, roi: &Roi) -> Result<()> {
        let _ = (input, roi);
        for output in ctx.outputs() {
            output.set_dirty_all()?;
        }
        Ok(())
    }

    /// Parameters needed to recreate the operator.
    fn params(&self) -> Result<Value> {
        Ok(Value::Null)
    }

    /// Runtime state worth persisting, such as cached blocks.
    fn state(&self) -> Result<Option<Value>> {
        Ok(None)
    }

    /// Restores state produced by [`Operator::state`].
    fn restore_state(&self, ctx: &OperatorContext<'_>, state: Value) -> Result<()> {
        let _ = (ctx, state);
        Ok(())
    }
}

/// Creates a fresh operator from an existing one.
///
/// Vectorized wrappers instantiate one copy of their template per element.
/// Implemented for every `Operator + Clone`; operators holding runtime
/// state implement `Clone` so that copies start with empty state.
pub trait OperatorClone {
    fn clone_operator(&self) -> Arc<dyn Operator>;
}

impl<T: Operator + Clone> OperatorClone for T {
    fn clone_operator(&self) -> Arc<dyn Operator> {
        Arc::new(self.clone())
    }
}

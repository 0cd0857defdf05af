//! Public handles to operators placed in a graph.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use lazyflow_core::{Error, Result};

use super::{Operator, OperatorNode};
use crate::id::OperatorId;
use crate::slot::{InputKey, InputSlot, OutputKey, OutputSlot};

/// Untyped handle to an operator in a graph.
#[derive(Clone)]
pub struct OperatorHandle {
    node: Arc<OperatorNode>,
}

impl OperatorHandle {
    pub(crate) fn from_node(node: Arc<OperatorNode>) -> Self {
        Self { node }
    }

    pub(crate) fn node(&self) -> &Arc<OperatorNode> {
        &self.node
    }

    pub fn id(&self) -> OperatorId {
        self.node.id()
    }

    pub fn name(&self) -> &str {
        self.node.name()
    }

    pub fn type_name(&self) -> &'static str {
        self.node.template().type_name()
    }

    pub fn inputs(&self) -> &[InputSlot] {
        self.node.inputs()
    }

    pub fn outputs(&self) -> &[OutputSlot] {
        self.node.outputs()
    }

    /// Looks an input up by its declared name.
    pub fn input_by_name(&self, name: &str) -> Result<&InputSlot> {
        self.node
            .inputs()
            .iter()
            .find(|slot| slot.name() == name)
            .ok_or_else(|| Error::UnknownSlot {
                operator: self.name().into(),
                slot: name.into(),
            })
    }

    /// Looks an output up by its declared name.
    pub fn output_by_name(&self, name: &str) -> Result<&OutputSlot> {
        self.node
            .outputs()
            .iter()
            .find(|slot| slot.name() == name)
            .ok_or_else(|| Error::UnknownSlot {
                operator: self.name().into(),
                slot: name.into(),
            })
    }

    /// Returns true once `setup` ran with every input ready.
    pub fn is_configured(&self) -> bool {
        self.node.is_configured()
    }

    pub fn is_vectorized(&self) -> bool {
        self.node.is_vectorized()
    }

    /// Inner operators of a vectorized operator, one per element.
    pub fn inner_operators(&self) -> Vec<OperatorHandle> {
        self.node
            .inner_nodes()
            .into_iter()
            .map(OperatorHandle::from_node)
            .collect()
    }

    /// Re-runs `setup` after the operator changed its own parameters.
    pub fn reconfigure(&self) -> Result<()> {
        let graph = self.node.graph()?;
        let _topology = graph.lock_topology();
        self.node.configure()
    }

    /// The operator instance (the template, for a vectorized operator).
    pub fn operator(&self) -> Arc<dyn Operator> {
        self.node.template()
    }
}

impl fmt::Debug for OperatorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperatorHandle")
            .field("id", &self.id())
            .field("name", &self.name())
            .finish()
    }
}

/// Typed handle returned by [`Graph::add_operator`].
///
/// Gives typed slot access through the operator's keys and derefs to
/// [`OperatorHandle`] for everything else.
///
/// [`Graph::add_operator`]: crate::Graph::add_operator
pub struct Op<T> {
    handle: OperatorHandle,
    operator: Arc<T>,
}

impl<T: Operator> Op<T> {
    pub(crate) fn new(handle: OperatorHandle, operator: Arc<T>) -> Self {
        Self { handle, operator }
    }

    pub fn input(&self, key: InputKey<T>) -> &InputSlot {
        &self.handle.node.inputs()[key.index()]
    }

    pub fn output(&self, key: OutputKey<T>) -> &OutputSlot {
        &self.handle.node.outputs()[key.index()]
    }

    /// The operator instance the graph runs.
    ///
    /// For a vectorized operator this is the template the inner operators
    /// were cloned from.
    pub fn operator(&self) -> &Arc<T> {
        &self.operator
    }

    pub fn handle(&self) -> &OperatorHandle {
        &self.handle
    }
}

impl<T> Clone for Op<T> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            operator: self.operator.clone(),
        }
    }
}

impl<T> Deref for Op<T> {
    type Target = OperatorHandle;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

impl<T> fmt::Debug for Op<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.handle.fmt(f)
    }
}

//! Views of a node handed to operator callbacks.

use std::sync::Arc;

use super::OperatorNode;
use crate::graph::Graph;
use crate::id::OperatorId;
use crate::request::Request;
use crate::slot::{InputKey, InputSlot, OutputKey, OutputSlot};

/// Context of the synchronous callbacks: `setup`, `notify_dirty` and
/// `restore_state`.
pub struct OperatorContext<'a> {
    node: &'a Arc<OperatorNode>,
    graph: &'a Graph,
}

impl<'a> OperatorContext<'a> {
    pub(crate) fn new(node: &'a Arc<OperatorNode>, graph: &'a Graph) -> Self {
        Self { node, graph }
    }

    pub fn id(&self) -> OperatorId {
        self.node.id()
    }

    pub fn name(&self) -> &str {
        self.node.name()
    }

    pub fn inputs(&self) -> &[InputSlot] {
        self.node.inputs()
    }

    pub fn outputs(&self) -> &[OutputSlot] {
        self.node.outputs()
    }

    /// Input slot addressed by a typed key.
    pub fn input<T>(&self, key: InputKey<T>) -> &InputSlot {
        &self.node.inputs()[key.index()]
    }

    /// Output slot addressed by a typed key.
    pub fn output<T>(&self, key: OutputKey<T>) -> &OutputSlot {
        &self.node.outputs()[key.index()]
    }

    pub fn graph(&self) -> &Graph {
        self.graph
    }
}

/// Context of [`Operator::execute`].
///
/// [`Operator::execute`]: super::Operator::execute
pub struct ExecuteContext {
    node: Arc<OperatorNode>,
    graph: Graph,
    request: Request,
}

impl ExecuteContext {
    pub(crate) fn new(node: Arc<OperatorNode>, graph: Graph, request: Request) -> Self {
        Self {
            node,
            graph,
            request,
        }
    }

    pub fn id(&self) -> OperatorId {
        self.node.id()
    }

    pub fn name(&self) -> &str {
        self.node.name()
    }

    pub fn inputs(&self) -> &[InputSlot] {
        self.node.inputs()
    }

    pub fn outputs(&self) -> &[OutputSlot] {
        self.node.outputs()
    }

    /// Input slot addressed by a typed key.
    pub fn input<T>(&self, key: InputKey<T>) -> &InputSlot {
        &self.node.inputs()[key.index()]
    }

    /// Output slot addressed by a typed key.
    pub fn output<T>(&self, key: OutputKey<T>) -> &OutputSlot {
        &self.node.outputs()[key.index()]
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// The request being executed.
    pub fn request(&self) -> &Request {
        &self.request
    }
}

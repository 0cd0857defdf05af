use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use lazyflow_core::{Error, Result, Roi};
use parking_lot::RwLock;

use super::{Operator, OperatorContext, TRACING_TARGET};
use crate::graph::{Graph, GraphInner};
use crate::id::OperatorId;
use crate::slot::{InputEvent, InputSlot, OutputSlot};

/// What a node computes with.
pub(crate) enum OperatorKind {
    /// The node runs its operator directly.
    Leaf(Arc<dyn Operator>),
    /// The node hosts one copy of `template` per element of its inputs.
    Vectorized {
        template: Arc<dyn Operator>,
        depth: usize,
        inner: Vec<Arc<OperatorNode>>,
    },
}

/// An operator placed in a graph, together with its slots.
pub(crate) struct OperatorNode {
    id: OperatorId,
    name: String,
    graph: Weak<GraphInner>,
    parent: Option<Weak<OperatorNode>>,
    inputs: Vec<InputSlot>,
    outputs: Vec<OutputSlot>,
    pub(super) kind: RwLock<OperatorKind>,
    pub(super) configured: AtomicBool,
}

impl OperatorNode {
    pub(crate) fn create(
        graph: Weak<GraphInner>,
        operator: Arc<dyn Operator>,
        id: OperatorId,
        name: String,
        parent: Option<Weak<OperatorNode>>,
    ) -> Result<Arc<Self>> {
        check_unique(&name, operator.input_slots().iter().map(|def| def.name))?;
        check_unique(&name, operator.output_slots().iter().map(|def| def.name))?;

        Ok(Arc::new_cyclic(|weak: &Weak<OperatorNode>| {
            let inputs = operator
                .input_slots()
                .iter()
                .enumerate()
                .map(|(top, def)| InputSlot::new(def.name, top, def.level, weak.clone()))
                .collect();
            let outputs = operator
                .output_slots()
                .iter()
                .map(|def| OutputSlot::new(def.name, def.level, weak.clone()))
                .collect();
            Self {
                id,
                name,
                graph,
                parent,
                inputs,
                outputs,
                kind: RwLock::new(OperatorKind::Leaf(operator)),
                configured: AtomicBool::new(false),
            }
        }))
    }

    pub(crate) fn id(&self) -> OperatorId {
        self.id
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn graph(&self) -> Result<Graph> {
        self.graph.upgrade().map(Graph::from_inner).ok_or(Error::Shutdown)
    }

    pub(crate) fn graph_weak(&self) -> &Weak<GraphInner> {
        &self.graph
    }

    /// Wrapper hosting this node, if it is an inner node.
    pub(crate) fn parent(&self) -> Option<Arc<OperatorNode>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn inputs(&self) -> &[InputSlot] {
        &self.inputs
    }

    pub(crate) fn outputs(&self) -> &[OutputSlot] {
        &self.outputs
    }

    /// The operator run by a leaf node.
    pub(crate) fn leaf(&self) -> Result<Arc<dyn Operator>> {
        match &*self.kind.read() {
            OperatorKind::Leaf(operator) => Ok(operator.clone()),
            OperatorKind::Vectorized { .. } => Err(Error::Internal(format!(
                "vectorized operator `{}` computes through its inner operators",
                self.name
            ))),
        }
    }

    /// The operator instance, or the template of a vectorized node.
    pub(crate) fn template(&self) -> Arc<dyn Operator> {
        match &*self.kind.read() {
            OperatorKind::Leaf(operator) => operator.clone(),
            OperatorKind::Vectorized { template, .. } => template.clone(),
        }
    }

    pub(crate) fn is_vectorized(&self) -> bool {
        matches!(&*self.kind.read(), OperatorKind::Vectorized { .. })
    }

    pub(crate) fn depth(&self) -> usize {
        match &*self.kind.read() {
            OperatorKind::Leaf(_) => 0,
            OperatorKind::Vectorized { depth, .. } => *depth,
        }
    }

    pub(crate) fn inner_nodes(&self) -> Vec<Arc<OperatorNode>> {
        match &*self.kind.read() {
            OperatorKind::Leaf(_) => Vec::new(),
            OperatorKind::Vectorized { inner, .. } => inner.clone(),
        }
    }

    pub(crate) fn is_configured(&self) -> bool {
        self.configured.load(Ordering::Acquire)
    }

    /// Reacts to a change on the input declared at `top`.
    pub(crate) fn on_input_event(self: &Arc<Self>, top: usize, event: InputEvent) -> Result<()> {
        if self.is_vectorized() {
            self.sync_inner(Some((top, event)))
        } else {
            self.configure()
        }
    }

    /// Runs `setup` if every input is ready, then forwards changed output
    /// metadata downstream.
    pub(crate) fn configure(self: &Arc<Self>) -> Result<()> {
        let leaf = match &*self.kind.read() {
            OperatorKind::Leaf(operator) => Some(operator.clone()),
            OperatorKind::Vectorized { .. } => None,
        };
        let Some(operator) = leaf else {
            return self.sync_inner(None);
        };
        if !self.inputs.iter().all(InputSlot::is_ready) {
            self.configured.store(false, Ordering::Release);
            return Ok(());
        }

        let graph = self.graph()?;
        let ctx = OperatorContext::new(self, &graph);
        operator.setup(&ctx)?;
        self.configured.store(true, Ordering::Release);
        tracing::debug!(
            target: TRACING_TARGET,
            operator = %self.name,
            id = %self.id,
            "operator configured"
        );

        for output in &self.outputs {
            output.propagate_meta()?;
        }
        Ok(())
    }

    /// Forwards a dirty region of `input` to the operator.
    pub(crate) fn notify_dirty(self: &Arc<Self>, input: &InputSlot, roi: &Roi) -> Result<()> {
        let operator = match &*self.kind.read() {
            OperatorKind::Leaf(operator) => operator.clone(),
            OperatorKind::Vectorized { .. } => return Ok(()),
        };
        if !self.is_configured() {
            return Ok(());
        }
        let graph = self.graph()?;
        let ctx = OperatorContext::new(self, &graph);
        operator.notify_dirty(&ctx, input, roi)
    }

    /// Cuts every connection of the node, telling downstream operators.
    pub(crate) fn detach_all(&self) -> Result<()> {
        for input in &self.inputs {
            input.detach();
        }
        for output in &self.outputs {
            output.disconnect_partners()?;
        }
        for node in self.inner_nodes() {
            node.detach_all()?;
        }
        self.configured.store(false, Ordering::Release);
        Ok(())
    }
}

fn check_unique<'a>(operator: &str, names: impl Iterator<Item = &'a str>) -> Result<()> {
    let mut seen = HashSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(Error::DuplicateSlot {
                operator: operator.into(),
                slot: name.into(),
            });
        }
    }
    Ok(())
}

impl fmt::Debug for OperatorNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperatorNode")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("vectorized", &self.is_vectorized())
            .field("configured", &self.is_configured())
            .finish_non_exhaustive()
    }
}

//! Automatic wrapping of operators over lists of inputs.
//!
//! A wrapped node raises every slot by one level and hosts one inner copy
//! of its operator per element. Element `k` of every multi-input feeds
//! inner node `k`; broadcast inputs feed every inner node. Output element
//! `k` is the output of inner node `k`.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use lazyflow_core::Result;

use super::node::{OperatorKind, OperatorNode};
use super::{Operator, TRACING_TARGET};
use crate::id::OperatorId;
use crate::slot::{InputEvent, InputSlot, InputSource, OutputSlot};

impl OperatorNode {
    /// Raises the node's level by `depth`.
    pub(crate) fn vectorize(self: &Arc<Self>, depth: usize) -> Result<()> {
        for _ in 0..depth {
            self.wrap_once()?;
        }
        Ok(())
    }

    fn wrap_once(self: &Arc<Self>) -> Result<()> {
        let (template, previous_inner) = {
            let kind = self.kind.read();
            match &*kind {
                OperatorKind::Leaf(operator) => (operator.clone(), Vec::new()),
                OperatorKind::Vectorized { template, inner, .. } => (template.clone(), inner.clone()),
            }
        };

        let sources: Vec<InputSource> = self.inputs().iter().map(InputSlot::take_source).collect();
        let mut downstream: Vec<(usize, InputSlot)> = Vec::new();
        for (index, output) in self.outputs().iter().enumerate() {
            for partner in output.partners() {
                let target = reconnect_target(&partner, output);
                target.detach();
                if !downstream.iter().any(|(_, t)| t.ptr_eq(&target)) {
                    downstream.push((index, target));
                }
            }
        }
        for node in previous_inner {
            node.detach_all()?;
        }

        let depth = self.depth() + 1;
        *self.kind.write() = OperatorKind::Vectorized {
            template,
            depth,
            inner: Vec::new(),
        };
        self.configured.store(false, Ordering::Release);
        for input in self.inputs() {
            input.raise_level();
        }
        for output in self.outputs() {
            output.raise_level();
        }

        let verbose = self.graph().map(|g| g.config().verbose_wrapping).unwrap_or(false);
        if verbose {
            tracing::info!(target: TRACING_TARGET, operator = %self.name(), depth, "operator wrapped");
        } else {
            tracing::debug!(target: TRACING_TARGET, operator = %self.name(), depth, "operator wrapped");
        }

        for (input, source) in self.inputs().iter().zip(sources) {
            match source {
                InputSource::Partner(partner) => {
                    input.connect_with(&partner, false)?;
                }
                InputSource::Value(value) => {
                    input.set_value_with(value, false)?;
                }
                InputSource::Empty => {}
            }
        }
        self.sync_inner(None)?;

        for (index, input) in downstream {
            input.connect_with(&self.outputs()[index], true)?;
        }
        Ok(())
    }

    /// Brings the inner nodes in line with the wrapper's inputs.
    ///
    /// `event` carries an element insertion or removal on one input so
    /// the inner node at that index can be created or dropped in place,
    /// keeping the other inner nodes (and whatever they cache) aligned.
    pub(crate) fn sync_inner(self: &Arc<Self>, event: Option<(usize, InputEvent)>) -> Result<()> {
        let (template, mut inner) = match &*self.kind.read() {
            OperatorKind::Leaf(_) => return Ok(()),
            OperatorKind::Vectorized { template, inner, .. } => (template.clone(), inner.clone()),
        };

        let mut applied = None;
        if let Some((top, event)) = event {
            let broadcast = self.inputs().get(top).is_some_and(InputSlot::is_broadcast);
            match event {
                InputEvent::Inserted(k) if !broadcast && k <= inner.len() => {
                    inner.insert(k, self.create_inner(&template)?);
                    applied = Some(event);
                }
                InputEvent::Removed(k) if !broadcast && k < inner.len() => {
                    inner.remove(k).detach_all()?;
                    applied = Some(event);
                }
                _ => {}
            }
        }

        let required = self
            .inputs()
            .iter()
            .map(InputSlot::required_length)
            .max()
            .unwrap_or(0);
        while inner.len() < required {
            inner.push(self.create_inner(&template)?);
        }
        let removed: Vec<_> = inner.drain(required..).collect();
        for node in removed {
            node.detach_all()?;
        }
        if let OperatorKind::Vectorized { inner: stored, .. } = &mut *self.kind.write() {
            stored.clone_from(&inner);
        }

        for input in self.inputs() {
            if input.is_broadcast() {
                input.resize_subs(required)?;
            }
        }

        for (k, node) in inner.iter().enumerate() {
            let mut changed = false;
            for (input, inner_input) in self.inputs().iter().zip(node.inputs()) {
                changed |= match input.sub(k) {
                    Ok(sub) => follow(inner_input, &sub)?,
                    Err(_) => inner_input.disconnect_with(false)?,
                };
            }
            if changed || !node.is_configured() {
                node.configure()?;
            }
        }

        match applied {
            Some(InputEvent::Inserted(k)) if k < inner.len() => {
                for (index, output) in self.outputs().iter().enumerate() {
                    output.insert_sub_slot(k, inner[k].outputs()[index].clone())?;
                }
            }
            Some(InputEvent::Removed(k)) => {
                for output in self.outputs() {
                    if k < output.len() {
                        output.remove_sub_slot(k)?;
                    }
                }
            }
            _ => {}
        }
        for (index, output) in self.outputs().iter().enumerate() {
            output.set_subs(inner.iter().map(|node| node.outputs()[index].clone()).collect())?;
        }
        self.configured.store(!inner.is_empty(), Ordering::Release);
        Ok(())
    }

    fn create_inner(self: &Arc<Self>, template: &Arc<dyn Operator>) -> Result<Arc<OperatorNode>> {
        let node = OperatorNode::create(
            self.graph_weak().clone(),
            template.clone_operator(),
            OperatorId::new(),
            self.name().to_owned(),
            Some(Arc::downgrade(self)),
        )?;
        tracing::trace!(
            target: TRACING_TARGET,
            operator = %self.name(),
            inner = %node.id(),
            "inner operator created"
        );
        Ok(node)
    }

    /// Position of `node` among the inner nodes.
    pub(crate) fn inner_index(&self, node: &Arc<OperatorNode>) -> Option<usize> {
        self.inner_nodes().iter().position(|n| Arc::ptr_eq(n, node))
    }
}

/// Input that has to be reconnected after the upstream node was wrapped.
///
/// Sub-slots fed by a broadcast are reconnected through their top-level
/// slot so the broadcast turns into a proper element-wise connection.
fn reconnect_target(partner: &InputSlot, output: &OutputSlot) -> InputSlot {
    let Ok(owner) = partner.owner() else {
        return partner.clone();
    };
    let top = &owner.inputs()[partner.top_index()];
    let broadcast_from_output = matches!(top.source(), InputSource::Partner(p) if p.ptr_eq(output));
    if !top.ptr_eq(partner) && broadcast_from_output {
        top.clone()
    } else {
        partner.clone()
    }
}

/// Makes an inner node input take the same source as a wrapper sub-slot.
fn follow(inner_input: &InputSlot, sub: &InputSlot) -> Result<bool> {
    match sub.source() {
        InputSource::Partner(partner) => {
            let had_value = inner_input.has_value();
            if had_value {
                inner_input.detach();
            }
            Ok(inner_input.connect_with(&partner, false)? || had_value)
        }
        InputSource::Value(value) => {
            if inner_input.is_connected() {
                inner_input.detach();
            }
            inner_input.set_value_with(value, false)
        }
        InputSource::Empty => inner_input.disconnect_with(false),
    }
}

#[cfg(test)]
mod tests {
    use lazyflow_core::{Error, Roi};

    use crate::testing::{AddOne, ConstantList};
    use crate::{Graph, GraphConfig, OperatorId};

    fn graph() -> Graph {
        Graph::new(GraphConfig::default().with_num_workers(2)).unwrap()
    }

    #[test]
    fn test_connect_to_list_wraps_operator() {
        let graph = graph();
        let list = graph
            .add_operator(ConstantList::new(&[3], &[1.0, 2.0, 3.0]))
            .unwrap();
        let add = graph.add_operator(AddOne).unwrap();
        add.input(AddOne::INPUT)
            .connect(list.output(ConstantList::OUTPUTS))
            .unwrap();

        assert!(add.is_vectorized());
        assert!(add.is_configured());
        assert_eq!(add.inner_operators().len(), 3);
        let output = add.output(AddOne::OUTPUT);
        assert_eq!(output.level(), 1);
        assert_eq!(output.len(), 3);
        assert!(matches!(
            output.get(Roi::full(&[3])),
            Err(Error::SlotLevel { .. })
        ));

        for (index, expected) in [2.0, 3.0, 4.0].into_iter().enumerate() {
            let data = output
                .sub(index)
                .unwrap()
                .get(Roi::full(&[3]))
                .unwrap()
                .wait_blocking()
                .unwrap();
            assert!(data.to_f64().iter().all(|&v| v == expected));
        }
    }

    #[test]
    fn test_downstream_follows_wrapping() {
        let graph = graph();
        let list = graph
            .add_operator(ConstantList::new(&[2], &[1.0, 5.0]))
            .unwrap();
        let first = graph.add_operator(AddOne).unwrap();
        let second = graph.add_operator(AddOne).unwrap();
        first.input(AddOne::INPUT)
            .connect(list.output(ConstantList::OUTPUTS))
            .unwrap();
        second.input(AddOne::INPUT)
            .connect(first.output(AddOne::OUTPUT))
            .unwrap();

        assert!(second.is_vectorized());
        let data = second
            .output(AddOne::OUTPUT)
            .sub(1)
            .unwrap()
            .get(Roi::full(&[2]))
            .unwrap()
            .wait_blocking()
            .unwrap();
        assert!(data.to_f64().iter().all(|&v| v == 7.0));
    }

    #[test]
    fn test_element_changes_keep_inner_operators_aligned() {
        let graph = graph();
        let list = graph
            .add_operator(ConstantList::new(&[2], &[1.0, 2.0, 3.0]))
            .unwrap();
        let add = graph.add_operator(AddOne).unwrap();
        add.input(AddOne::INPUT)
            .connect(list.output(ConstantList::OUTPUTS))
            .unwrap();

        let ids = |op: &crate::Op<AddOne>| -> Vec<OperatorId> {
            op.inner_operators().iter().map(|inner| inner.id()).collect()
        };
        let before = ids(&add);

        list.output(ConstantList::OUTPUTS).remove(0).unwrap();
        let after_remove = ids(&add);
        assert_eq!(after_remove, before[1..].to_vec());
        assert_eq!(add.output(AddOne::OUTPUT).len(), 2);

        list.output(ConstantList::OUTPUTS).insert(1).unwrap();
        let after_insert = ids(&add);
        assert_eq!(after_insert.len(), 3);
        assert_eq!(after_insert[0], before[1]);
        assert_eq!(after_insert[2], before[2]);
        assert!(!before.contains(&after_insert[1]));
        assert_eq!(add.output(AddOne::OUTPUT).len(), 3);
    }
}

//! Persisting and rebuilding graphs.
//!
//! [`Graph::dump`] records every top-level operator with its parameters,
//! the sources of its inputs and optional runtime state.
//! [`Graph::reconstruct`] turns such a record back into a running graph
//! using an [`OperatorRegistry`]. The storage format is up to the caller;
//! every record type is serde-serializable and operator records can also be
//! flattened into [`NamedObjects`].

mod registry;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use lazyflow_core::{Buffer, Error, Result};
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use semver::Version;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use self::registry::OperatorRegistry;
use crate::config::GraphConfig;
use crate::graph::Graph;
use crate::id::OperatorId;
use crate::operator::{OperatorContext, OperatorHandle, OperatorNode};
use crate::slot::{InputSlot, InputSource, OutputSlot};

/// Tracing target for snapshot operations.
const TRACING_TARGET: &str = "lazyflow_runtime::snapshot";

/// Version written into every snapshot.
pub const SNAPSHOT_FORMAT: Version = Version::new(1, 0, 0);

/// Flat map of named sub-objects.
pub type NamedObjects = BTreeMap<String, Value>;

/// Serializable record of a whole graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub format: Version,
    pub config: GraphConfig,
    /// Top-level operators in insertion order.
    pub operators: Vec<OperatorRecord>,
}

/// Record of one operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorRecord {
    pub id: OperatorId,
    pub name: String,
    pub type_name: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<StateRecord>,
    pub inputs: Vec<InputRecord>,
}

/// Source of one declared input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputRecord {
    pub name: String,
    pub source: SourceRecord,
}

/// Where an input gets its data from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceRecord {
    Empty,
    Value { value: Buffer },
    Partner { slot: SlotRef },
    /// A multi-input whose elements were connected one by one.
    Elements { elements: Vec<SourceRecord> },
}

/// Stable address of an output slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotRef {
    pub operator: OperatorId,
    pub output: String,
    /// Sub-slot indices from the top-level output down.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path: Vec<usize>,
}

/// Persisted operator state; vectorized operators keep one entry per
/// element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StateRecord {
    Leaf { value: Value },
    Elements { elements: Vec<Option<StateRecord>> },
}

impl GraphSnapshot {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Named sub-objects of every operator, keyed by operator id.
    pub fn named_objects(&self) -> Result<BTreeMap<OperatorId, NamedObjects>> {
        self.operators
            .iter()
            .map(|record| Ok((record.id, record.to_named_objects()?)))
            .collect()
    }
}

impl OperatorRecord {
    /// Flattens the record: scalar fields under their own names, inputs
    /// under `inputs/<name>`.
    pub fn to_named_objects(&self) -> Result<NamedObjects> {
        let mut objects = NamedObjects::new();
        objects.insert("id".into(), serde_json::to_value(self.id)?);
        objects.insert("name".into(), Value::String(self.name.clone()));
        objects.insert("type_name".into(), Value::String(self.type_name.clone()));
        objects.insert("params".into(), self.params.clone());
        if let Some(state) = &self.state {
            objects.insert("state".into(), serde_json::to_value(state)?);
        }
        for input in &self.inputs {
            objects.insert(
                format!("inputs/{}", input.name),
                serde_json::to_value(&input.source)?,
            );
        }
        Ok(objects)
    }

    /// Inverse of [`to_named_objects`](Self::to_named_objects).
    pub fn from_named_objects(objects: &NamedObjects) -> Result<Self> {
        let field = |name: &str| {
            objects
                .get(name)
                .cloned()
                .ok_or_else(|| Error::Serialization(format!("missing named object `{name}`")))
        };
        let inputs = objects
            .iter()
            .filter_map(|(key, value)| Some((key.strip_prefix("inputs/")?, value)))
            .map(|(name, value)| {
                Ok(InputRecord {
                    name: name.to_owned(),
                    source: serde_json::from_value(value.clone())?,
                })
            })
            .collect::<Result<_>>()?;
        Ok(Self {
            id: serde_json::from_value(field("id")?)?,
            name: serde_json::from_value(field("name")?)?,
            type_name: serde_json::from_value(field("type_name")?)?,
            params: objects.get("params").cloned().unwrap_or(Value::Null),
            state: objects
                .get("state")
                .map(|state| serde_json::from_value(state.clone()))
                .transpose()?,
            inputs,
        })
    }
}

impl Graph {
    /// Records the graph.
    ///
    /// The worker pool is suspended while recording so cached state is
    /// consistent, and resumed afterwards unless it was already suspended.
    pub fn dump(&self) -> Result<GraphSnapshot> {
        let was_suspended = self.is_suspended();
        if !was_suspended {
            self.suspend()?;
        }
        let snapshot = self.record();
        if !was_suspended {
            self.resume();
        }
        let snapshot = snapshot?;
        tracing::info!(
            target: TRACING_TARGET,
            operators = snapshot.operators.len(),
            "graph dumped"
        );
        Ok(snapshot)
    }

    fn record(&self) -> Result<GraphSnapshot> {
        let _topology = self.lock_topology();
        let operators = self
            .operators()
            .iter()
            .map(|handle| record_operator(handle.node()))
            .collect::<Result<_>>()?;
        Ok(GraphSnapshot {
            format: SNAPSHOT_FORMAT,
            config: self.config().clone(),
            operators,
        })
    }

    /// Builds a new graph from `snapshot`.
    ///
    /// Operators keep their recorded ids. Connections are made upstream
    /// first, then state is restored.
    pub fn reconstruct(snapshot: &GraphSnapshot, registry: &OperatorRegistry) -> Result<Graph> {
        if snapshot.format.major != SNAPSHOT_FORMAT.major {
            return Err(Error::Serialization(format!(
                "unsupported snapshot format {}, expected {}.x",
                snapshot.format, SNAPSHOT_FORMAT.major
            )));
        }
        let order = connection_order(snapshot)?;

        let graph = Graph::new(snapshot.config.clone())?;
        let mut handles = HashMap::with_capacity(snapshot.operators.len());
        for record in &snapshot.operators {
            let operator = registry.create(&record.type_name, &record.params)?;
            let handle = graph.insert_node(operator, record.id, record.name.clone())?;
            handles.insert(record.id, handle);
        }

        for index in order {
            let record = &snapshot.operators[index];
            let handle = &handles[&record.id];
            for input in &record.inputs {
                let slot = handle.input_by_name(&input.name)?;
                apply_source(&handles, slot, &input.source)?;
            }
        }

        for record in &snapshot.operators {
            if let Some(state) = &record.state {
                restore_state(handles[&record.id].node(), state)?;
            }
        }

        tracing::info!(
            target: TRACING_TARGET,
            operators = snapshot.operators.len(),
            "graph reconstructed"
        );
        Ok(graph)
    }
}

fn record_operator(node: &Arc<OperatorNode>) -> Result<OperatorRecord> {
    let template = node.template();
    let inputs = node
        .inputs()
        .iter()
        .map(|input| {
            Ok(InputRecord {
                name: input.name().to_owned(),
                source: record_source(input)?,
            })
        })
        .collect::<Result<_>>()?;
    Ok(OperatorRecord {
        id: node.id(),
        name: node.name().to_owned(),
        type_name: template.type_name().to_owned(),
        params: template.params()?,
        state: record_state(node)?,
        inputs,
    })
}

fn record_source(input: &InputSlot) -> Result<SourceRecord> {
    Ok(match input.source() {
        InputSource::Value(value) => SourceRecord::Value {
            value: (*value).clone(),
        },
        InputSource::Partner(partner) => SourceRecord::Partner {
            slot: slot_ref(&partner)?,
        },
        InputSource::Empty if input.level() > 0 && !input.is_empty() => SourceRecord::Elements {
            elements: input
                .subs()
                .iter()
                .map(record_source)
                .collect::<Result<_>>()?,
        },
        InputSource::Empty => SourceRecord::Empty,
    })
}

fn record_state(node: &Arc<OperatorNode>) -> Result<Option<StateRecord>> {
    if node.is_vectorized() {
        let elements = node
            .inner_nodes()
            .iter()
            .map(record_state)
            .collect::<Result<Vec<_>>>()?;
        if elements.iter().all(Option::is_none) {
            return Ok(None);
        }
        return Ok(Some(StateRecord::Elements { elements }));
    }
    Ok(node.leaf()?.state()?.map(|value| StateRecord::Leaf { value }))
}

/// Address of `slot` relative to the top-level operator hosting it.
fn slot_ref(slot: &OutputSlot) -> Result<SlotRef> {
    let mut node = slot.owner()?;
    let (output, mut path) = locate(&node, slot).ok_or_else(|| {
        Error::Internal(format!("slot `{}` not found on its operator", slot.qualified_name()))
    })?;
    while let Some(parent) = node.parent() {
        let index = parent.inner_index(&node).ok_or_else(|| {
            Error::Internal(format!("operator `{}` detached from its wrapper", node.name()))
        })?;
        path.insert(0, index);
        node = parent;
    }
    Ok(SlotRef {
        operator: node.id(),
        output,
        path,
    })
}

fn locate(node: &OperatorNode, slot: &OutputSlot) -> Option<(String, Vec<usize>)> {
    fn search(current: &OutputSlot, slot: &OutputSlot, path: &mut Vec<usize>) -> bool {
        if current.ptr_eq(slot) {
            return true;
        }
        for (index, sub) in current.subs().iter().enumerate() {
            path.push(index);
            if search(sub, slot, path) {
                return true;
            }
            path.pop();
        }
        false
    }

    node.outputs().iter().find_map(|output| {
        let mut path = Vec::new();
        search(output, slot, &mut path).then(|| (output.name().to_owned(), path))
    })
}

fn resolve(handles: &HashMap<OperatorId, OperatorHandle>, slot: &SlotRef) -> Result<OutputSlot> {
    let handle = handles.get(&slot.operator).ok_or_else(|| {
        Error::InvalidConfig(format!("snapshot refers to unknown operator {}", slot.operator))
    })?;
    let mut output = handle.output_by_name(&slot.output)?.clone();
    for &index in &slot.path {
        output = output.sub(index)?;
    }
    Ok(output)
}

fn apply_source(
    handles: &HashMap<OperatorId, OperatorHandle>,
    input: &InputSlot,
    source: &SourceRecord,
) -> Result<()> {
    match source {
        SourceRecord::Empty => Ok(()),
        SourceRecord::Value { value } => input.set_value(value.clone()),
        SourceRecord::Partner { slot } => input.connect(&resolve(handles, slot)?),
        SourceRecord::Elements { elements } => {
            input.resize(elements.len())?;
            for (index, element) in elements.iter().enumerate() {
                apply_source(handles, &input.sub(index)?, element)?;
            }
            Ok(())
        }
    }
}

fn restore_state(node: &Arc<OperatorNode>, state: &StateRecord) -> Result<()> {
    match state {
        StateRecord::Leaf { value } => {
            let operator = node.leaf()?;
            let graph = node.graph()?;
            operator.restore_state(&OperatorContext::new(node, &graph), value.clone())
        }
        StateRecord::Elements { elements } => {
            let inner = node.inner_nodes();
            if inner.len() != elements.len() {
                return Err(Error::Serialization(format!(
                    "operator `{}` has {} elements, snapshot has {}",
                    node.name(),
                    inner.len(),
                    elements.len()
                )));
            }
            for (node, element) in inner.iter().zip(elements) {
                if let Some(element) = element {
                    restore_state(node, element)?;
                }
            }
            Ok(())
        }
    }
}

/// Operator indices ordered so every partner comes before its consumers.
fn connection_order(snapshot: &GraphSnapshot) -> Result<Vec<usize>> {
    fn partners<'a>(source: &'a SourceRecord, out: &mut Vec<&'a SlotRef>) {
        match source {
            SourceRecord::Partner { slot } => out.push(slot),
            SourceRecord::Elements { elements } => {
                for element in elements {
                    partners(element, out);
                }
            }
            SourceRecord::Empty | SourceRecord::Value { .. } => {}
        }
    }

    let mut dag = DiGraph::<usize, ()>::with_capacity(snapshot.operators.len(), 0);
    let indices: HashMap<OperatorId, _> = snapshot
        .operators
        .iter()
        .enumerate()
        .map(|(index, record)| (record.id, dag.add_node(index)))
        .collect();
    if indices.len() != snapshot.operators.len() {
        return Err(Error::InvalidConfig("snapshot contains duplicate operator ids".into()));
    }

    for record in &snapshot.operators {
        let consumer = indices[&record.id];
        let mut refs = Vec::new();
        for input in &record.inputs {
            partners(&input.source, &mut refs);
        }
        for slot in refs {
            let producer = indices.get(&slot.operator).ok_or_else(|| {
                Error::InvalidConfig(format!("snapshot refers to unknown operator {}", slot.operator))
            })?;
            dag.update_edge(*producer, consumer, ());
        }
    }

    let sorted = toposort(&dag, None).map_err(|cycle| {
        let index = dag[cycle.node_id()];
        Error::InvalidConfig(format!(
            "snapshot topology has a cycle through `{}`",
            snapshot.operators[index].name
        ))
    })?;
    Ok(sorted.into_iter().map(|node| dag[node]).collect())
}

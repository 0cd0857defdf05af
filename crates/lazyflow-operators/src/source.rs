//! Operators without inputs that serve arrays held in memory.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use lazyflow_core::{AxisTag, Buffer, DType, Error, MetaInfo, Result, Roi};
use lazyflow_runtime::{ExecuteContext, Op, Operator, OperatorContext, OutputKey, OutputSlot, SlotDef};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Tracing target for source operators.
const TRACING_TARGET: &str = "lazyflow_operators::source";

/// Serves regions of an in-memory array.
///
/// Counts its executions, which makes it the usual tool for checking
/// whether downstream caches did their job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArraySource {
    data: Buffer,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    axis_tags: Option<Vec<AxisTag>>,
    #[serde(skip)]
    executions: Arc<AtomicUsize>,
}

impl ArraySource {
    pub const OUTPUT: OutputKey<Self> = OutputKey::new(0, "Output");

    pub fn new(data: impl Into<Buffer>) -> Self {
        Self {
            data: data.into(),
            axis_tags: None,
            executions: Arc::default(),
        }
    }

    /// Array of `shape` filled with `value`.
    pub fn constant(shape: &[usize], dtype: DType, value: f64) -> Self {
        let mut data = Buffer::zeros(dtype, shape);
        data.fill(value);
        Self::new(data)
    }

    /// Attaches axis tags to the output metadata.
    pub fn with_axis_tags(mut self, tags: impl Into<Vec<AxisTag>>) -> Self {
        self.axis_tags = Some(tags.into());
        self
    }

    pub fn data(&self) -> &Buffer {
        &self.data
    }

    /// Number of regions served so far.
    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Operator for ArraySource {
    fn type_name(&self) -> &'static str {
        "ArraySource"
    }

    fn input_slots(&self) -> &'static [SlotDef] {
        &[]
    }

    fn output_slots(&self) -> &'static [SlotDef] {
        const OUTPUTS: &[SlotDef] = &[SlotDef::new("Output")];
        OUTPUTS
    }

    fn setup(&self, ctx: &OperatorContext<'_>) -> Result<()> {
        let mut meta = self.data.meta();
        if let Some(tags) = &self.axis_tags {
            if tags.len() != self.data.shape().len() {
                return Err(Error::InvalidConfig(format!(
                    "{} axis tags for a {}-d array",
                    tags.len(),
                    self.data.shape().len()
                )));
            }
            meta = meta.with_axis_tags(tags.clone());
        }
        ctx.output(Self::OUTPUT).set_meta(&meta);
        Ok(())
    }

    async fn execute(
        &self,
        ctx: &ExecuteContext,
        _output: &OutputSlot,
        roi: &Roi,
        destination: &mut Buffer,
    ) -> Result<()> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        tracing::trace!(target: TRACING_TARGET, operator = %ctx.name(), roi = %roi, "serving region");
        destination.assign(&self.data.slice(roi)?)
    }

    fn params(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Serves a list of arrays on a level-1 output, one element per array.
///
/// The list can be edited while the operator is part of a graph; edits
/// insert or remove the matching output element so that connected
/// multi-inputs (and vectorized operators downstream) follow at the same
/// index.
#[derive(Debug, Default)]
pub struct ListSource {
    arrays: RwLock<Vec<Buffer>>,
}

impl ListSource {
    pub const OUTPUTS: OutputKey<Self> = OutputKey::new(0, "Outputs");

    pub fn new(arrays: Vec<Buffer>) -> Self {
        Self {
            arrays: RwLock::new(arrays),
        }
    }

    pub fn len(&self) -> usize {
        self.arrays.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inserts `data` at `index` of a source placed in a graph.
    pub fn insert(source: &Op<Self>, index: usize, data: Buffer) -> Result<()> {
        let index = {
            let mut arrays = source.operator().arrays.write();
            let index = index.min(arrays.len());
            arrays.insert(index, data);
            index
        };
        source.output(Self::OUTPUTS).insert(index)?;
        source.reconfigure()
    }

    /// Removes the array at `index` of a source placed in a graph.
    pub fn remove(source: &Op<Self>, index: usize) -> Result<Buffer> {
        let removed = {
            let mut arrays = source.operator().arrays.write();
            if index >= arrays.len() {
                return Err(Error::SubSlotIndex {
                    slot: Self::OUTPUTS.name().into(),
                    index,
                    len: arrays.len(),
                });
            }
            arrays.remove(index)
        };
        source.output(Self::OUTPUTS).remove(index)?;
        source.reconfigure()?;
        Ok(removed)
    }
}

impl Clone for ListSource {
    fn clone(&self) -> Self {
        Self::new(self.arrays.read().clone())
    }
}

#[async_trait]
impl Operator for ListSource {
    fn type_name(&self) -> &'static str {
        "ListSource"
    }

    fn input_slots(&self) -> &'static [SlotDef] {
        &[]
    }

    fn output_slots(&self) -> &'static [SlotDef] {
        const OUTPUTS: &[SlotDef] = &[SlotDef::multi("Outputs", 1)];
        OUTPUTS
    }

    fn setup(&self, ctx: &OperatorContext<'_>) -> Result<()> {
        let metas: Vec<MetaInfo> = self.arrays.read().iter().map(Buffer::meta).collect();
        let outputs = ctx.output(Self::OUTPUTS);
        outputs.resize(metas.len())?;
        for (sub, meta) in outputs.subs().iter().zip(&metas) {
            sub.set_meta(meta);
        }
        Ok(())
    }

    async fn execute(
        &self,
        _ctx: &ExecuteContext,
        output: &OutputSlot,
        roi: &Roi,
        destination: &mut Buffer,
    ) -> Result<()> {
        let index = output
            .position()
            .ok_or_else(|| Error::operator("expected an element of the output list"))?;
        let data = {
            let arrays = self.arrays.read();
            let array = arrays
                .get(index)
                .ok_or_else(|| Error::operator(format!("list element {index} is gone")))?;
            array.slice(roi)?
        };
        destination.assign(&data)
    }

    fn params(&self) -> Result<Value> {
        Ok(serde_json::to_value(&*self.arrays.read())?)
    }
}

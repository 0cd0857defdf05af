//! Small operators for unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::task::{Poll, Waker};

use async_trait::async_trait;
use lazyflow_core::{Buffer, DType, Error, MetaInfo, Result, Roi};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::operator::{ExecuteContext, Operator, OperatorContext};
use crate::request::Request;
use crate::slot::{InputKey, InputSlot, OutputKey, OutputSlot, SlotDef};

/// Constant `f64` array with an execution counter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Constant {
    pub shape: Vec<usize>,
    pub value: f64,
    #[serde(skip)]
    pub executions: Arc<AtomicUsize>,
}

impl Constant {
    pub const OUTPUT: OutputKey<Self> = OutputKey::new(0, "Output");

    pub fn new(shape: &[usize], value: f64) -> Self {
        Self {
            shape: shape.to_vec(),
            value,
            executions: Arc::default(),
        }
    }

    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Operator for Constant {
    fn type_name(&self) -> &'static str {
        "Constant"
    }

    fn input_slots(&self) -> &'static [SlotDef] {
        &[]
    }

    fn output_slots(&self) -> &'static [SlotDef] {
        const OUTPUTS: &[SlotDef] = &[SlotDef::new("Output")];
        OUTPUTS
    }

    fn setup(&self, ctx: &OperatorContext<'_>) -> Result<()> {
        ctx.output(Self::OUTPUT)
            .set_meta(&MetaInfo::new(self.shape.clone(), DType::F64));
        Ok(())
    }

    async fn execute(
        &self,
        _ctx: &ExecuteContext,
        _output: &OutputSlot,
        _roi: &Roi,
        destination: &mut Buffer,
    ) -> Result<()> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        destination.fill(self.value);
        Ok(())
    }

    fn params(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Adds one to its input.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct AddOne;

impl AddOne {
    pub const INPUT: InputKey<Self> = InputKey::new(0, "Input");
    pub const OUTPUT: OutputKey<Self> = OutputKey::new(0, "Output");
}

#[async_trait]
impl Operator for AddOne {
    fn type_name(&self) -> &'static str {
        "AddOne"
    }

    fn input_slots(&self) -> &'static [SlotDef] {
        const INPUTS: &[SlotDef] = &[SlotDef::new("Input")];
        INPUTS
    }

    fn output_slots(&self) -> &'static [SlotDef] {
        const OUTPUTS: &[SlotDef] = &[SlotDef::new("Output")];
        OUTPUTS
    }

    fn setup(&self, ctx: &OperatorContext<'_>) -> Result<()> {
        ctx.output(Self::OUTPUT)
            .set_meta(&ctx.input(Self::INPUT).meta());
        Ok(())
    }

    async fn execute(
        &self,
        ctx: &ExecuteContext,
        _output: &OutputSlot,
        roi: &Roi,
        destination: &mut Buffer,
    ) -> Result<()> {
        let data = ctx.input(Self::INPUT).get(roi.clone())?.wait().await?;
        let result = data.to_f64() + 1.0;
        destination.assign(&Buffer::from_f64(result, destination.dtype()))
    }

    fn notify_dirty(&self, ctx: &OperatorContext<'_>, _input: &InputSlot, roi: &Roi) -> Result<()> {
        ctx.output(Self::OUTPUT).set_dirty(roi)
    }
}

/// List of constant arrays on a level-1 output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ConstantList {
    pub shape: Vec<usize>,
    pub values: Vec<f64>,
}

impl ConstantList {
    pub const OUTPUTS: OutputKey<Self> = OutputKey::new(0, "Outputs");

    pub fn new(shape: &[usize], values: &[f64]) -> Self {
        Self {
            shape: shape.to_vec(),
            values: values.to_vec(),
        }
    }
}

#[async_trait]
impl Operator for ConstantList {
    fn type_name(&self) -> &'static str {
        "ConstantList"
    }

    fn input_slots(&self) -> &'static [SlotDef] {
        &[]
    }

    fn output_slots(&self) -> &'static [SlotDef] {
        const OUTPUTS: &[SlotDef] = &[SlotDef::multi("Outputs", 1)];
        OUTPUTS
    }

    fn setup(&self, ctx: &OperatorContext<'_>) -> Result<()> {
        let outputs = ctx.output(Self::OUTPUTS);
        outputs.resize(self.values.len())?;
        for sub in outputs.subs() {
            sub.set_meta(&MetaInfo::new(self.shape.clone(), DType::F64));
        }
        Ok(())
    }

    async fn execute(
        &self,
        _ctx: &ExecuteContext,
        output: &OutputSlot,
        _roi: &Roi,
        destination: &mut Buffer,
    ) -> Result<()> {
        let index = output
            .position()
            .ok_or_else(|| Error::operator("expected an element of the output list"))?;
        destination.fill(self.values[index]);
        Ok(())
    }

    fn params(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Never finishes; used to observe running requests.
///
/// Keeps the wakers it was polled with so the task stays parked instead
/// of being dropped.
#[derive(Debug, Clone, Default)]
pub(crate) struct Stall {
    pub shape: Vec<usize>,
    pub wakers: Arc<Mutex<Vec<Waker>>>,
}

impl Stall {
    pub const OUTPUT: OutputKey<Self> = OutputKey::new(0, "Output");
}

#[async_trait]
impl Operator for Stall {
    fn type_name(&self) -> &'static str {
        "Stall"
    }

    fn input_slots(&self) -> &'static [SlotDef] {
        &[]
    }

    fn output_slots(&self) -> &'static [SlotDef] {
        const OUTPUTS: &[SlotDef] = &[SlotDef::new("Output")];
        OUTPUTS
    }

    fn setup(&self, ctx: &OperatorContext<'_>) -> Result<()> {
        ctx.output(Self::OUTPUT)
            .set_meta(&MetaInfo::new(self.shape.clone(), DType::F64));
        Ok(())
    }

    async fn execute(
        &self,
        _ctx: &ExecuteContext,
        _output: &OutputSlot,
        _roi: &Roi,
        _destination: &mut Buffer,
    ) -> Result<()> {
        futures::future::poll_fn(|cx| {
            self.wakers.lock().push(cx.waker().clone());
            Poll::<()>::Pending
        })
        .await;
        Ok(())
    }
}

/// Fails or panics on every execution.
#[derive(Debug, Clone)]
pub(crate) struct Broken {
    pub panic: bool,
}

impl Broken {
    pub const OUTPUT: OutputKey<Self> = OutputKey::new(0, "Output");
}

#[async_trait]
impl Operator for Broken {
    fn type_name(&self) -> &'static str {
        "Broken"
    }

    fn input_slots(&self) -> &'static [SlotDef] {
        &[]
    }

    fn output_slots(&self) -> &'static [SlotDef] {
        const OUTPUTS: &[SlotDef] = &[SlotDef::new("Output")];
        OUTPUTS
    }

    fn setup(&self, ctx: &OperatorContext<'_>) -> Result<()> {
        ctx.output(Self::OUTPUT)
            .set_meta(&MetaInfo::new(vec![4], DType::F64));
        Ok(())
    }

    async fn execute(
        &self,
        _ctx: &ExecuteContext,
        _output: &OutputSlot,
        _roi: &Roi,
        _destination: &mut Buffer,
    ) -> Result<()> {
        if self.panic {
            panic!("broken operator");
        }
        Err(Error::operator("broken operator"))
    }
}

/// Requests its input, parks until opened, then waits on that request.
///
/// The input request is exposed through `child` so a test can act on it
/// while the operator is parked.
#[derive(Debug, Clone, Default)]
pub(crate) struct Gated {
    pub child: Arc<Mutex<Option<Request>>>,
    pub open: Arc<AtomicBool>,
    pub wakers: Arc<Mutex<Vec<Waker>>>,
}

impl Gated {
    pub const INPUT: InputKey<Self> = InputKey::new(0, "Input");
    pub const OUTPUT: OutputKey<Self> = OutputKey::new(0, "Output");

    pub fn child(&self) -> Option<Request> {
        self.child.lock().clone()
    }

    pub fn open(&self) {
        self.open.store(true, Ordering::SeqCst);
        for waker in self.wakers.lock().drain(..) {
            waker.wake();
        }
    }
}

#[async_trait]
impl Operator for Gated {
    fn type_name(&self) -> &'static str {
        "Gated"
    }

    fn input_slots(&self) -> &'static [SlotDef] {
        const INPUTS: &[SlotDef] = &[SlotDef::new("Input")];
        INPUTS
    }

    fn output_slots(&self) -> &'static [SlotDef] {
        const OUTPUTS: &[SlotDef] = &[SlotDef::new("Output")];
        OUTPUTS
    }

    fn setup(&self, ctx: &OperatorContext<'_>) -> Result<()> {
        ctx.output(Self::OUTPUT)
            .set_meta(&ctx.input(Self::INPUT).meta());
        Ok(())
    }

    async fn execute(
        &self,
        ctx: &ExecuteContext,
        _output: &OutputSlot,
        roi: &Roi,
        destination: &mut Buffer,
    ) -> Result<()> {
        let child = ctx.input(Self::INPUT).get(roi.clone())?;
        child.submit();
        *self.child.lock() = Some(child.clone());
        futures::future::poll_fn(|cx| {
            if self.open.load(Ordering::SeqCst) {
                return Poll::Ready(());
            }
            self.wakers.lock().push(cx.waker().clone());
            if self.open.load(Ordering::SeqCst) {
                Poll::Ready(())
            } else {
                Poll::Pending
            }
        })
        .await;
        let data = child.wait().await?;
        destination.assign(&data)
    }
}

/// Records the first coordinate of every region it computes, in order.
#[derive(Debug, Clone, Default)]
pub(crate) struct Recorder {
    pub log: Arc<Mutex<Vec<i64>>>,
}

impl Recorder {
    pub const OUTPUT: OutputKey<Self> = OutputKey::new(0, "Output");
    pub const LEN: usize = 128;

    pub fn log(&self) -> Vec<i64> {
        self.log.lock().clone()
    }
}

#[async_trait]
impl Operator for Recorder {
    fn type_name(&self) -> &'static str {
        "Recorder"
    }

    fn input_slots(&self) -> &'static [SlotDef] {
        &[]
    }

    fn output_slots(&self) -> &'static [SlotDef] {
        const OUTPUTS: &[SlotDef] = &[SlotDef::new("Output")];
        OUTPUTS
    }

    fn setup(&self, ctx: &OperatorContext<'_>) -> Result<()> {
        ctx.output(Self::OUTPUT)
            .set_meta(&MetaInfo::new(vec![Self::LEN], DType::F64));
        Ok(())
    }

    async fn execute(
        &self,
        _ctx: &ExecuteContext,
        _output: &OutputSlot,
        roi: &Roi,
        _destination: &mut Buffer,
    ) -> Result<()> {
        self.log.lock().push(roi.start()[0]);
        Ok(())
    }
}

/// Blocks its worker thread between two barrier rounds.
#[derive(Debug, Clone)]
pub(crate) struct Blocker {
    pub barrier: Arc<Barrier>,
}

impl Blocker {
    pub const OUTPUT: OutputKey<Self> = OutputKey::new(0, "Output");
}

#[async_trait]
impl Operator for Blocker {
    fn type_name(&self) -> &'static str {
        "Blocker"
    }

    fn input_slots(&self) -> &'static [SlotDef] {
        &[]
    }

    fn output_slots(&self) -> &'static [SlotDef] {
        const OUTPUTS: &[SlotDef] = &[SlotDef::new("Output")];
        OUTPUTS
    }

    fn setup(&self, ctx: &OperatorContext<'_>) -> Result<()> {
        ctx.output(Self::OUTPUT)
            .set_meta(&MetaInfo::new(vec![1], DType::F64));
        Ok(())
    }

    async fn execute(
        &self,
        _ctx: &ExecuteContext,
        _output: &OutputSlot,
        _roi: &Roi,
        _destination: &mut Buffer,
    ) -> Result<()> {
        self.barrier.wait();
        self.barrier.wait();
        Ok(())
    }
}

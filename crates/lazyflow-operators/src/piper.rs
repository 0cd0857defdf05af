use async_trait::async_trait;
use lazyflow_core::{Buffer, Result, Roi};
use lazyflow_runtime::{
    ExecuteContext, InputKey, InputSlot, Operator, OperatorContext, OutputKey, OutputSlot, SlotDef,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Forwards its input unchanged.
///
/// Handy as a named junction point and as a way to feed a literal array
/// into a graph: set a value on `Input` and connect `Output` downstream.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Piper;

impl Piper {
    pub const INPUT: InputKey<Self> = InputKey::new(0, "Input");
    pub const OUTPUT: OutputKey<Self> = OutputKey::new(0, "Output");
}

#[async_trait]
impl Operator for Piper {
    fn type_name(&self) -> &'static str {
        "Piper"
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
        ctx.output(Self::OUTPUT).set_meta(&ctx.input(Self::INPUT).meta());
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
        destination.assign(&data)
    }

    fn notify_dirty(&self, ctx: &OperatorContext<'_>, _input: &InputSlot, roi: &Roi) -> Result<()> {
        ctx.output(Self::OUTPUT).set_dirty(roi)
    }

    fn params(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

use async_trait::async_trait;
use lazyflow_core::{Buffer, Error, Result, Roi};
use lazyflow_runtime::{
    ExecuteContext, InputKey, InputSlot, Operator, OperatorContext, OutputKey, OutputSlot, SlotDef,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Element-wise sum of every array on a multi-input.
///
/// All elements must share one shape; the output takes the metadata of the
/// first element. An empty list leaves the output unset.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Sum;

impl Sum {
    pub const INPUTS: InputKey<Self> = InputKey::new(0, "Inputs");
    pub const OUTPUT: OutputKey<Self> = OutputKey::new(0, "Output");
}

#[async_trait]
impl Operator for Sum {
    fn type_name(&self) -> &'static str {
        "Sum"
    }

    fn input_slots(&self) -> &'static [SlotDef] {
        const INPUTS: &[SlotDef] = &[SlotDef::multi("Inputs", 1)];
        INPUTS
    }

    fn output_slots(&self) -> &'static [SlotDef] {
        const OUTPUTS: &[SlotDef] = &[SlotDef::new("Output")];
        OUTPUTS
    }

    fn setup(&self, ctx: &OperatorContext<'_>) -> Result<()> {
        let inputs = ctx.input(Self::INPUTS).subs();
        let output = ctx.output(Self::OUTPUT);
        let Some(first) = inputs.first().map(InputSlot::meta) else {
            output.update_meta(|meta| meta.reset());
            return Ok(());
        };
        for input in &inputs[1..] {
            let meta = input.meta();
            if meta.shape() != first.shape() {
                return Err(Error::ShapeMismatch {
                    expected: first.shape().unwrap_or_default().to_vec(),
                    found: meta.shape().unwrap_or_default().to_vec(),
                });
            }
        }
        output.set_meta(&first);
        Ok(())
    }

    async fn execute(
        &self,
        ctx: &ExecuteContext,
        _output: &OutputSlot,
        roi: &Roi,
        destination: &mut Buffer,
    ) -> Result<()> {
        let requests = ctx
            .input(Self::INPUTS)
            .subs()
            .iter()
            .map(|input| input.get(roi.clone()))
            .collect::<Result<Vec<_>>>()?;
        for request in &requests {
            request.submit();
        }

        let mut total = Buffer::zeros(destination.dtype(), destination.shape()).to_f64();
        for request in requests {
            total += &request.wait().await?.to_f64();
        }
        destination.assign(&Buffer::from_f64(total, destination.dtype()))
    }

    fn notify_dirty(&self, ctx: &OperatorContext<'_>, _input: &InputSlot, roi: &Roi) -> Result<()> {
        ctx.output(Self::OUTPUT).set_dirty(roi)
    }

    fn params(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

#[cfg(test)]
mod tests {
    use lazyflow_core::DType;
    use lazyflow_runtime::{Graph, GraphConfig};

    use super::*;
    use crate::{ArraySource, ListSource};

    fn constant(shape: &[usize], value: f64) -> Buffer {
        let mut data = Buffer::zeros(DType::F64, shape);
        data.fill(value);
        data
    }

    #[test]
    fn test_sums_every_element() {
        let graph = Graph::new(GraphConfig::default().with_num_workers(2)).unwrap();
        let list = graph
            .add_operator(ListSource::new(vec![
                constant(&[3, 3], 1.0),
                constant(&[3, 3], 2.0),
                constant(&[3, 3], 4.0),
            ]))
            .unwrap();
        let sum = graph.add_operator(Sum).unwrap();
        sum.input(Sum::INPUTS).connect(list.output(ListSource::OUTPUTS)).unwrap();
        assert_eq!(sum.input(Sum::INPUTS).len(), 3);

        let data = sum
            .output(Sum::OUTPUT)
            .get(Roi::new(vec![0, 1], vec![2, 3]).unwrap())
            .unwrap()
            .wait_blocking()
            .unwrap();
        assert_eq!(data.shape(), &[2, 2]);
        assert!(data.as_f64().unwrap().iter().all(|&v| v == 7.0));
    }

    #[test]
    fn test_single_array_is_broadcast() {
        let graph = Graph::new(GraphConfig::default().with_num_workers(1)).unwrap();
        let source = graph.add_operator(ArraySource::new(constant(&[4], 5.0))).unwrap();
        let sum = graph.add_operator(Sum).unwrap();
        sum.input(Sum::INPUTS).connect(source.output(ArraySource::OUTPUT)).unwrap();
        assert_eq!(sum.input(Sum::INPUTS).len(), 1);

        let data = sum.output(Sum::OUTPUT).get(Roi::full(&[4])).unwrap().wait_blocking().unwrap();
        assert!(data.as_f64().unwrap().iter().all(|&v| v == 5.0));
    }

    #[test]
    fn test_mismatched_shapes_are_rejected() {
        let graph = Graph::new(GraphConfig::default().with_num_workers(1)).unwrap();
        let list = graph
            .add_operator(ListSource::new(vec![constant(&[3], 1.0), constant(&[4], 1.0)]))
            .unwrap();
        let sum = graph.add_operator(Sum).unwrap();
        let err = sum
            .input(Sum::INPUTS)
            .connect(list.output(ListSource::OUTPUTS))
            .unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
    }
}

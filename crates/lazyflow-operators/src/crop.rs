use async_trait::async_trait;
use lazyflow_core::{Buffer, Error, Result, Roi};
use lazyflow_runtime::{
    ExecuteContext, InputKey, InputSlot, Operator, OperatorContext, OutputKey, OutputSlot, SlotDef,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Tracing target for the crop operator.
const TRACING_TARGET: &str = "lazyflow_operators::crop";

/// Exposes a fixed sub-region of its input.
///
/// Output coordinates are input coordinates shifted by the region start.
/// Dirty regions are shifted the same way and clipped to the crop, so
/// changes outside the crop never reach downstream operators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Crop {
    region: Roi,
    /// Removes axes of extent one from the output.
    #[serde(default)]
    drop_singletons: bool,
}

impl Crop {
    pub const INPUT: InputKey<Self> = InputKey::new(0, "Input");
    pub const OUTPUT: OutputKey<Self> = OutputKey::new(0, "Output");

    pub fn new(region: Roi) -> Self {
        Self {
            region,
            drop_singletons: false,
        }
    }

    /// Removes axes of extent one from the output shape.
    pub fn dropping_singletons(mut self) -> Self {
        self.drop_singletons = true;
        self
    }

    pub fn region(&self) -> &Roi {
        &self.region
    }

    fn keeps(&self, axis: usize) -> bool {
        !self.drop_singletons || self.region.stop()[axis] - self.region.start()[axis] != 1
    }

    /// Maps an output region to the input region it reads.
    fn to_input(&self, roi: &Roi) -> Result<Roi> {
        let mut start = Vec::with_capacity(self.region.dim());
        let mut stop = Vec::with_capacity(self.region.dim());
        let mut next = 0;
        for axis in 0..self.region.dim() {
            let offset = self.region.start()[axis];
            if self.keeps(axis) {
                start.push(roi.start()[next] + offset);
                stop.push(roi.stop()[next] + offset);
                next += 1;
            } else {
                start.push(offset);
                stop.push(offset + 1);
            }
        }
        Roi::new(start, stop)
    }

    /// Maps an input region to the output region it affects, if any.
    fn to_output(&self, roi: &Roi) -> Result<Option<Roi>> {
        let Some(overlap) = roi.intersect(&self.region) else {
            return Ok(None);
        };
        let mut local = overlap.relative_to(&self.region);
        for axis in (0..self.region.dim()).rev() {
            if !self.keeps(axis) {
                local = local.remove_axis(axis)?;
            }
        }
        Ok(Some(local))
    }
}

#[async_trait]
impl Operator for Crop {
    fn type_name(&self) -> &'static str {
        "Crop"
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
        let input = ctx.input(Self::INPUT).meta();
        let shape = input
            .shape()
            .ok_or_else(|| Error::SlotNotReady(ctx.input(Self::INPUT).qualified_name()))?;
        if self.region.dim() != shape.len() {
            return Err(Error::InvalidRoi(format!(
                "crop {} has {} axes but the input has {}",
                self.region,
                self.region.dim(),
                shape.len()
            )));
        }
        if !self.region.fits_in(shape) {
            return Err(Error::RoiOutOfBounds {
                roi: self.region.clone(),
                shape: shape.to_vec(),
            });
        }

        let kept: Vec<usize> = (0..shape.len()).filter(|&axis| self.keeps(axis)).collect();
        let extent = self.region.shape();
        let mut meta = input.clone();
        meta.set_shape(kept.iter().map(|&axis| extent[axis]).collect::<Vec<_>>());
        if let Some(tags) = input.axis_tags() {
            meta.set_axis_tags(Some(kept.iter().map(|&axis| tags[axis]).collect()));
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
        let source = self.to_input(roi)?;
        let data = ctx.input(Self::INPUT).get(source)?.wait().await?;
        if data.shape() == destination.shape() {
            destination.assign(&data)
        } else {
            let shape = destination.shape().to_vec();
            destination.assign(&data.reshape(&shape)?)
        }
    }

    fn notify_dirty(&self, ctx: &OperatorContext<'_>, _input: &InputSlot, roi: &Roi) -> Result<()> {
        match self.to_output(roi)? {
            Some(local) => ctx.output(Self::OUTPUT).set_dirty(&local),
            None => {
                tracing::trace!(target: TRACING_TARGET, roi = %roi, "dirty region outside the crop");
                Ok(())
            }
        }
    }

    fn params(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use lazyflow_core::{AxisTag, DType};
    use lazyflow_runtime::{Graph, GraphConfig, Op};
    use ndarray::{ArrayD, IxDyn};
    use parking_lot::Mutex;

    use super::*;
    use crate::ArraySource;

    fn ramp(shape: &[usize]) -> Buffer {
        let n: usize = shape.iter().product();
        let data: Vec<f64> = (0..n).map(|v| v as f64).collect();
        Buffer::F64(ArrayD::from_shape_vec(IxDyn(shape), data).unwrap())
    }

    fn roi(start: &[i64], stop: &[i64]) -> Roi {
        Roi::new(start.to_vec(), stop.to_vec()).unwrap()
    }

    fn pipeline(graph: &Graph, data: ArraySource, crop: Crop) -> (Op<ArraySource>, Op<Crop>) {
        let source = graph.add_operator(data).unwrap();
        let crop = graph.add_operator(crop).unwrap();
        crop.input(Crop::INPUT).connect(source.output(ArraySource::OUTPUT)).unwrap();
        (source, crop)
    }

    #[test]
    fn test_crop_shifts_requests() {
        let graph = Graph::new(GraphConfig::default().with_num_workers(2)).unwrap();
        let (_, crop) = pipeline(
            &graph,
            ArraySource::new(ramp(&[10, 10])),
            Crop::new(roi(&[2, 3], &[6, 8])),
        );
        assert_eq!(crop.output(Crop::OUTPUT).meta().shape(), Some(&[4, 5][..]));

        let data = crop
            .output(Crop::OUTPUT)
            .get(roi(&[1, 1], &[2, 3]))
            .unwrap()
            .wait_blocking()
            .unwrap();
        let values: Vec<f64> = data.as_f64().unwrap().iter().copied().collect();
        assert_eq!(values, vec![34.0, 35.0]);
    }

    #[test]
    fn test_crop_narrows_dirty_regions() {
        let graph = Graph::new(GraphConfig::default().with_num_workers(1)).unwrap();
        let (source, crop) = pipeline(
            &graph,
            ArraySource::new(ramp(&[100, 100])),
            Crop::new(roi(&[20, 30], &[60, 50])),
        );
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        crop.output(Crop::OUTPUT)
            .register_dirty_callback(move |roi| sink.lock().push(roi.clone()));

        let output = source.output(ArraySource::OUTPUT);
        output.set_dirty(&roi(&[0, 0], &[30, 100])).unwrap();
        output.set_dirty(&roi(&[70, 0], &[80, 100])).unwrap();
        output.set_dirty(&roi(&[25, 35], &[26, 36])).unwrap();

        assert_eq!(
            *seen.lock(),
            vec![roi(&[0, 0], &[10, 20]), roi(&[5, 5], &[6, 6])]
        );
    }

    #[test]
    fn test_singleton_axes_are_dropped() {
        let graph = Graph::new(GraphConfig::default().with_num_workers(1)).unwrap();
        let source = ArraySource::new(ramp(&[10, 4])).with_axis_tags([AxisTag::Y, AxisTag::X]);
        let (source, crop) = pipeline(
            &graph,
            source,
            Crop::new(roi(&[5, 0], &[6, 4])).dropping_singletons(),
        );
        let meta = crop.output(Crop::OUTPUT).meta();
        assert_eq!(meta.shape(), Some(&[4][..]));
        assert_eq!(meta.axis_tags(), Some(&[AxisTag::X][..]));
        assert_eq!(meta.dtype(), Some(DType::F64));

        let data = crop
            .output(Crop::OUTPUT)
            .get(roi(&[1], &[3]))
            .unwrap()
            .wait_blocking()
            .unwrap();
        let values: Vec<f64> = data.as_f64().unwrap().iter().copied().collect();
        assert_eq!(values, vec![21.0, 22.0]);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        crop.output(Crop::OUTPUT)
            .register_dirty_callback(move |roi| sink.lock().push(roi.clone()));
        source.output(ArraySource::OUTPUT).set_dirty(&roi(&[5, 2], &[9, 4])).unwrap();
        assert_eq!(*seen.lock(), vec![roi(&[2], &[4])]);
    }

    #[test]
    fn test_region_outside_input_is_rejected() {
        let graph = Graph::new(GraphConfig::default().with_num_workers(1)).unwrap();
        let source = graph.add_operator(ArraySource::new(ramp(&[4, 4]))).unwrap();
        let crop = graph.add_operator(Crop::new(roi(&[2, 2], &[6, 4]))).unwrap();
        let err = crop
            .input(Crop::INPUT)
            .connect(source.output(ArraySource::OUTPUT))
            .unwrap_err();
        assert!(matches!(err, Error::RoiOutOfBounds { .. }));
    }
}

//! Separable Gaussian smoothing.
//!
//! The filter is truncated at three standard deviations and replicates the
//! border value outside the array. A request for a region reads the region
//! grown by the filter radius (clipped to the input), filters that window
//! and keeps the requested part, so tiles computed independently agree with
//! filtering the whole array at once.

use async_trait::async_trait;
use lazyflow_core::{Buffer, DType, Error, MetaInfo, Result, Roi};
use lazyflow_runtime::{
    ExecuteContext, InputKey, InputSlot, Operator, OperatorContext, OutputKey, OutputSlot, SlotDef,
};
use ndarray::{ArrayD, Axis};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Tracing target for smoothing.
const TRACING_TARGET: &str = "lazyflow_operators::smoothing";

/// Normalized Gaussian weights for offsets `-radius..=radius`.
pub fn gaussian_kernel(sigma: f64, radius: usize) -> Vec<f64> {
    let radius = radius as i64;
    let weights: Vec<f64> = (-radius..=radius)
        .map(|x| (-((x * x) as f64) / (2.0 * sigma * sigma)).exp())
        .collect();
    let total: f64 = weights.iter().sum();
    weights.into_iter().map(|w| w / total).collect()
}

/// Filter radius used for `sigma`.
pub fn gaussian_radius(sigma: f64) -> usize {
    (3.0 * sigma).ceil() as usize
}

/// Smooths `array` along each of `axes`, replicating border values.
pub fn gaussian_filter(array: &ArrayD<f64>, sigma: f64, axes: &[usize]) -> ArrayD<f64> {
    let kernel = gaussian_kernel(sigma, gaussian_radius(sigma));
    axes.iter().fold(array.clone(), |data, &axis| convolve_axis(&data, axis, &kernel))
}

fn convolve_axis(input: &ArrayD<f64>, axis: usize, kernel: &[f64]) -> ArrayD<f64> {
    let radius = (kernel.len() / 2) as isize;
    let mut output = ArrayD::zeros(input.raw_dim());
    for (mut dst, src) in output
        .lanes_mut(Axis(axis))
        .into_iter()
        .zip(input.lanes(Axis(axis)))
    {
        let n = src.len() as isize;
        for i in 0..n {
            dst[i as usize] = kernel
                .iter()
                .enumerate()
                .map(|(k, w)| w * src[(i + k as isize - radius).clamp(0, n - 1) as usize])
                .sum();
        }
    }
    output
}

/// Gaussian smoothing over the spatial axes of its input.
///
/// Without explicit axes every axis except the tagged channel axis is
/// smoothed. Integer inputs produce `f32` output; float inputs keep their
/// element type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GaussianSmoothing {
    sigma: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    axes: Option<Vec<usize>>,
}

impl GaussianSmoothing {
    pub const INPUT: InputKey<Self> = InputKey::new(0, "Input");
    pub const OUTPUT: OutputKey<Self> = OutputKey::new(0, "Output");

    pub fn new(sigma: f64) -> Self {
        Self { sigma, axes: None }
    }

    /// Restricts smoothing to `axes`.
    pub fn with_axes(mut self, axes: impl Into<Vec<usize>>) -> Self {
        self.axes = Some(axes.into());
        self
    }

    pub fn sigma(&self) -> f64 {
        self.sigma
    }

    pub fn radius(&self) -> usize {
        gaussian_radius(self.sigma)
    }

    fn smoothed_axes(&self, meta: &MetaInfo) -> Result<Vec<usize>> {
        let ndim = meta.shape().map_or(0, <[usize]>::len);
        match &self.axes {
            Some(axes) => match axes.iter().find(|&&axis| axis >= ndim) {
                Some(axis) => Err(Error::InvalidConfig(format!(
                    "cannot smooth axis {axis} of a {ndim}-d input"
                ))),
                None => Ok(axes.clone()),
            },
            None => {
                let channel = meta.channel_axis();
                Ok((0..ndim).filter(|&axis| Some(axis) != channel).collect())
            }
        }
    }

    /// Region of the input read to smooth `roi`, and the smoothed axes.
    ///
    /// Smoothed axes grow by the filter radius; the others are read as is.
    fn read_window(&self, input: &InputSlot, roi: &Roi) -> Result<(Roi, Vec<usize>)> {
        let meta = input.meta();
        let shape = meta
            .shape()
            .ok_or_else(|| Error::SlotNotReady(input.qualified_name()))?;
        let axes = self.smoothed_axes(&meta)?;
        let kept: Vec<usize> = (0..shape.len()).filter(|axis| !axes.contains(axis)).collect();
        let halo = vec![self.radius() as i64; shape.len()];
        Ok((roi.expand_clipped(&halo, shape, &kept), axes))
    }
}

#[async_trait]
impl Operator for GaussianSmoothing {
    fn type_name(&self) -> &'static str {
        "GaussianSmoothing"
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
        if !(self.sigma.is_finite() && self.sigma > 0.0) {
            return Err(Error::InvalidConfig(format!(
                "sigma must be positive, got {}",
                self.sigma
            )));
        }
        let mut meta = ctx.input(Self::INPUT).meta();
        self.smoothed_axes(&meta)?;
        if let Some(DType::U8 | DType::U32) = meta.dtype() {
            meta.set_dtype(DType::F32);
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
        let input = ctx.input(Self::INPUT);
        let (window, axes) = self.read_window(input, roi)?;
        tracing::trace!(
            target: TRACING_TARGET,
            operator = %ctx.name(),
            roi = %roi,
            window = %window,
            "smoothing region"
        );

        let data = input.get(window.clone())?.wait().await?;
        let smoothed = gaussian_filter(&data.to_f64(), self.sigma, &axes);
        let result = Buffer::from_f64(smoothed, destination.dtype());
        destination.assign(&result.slice(&roi.relative_to(&window))?)
    }

    fn notify_dirty(&self, ctx: &OperatorContext<'_>, input: &InputSlot, roi: &Roi) -> Result<()> {
        let (window, _) = self.read_window(input, roi)?;
        ctx.output(Self::OUTPUT).set_dirty(&window)
    }

    fn params(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use lazyflow_core::AxisTag;
    use lazyflow_runtime::{Graph, GraphConfig};
    use ndarray::{Dimension, IxDyn};
    use parking_lot::Mutex;

    use super::*;
    use crate::ArraySource;

    fn pattern(shape: &[usize]) -> ArrayD<f64> {
        ArrayD::from_shape_fn(IxDyn(shape), |index| {
            let sum: usize = index.slice().iter().enumerate().map(|(a, &i)| (a + 3) * i).sum();
            (sum % 11) as f64
        })
    }

    fn roi(start: &[i64], stop: &[i64]) -> Roi {
        Roi::new(start.to_vec(), stop.to_vec()).unwrap()
    }

    #[test]
    fn test_kernel_is_normalized() {
        let kernel = gaussian_kernel(2.0, gaussian_radius(2.0));
        assert_eq!(kernel.len(), 13);
        assert!((kernel.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert_eq!(kernel[0], kernel[12]);
        assert!(kernel[6] > kernel[5]);
    }

    #[test]
    fn test_filter_keeps_constants() {
        let array = ArrayD::from_elem(IxDyn(&[7, 9]), 3.5);
        let smoothed = gaussian_filter(&array, 1.5, &[0, 1]);
        assert!(smoothed.iter().all(|v| (v - 3.5).abs() < 1e-12));
    }

    #[test]
    fn test_impulse_response_is_the_kernel() {
        let mut array = ArrayD::zeros(IxDyn(&[21]));
        array[[10]] = 1.0;
        let smoothed = gaussian_filter(&array, 1.0, &[0]);
        let kernel = gaussian_kernel(1.0, 3);
        for (offset, weight) in kernel.iter().enumerate() {
            assert!((smoothed[[7 + offset]] - weight).abs() < 1e-12);
        }
        assert_eq!(smoothed[[6]], 0.0);
    }

    #[test]
    fn test_tiles_match_whole_array() {
        let graph = Graph::new(GraphConfig::default().with_num_workers(2)).unwrap();
        let data = pattern(&[20, 16]);
        let source = graph.add_operator(ArraySource::new(data.clone())).unwrap();
        let blur = graph.add_operator(GaussianSmoothing::new(1.0)).unwrap();
        blur.input(GaussianSmoothing::INPUT)
            .connect(source.output(ArraySource::OUTPUT))
            .unwrap();

        let expected = Buffer::from(gaussian_filter(&data, 1.0, &[0, 1]));
        for tile in [roi(&[0, 0], &[5, 5]), roi(&[8, 3], &[20, 11]), roi(&[17, 12], &[20, 16])] {
            let got = blur
                .output(GaussianSmoothing::OUTPUT)
                .get(tile.clone())
                .unwrap()
                .wait_blocking()
                .unwrap();
            let want = expected.slice(&tile).unwrap();
            let diff = (&got.to_f64() - &want.to_f64()).mapv(f64::abs);
            assert!(diff.iter().all(|&d| d < 1e-9), "tile {tile} differs");
        }
    }

    #[test]
    fn test_channel_axis_is_not_smoothed() {
        let graph = Graph::new(GraphConfig::default().with_num_workers(1)).unwrap();
        let source = ArraySource::new(pattern(&[6, 6, 2])).with_axis_tags([
            AxisTag::Y,
            AxisTag::X,
            AxisTag::C,
        ]);
        let source = graph.add_operator(source).unwrap();
        let blur = graph.add_operator(GaussianSmoothing::new(0.8)).unwrap();
        blur.input(GaussianSmoothing::INPUT)
            .connect(source.output(ArraySource::OUTPUT))
            .unwrap();

        let got = blur
            .output(GaussianSmoothing::OUTPUT)
            .get(Roi::full(&[6, 6, 2]))
            .unwrap()
            .wait_blocking()
            .unwrap();
        let want = gaussian_filter(&pattern(&[6, 6, 2]), 0.8, &[0, 1]);
        assert_eq!(got.to_f64(), want);
    }

    #[test]
    fn test_integer_input_gives_float_output() {
        let graph = Graph::new(GraphConfig::default().with_num_workers(1)).unwrap();
        let source = graph
            .add_operator(ArraySource::constant(&[4, 4], DType::U8, 9.0))
            .unwrap();
        let blur = graph.add_operator(GaussianSmoothing::new(1.0)).unwrap();
        blur.input(GaussianSmoothing::INPUT)
            .connect(source.output(ArraySource::OUTPUT))
            .unwrap();
        assert_eq!(blur.output(GaussianSmoothing::OUTPUT).meta().dtype(), Some(DType::F32));
    }

    #[test]
    fn test_invalid_parameters_are_rejected() {
        let graph = Graph::new(GraphConfig::default().with_num_workers(1)).unwrap();
        let source = graph
            .add_operator(ArraySource::constant(&[4, 4], DType::F64, 1.0))
            .unwrap();
        for blur in [GaussianSmoothing::new(0.0), GaussianSmoothing::new(1.0).with_axes([2])] {
            let blur = graph.add_operator(blur).unwrap();
            let err = blur
                .input(GaussianSmoothing::INPUT)
                .connect(source.output(ArraySource::OUTPUT))
                .unwrap_err();
            assert!(err.is_configuration());
        }
    }

    #[test]
    fn test_dirty_region_grows_by_radius() {
        let graph = Graph::new(GraphConfig::default().with_num_workers(1)).unwrap();
        let source = graph
            .add_operator(ArraySource::constant(&[50, 50], DType::F64, 1.0))
            .unwrap();
        let blur = graph.add_operator(GaussianSmoothing::new(1.0)).unwrap();
        blur.input(GaussianSmoothing::INPUT)
            .connect(source.output(ArraySource::OUTPUT))
            .unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        blur.output(GaussianSmoothing::OUTPUT)
            .register_dirty_callback(move |roi| sink.lock().push(roi.clone()));

        source
            .output(ArraySource::OUTPUT)
            .set_dirty(&roi(&[1, 20], &[2, 30]))
            .unwrap();
        assert_eq!(*seen.lock(), vec![roi(&[0, 17], &[5, 33])]);
    }

    #[test]
    fn test_dirty_region_keeps_channel_extent() {
        let graph = Graph::new(GraphConfig::default().with_num_workers(1)).unwrap();
        let source = ArraySource::new(pattern(&[10, 10, 2])).with_axis_tags([
            AxisTag::Y,
            AxisTag::X,
            AxisTag::C,
        ]);
        let source = graph.add_operator(source).unwrap();
        let blur = graph.add_operator(GaussianSmoothing::new(1.0)).unwrap();
        blur.input(GaussianSmoothing::INPUT)
            .connect(source.output(ArraySource::OUTPUT))
            .unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        blur.output(GaussianSmoothing::OUTPUT)
            .register_dirty_callback(move |roi| sink.lock().push(roi.clone()));

        source
            .output(ArraySource::OUTPUT)
            .set_dirty(&roi(&[4, 4, 1], &[5, 5, 2]))
            .unwrap();
        assert_eq!(*seen.lock(), vec![roi(&[1, 1, 1], &[8, 8, 2])]);
    }
}

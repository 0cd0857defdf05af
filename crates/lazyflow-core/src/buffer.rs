//! Owned n-dimensional array storage.

use ndarray::{ArrayD, IxDyn, Slice};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::meta::{DType, MetaInfo};
use crate::roi::Roi;

/// Dense array of one of the supported element types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Buffer {
    U8(ArrayD<u8>),
    U32(ArrayD<u32>),
    F32(ArrayD<f32>),
    F64(ArrayD<f64>),
}

macro_rules! each_variant {
    ($value:expr, $array:ident => $body:expr) => {
        match $value {
            Buffer::U8($array) => $body,
            Buffer::U32($array) => $body,
            Buffer::F32($array) => $body,
            Buffer::F64($array) => $body,
        }
    };
}

macro_rules! typed_access {
    ($(($variant:ident, $ty:ty, $get:ident, $get_mut:ident)),* $(,)?) => {
        $(
            #[doc = concat!("Borrows the array when the element type is `", stringify!($ty), "`.")]
            pub fn $get(&self) -> Result<&ArrayD<$ty>> {
                match self {
                    Self::$variant(array) => Ok(array),
                    other => Err(Error::DTypeMismatch {
                        expected: DType::$variant,
                        found: other.dtype(),
                    }),
                }
            }

            #[doc = concat!("Mutably borrows the array when the element type is `", stringify!($ty), "`.")]
            pub fn $get_mut(&mut self) -> Result<&mut ArrayD<$ty>> {
                match self {
                    Self::$variant(array) => Ok(array),
                    other => Err(Error::DTypeMismatch {
                        expected: DType::$variant,
                        found: other.dtype(),
                    }),
                }
            }
        )*
    };
}

impl Buffer {
    /// Allocates a zero-filled buffer.
    pub fn zeros(dtype: DType, shape: &[usize]) -> Self {
        tracing::trace!(
            target: crate::TRACING_TARGET,
            dtype = %dtype,
            shape = ?shape,
            "allocating buffer"
        );
        let dim = IxDyn(shape);
        match dtype {
            DType::U8 => Self::U8(ArrayD::zeros(dim)),
            DType::U32 => Self::U32(ArrayD::zeros(dim)),
            DType::F32 => Self::F32(ArrayD::zeros(dim)),
            DType::F64 => Self::F64(ArrayD::zeros(dim)),
        }
    }

    /// One-element `f64` buffer of shape `[1]`, used for scalar slot values.
    pub fn scalar(value: f64) -> Self {
        Self::F64(ArrayD::from_elem(IxDyn(&[1]), value))
    }

    /// Builds a buffer of `dtype` from `f64` data, casting every element.
    pub fn from_f64(array: ArrayD<f64>, dtype: DType) -> Self {
        match dtype {
            DType::U8 => Self::U8(array.mapv(|v| v as u8)),
            DType::U32 => Self::U32(array.mapv(|v| v as u32)),
            DType::F32 => Self::F32(array.mapv(|v| v as f32)),
            DType::F64 => Self::F64(array),
        }
    }

    pub fn dtype(&self) -> DType {
        match self {
            Self::U8(_) => DType::U8,
            Self::U32(_) => DType::U32,
            Self::F32(_) => DType::F32,
            Self::F64(_) => DType::F64,
        }
    }

    pub fn shape(&self) -> &[usize] {
        each_variant!(self, array => array.shape())
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        each_variant!(self, array => array.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size of the element data in bytes.
    pub fn num_bytes(&self) -> usize {
        self.len() * self.dtype().size_of()
    }

    /// Metadata describing this buffer.
    pub fn meta(&self) -> MetaInfo {
        MetaInfo::new(self.shape().to_vec(), self.dtype())
    }

    /// Copies the elements inside `roi` into a new buffer.
    pub fn slice(&self, roi: &Roi) -> Result<Buffer> {
        self.check_region(roi)?;
        Ok(each_variant!(self, array => {
            array
                .slice_each_axis(|axis| axis_slice(roi, axis.axis.index()))
                .to_owned()
                .into()
        }))
    }

    /// Overwrites the elements inside `roi` with `src`.
    pub fn assign_region(&mut self, roi: &Roi, src: &Buffer) -> Result<()> {
        self.check_region(roi)?;
        let expected = roi.shape();
        if src.shape() != expected.as_slice() {
            return Err(Error::ShapeMismatch {
                expected,
                found: src.shape().to_vec(),
            });
        }
        match (self, src) {
            (Self::U8(dst), Self::U8(src)) => assign_view(dst, roi, src),
            (Self::U32(dst), Self::U32(src)) => assign_view(dst, roi, src),
            (Self::F32(dst), Self::F32(src)) => assign_view(dst, roi, src),
            (Self::F64(dst), Self::F64(src)) => assign_view(dst, roi, src),
            (dst, src) => {
                return Err(Error::DTypeMismatch {
                    expected: dst.dtype(),
                    found: src.dtype(),
                });
            }
        }
        Ok(())
    }

    /// Overwrites the whole buffer with `src`.
    pub fn assign(&mut self, src: &Buffer) -> Result<()> {
        let roi = Roi::full(self.shape());
        self.assign_region(&roi, src)
    }

    /// Copies the elements into a buffer of `shape`, in row-major order.
    ///
    /// The element count must not change.
    pub fn reshape(&self, shape: &[usize]) -> Result<Buffer> {
        let mismatch = || Error::ShapeMismatch {
            expected: shape.to_vec(),
            found: self.shape().to_vec(),
        };
        Ok(each_variant!(self, array => {
            array
                .to_shape(shape)
                .map_err(|_| mismatch())?
                .into_owned()
                .into()
        }))
    }

    /// Sets every element to `value`, cast to the element type.
    pub fn fill(&mut self, value: f64) {
        match self {
            Self::U8(array) => array.fill(value as u8),
            Self::U32(array) => array.fill(value as u32),
            Self::F32(array) => array.fill(value as f32),
            Self::F64(array) => array.fill(value),
        }
    }

    /// Copies the elements into an `f64` array.
    pub fn to_f64(&self) -> ArrayD<f64> {
        match self {
            Self::U8(array) => array.mapv(f64::from),
            Self::U32(array) => array.mapv(f64::from),
            Self::F32(array) => array.mapv(f64::from),
            Self::F64(array) => array.clone(),
        }
    }

    /// First element as `f64`; used to read scalar slot values.
    pub fn scalar_f64(&self) -> Result<f64> {
        let first = match self {
            Self::U8(array) => array.iter().next().map(|&v| f64::from(v)),
            Self::U32(array) => array.iter().next().map(|&v| f64::from(v)),
            Self::F32(array) => array.iter().next().map(|&v| f64::from(v)),
            Self::F64(array) => array.iter().next().copied(),
        };
        first.ok_or_else(|| Error::ShapeMismatch {
            expected: vec![1],
            found: self.shape().to_vec(),
        })
    }

    typed_access!(
        (U8, u8, as_u8, as_u8_mut),
        (U32, u32, as_u32, as_u32_mut),
        (F32, f32, as_f32, as_f32_mut),
        (F64, f64, as_f64, as_f64_mut),
    );

    fn check_region(&self, roi: &Roi) -> Result<()> {
        if roi.fits_in(self.shape()) {
            Ok(())
        } else {
            Err(Error::RoiOutOfBounds {
                roi: roi.clone(),
                shape: self.shape().to_vec(),
            })
        }
    }
}

impl From<ArrayD<u8>> for Buffer {
    fn from(array: ArrayD<u8>) -> Self {
        Self::U8(array)
    }
}

impl From<ArrayD<u32>> for Buffer {
    fn from(array: ArrayD<u32>) -> Self {
        Self::U32(array)
    }
}

impl From<ArrayD<f32>> for Buffer {
    fn from(array: ArrayD<f32>) -> Self {
        Self::F32(array)
    }
}

impl From<ArrayD<f64>> for Buffer {
    fn from(array: ArrayD<f64>) -> Self {
        Self::F64(array)
    }
}

fn axis_slice(roi: &Roi, axis: usize) -> Slice {
    Slice::from(roi.start()[axis] as isize..roi.stop()[axis] as isize)
}

fn assign_view<A: Clone>(dst: &mut ArrayD<A>, roi: &Roi, src: &ArrayD<A>) {
    dst.slice_each_axis_mut(|axis| axis_slice(roi, axis.axis.index()))
        .assign(src);
}

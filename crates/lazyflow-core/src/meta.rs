//! Slot metadata: shape, element type and axis tags.

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString, IntoStaticStr};

/// Element type of an array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(AsRefStr, Display, EnumString, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DType {
    U8,
    U32,
    F32,
    F64,
}

impl DType {
    /// Size of one element in bytes.
    pub const fn size_of(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::U32 | Self::F32 => 4,
            Self::F64 => 8,
        }
    }
}

/// Meaning of an array axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(AsRefStr, Display, EnumString, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum AxisTag {
    T,
    Z,
    Y,
    X,
    C,
}

impl AxisTag {
    /// Returns true for the spatial axes.
    pub const fn is_spatial(self) -> bool {
        matches!(self, Self::X | Self::Y | Self::Z)
    }
}

/// Descriptor attached to every slot.
///
/// A slot is ready once shape and dtype are both known. Every setter
/// raises the dirty flag when the stored attribute actually changes; the
/// owning slot clears it after downstream operators have been told.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetaInfo {
    shape: Option<Vec<usize>>,
    dtype: Option<DType>,
    axis_tags: Option<Vec<AxisTag>>,
    #[serde(skip)]
    dirty: bool,
}

impl MetaInfo {
    /// Creates ready metadata for the given shape and element type.
    pub fn new(shape: impl Into<Vec<usize>>, dtype: DType) -> Self {
        Self {
            shape: Some(shape.into()),
            dtype: Some(dtype),
            axis_tags: None,
            dirty: true,
        }
    }

    /// Attaches axis tags.
    #[must_use]
    pub fn with_axis_tags(mut self, tags: impl Into<Vec<AxisTag>>) -> Self {
        self.axis_tags = Some(tags.into());
        self
    }

    pub fn shape(&self) -> Option<&[usize]> {
        self.shape.as_deref()
    }

    pub fn dtype(&self) -> Option<DType> {
        self.dtype
    }

    pub fn axis_tags(&self) -> Option<&[AxisTag]> {
        self.axis_tags.as_deref()
    }

    /// Returns true once shape and dtype are both set.
    pub fn is_ready(&self) -> bool {
        self.shape.is_some() && self.dtype.is_some()
    }

    /// Index of the channel axis, if tagged.
    pub fn channel_axis(&self) -> Option<usize> {
        self.axis_tags
            .as_ref()
            .and_then(|tags| tags.iter().position(|t| *t == AxisTag::C))
    }

    /// Size in bytes of the full array described.
    pub fn num_bytes(&self) -> Option<usize> {
        let shape = self.shape.as_ref()?;
        let dtype = self.dtype?;
        Some(shape.iter().product::<usize>() * dtype.size_of())
    }

    pub fn set_shape(&mut self, shape: impl Into<Vec<usize>>) {
        let shape = Some(shape.into());
        if self.shape != shape {
            self.shape = shape;
            self.dirty = true;
        }
    }

    pub fn set_dtype(&mut self, dtype: DType) {
        if self.dtype != Some(dtype) {
            self.dtype = Some(dtype);
            self.dirty = true;
        }
    }

    pub fn set_axis_tags(&mut self, tags: Option<Vec<AxisTag>>) {
        if self.axis_tags != tags {
            self.axis_tags = tags;
            self.dirty = true;
        }
    }

    /// Copies every attribute of `other`, raising the dirty flag on change.
    pub fn assign(&mut self, other: &MetaInfo) {
        if self != other {
            self.shape = other.shape.clone();
            self.dtype = other.dtype;
            self.axis_tags = other.axis_tags.clone();
            self.dirty = true;
        }
    }

    /// Forgets every attribute, making the metadata not ready.
    pub fn reset(&mut self) {
        self.assign(&MetaInfo::default());
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Clears the dirty flag, returning its previous value.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }
}

impl PartialEq for MetaInfo {
    fn eq(&self, other: &Self) -> bool {
        self.shape == other.shape && self.dtype == other.dtype && self.axis_tags == other.axis_tags
    }
}

//! Regions of interest.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Hyper-rectangular region of an n-dimensional array.
///
/// `start` is inclusive and `stop` exclusive on every axis. Geometric
/// helpers never mutate the receiver; they return a new region.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Roi {
    start: Vec<i64>,
    stop: Vec<i64>,
}

impl Roi {
    /// Creates a region, validating that both corners have the same
    /// dimensionality and that no axis is inverted.
    pub fn new(start: impl Into<Vec<i64>>, stop: impl Into<Vec<i64>>) -> Result<Self> {
        let start = start.into();
        let stop = stop.into();
        if start.len() != stop.len() {
            return Err(Error::InvalidRoi(format!(
                "start has {} axes but stop has {}",
                start.len(),
                stop.len()
            )));
        }
        if let Some(axis) = (0..start.len()).find(|&i| stop[i] < start[i]) {
            return Err(Error::InvalidRoi(format!(
                "axis {axis} is inverted ({}:{})",
                start[axis], stop[axis]
            )));
        }
        Ok(Self { start, stop })
    }

    /// Region covering a whole array of the given shape.
    pub fn full(shape: &[usize]) -> Self {
        Self {
            start: vec![0; shape.len()],
            stop: shape.iter().map(|&n| n as i64).collect(),
        }
    }

    /// Inclusive start corner.
    #[inline]
    pub fn start(&self) -> &[i64] {
        &self.start
    }

    /// Exclusive stop corner.
    #[inline]
    pub fn stop(&self) -> &[i64] {
        &self.stop
    }

    /// Number of axes.
    #[inline]
    pub fn dim(&self) -> usize {
        self.start.len()
    }

    /// Extent along every axis.
    pub fn shape(&self) -> Vec<usize> {
        self.start
            .iter()
            .zip(&self.stop)
            .map(|(a, b)| (b - a).max(0) as usize)
            .collect()
    }

    /// Number of elements covered.
    pub fn num_elements(&self) -> usize {
        self.shape().iter().product()
    }

    /// Returns true when some axis has zero extent.
    pub fn is_empty(&self) -> bool {
        self.start.iter().zip(&self.stop).any(|(a, b)| b <= a)
    }

    /// Returns true when the region lies inside `[0, shape)`.
    pub fn fits_in(&self, shape: &[usize]) -> bool {
        self.dim() == shape.len()
            && self
                .start
                .iter()
                .zip(&self.stop)
                .zip(shape)
                .all(|((&a, &b), &n)| a >= 0 && b <= n as i64)
    }

    /// Returns true when `other` lies entirely inside `self`.
    pub fn contains(&self, other: &Roi) -> bool {
        self.dim() == other.dim()
            && (0..self.dim())
                .all(|i| self.start[i] <= other.start[i] && other.stop[i] <= self.stop[i])
    }

    /// Overlap of two regions, or `None` when they do not overlap.
    pub fn intersect(&self, other: &Roi) -> Option<Roi> {
        if self.dim() != other.dim() {
            return None;
        }
        let start: Vec<i64> = (0..self.dim())
            .map(|i| self.start[i].max(other.start[i]))
            .collect();
        let stop: Vec<i64> = (0..self.dim())
            .map(|i| self.stop[i].min(other.stop[i]))
            .collect();
        let roi = Roi { start, stop };
        (!roi.is_empty()).then_some(roi)
    }

    /// Returns true when the regions overlap.
    pub fn intersects(&self, other: &Roi) -> bool {
        self.intersect(other).is_some()
    }

    /// Shifts the region by `offset`. Missing offset entries count as zero.
    pub fn translate(&self, offset: &[i64]) -> Roi {
        let delta = |i: usize| offset.get(i).copied().unwrap_or(0);
        Roi {
            start: self.start.iter().enumerate().map(|(i, a)| a + delta(i)).collect(),
            stop: self.stop.iter().enumerate().map(|(i, b)| b + delta(i)).collect(),
        }
    }

    /// Expresses the region in the coordinates of `outer`.
    pub fn relative_to(&self, outer: &Roi) -> Roi {
        let offset: Vec<i64> = outer.start.iter().map(|a| -a).collect();
        self.translate(&offset)
    }

    /// Grows the region by `halo` elements on both sides of every axis.
    /// Missing halo entries count as zero.
    pub fn expand(&self, halo: &[i64]) -> Roi {
        let amount = |i: usize| halo.get(i).copied().unwrap_or(0);
        Roi {
            start: self.start.iter().enumerate().map(|(i, a)| a - amount(i)).collect(),
            stop: self.stop.iter().enumerate().map(|(i, b)| b + amount(i)).collect(),
        }
    }

    /// Intersects the region with `[0, shape)`.
    pub fn clip_to(&self, shape: &[usize]) -> Roi {
        let start = self
            .start
            .iter()
            .zip(shape)
            .map(|(&a, &n)| a.clamp(0, n as i64))
            .collect();
        let stop = self
            .stop
            .iter()
            .zip(shape)
            .map(|(&b, &n)| b.clamp(0, n as i64))
            .collect();
        Roi { start, stop }
    }

    /// Grows the region by `halo` and clips the result into `shape`.
    ///
    /// Axes listed in `keep` are neither grown nor clipped.
    pub fn expand_clipped(&self, halo: &[i64], shape: &[usize], keep: &[usize]) -> Roi {
        let mut grown = self.expand(halo).clip_to(shape);
        for &axis in keep.iter().filter(|&&axis| axis < self.dim()) {
            grown.start[axis] = self.start[axis];
            grown.stop[axis] = self.stop[axis];
        }
        grown
    }

    /// Region of the same extent centered inside an array of `shape`.
    pub fn center_in(&self, shape: &[usize]) -> Roi {
        let extent = self.shape();
        let start: Vec<i64> = extent
            .iter()
            .zip(shape)
            .map(|(&e, &n)| (n as i64 - e as i64) / 2)
            .collect();
        let stop = start.iter().zip(&extent).map(|(a, &e)| a + e as i64).collect();
        Roi { start, stop }
    }

    /// Inserts a new axis at `axis`.
    pub fn insert_axis(&self, axis: usize, start: i64, stop: i64) -> Result<Roi> {
        if axis > self.dim() {
            return Err(Error::InvalidRoi(format!(
                "cannot insert axis {axis} into a {}-d region",
                self.dim()
            )));
        }
        let mut roi = self.clone();
        roi.start.insert(axis, start);
        roi.stop.insert(axis, stop);
        Roi::new(roi.start, roi.stop)
    }

    /// Removes `axis`.
    pub fn remove_axis(&self, axis: usize) -> Result<Roi> {
        if axis >= self.dim() {
            return Err(Error::InvalidRoi(format!(
                "cannot remove axis {axis} from a {}-d region",
                self.dim()
            )));
        }
        let mut roi = self.clone();
        roi.start.remove(axis);
        roi.stop.remove(axis);
        Ok(roi)
    }

    /// Replaces the bounds of `axis`.
    pub fn set_axis(&self, axis: usize, start: i64, stop: i64) -> Result<Roi> {
        if axis >= self.dim() {
            return Err(Error::InvalidRoi(format!(
                "axis {axis} is out of range for a {}-d region",
                self.dim()
            )));
        }
        let mut roi = self.clone();
        roi.start[axis] = start;
        roi.stop[axis] = stop;
        Roi::new(roi.start, roi.stop)
    }
}

impl fmt::Display for Roi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, (a, b)) in self.start.iter().zip(&self.stop).enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{a}:{b}")?;
        }
        f.write_str("]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roi(start: &[i64], stop: &[i64]) -> Roi {
        Roi::new(start.to_vec(), stop.to_vec()).unwrap()
    }

    #[test]
    fn test_new_rejects_malformed() {
        assert!(Roi::new(vec![0, 0], vec![1]).is_err());
        assert!(Roi::new(vec![5], vec![2]).is_err());
        assert!(Roi::new(vec![2], vec![2]).unwrap().is_empty());
    }

    #[test]
    fn test_shape_and_display() {
        let r = roi(&[10, 10, 0], &[40, 40, 3]);
        assert_eq!(r.shape(), vec![30, 30, 3]);
        assert_eq!(r.num_elements(), 2700);
        assert_eq!(r.to_string(), "[10:40, 10:40, 0:3]");
    }

    #[test]
    fn test_intersect() {
        let a = roi(&[0, 0], &[10, 10]);
        let b = roi(&[5, 8], &[20, 9]);
        assert_eq!(a.intersect(&b), Some(roi(&[5, 8], &[10, 9])));
        assert_eq!(a.intersect(&roi(&[10, 0], &[12, 5])), None);
        assert!(a.contains(&roi(&[1, 1], &[2, 2])));
        assert!(!a.contains(&b));
    }

    #[test]
    fn test_expand_clipped_keeps_inside_shape() {
        let r = roi(&[2, 50, 0], &[10, 98, 3]);
        let padded = r.expand_clipped(&[6, 6, 0], &[100, 100, 3], &[]);
        assert_eq!(padded, roi(&[0, 44, 0], &[16, 100, 3]));
    }

    #[test]
    fn test_expand_clipped_leaves_kept_axes() {
        let r = roi(&[2, 50, 1], &[10, 98, 2]);
        let padded = r.expand_clipped(&[4, 4, 4], &[100, 100, 3], &[2]);
        assert_eq!(padded, roi(&[0, 46, 1], &[14, 100, 2]));

        // Kept axes are not clipped either, and unknown axes are ignored.
        let outside = roi(&[-1, 0], &[5, 4]);
        assert_eq!(
            outside.expand_clipped(&[1, 1], &[4, 4], &[0, 7]),
            roi(&[-1, 0], &[5, 4])
        );
    }

    #[test]
    fn test_translate_and_relative() {
        let outer = roi(&[4, 4], &[20, 20]);
        let inner = roi(&[6, 10], &[8, 12]);
        assert_eq!(inner.relative_to(&outer), roi(&[2, 6], &[4, 8]));
        assert_eq!(inner.translate(&[-6]), roi(&[0, 10], &[2, 12]));
    }

    #[test]
    fn test_center_in() {
        let r = roi(&[0, 0], &[4, 6]);
        assert_eq!(r.center_in(&[10, 10]), roi(&[3, 2], &[7, 8]));
    }

    #[test]
    fn test_axis_editing() {
        let r = roi(&[1, 2], &[3, 4]);
        let r3 = r.insert_axis(0, 0, 5).unwrap();
        assert_eq!(r3, roi(&[0, 1, 2], &[5, 3, 4]));
        assert_eq!(r3.remove_axis(0).unwrap(), r);
        assert_eq!(r.set_axis(1, 0, 1).unwrap(), roi(&[1, 0], &[3, 1]));
        assert!(r.remove_axis(2).is_err());
        assert!(r.set_axis(0, 4, 1).is_err());
    }

    #[test]
    fn test_fits_in() {
        assert!(roi(&[0, 0], &[4, 4]).fits_in(&[4, 4]));
        assert!(!roi(&[0, 0], &[5, 4]).fits_in(&[4, 4]));
        assert!(!roi(&[-1, 0], &[2, 4]).fits_in(&[4, 4]));
        assert!(!roi(&[0], &[2]).fits_in(&[4, 4]));
    }
}

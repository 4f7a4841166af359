//! Bounding box of a mask.

use ndarray::{Array3, ArrayD, ArrayView3, ArrayViewD, Axis, Slice, s};

use crate::error::{Error, Result};

/// Minimal axis-aligned box holding every true voxel of a mask.
///
/// Bounds are half-open per axis. An empty mask gives the empty box, whose
/// extent is zero along every axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundingBox {
    start: [usize; 3],
    end: [usize; 3],
}

impl BoundingBox {
    pub fn from_mask(mask: &ArrayView3<'_, bool>) -> Self {
        let mut start = [usize::MAX; 3];
        let mut end = [0usize; 3];
        let mut any = false;
        for ((i, j, k), &set) in mask.indexed_iter() {
            if !set {
                continue;
            }
            any = true;
            for (a, idx) in [i, j, k].into_iter().enumerate() {
                start[a] = start[a].min(idx);
                end[a] = end[a].max(idx + 1);
            }
        }
        if any { Self { start, end } } else { Self::empty() }
    }

    /// Box covering a whole grid.
    pub fn full(shape: [usize; 3]) -> Self {
        Self {
            start: [0; 3],
            end: shape,
        }
    }

    pub fn empty() -> Self {
        Self {
            start: [0; 3],
            end: [0; 3],
        }
    }

    pub fn start(&self) -> [usize; 3] {
        self.start
    }

    pub fn end(&self) -> [usize; 3] {
        self.end
    }

    pub fn shape(&self) -> [usize; 3] {
        std::array::from_fn(|a| self.end[a] - self.start[a])
    }

    pub fn is_empty(&self) -> bool {
        self.shape().contains(&0)
    }

    /// Crop a mask to the box.
    pub fn crop_mask(&self, mask: &ArrayView3<'_, bool>) -> Array3<bool> {
        mask.slice(s![
            self.start[0]..self.end[0],
            self.start[1]..self.end[1],
            self.start[2]..self.end[2]
        ])
        .to_owned()
    }

    /// Crop the first three axes of a 3-D or 4-D array to the box.
    pub fn crop<A: Clone>(&self, array: &ArrayViewD<'_, A>) -> Result<ArrayD<A>> {
        if array.ndim() < 3 || (0..3).any(|a| array.shape()[a] < self.end[a]) {
            return Err(Error::Shape(format!(
                "cannot crop array of shape {:?} to box {:?}..{:?}",
                array.shape(),
                self.start,
                self.end
            )));
        }
        let mut view = array.view();
        for a in 0..3 {
            view.slice_axis_inplace(Axis(a), Slice::from(self.start[a]..self.end[a]));
        }
        Ok(view.to_owned())
    }

    /// Write a box-shaped array into the matching region of a full-grid array.
    pub fn place(&self, full: &mut ArrayD<f32>, boxed: &ArrayViewD<'_, f32>) -> Result<()> {
        let expected: Vec<usize> = self
            .shape()
            .into_iter()
            .chain(full.shape().iter().skip(3).copied())
            .collect();
        if full.ndim() < 3 || boxed.shape() != expected.as_slice() {
            return Err(Error::Shape(format!(
                "cannot place array of shape {:?} into {:?} at {:?}",
                boxed.shape(),
                full.shape(),
                self.start
            )));
        }
        let mut region = full.view_mut();
        for a in 0..3 {
            region.slice_axis_inplace(Axis(a), Slice::from(self.start[a]..self.end[a]));
        }
        region.assign(boxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array3, IxDyn};

    #[test]
    fn test_from_mask() {
        let mut mask = Array3::from_elem((5, 5, 5), false);
        mask[[1, 2, 3]] = true;
        mask[[3, 2, 1]] = true;

        let bb = BoundingBox::from_mask(&mask.view());
        assert_eq!(bb.start(), [1, 2, 1]);
        assert_eq!(bb.end(), [4, 3, 4]);
        assert_eq!(bb.shape(), [3, 1, 3]);
    }

    #[test]
    fn test_empty_mask() {
        let mask = Array3::from_elem((3, 3, 3), false);
        let bb = BoundingBox::from_mask(&mask.view());
        assert!(bb.is_empty());
        assert_eq!(bb.shape(), [0, 0, 0]);
    }

    #[test]
    fn test_crop_4d() {
        let data = ArrayD::from_shape_fn(IxDyn(&[4, 4, 4, 2]), |ix| (ix[0] * 100 + ix[3]) as f32);
        let bb = BoundingBox {
            start: [1, 0, 0],
            end: [3, 2, 4],
        };
        let cropped = bb.crop(&data.view()).unwrap();
        assert_eq!(cropped.shape(), &[2, 2, 4, 2]);
        assert_eq!(cropped[[0, 0, 0, 1]], 101.0);
    }

    #[test]
    fn test_crop_out_of_range() {
        let data = ArrayD::<f32>::zeros(IxDyn(&[2, 2, 2]));
        let bb = BoundingBox::full([3, 2, 2]);
        assert!(bb.crop(&data.view()).is_err());
    }

    #[test]
    fn test_place() {
        let mut full = ArrayD::<f32>::zeros(IxDyn(&[4, 4, 4]));
        let bb = BoundingBox {
            start: [1, 1, 1],
            end: [3, 2, 2],
        };
        let boxed = ArrayD::from_elem(IxDyn(&[2, 1, 1]), 7.0f32);
        bb.place(&mut full, &boxed.view()).unwrap();

        assert_eq!(full[[1, 1, 1]], 7.0);
        assert_eq!(full[[2, 1, 1]], 7.0);
        assert_eq!(full.sum(), 14.0);
    }

    #[test]
    fn test_place_shape_mismatch() {
        let mut full = ArrayD::<f32>::zeros(IxDyn(&[4, 4, 4]));
        let bb = BoundingBox::full([2, 2, 2]);
        let boxed = ArrayD::<f32>::zeros(IxDyn(&[3, 2, 2]));
        assert!(bb.place(&mut full, &boxed.view()).is_err());
    }
}

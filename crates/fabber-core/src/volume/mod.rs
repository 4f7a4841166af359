//! Volumes, masks and their geometry.
//!
//! - `grid` - axis-aligned voxel grids
//! - `bbox` - mask bounding boxes, cropping and placement

mod bbox;
mod grid;

pub use bbox::BoundingBox;
pub use grid::Grid;

use ndarray::{Array3, ArrayD, ArrayView3, IxDyn};

use crate::error::{Error, Result};

/// Boolean mask over a grid's spatial dimensions.
pub type Mask = Array3<bool>;

/// Number of true voxels in a mask.
pub fn count_voxels(mask: &ArrayView3<'_, bool>) -> usize {
    mask.iter().filter(|&&set| set).count()
}

/// Dense 3-D or 4-D array on a grid.
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    grid: Grid,
    data: ArrayD<f32>,
}

impl Volume {
    /// Wrap an array, checking that its spatial dimensions match the grid.
    pub fn new(grid: Grid, data: ArrayD<f32>) -> Result<Self> {
        if !(data.ndim() == 3 || data.ndim() == 4) || data.shape()[..3] != grid.shape {
            return Err(Error::Shape(format!(
                "volume of shape {:?} does not fit grid {:?}",
                data.shape(),
                grid.shape
            )));
        }
        Ok(Self { grid, data })
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    pub fn data(&self) -> &ArrayD<f32> {
        &self.data
    }

    pub fn into_data(self) -> ArrayD<f32> {
        self.data
    }

    /// Length of the trailing axis for 4-D volumes.
    pub fn nvols(&self) -> Option<usize> {
        (self.data.ndim() == 4).then(|| self.data.shape()[3])
    }

    /// Nearest-neighbour resample onto another grid.
    ///
    /// Target voxels falling outside this volume's grid are zero.
    pub fn resample(&self, target: &Grid) -> ArrayD<f32> {
        if *target == self.grid {
            return self.data.clone();
        }
        let nt = self.nvols().unwrap_or(1);
        let mut shape = target.shape.to_vec();
        if let Some(n) = self.nvols() {
            shape.push(n);
        }
        let mut out = ArrayD::<f32>::zeros(IxDyn(&shape));
        for i in 0..target.shape[0] {
            for j in 0..target.shape[1] {
                for k in 0..target.shape[2] {
                    let Some([si, sj, sk]) = self.grid.world_to_voxel(target.voxel_to_world([i, j, k])) else {
                        continue;
                    };
                    if self.nvols().is_some() {
                        for t in 0..nt {
                            out[&[i, j, k, t][..]] = self.data[&[si, sj, sk, t][..]];
                        }
                    } else {
                        out[&[i, j, k][..]] = self.data[&[si, sj, sk][..]];
                    }
                }
            }
        }
        out
    }

    /// Threshold into a mask (voxels > 0 are set). 4-D volumes use the first volume.
    pub fn to_mask(&self) -> Mask {
        Array3::from_shape_fn(
            (self.grid.shape[0], self.grid.shape[1], self.grid.shape[2]),
            |(i, j, k)| {
                if self.data.ndim() == 4 {
                    self.data[&[i, j, k, 0][..]] > 0.0
                } else {
                    self.data[&[i, j, k][..]] > 0.0
                }
            },
        )
    }
}

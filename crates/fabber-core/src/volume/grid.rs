//! Axis-aligned voxel grids.

use serde::{Deserialize, Serialize};

/// Spatial grid a volume is defined on.
///
/// Voxel `(i, j, k)` sits at world position `origin + spacing * (i, j, k)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Grid {
    pub shape: [usize; 3],
    #[serde(default)]
    pub origin: [f64; 3],
    #[serde(default = "unit_spacing")]
    pub spacing: [f64; 3],
}

fn unit_spacing() -> [f64; 3] {
    [1.0; 3]
}

impl Grid {
    /// Unit-spaced grid at the world origin.
    pub fn new(shape: [usize; 3]) -> Self {
        Self {
            shape,
            origin: [0.0; 3],
            spacing: unit_spacing(),
        }
    }

    pub fn with_geometry(shape: [usize; 3], origin: [f64; 3], spacing: [f64; 3]) -> Self {
        Self {
            shape,
            origin,
            spacing,
        }
    }

    /// Total number of voxels.
    pub fn nvoxels(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn voxel_to_world(&self, voxel: [usize; 3]) -> [f64; 3] {
        std::array::from_fn(|a| self.origin[a] + self.spacing[a] * voxel[a] as f64)
    }

    /// Nearest voxel to a world position, if it lies inside the grid.
    pub fn world_to_voxel(&self, pos: [f64; 3]) -> Option<[usize; 3]> {
        let mut voxel = [0usize; 3];
        for a in 0..3 {
            let idx = ((pos[a] - self.origin[a]) / self.spacing[a]).round();
            if !(idx >= 0.0 && (idx as usize) < self.shape[a]) {
                return None;
            }
            voxel[a] = idx as usize;
        }
        Some(voxel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_grid_round_trip() {
        let grid = Grid::new([4, 4, 3]);
        assert_eq!(grid.nvoxels(), 48);
        assert_eq!(grid.world_to_voxel(grid.voxel_to_world([3, 1, 2])), Some([3, 1, 2]));
    }

    #[test]
    fn test_outside_grid() {
        let grid = Grid::new([2, 2, 2]);
        assert_eq!(grid.world_to_voxel([-1.0, 0.0, 0.0]), None);
        assert_eq!(grid.world_to_voxel([2.0, 0.0, 0.0]), None);
    }

    #[test]
    fn test_scaled_grid() {
        let grid = Grid::with_geometry([4, 4, 4], [10.0, 0.0, 0.0], [2.0, 2.0, 2.0]);
        assert_eq!(grid.voxel_to_world([1, 0, 0]), [12.0, 0.0, 0.0]);
        assert_eq!(grid.world_to_voxel([12.9, 0.0, 0.0]), Some([1, 0, 0]));
    }
}

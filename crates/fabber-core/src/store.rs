//! Host data store seam.
//!
//! The host application owns every volume. The dispatch layer reads the main
//! data, the mask and any auxiliary items before partitioning, and writes the
//! merged outputs back once a run completes.

use std::collections::HashMap;

use ndarray::{Array3, ArrayD};

use crate::error::{Error, Result};
use crate::volume::{Grid, Mask, Volume};

/// Read/write access to the host's named volumes.
pub trait DataStore {
    /// Fetch a volume by name.
    fn get_data(&self, name: &str) -> Result<Volume>;

    /// Whether a volume with this name exists.
    fn contains(&self, name: &str) -> bool;

    /// Fetch a mask on `grid`. `None` selects every voxel.
    fn get_roi(&self, name: Option<&str>, grid: &Grid) -> Result<Mask> {
        match name {
            None => Ok(Array3::from_elem(
                (grid.shape[0], grid.shape[1], grid.shape[2]),
                true,
            )),
            Some(name) => {
                let roi = self.get_data(name)?;
                let resampled = Volume::new(grid.clone(), roi.resample(grid))?;
                Ok(resampled.to_mask())
            }
        }
    }

    /// Fetch a volume resampled onto `grid`.
    fn resampled(&self, name: &str, grid: &Grid) -> Result<ArrayD<f32>> {
        Ok(self.get_data(name)?.resample(grid))
    }

    /// Store a volume, optionally making it the current item.
    fn add_data(&mut self, data: ArrayD<f32>, grid: &Grid, name: &str, make_current: bool) -> Result<()>;
}

/// In-memory data store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    items: HashMap<String, Volume>,
    current: Option<String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a volume under a name, replacing any previous item.
    pub fn insert(&mut self, name: impl Into<String>, volume: Volume) {
        self.items.insert(name.into(), volume);
    }

    pub fn get(&self, name: &str) -> Option<&Volume> {
        self.items.get(name)
    }

    /// Name of the current item.
    pub fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }

    /// Names of all items, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.items.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl DataStore for MemoryStore {
    fn get_data(&self, name: &str) -> Result<Volume> {
        self.items
            .get(name)
            .cloned()
            .ok_or_else(|| Error::DataNotFound(name.to_string()))
    }

    fn contains(&self, name: &str) -> bool {
        self.items.contains_key(name)
    }

    fn add_data(&mut self, data: ArrayD<f32>, grid: &Grid, name: &str, make_current: bool) -> Result<()> {
        let volume = Volume::new(grid.clone(), data)?;
        self.items.insert(name.to_string(), volume);
        if make_current {
            self.current = Some(name.to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::IxDyn;

    fn store_with(name: &str, grid: &Grid, fill: f32) -> MemoryStore {
        let mut store = MemoryStore::new();
        let data = ArrayD::from_elem(IxDyn(&grid.shape), fill);
        store.insert(name, Volume::new(grid.clone(), data).unwrap());
        store
    }

    #[test]
    fn test_get_missing() {
        let store = MemoryStore::new();
        assert!(matches!(store.get_data("nope"), Err(Error::DataNotFound(_))));
    }

    #[test]
    fn test_default_roi_is_full() {
        let store = MemoryStore::new();
        let roi = store.get_roi(None, &Grid::new([2, 3, 4])).unwrap();
        assert_eq!(roi.len(), 24);
        assert!(roi.iter().all(|&v| v));
    }

    #[test]
    fn test_named_roi() {
        let grid = Grid::new([2, 2, 2]);
        let store = store_with("mask", &grid, 1.0);
        let roi = store.get_roi(Some("mask"), &grid).unwrap();
        assert!(roi.iter().all(|&v| v));
    }

    #[test]
    fn test_add_data_current() {
        let grid = Grid::new([1, 1, 1]);
        let mut store = MemoryStore::new();
        store
            .add_data(ArrayD::zeros(IxDyn(&[1, 1, 1])), &grid, "a", false)
            .unwrap();
        assert_eq!(store.current(), None);
        store
            .add_data(ArrayD::zeros(IxDyn(&[1, 1, 1, 3])), &grid, "b", true)
            .unwrap();
        assert_eq!(store.current(), Some("b"));
        assert_eq!(store.names(), vec!["a", "b"]);
    }

    #[test]
    fn test_add_data_wrong_grid() {
        let mut store = MemoryStore::new();
        let result = store.add_data(ArrayD::zeros(IxDyn(&[2, 1, 1])), &Grid::new([1, 1, 1]), "a", true);
        assert!(result.is_err());
        assert!(store.is_empty());
    }
}

//! JSON volume and option files.
//!
//! A volume file holds the array shape, optional grid geometry and the
//! values in row-major order:
//!
//! ```text
//! { "shape": [64, 64, 20, 8], "spacing": [3.0, 3.0, 5.0], "values": [...] }
//! ```

use std::fs;
use std::path::Path;

use anyhow::{Context, bail};
use fabber_core::{Grid, RunOptions, Volume};
use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
struct VolumeFile {
    shape: Vec<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    origin: Option<[f64; 3]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    spacing: Option<[f64; 3]>,
    values: Vec<f32>,
}

/// Read a volume file.
pub fn read_volume(path: &Path) -> anyhow::Result<Volume> {
    let text = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let file: VolumeFile =
        serde_json::from_str(&text).with_context(|| format!("Invalid volume file {}", path.display()))?;

    if !(file.shape.len() == 3 || file.shape.len() == 4) {
        bail!("{}: shape {:?} must have 3 or 4 dimensions", path.display(), file.shape);
    }
    let expected: usize = file.shape.iter().product();
    if file.values.len() != expected {
        bail!(
            "{}: {} values for shape {:?} (expected {})",
            path.display(),
            file.values.len(),
            file.shape,
            expected
        );
    }

    let grid = Grid::with_geometry(
        [file.shape[0], file.shape[1], file.shape[2]],
        file.origin.unwrap_or([0.0; 3]),
        file.spacing.unwrap_or([1.0; 3]),
    );
    let data = ArrayD::from_shape_vec(IxDyn(&file.shape), file.values)?;
    Ok(Volume::new(grid, data)?)
}

/// Write a volume file.
pub fn write_volume(path: &Path, volume: &Volume) -> anyhow::Result<()> {
    let grid = volume.grid();
    let file = VolumeFile {
        shape: volume.data().shape().to_vec(),
        origin: Some(grid.origin),
        spacing: Some(grid.spacing),
        values: volume.data().iter().copied().collect(),
    };
    let json = serde_json::to_string(&file)?;
    fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

/// Read run options from a JSON object file.
pub fn read_options(path: &Path) -> anyhow::Result<RunOptions> {
    let text = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let value: serde_json::Value =
        serde_json::from_str(&text).with_context(|| format!("Invalid options file {}", path.display()))?;
    Ok(RunOptions::from_json(&value)?)
}

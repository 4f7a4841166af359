//! Splitting a boxed volume into per-worker partitions.

use ndarray::{ArrayD, Axis, Slice, s};

use crate::error::{Error, Result};
use crate::options::{OptionValue, RunOptions, SPATIAL_METHOD};
use crate::store::DataStore;
use crate::volume::{BoundingBox, Grid, Mask, count_voxels};

/// One worker's share of the bounding box.
#[derive(Debug, Clone)]
pub struct Partition {
    pub worker_id: usize,
    /// Main data slab, 3-D or 4-D.
    pub data: ArrayD<f32>,
    pub mask: Mask,
    /// Auxiliary arrays keyed by the option that named them.
    pub extra: Vec<(String, ArrayD<f32>)>,
}

impl Partition {
    /// Number of masked voxels in the partition.
    pub fn voxels(&self) -> usize {
        count_voxels(&self.mask.view())
    }

    /// Extent along axis 0.
    pub fn slices(&self) -> usize {
        self.mask.dim().0
    }
}

/// Ordered partitions for a run.
#[derive(Debug, Clone, Default)]
pub struct PartitionPlan {
    pub partitions: Vec<Partition>,
    /// Masked voxels across all partitions; the progress denominator.
    pub voxels_todo: usize,
}

impl PartitionPlan {
    /// Number of workers.
    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    /// Axis-0 extent of each partition, in worker order.
    pub fn slice_lengths(&self) -> Vec<usize> {
        self.partitions.iter().map(Partition::slices).collect()
    }
}

/// Pull auxiliary data items out of the options.
///
/// Every option whose text value names an existing data item is resampled
/// onto `grid`, cropped to `bbox` and returned under the option's key. Those
/// keys are removed from `options`.
pub fn collect_extra_data(
    options: &mut RunOptions,
    store: &dyn DataStore,
    grid: &Grid,
    bbox: &BoundingBox,
) -> Result<Vec<(String, ArrayD<f32>)>> {
    let keys: Vec<String> = options
        .iter()
        .filter(|(_, value)| matches!(value, OptionValue::Text(name) if store.contains(name)))
        .map(|(key, _)| key.to_string())
        .collect();

    let mut extra = Vec::with_capacity(keys.len());
    for key in keys {
        let Some(OptionValue::Text(name)) = options.remove(&key) else {
            continue;
        };
        tracing::debug!("Option '{}' refers to data item '{}'", key, name);
        let resampled = store.resampled(&name, grid)?;
        extra.push((key, bbox.crop(&resampled.view())?));
    }
    Ok(extra)
}

/// Split boxed data into partitions along axis 0.
///
/// Spatial VB needs the whole volume, so it always gets a single partition.
/// Every other method gets one partition per slice.
pub fn partition(
    data: &ArrayD<f32>,
    mask: &Mask,
    extra: &[(String, ArrayD<f32>)],
    method: &str,
) -> Result<PartitionPlan> {
    let (nx, ny, nz) = mask.dim();
    let spatial_ok = |shape: &[usize]| shape.len() >= 3 && shape[..3] == [nx, ny, nz];
    if !spatial_ok(data.shape()) {
        return Err(Error::Shape(format!(
            "data of shape {:?} does not match mask {:?}",
            data.shape(),
            mask.dim()
        )));
    }
    if let Some((name, array)) = extra.iter().find(|(_, a)| !spatial_ok(a.shape())) {
        return Err(Error::Shape(format!(
            "data '{}' of shape {:?} does not match mask {:?}",
            name,
            array.shape(),
            mask.dim()
        )));
    }

    let voxels_todo = count_voxels(&mask.view());

    if method == SPATIAL_METHOD {
        let partitions = vec![Partition {
            worker_id: 0,
            data: data.clone(),
            mask: mask.clone(),
            extra: extra.to_vec(),
        }];
        return Ok(PartitionPlan {
            partitions,
            voxels_todo,
        });
    }

    let partitions = (0..nx)
        .map(|i| Partition {
            worker_id: i,
            data: data.slice_axis(Axis(0), Slice::from(i..i + 1)).to_owned(),
            mask: mask.slice(s![i..i + 1, .., ..]).to_owned(),
            extra: extra
                .iter()
                .map(|(name, array)| {
                    (name.clone(), array.slice_axis(Axis(0), Slice::from(i..i + 1)).to_owned())
                })
                .collect(),
        })
        .collect();

    Ok(PartitionPlan {
        partitions,
        voxels_todo,
    })
}

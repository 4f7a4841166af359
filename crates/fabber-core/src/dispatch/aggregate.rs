//! Merging worker results back into full-grid outputs.

use std::collections::BTreeMap;

use ndarray::{Array3, ArrayD, ArrayViewD, Axis, IxDyn};
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::volume::BoundingBox;

use super::worker::{WorkerOutcome, WorkerResult};

/// Which worker logs end up in the run log.
///
/// Every worker prints the same engine header, so by default only one log
/// is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogPolicy {
    /// First non-empty log in worker order: from a successful worker when
    /// the run succeeded, from a failed worker when it failed.
    #[default]
    First,
    /// Every non-empty log in worker order, successful or not.
    Concatenate,
}

/// Geometry needed to put partitions back together.
#[derive(Debug, Clone)]
pub struct RecombineLayout {
    pub grid_shape: [usize; 3],
    pub bbox: BoundingBox,
    /// Mask cropped to the bounding box. Outputs are zero wherever it is false.
    pub mask: Array3<bool>,
    /// Axis-0 extent of each partition, in worker order.
    pub slice_lengths: Vec<usize>,
}

/// One merged output volume.
#[derive(Debug, Clone)]
pub struct MergedOutput {
    /// Name the engine gave the output.
    pub key: String,
    /// Name after applying the rename mapping.
    pub name: String,
    /// Full-grid array.
    pub data: ArrayD<f32>,
    pub make_current: bool,
}

/// Outcome of a whole run.
#[derive(Debug, Clone)]
pub struct Aggregate {
    pub success: bool,
    /// Merged outputs. Always empty for a failed run.
    pub outputs: Vec<MergedOutput>,
    pub log: String,
    /// First failure in worker order.
    pub error: Option<Error>,
}

fn select_log<'a>(logs: impl Iterator<Item = &'a str>, policy: LogPolicy) -> String {
    let mut logs = logs.filter(|l| !l.is_empty());
    match policy {
        LogPolicy::First => logs.next().unwrap_or_default().to_string(),
        LogPolicy::Concatenate => logs.collect::<Vec<_>>().join("\n"),
    }
}

/// Output names in order of first appearance across workers.
fn output_keys(results: &[&WorkerResult]) -> Vec<String> {
    let mut keys: Vec<String> = Vec::new();
    for result in results {
        if let Some(run) = result.run_result() {
            for key in run.data.keys() {
                if !keys.contains(key) {
                    keys.push(key.clone());
                }
            }
        }
    }
    keys
}

/// Stitch one output back into the full grid.
///
/// Partitions that produced nothing for `key` (empty masks) contribute zeros.
fn recombine(key: &str, results: &[&WorkerResult], layout: &RecombineLayout) -> Result<ArrayD<f32>> {
    let [_, ny, nz] = layout.bbox.shape();
    let pieces: Vec<Option<&ArrayD<f32>>> = results
        .iter()
        .map(|r| r.run_result().and_then(|run| run.data.get(key)))
        .collect();

    let trailing: Vec<usize> = pieces
        .iter()
        .flatten()
        .next()
        .map(|a| a.shape().iter().skip(3).copied().collect())
        .unwrap_or_default();

    // Placeholders for partitions with no output, indexed like `pieces`.
    let mut zeros: Vec<Option<ArrayD<f32>>> = Vec::with_capacity(pieces.len());
    for (idx, piece) in pieces.iter().enumerate() {
        let mut shape = vec![layout.slice_lengths[idx], ny, nz];
        shape.extend(&trailing);
        match piece {
            Some(array) if array.shape() != shape.as_slice() => {
                return Err(Error::Shape(format!(
                    "output '{}' from worker {} has shape {:?}, expected {:?}",
                    key,
                    results[idx].worker_id,
                    array.shape(),
                    shape
                )));
            }
            Some(_) => zeros.push(None),
            None => zeros.push(Some(ArrayD::zeros(IxDyn(&shape)))),
        }
    }

    let views: Vec<ArrayViewD<'_, f32>> = pieces
        .iter()
        .zip(&zeros)
        .filter_map(|(piece, zero)| piece.or(zero.as_ref()).map(|a| a.view()))
        .collect();
    let mut boxed = ndarray::concatenate(Axis(0), &views)
        .map_err(|e| Error::Shape(format!("output '{}': {}", key, e)))?;
    apply_mask(&mut boxed, &layout.mask).map_err(|e| Error::Shape(format!("output '{}': {}", key, e)))?;

    let mut full_shape = layout.grid_shape.to_vec();
    full_shape.extend(&trailing);
    let mut full = ArrayD::<f32>::zeros(IxDyn(&full_shape));
    layout.bbox.place(&mut full, &boxed.view())?;
    Ok(full)
}

/// Zero every voxel outside the mask, across all trailing axes.
fn apply_mask(boxed: &mut ArrayD<f32>, mask: &Array3<bool>) -> Result<()> {
    let (nx, ny, nz) = mask.dim();
    if boxed.ndim() < 3 || boxed.shape()[..3] != [nx, ny, nz] {
        return Err(Error::Shape(format!(
            "array of shape {:?} does not match mask {:?}",
            boxed.shape(),
            [nx, ny, nz]
        )));
    }
    for ((i, j, k), _) in mask.indexed_iter().filter(|(_, set)| !**set) {
        boxed
            .index_axis_mut(Axis(0), i)
            .index_axis_move(Axis(0), j)
            .index_axis_move(Axis(0), k)
            .fill(0.0);
    }
    Ok(())
}

/// Merge every worker's result into the run outcome.
///
/// The run succeeds only if every worker succeeded. A failed run exposes no
/// outputs, even from workers that did succeed.
pub fn aggregate(
    results: &[WorkerResult],
    layout: &RecombineLayout,
    policy: LogPolicy,
    rename: &BTreeMap<String, String>,
) -> Aggregate {
    let mut ordered: Vec<&WorkerResult> = results.iter().collect();
    ordered.sort_by_key(|r| r.worker_id);

    let failures: Vec<&WorkerResult> = ordered.iter().copied().filter(|r| !r.is_success()).collect();
    let log = match policy {
        LogPolicy::First if failures.is_empty() => select_log(ordered.iter().map(|r| r.log()), policy),
        LogPolicy::First => select_log(failures.iter().map(|r| r.log()), policy),
        LogPolicy::Concatenate => select_log(ordered.iter().map(|r| r.log()), policy),
    };

    if let Some(first) = failures.first() {
        let error = match &first.outcome {
            WorkerOutcome::Failure(e) => e.clone(),
            WorkerOutcome::Success(_) => Error::Worker("inconsistent worker outcome".to_string()),
        };
        return Aggregate {
            success: false,
            outputs: Vec::new(),
            log,
            error: Some(error),
        };
    }

    if ordered.len() != layout.slice_lengths.len() {
        return Aggregate {
            success: false,
            outputs: Vec::new(),
            log,
            error: Some(Error::Worker(format!(
                "expected {} worker results, got {}",
                layout.slice_lengths.len(),
                ordered.len()
            ))),
        };
    }

    let mut outputs = Vec::new();
    for key in output_keys(&ordered) {
        tracing::debug!("Recombining output '{}'", key);
        match recombine(&key, &ordered, layout) {
            Ok(data) => {
                let name = rename.get(&key).cloned().unwrap_or_else(|| key.clone());
                outputs.push(MergedOutput {
                    make_current: outputs.is_empty(),
                    key,
                    name,
                    data,
                });
            }
            Err(e) => {
                return Aggregate {
                    success: false,
                    outputs: Vec::new(),
                    log,
                    error: Some(e),
                };
            }
        }
    }

    Aggregate {
        success: true,
        outputs,
        log,
        error: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::RunResult;
    use ndarray::Array3;

    fn success(worker_id: usize, outputs: &[(&str, ArrayD<f32>)], log: &str) -> WorkerResult {
        let mut run = RunResult {
            log: log.to_string(),
            ..RunResult::default()
        };
        for (k, v) in outputs {
            run.data.insert(k.to_string(), v.clone());
        }
        WorkerResult {
            worker_id,
            outcome: WorkerOutcome::Success(run),
        }
    }

    fn failure(worker_id: usize, log: &str) -> WorkerResult {
        WorkerResult {
            worker_id,
            outcome: WorkerOutcome::Failure(Error::engine("boom", log)),
        }
    }

    fn slab(value: f32, shape: &[usize]) -> ArrayD<f32> {
        ArrayD::from_elem(IxDyn(shape), value)
    }

    /// 5x4x4 grid, mask filling the box x in 1..4, y in 1..3, z in 0..4.
    fn layout() -> RecombineLayout {
        let mut mask = Array3::from_elem((5, 4, 4), false);
        mask.slice_mut(ndarray::s![1..4, 1..3, ..]).fill(true);
        layout_for(&mask)
    }

    fn layout_for(mask: &Array3<bool>) -> RecombineLayout {
        let bbox = BoundingBox::from_mask(&mask.view());
        RecombineLayout {
            grid_shape: [5, 4, 4],
            mask: bbox.crop_mask(&mask.view()),
            slice_lengths: vec![1; bbox.shape()[0]],
            bbox,
        }
    }

    #[test]
    fn test_recombine_constants() {
        let results = vec![
            success(0, &[("mean_c0", slab(1.0, &[1, 2, 4]))], "log"),
            success(1, &[("mean_c0", slab(2.0, &[1, 2, 4]))], "log"),
            success(2, &[("mean_c0", slab(3.0, &[1, 2, 4]))], "log"),
        ];
        let agg = aggregate(&results, &layout(), LogPolicy::First, &BTreeMap::new());

        assert!(agg.success);
        assert_eq!(agg.outputs.len(), 1);
        let out = &agg.outputs[0].data;
        assert_eq!(out.shape(), &[5, 4, 4]);
        assert_eq!(out[[1, 1, 0]], 1.0);
        assert_eq!(out[[2, 2, 3]], 2.0);
        assert_eq!(out[[3, 1, 2]], 3.0);
        // Outside the box
        assert_eq!(out[[0, 1, 0]], 0.0);
        assert_eq!(out[[4, 1, 0]], 0.0);
        assert_eq!(out[[2, 0, 0]], 0.0);
        assert_eq!(out.sum(), (1.0 + 2.0 + 3.0) * 8.0);
    }

    #[test]
    fn test_mask_false_voxels_stay_zero() {
        // Same box as `layout()`, but only two corners are in the mask
        let mut mask = Array3::from_elem((5, 4, 4), false);
        mask[[1, 1, 0]] = true;
        mask[[3, 2, 3]] = true;
        let layout = layout_for(&mask);
        assert_eq!(layout.bbox.shape(), [3, 2, 4]);

        let results = vec![
            success(0, &[("mean_c0", slab(1.0, &[1, 2, 4])), ("modelfit", slab(1.0, &[1, 2, 4, 3]))], ""),
            success(1, &[], ""),
            success(2, &[("mean_c0", slab(3.0, &[1, 2, 4])), ("modelfit", slab(3.0, &[1, 2, 4, 3]))], ""),
        ];
        let agg = aggregate(&results, &layout, LogPolicy::First, &BTreeMap::new());
        assert!(agg.success);

        let mean = &agg.outputs[0].data;
        assert_eq!(mean[[1, 1, 0]], 1.0);
        assert_eq!(mean[[3, 2, 3]], 3.0);
        assert_eq!(mean[[1, 2, 0]], 0.0);
        assert_eq!(mean[[3, 1, 3]], 0.0);
        assert_eq!(mean.sum(), 4.0);

        let modelfit = &agg.outputs[1].data;
        assert_eq!(modelfit.shape(), &[5, 4, 4, 3]);
        assert_eq!(modelfit[[1, 1, 0, 2]], 1.0);
        assert_eq!(modelfit[[1, 1, 1, 2]], 0.0);
        assert_eq!(modelfit.sum(), 12.0);
    }

    #[test]
    fn test_recombine_order_independent() {
        let results = vec![
            success(2, &[("x", slab(3.0, &[1, 2, 4]))], ""),
            success(0, &[("x", slab(1.0, &[1, 2, 4]))], ""),
            success(1, &[("x", slab(2.0, &[1, 2, 4]))], ""),
        ];
        let agg = aggregate(&results, &layout(), LogPolicy::First, &BTreeMap::new());
        assert_eq!(agg.outputs[0].data[[1, 1, 0]], 1.0);
        assert_eq!(agg.outputs[0].data[[3, 1, 0]], 3.0);
    }

    #[test]
    fn test_empty_partition_placeholder_is_zero() {
        let results = vec![
            success(0, &[("modelfit", slab(1.0, &[1, 2, 4, 6]))], "header"),
            success(1, &[], ""),
            success(2, &[("modelfit", slab(3.0, &[1, 2, 4, 6]))], "header"),
        ];
        let agg = aggregate(&results, &layout(), LogPolicy::First, &BTreeMap::new());

        assert!(agg.success);
        let out = &agg.outputs[0].data;
        assert_eq!(out.shape(), &[5, 4, 4, 6]);
        assert_eq!(out[[1, 1, 0, 5]], 1.0);
        assert_eq!(out[[2, 1, 0, 5]], 0.0);
        assert_eq!(out[[3, 2, 3, 0]], 3.0);
        assert_eq!(agg.log, "header");
    }

    #[test]
    fn test_rename_and_make_current() {
        let results = vec![
            success(0, &[("a", slab(1.0, &[1, 2, 4])), ("b", slab(1.0, &[1, 2, 4]))], ""),
            success(1, &[("a", slab(1.0, &[1, 2, 4])), ("b", slab(1.0, &[1, 2, 4]))], ""),
            success(2, &[("a", slab(1.0, &[1, 2, 4])), ("b", slab(1.0, &[1, 2, 4]))], ""),
        ];
        let rename = BTreeMap::from([("a".to_string(), "alpha".to_string())]);
        let agg = aggregate(&results, &layout(), LogPolicy::First, &rename);

        let names: Vec<_> = agg.outputs.iter().map(|o| (o.name.as_str(), o.make_current)).collect();
        assert_eq!(names, vec![("alpha", true), ("b", false)]);
        assert_eq!(agg.outputs[0].key, "a");
    }

    #[test]
    fn test_failure_discards_outputs() {
        let results = vec![
            success(0, &[("x", slab(1.0, &[1, 2, 4]))], "ok log"),
            failure(1, "failed log"),
            success(2, &[("x", slab(1.0, &[1, 2, 4]))], "ok log"),
        ];
        let agg = aggregate(&results, &layout(), LogPolicy::First, &BTreeMap::new());

        assert!(!agg.success);
        assert!(agg.outputs.is_empty());
        assert_eq!(agg.log, "failed log");
        assert!(matches!(agg.error, Some(Error::Engine { .. })));
    }

    #[test]
    fn test_concatenate_policy() {
        let results = vec![
            success(0, &[], "zero"),
            success(1, &[], ""),
            success(2, &[], "two"),
        ];
        let agg = aggregate(&results, &layout(), LogPolicy::Concatenate, &BTreeMap::new());
        assert!(agg.success);
        assert!(agg.outputs.is_empty());
        assert_eq!(agg.log, "zero\ntwo");
    }

    #[test]
    fn test_bad_output_shape_fails() {
        let results = vec![
            success(0, &[("x", slab(1.0, &[1, 2, 4]))], ""),
            success(1, &[("x", slab(1.0, &[1, 3, 4]))], ""),
            success(2, &[("x", slab(1.0, &[1, 2, 4]))], ""),
        ];
        let agg = aggregate(&results, &layout(), LogPolicy::First, &BTreeMap::new());
        assert!(!agg.success);
        assert!(matches!(agg.error, Some(Error::Shape(_))));
    }

    #[test]
    fn test_missing_results_fail() {
        let results = vec![success(0, &[], "")];
        let agg = aggregate(&results, &layout(), LogPolicy::First, &BTreeMap::new());
        assert!(!agg.success);
    }

    #[test]
    fn test_no_workers_is_success() {
        let layout = RecombineLayout {
            grid_shape: [3, 3, 3],
            bbox: BoundingBox::empty(),
            mask: Array3::from_elem((0, 0, 0), false),
            slice_lengths: vec![],
        };
        let agg = aggregate(&[], &layout, LogPolicy::First, &BTreeMap::new());
        assert!(agg.success);
        assert!(agg.outputs.is_empty());
        assert!(agg.log.is_empty());
    }
}

//! Engine seam.
//!
//! The model fitting itself happens in a native engine library. The dispatch
//! layer only needs to construct an engine for a model-group selection, hand it
//! one partition's data and read back the named output arrays.
//!
//! - `library` - locating the core and model-group shared libraries
//! - `native` - `Engine` implementation over the engine's C entry points

mod library;
mod native;

pub use library::{LibraryLocator, model_group_name};
pub use native::{NativeEngine, NativeEngineFactory};

use std::collections::BTreeMap;
use std::path::PathBuf;

use ndarray::ArrayD;

use crate::error::Result;
use crate::options::RunOptions;
use crate::volume::Mask;

/// Data handed to the engine for one partition.
#[derive(Debug, Clone)]
pub struct DataBundle {
    /// Main data, 3-D or 4-D.
    pub data: ArrayD<f32>,
    pub mask: Mask,
    /// Auxiliary arrays keyed by the option that referred to them.
    pub extra: Vec<(String, ArrayD<f32>)>,
}

/// Output of one engine run.
#[derive(Debug, Clone, Default)]
pub struct RunResult {
    /// Output arrays by name, each shaped like the partition.
    pub data: BTreeMap<String, ArrayD<f32>>,
    pub log: String,
}

impl RunResult {
    /// Placeholder for partitions with no voxels to fit.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty() && self.log.is_empty()
    }
}

/// Libraries an engine should load beyond its core.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineSelection {
    pub model_libs: Vec<PathBuf>,
}

impl EngineSelection {
    /// Selection from the `loadmodels` option value, if any.
    pub fn from_options(options: &RunOptions) -> Self {
        let model_libs = options
            .get_str(crate::options::LOAD_MODELS)
            .map(|lib| vec![PathBuf::from(lib)])
            .unwrap_or_default();
        Self { model_libs }
    }
}

/// A model-fitting engine instance.
///
/// An instance is created inside a worker and used for exactly one run.
pub trait Engine {
    /// Fit the model to every masked voxel of `bundle`.
    ///
    /// `progress` is called with `(voxels done, voxels total)` at the
    /// engine's own cadence.
    fn run(
        &mut self,
        options: &RunOptions,
        bundle: &DataBundle,
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<RunResult>;
}

/// Constructs engines for workers.
pub trait EngineFactory: Send + Sync {
    fn create(&self, selection: &EngineSelection) -> Result<Box<dyn Engine>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selection_from_options() {
        let mut opts = RunOptions::new();
        assert!(EngineSelection::from_options(&opts).model_libs.is_empty());

        opts.insert("loadmodels", "/opt/fabber/libfabber_models_asl.so");
        assert_eq!(
            EngineSelection::from_options(&opts).model_libs,
            vec![PathBuf::from("/opt/fabber/libfabber_models_asl.so")]
        );
    }

    #[test]
    fn test_empty_result() {
        let result = RunResult::empty();
        assert!(result.is_empty());
    }
}

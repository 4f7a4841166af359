//! Orchestrator for a dispatched Fabber run.
//!
//! `FabberProcess` takes run options from the host, splits the masked data
//! into partitions, runs one worker per partition on a thread pool and merges
//! the results back into the host's data store.
//!
//! The host drives it by polling:
//!
//! ```text
//! run(options)        IDLE -> RUNNING
//!   poll() ...        progress fraction, collects worker results
//!   poll()            all results in -> SUCCEEDED | FAILED
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, TryRecvError};
use ndarray::{ArrayD, Axis};

use crate::config::DispatchConfig;
use crate::engine::{EngineFactory, EngineSelection, LibraryLocator};
use crate::error::{Error, Result};
use crate::options::{RunOptions, WORKING_DIR};
use crate::store::DataStore;
use crate::volume::{BoundingBox, Grid};

use super::aggregate::{RecombineLayout, aggregate};
use super::context::{AbortHandle, ProcessCallback};
use super::partition::{collect_extra_data, partition};
use super::progress::{ProgressReceiver, ProgressTracker, progress_channel};
use super::pool::WorkerPool;
use super::rundata::RunData;
use super::worker::{WorkerResult, WorkerTask};

/// Interval between polls in [`FabberProcess::wait`].
pub const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Lifecycle of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcessStatus {
    #[default]
    Idle,
    Running,
    Succeeded,
    Failed,
}

impl ProcessStatus {
    /// Whether a run has completed, either way.
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Working directory of the host while a run is in flight. The previous
/// directory is restored on drop.
struct WorkingDirGuard {
    previous: PathBuf,
}

impl WorkingDirGuard {
    fn enter(dir: &Path) -> Result<Self> {
        let previous = std::env::current_dir()?;
        std::env::set_current_dir(dir)?;
        tracing::debug!("Working directory {}", dir.display());
        Ok(Self { previous })
    }
}

impl Drop for WorkingDirGuard {
    fn drop(&mut self) {
        if let Err(e) = std::env::set_current_dir(&self.previous) {
            tracing::warn!("Failed to restore working directory {}: {}", self.previous.display(), e);
        }
    }
}

/// State of an in-flight run.
struct ActiveRun {
    results: Receiver<WorkerResult>,
    progress: ProgressReceiver,
    tracker: ProgressTracker,
    collected: Vec<WorkerResult>,
    /// Masked voxels per partition, indexed by worker id.
    partition_voxels: Vec<usize>,
    layout: RecombineLayout,
    grid: Grid,
    rename: BTreeMap<String, String>,
    abort: AbortHandle,
    _pool: WorkerPool,
    working_dir: Option<WorkingDirGuard>,
}

impl ActiveRun {
    fn expected(&self) -> usize {
        self.partition_voxels.len()
    }
}

impl Drop for ActiveRun {
    fn drop(&mut self) {
        // Workers still queued when a run is abandoned never start their engine.
        self.abort.abort();
    }
}

/// Parallel Fabber run over a host data store.
pub struct FabberProcess<S: DataStore> {
    store: S,
    factory: Arc<dyn EngineFactory>,
    config: DispatchConfig,
    locator: LibraryLocator,
    working_dir: Option<PathBuf>,
    callback: Option<Arc<dyn ProcessCallback>>,
    status: ProcessStatus,
    active: Option<ActiveRun>,
    log: String,
    outputs: Vec<String>,
    error: Option<Error>,
    worker_results: Vec<WorkerResult>,
    progress: f64,
}

impl<S: DataStore> FabberProcess<S> {
    /// Create a process over `store`, building engines with `factory`.
    pub fn new(store: S, factory: Arc<dyn EngineFactory>) -> Self {
        Self {
            store,
            factory,
            config: DispatchConfig::default(),
            locator: LibraryLocator::from_env(),
            working_dir: None,
            callback: None,
            status: ProcessStatus::Idle,
            active: None,
            log: String::new(),
            outputs: Vec::new(),
            error: None,
            worker_results: Vec::new(),
            progress: 0.0,
        }
    }

    pub fn with_config(mut self, config: DispatchConfig) -> Self {
        self.config = config;
        self
    }

    /// Locator used to resolve `model-group` options. Defaults to
    /// [`LibraryLocator::from_env`].
    pub fn with_locator(mut self, locator: LibraryLocator) -> Self {
        self.locator = locator;
        self
    }

    /// Directory the engine runs in. The host's working directory is
    /// switched for the duration of each run and restored afterwards.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn locator(&self) -> &LibraryLocator {
        &self.locator
    }

    /// Set the host callback.
    pub fn set_callback(&mut self, callback: impl ProcessCallback + 'static) {
        self.callback = Some(Arc::new(callback));
    }

    /// Start a run.
    ///
    /// Reads the data and mask named by the options from the store,
    /// partitions the mask's bounding box and launches one worker per
    /// partition. A mask with no voxels completes immediately.
    pub fn run(&mut self, options: &RunOptions) -> Result<()> {
        if self.status == ProcessStatus::Running {
            return Err(Error::InvalidState("a run is already in progress".to_string()));
        }
        self.reset();

        let RunData {
            mut options,
            data_names,
            roi,
            rename,
        } = RunData::prepare(options, &self.locator)?;

        let (grid, data) = self.read_data(&data_names)?;
        let mask = self.store.get_roi(roi.as_deref(), &grid)?;
        let bbox = BoundingBox::from_mask(&mask.view());
        tracing::debug!("Bounding box {:?} -> {:?}", bbox.start(), bbox.end());

        if bbox.is_empty() {
            tracing::info!("Mask is empty, nothing to fit");
            self.status = ProcessStatus::Running;
            self.finish_empty();
            return Ok(());
        }

        let data_bb = bbox.crop(&data.view())?;
        let mask_bb = bbox.crop_mask(&mask.view());
        let extra = collect_extra_data(&mut options, &self.store, &grid, &bbox)?;
        let plan = partition(&data_bb, &mask_bb, &extra, options.method())?;

        if options.remove(WORKING_DIR).is_some() {
            tracing::warn!("Ignoring '{}' option, the working directory is a process setting", WORKING_DIR);
        }
        let working_dir = match &self.working_dir {
            Some(dir) => {
                options.insert(WORKING_DIR, dir.display().to_string());
                Some(WorkingDirGuard::enter(dir)?)
            }
            None => None,
        };

        for (key, value) in options.iter() {
            tracing::debug!("{}={}", key, value);
        }

        let selection = EngineSelection::from_options(&options);
        let pool = WorkerPool::new(self.config.threads)?;
        let (progress_tx, progress_rx) = progress_channel();
        let abort = AbortHandle::new();

        let layout = RecombineLayout {
            grid_shape: grid.shape,
            bbox,
            mask: mask_bb,
            slice_lengths: plan.slice_lengths(),
        };
        let partition_voxels = plan.partitions.iter().map(|p| p.voxels()).collect();
        let tracker = ProgressTracker::new(plan.len(), plan.voxels_todo);

        tracing::info!(
            "Starting run: {} workers, {} voxels, method '{}'",
            plan.len(),
            plan.voxels_todo,
            options.method()
        );

        let tasks = plan
            .partitions
            .into_iter()
            .map(|partition| WorkerTask {
                partition,
                options: options.clone(),
                selection: selection.clone(),
                progress: progress_tx.clone(),
                abort: abort.clone(),
                trace_failures: self.config.trace_failures,
            })
            .collect();
        let results = pool.launch(tasks, Arc::clone(&self.factory));

        self.active = Some(ActiveRun {
            results,
            progress: progress_rx,
            tracker,
            collected: Vec::new(),
            partition_voxels,
            layout,
            grid,
            rename,
            abort,
            _pool: pool,
            working_dir,
        });
        self.status = ProcessStatus::Running;
        Ok(())
    }

    /// Read the main data. Several items are stacked along a fourth axis on
    /// the first item's grid.
    fn read_data(&self, names: &[String]) -> Result<(Grid, ArrayD<f32>)> {
        let Some((first, rest)) = names.split_first() else {
            return Err(Error::Config("no data item given".to_string()));
        };
        let volume = self.store.get_data(first)?;
        let grid = volume.grid().clone();
        if rest.is_empty() {
            return Ok((grid, volume.into_data()));
        }

        let mut arrays = vec![volume.into_data()];
        for name in rest {
            arrays.push(self.store.resampled(name, &grid)?);
        }
        let arrays: Vec<ArrayD<f32>> = arrays
            .into_iter()
            .map(|a| if a.ndim() == 3 { a.insert_axis(Axis(3)) } else { a })
            .collect();
        let views: Vec<_> = arrays.iter().map(|a| a.view()).collect();
        let stacked = ndarray::concatenate(Axis(3), &views)
            .map_err(|e| Error::Shape(format!("cannot stack data items {:?}: {}", names, e)))?;
        Ok((grid, stacked))
    }

    /// Drain progress and worker results.
    ///
    /// Returns the fraction of masked voxels processed. Once every worker
    /// has reported, the results are merged and the run finishes.
    pub fn poll(&mut self) -> f64 {
        let Some(active) = self.active.as_mut() else {
            return self.progress;
        };

        for message in active.progress.drain() {
            active.tracker.apply(message);
        }

        let mut lost = false;
        loop {
            match active.results.try_recv() {
                Ok(result) => {
                    if result.is_success()
                        && let Some(&voxels) = active.partition_voxels.get(result.worker_id)
                    {
                        active.tracker.complete(result.worker_id, voxels);
                    }
                    if let Some(callback) = &self.callback {
                        callback.on_worker_finished(result.worker_id, result.is_success());
                    }
                    active.collected.push(result);
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    lost = active.collected.len() < active.expected();
                    break;
                }
            }
        }

        self.progress = self.progress.max(active.tracker.fraction());
        if let Some(callback) = &self.callback {
            callback.on_progress(self.progress);
        }

        let complete = active.collected.len() >= active.expected();
        if complete || lost {
            self.finish();
        }
        self.progress
    }

    /// Block until the run completes, polling every [`POLL_INTERVAL`].
    pub fn wait(&mut self) -> ProcessStatus {
        while self.status == ProcessStatus::Running {
            self.poll();
            if self.status == ProcessStatus::Running {
                thread::sleep(POLL_INTERVAL);
            }
        }
        self.status
    }

    /// Request cancellation of the current run.
    ///
    /// Workers not yet inside the engine are skipped; those already running
    /// finish their call. The run then completes as failed with `Aborted`.
    pub fn cancel(&self) {
        if let Some(active) = &self.active {
            tracing::info!("Cancelling run");
            active.abort.abort();
        }
    }

    fn reset(&mut self) {
        self.active = None;
        self.status = ProcessStatus::Idle;
        self.log.clear();
        self.outputs.clear();
        self.error = None;
        self.worker_results.clear();
        self.progress = 0.0;
    }

    fn finish_empty(&mut self) {
        self.progress = 1.0;
        if let Some(callback) = &self.callback {
            callback.on_progress(self.progress);
        }
        self.complete(ProcessStatus::Succeeded);
    }

    fn finish(&mut self) {
        let Some(mut active) = self.active.take() else {
            return;
        };
        // Every worker has returned, so the host gets its directory back
        // before outputs reach the store.
        active.working_dir = None;
        let mut results = std::mem::take(&mut active.collected);
        results.sort_by_key(|r| r.worker_id);

        let merged = aggregate(&results, &active.layout, self.config.log_policy, &active.rename);
        self.log = merged.log;
        self.worker_results = results;

        let mut status = if merged.success {
            ProcessStatus::Succeeded
        } else {
            ProcessStatus::Failed
        };
        self.error = merged.error;
        if self.error.is_none() && self.worker_results.len() < active.expected() {
            status = ProcessStatus::Failed;
            self.error = Some(Error::Worker(format!(
                "{} of {} workers did not report",
                active.expected() - self.worker_results.len(),
                active.expected()
            )));
        }

        if status == ProcessStatus::Succeeded {
            for output in merged.outputs {
                tracing::debug!("Adding output '{}' as '{}'", output.key, output.name);
                if let Err(e) = self
                    .store
                    .add_data(output.data, &active.grid, &output.name, output.make_current)
                {
                    status = ProcessStatus::Failed;
                    self.error = Some(e);
                    break;
                }
                self.outputs.push(output.name);
            }
        }
        if status == ProcessStatus::Failed {
            self.outputs.clear();
        }
        self.complete(status);
    }

    fn complete(&mut self, status: ProcessStatus) {
        self.status = status;
        match &self.error {
            Some(e) => tracing::info!("Run {}: {}", status, e),
            None => tracing::info!("Run {}", status),
        }
        if let Some(callback) = &self.callback {
            callback.on_finished(status, &self.log);
        }
    }

    pub fn status(&self) -> ProcessStatus {
        self.status
    }

    /// Log of the last run.
    pub fn log(&self) -> &str {
        &self.log
    }

    /// Names of the data items the last run added to the store.
    pub fn output_data_items(&self) -> &[String] {
        &self.outputs
    }

    /// Failure of the last run, if it failed.
    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    /// Raw per-worker results of the last run, in worker order.
    pub fn worker_results(&self) -> &[WorkerResult] {
        &self.worker_results
    }

    /// Fraction of masked voxels processed.
    pub fn progress(&self) -> f64 {
        self.progress
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }
}

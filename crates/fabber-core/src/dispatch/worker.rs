//! Worker invocation: runs the engine over one partition.
//!
//! A worker never propagates a failure. Configuration errors, engine errors
//! and panics all come back as `WorkerOutcome::Failure` so that one bad
//! partition cannot take down the orchestrator or its sibling workers.

use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};

use crate::engine::{DataBundle, EngineFactory, EngineSelection, RunResult};
use crate::error::{Error, Result};
use crate::options::{RunOptions, WORKING_DIR};

use super::context::AbortHandle;
use super::partition::Partition;
use super::progress::{ProgressReporter, ProgressSender};

/// Result payload of one worker.
#[derive(Debug, Clone)]
pub enum WorkerOutcome {
    Success(RunResult),
    Failure(Error),
}

/// Tagged result of one worker.
#[derive(Debug, Clone)]
pub struct WorkerResult {
    pub worker_id: usize,
    pub outcome: WorkerOutcome,
}

impl WorkerResult {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, WorkerOutcome::Success(_))
    }

    pub fn run_result(&self) -> Option<&RunResult> {
        match &self.outcome {
            WorkerOutcome::Success(result) => Some(result),
            WorkerOutcome::Failure(_) => None,
        }
    }

    pub fn error(&self) -> Option<&Error> {
        match &self.outcome {
            WorkerOutcome::Success(_) => None,
            WorkerOutcome::Failure(e) => Some(e),
        }
    }

    /// Log text carried by the payload, empty if none.
    pub fn log(&self) -> &str {
        match &self.outcome {
            WorkerOutcome::Success(result) => &result.log,
            WorkerOutcome::Failure(e) => e.log().unwrap_or_default(),
        }
    }
}

/// Everything a worker needs, owned.
#[derive(Debug)]
pub struct WorkerTask {
    pub partition: Partition,
    /// Private copy of the run options.
    pub options: RunOptions,
    pub selection: EngineSelection,
    pub progress: ProgressSender,
    pub abort: AbortHandle,
    /// Log failures as they happen.
    pub trace_failures: bool,
}

/// Run one partition to completion, capturing any failure.
pub fn run_worker(task: WorkerTask, factory: &dyn EngineFactory) -> WorkerResult {
    let worker_id = task.partition.worker_id;
    let trace_failures = task.trace_failures;

    let outcome = match panic::catch_unwind(AssertUnwindSafe(|| invoke(task, factory))) {
        Ok(Ok(result)) => WorkerOutcome::Success(result),
        Ok(Err(e)) => {
            if trace_failures {
                tracing::warn!("Worker {} failed: {}", worker_id, e);
            }
            WorkerOutcome::Failure(e)
        }
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!("Worker {} panicked: {}", worker_id, message);
            WorkerOutcome::Failure(Error::Worker(format!("worker {} panicked: {}", worker_id, message)))
        }
    };

    WorkerResult { worker_id, outcome }
}

/// Check auxiliary data against the partition before any engine work.
fn validate_extra(partition: &Partition) -> Result<()> {
    let (nx, ny, nz) = partition.mask.dim();
    let mut seen = HashSet::new();
    for (name, array) in &partition.extra {
        if name.is_empty() {
            return Err(Error::InvalidPartition(format!(
                "partition {}: auxiliary data without a name",
                partition.worker_id
            )));
        }
        if !seen.insert(name.as_str()) {
            return Err(Error::InvalidPartition(format!(
                "partition {}: auxiliary data '{}' given twice",
                partition.worker_id, name
            )));
        }
        if array.ndim() < 3 || array.shape()[..3] != [nx, ny, nz] {
            return Err(Error::InvalidPartition(format!(
                "partition {}: auxiliary data '{}' has shape {:?}, expected {:?}",
                partition.worker_id,
                name,
                array.shape(),
                [nx, ny, nz]
            )));
        }
    }
    Ok(())
}

fn invoke(task: WorkerTask, factory: &dyn EngineFactory) -> Result<RunResult> {
    let WorkerTask {
        partition,
        mut options,
        selection,
        progress,
        abort,
        ..
    } = task;
    let worker_id = partition.worker_id;

    validate_extra(&partition)?;

    if partition.voxels() == 0 {
        tracing::debug!("Worker {}: no voxels", worker_id);
        return Ok(RunResult::empty());
    }

    if abort.is_aborted() {
        return Err(Error::Aborted);
    }

    options.remove(WORKING_DIR);
    let bundle = DataBundle {
        data: partition.data,
        mask: partition.mask,
        extra: partition.extra,
    };

    let mut reporter = ProgressReporter::new(worker_id, progress, abort.clone());
    let result = {
        // Engine lives exactly as long as this worker's single run.
        let mut engine = factory.create(&selection)?;
        tracing::debug!("Worker {}: running engine", worker_id);
        engine.run(&options, &bundle, &mut |done, total| reporter.report(done, total))
    };

    if abort.is_aborted() {
        return Err(Error::Aborted);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::progress::progress_channel;
    use crate::engine::Engine;
    use ndarray::{Array3, ArrayD, IxDyn};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingFactory {
        created: AtomicUsize,
        fail: bool,
    }

    struct ConstEngine {
        fail: bool,
    }

    impl Engine for ConstEngine {
        fn run(
            &mut self,
            _options: &RunOptions,
            bundle: &DataBundle,
            progress: &mut dyn FnMut(usize, usize),
        ) -> Result<RunResult> {
            if self.fail {
                return Err(Error::engine("model not found", "partial log"));
            }
            let total = bundle.mask.iter().filter(|&&m| m).count();
            for voxel in 1..=total {
                progress(voxel, total);
            }
            let mut result = RunResult {
                log: "ok".into(),
                ..RunResult::default()
            };
            result
                .data
                .insert("mean_c0".into(), ArrayD::from_elem(IxDyn(bundle.data.shape()), 1.0));
            Ok(result)
        }
    }

    impl EngineFactory for CountingFactory {
        fn create(&self, _selection: &EngineSelection) -> Result<Box<dyn Engine>> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(ConstEngine { fail: self.fail }))
        }
    }

    fn factory(fail: bool) -> CountingFactory {
        CountingFactory {
            created: AtomicUsize::new(0),
            fail,
        }
    }

    fn task(mask: Array3<bool>, extra: Vec<(String, ArrayD<f32>)>, progress: ProgressSender) -> WorkerTask {
        let (nx, ny, nz) = mask.dim();
        WorkerTask {
            partition: Partition {
                worker_id: 2,
                data: ArrayD::zeros(IxDyn(&[nx, ny, nz])),
                mask,
                extra,
            },
            options: RunOptions::new(),
            selection: EngineSelection::default(),
            progress,
            abort: AbortHandle::new(),
            trace_failures: false,
        }
    }

    #[test]
    fn test_success() {
        let (tx, rx) = progress_channel();
        let f = factory(false);
        let result = run_worker(task(Array3::from_elem((1, 2, 2), true), vec![], tx), &f);

        assert_eq!(result.worker_id, 2);
        assert!(result.is_success());
        assert_eq!(result.log(), "ok");
        assert!(result.run_result().unwrap().data.contains_key("mean_c0"));
        let last = rx.drain().pop().unwrap();
        assert_eq!((last.worker_id, last.done, last.total), (2, 4, 4));
    }

    #[test]
    fn test_empty_partition_skips_engine() {
        let (tx, _rx) = progress_channel();
        let f = factory(false);
        let result = run_worker(task(Array3::from_elem((1, 2, 2), false), vec![], tx), &f);

        assert!(result.is_success());
        assert!(result.run_result().unwrap().is_empty());
        assert_eq!(f.created.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_engine_failure_captured() {
        let (tx, _rx) = progress_channel();
        let result = run_worker(task(Array3::from_elem((1, 1, 1), true), vec![], tx), &factory(true));

        assert!(!result.is_success());
        assert_eq!(result.log(), "partial log");
        assert!(matches!(result.error(), Some(Error::Engine { .. })));
    }

    #[test]
    fn test_bad_extra_data_fails_fast() {
        let (tx, _rx) = progress_channel();
        let f = factory(false);
        let extra = vec![("suppdata".to_string(), ArrayD::zeros(IxDyn(&[2, 2, 2])))];
        let result = run_worker(task(Array3::from_elem((1, 2, 2), true), extra, tx), &f);

        assert!(matches!(result.error(), Some(Error::InvalidPartition(_))));
        assert_eq!(f.created.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_duplicate_extra_name() {
        let (tx, _rx) = progress_channel();
        let slab = ArrayD::zeros(IxDyn(&[1, 2, 2]));
        let extra = vec![("a".to_string(), slab.clone()), ("a".to_string(), slab)];
        let result = run_worker(task(Array3::from_elem((1, 2, 2), true), extra, tx), &factory(false));
        assert!(matches!(result.error(), Some(Error::InvalidPartition(_))));
    }

    #[test]
    fn test_aborted_before_start() {
        let (tx, _rx) = progress_channel();
        let f = factory(false);
        let t = task(Array3::from_elem((1, 1, 1), true), vec![], tx);
        t.abort.abort();
        let result = run_worker(t, &f);

        assert!(matches!(result.error(), Some(Error::Aborted)));
        assert_eq!(f.created.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_panic_captured() {
        struct PanicFactory;
        impl EngineFactory for PanicFactory {
            fn create(&self, _selection: &EngineSelection) -> Result<Box<dyn Engine>> {
                panic!("engine exploded");
            }
        }

        let (tx, _rx) = progress_channel();
        let result = run_worker(task(Array3::from_elem((1, 1, 1), true), vec![], tx), &PanicFactory);
        match result.error() {
            Some(Error::Worker(msg)) => assert!(msg.contains("engine exploded")),
            other => panic!("unexpected {:?}", other),
        }
    }
}

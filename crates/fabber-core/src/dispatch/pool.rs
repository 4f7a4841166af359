//! Worker pool for dispatched partitions.
//!
//! Each partition becomes one task on a Rayon thread pool. Results come back
//! over a channel in completion order; the orchestrator restores worker order
//! when it aggregates.

use std::sync::Arc;

use crossbeam_channel::Receiver;
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::engine::EngineFactory;
use crate::error::{Error, Result};

use super::worker::{WorkerResult, WorkerTask, run_worker};

/// Fixed-size pool running one worker per partition.
pub struct WorkerPool {
    pool: ThreadPool,
}

impl WorkerPool {
    /// Create a pool with `threads` threads, or Rayon's default when 0.
    pub fn new(threads: usize) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|idx| format!("fabber-worker-{}", idx))
            .build()
            .map_err(|e| Error::Config(format!("failed to build worker pool: {}", e)))?;
        Ok(Self { pool })
    }

    /// Number of threads in the pool.
    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Spawn every task and return the channel its results arrive on.
    ///
    /// The channel disconnects once every task has reported.
    pub fn launch(&self, tasks: Vec<WorkerTask>, factory: Arc<dyn EngineFactory>) -> Receiver<WorkerResult> {
        let (tx, rx) = crossbeam_channel::unbounded();
        for task in tasks {
            let tx = tx.clone();
            let factory = Arc::clone(&factory);
            self.pool.spawn(move || {
                let result = run_worker(task, factory.as_ref());
                tracing::debug!("Worker {} finished (success: {})", result.worker_id, result.is_success());
                // Receiver gone means the run was abandoned
                let _ = tx.send(result);
            });
        }
        rx
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool").field("threads", &self.threads()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::context::AbortHandle;
    use crate::dispatch::partition::Partition;
    use crate::dispatch::progress::progress_channel;
    use crate::engine::{DataBundle, Engine, EngineSelection, RunResult};
    use crate::options::RunOptions;
    use ndarray::{Array3, ArrayD, IxDyn};

    struct IdEngine;

    impl Engine for IdEngine {
        fn run(
            &mut self,
            _options: &RunOptions,
            bundle: &DataBundle,
            _progress: &mut dyn FnMut(usize, usize),
        ) -> Result<RunResult> {
            let mut result = RunResult::default();
            result.data.insert("copy".into(), bundle.data.clone());
            Ok(result)
        }
    }

    struct IdFactory;

    impl EngineFactory for IdFactory {
        fn create(&self, _selection: &EngineSelection) -> Result<Box<dyn Engine>> {
            Ok(Box::new(IdEngine))
        }
    }

    #[test]
    fn test_pool_threads() {
        let pool = WorkerPool::new(2).unwrap();
        assert_eq!(pool.threads(), 2);
    }

    #[test]
    fn test_launch_collects_every_result() {
        let pool = WorkerPool::new(3).unwrap();
        let (progress, _rx) = progress_channel();
        let tasks: Vec<WorkerTask> = (0..5)
            .map(|id| WorkerTask {
                partition: Partition {
                    worker_id: id,
                    data: ArrayD::from_elem(IxDyn(&[1, 2, 2]), id as f32),
                    mask: Array3::from_elem((1, 2, 2), true),
                    extra: Vec::new(),
                },
                options: RunOptions::new(),
                selection: EngineSelection::default(),
                progress: progress.clone(),
                abort: AbortHandle::new(),
                trace_failures: false,
            })
            .collect();

        let rx = pool.launch(tasks, Arc::new(IdFactory));
        let mut results: Vec<WorkerResult> = rx.iter().collect();
        results.sort_by_key(|r| r.worker_id);

        assert_eq!(results.len(), 5);
        for (id, result) in results.iter().enumerate() {
            assert_eq!(result.worker_id, id);
            let copy = &result.run_result().unwrap().data["copy"];
            assert_eq!(copy[[0, 1, 1]], id as f32);
        }
    }
}

//! Cancellation and host callbacks for a dispatched run.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use super::ProcessStatus;

/// Handle for cooperative cancellation of a run.
///
/// `AbortHandle` is cloned into every worker of a run. Any clone can trigger
/// the abort, which is visible to all other clones. Workers check it before
/// constructing their engine and on every progress report.
///
/// # Example
///
/// ```
/// use fabber_core::dispatch::AbortHandle;
///
/// let handle = AbortHandle::new();
/// let worker_copy = handle.clone();
///
/// assert!(!worker_copy.is_aborted());
/// handle.abort();
/// assert!(worker_copy.is_aborted());
/// ```
#[derive(Debug, Clone, Default)]
pub struct AbortHandle {
    aborted: Arc<AtomicBool>,
}

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if abort has been requested.
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Relaxed)
    }

    /// Request abort of the run.
    ///
    /// Workers that have not yet started their engine skip it. Workers
    /// already inside the engine finish the call, then report `Aborted`.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Relaxed);
    }
}

/// Callback trait for the host application.
pub trait ProcessCallback: Send + Sync {
    /// Overall fraction of masked voxels processed, in `[0, 1]`.
    fn on_progress(&self, fraction: f64);

    /// Called as each worker's result is collected.
    fn on_worker_finished(&self, _worker_id: usize, _success: bool) {}

    /// Called once when the run completes.
    fn on_finished(&self, status: ProcessStatus, log: &str);
}

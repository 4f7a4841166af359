//! Progress channel from workers to the orchestrator.
//!
//! Workers push `(worker id, voxels done, voxels total)` messages without
//! blocking; the orchestrator drains everything available on each poll and
//! folds it into a `ProgressTracker`.

use crossbeam_channel::{Receiver, Sender, TryRecvError};

use super::context::AbortHandle;

/// Report interval in voxels. The final voxel is always reported.
pub const REPORT_INTERVAL: usize = 100;

/// Latest progress of one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressMessage {
    pub worker_id: usize,
    pub done: usize,
    pub total: usize,
}

/// Producer side, one clone per worker.
#[derive(Debug, Clone)]
pub struct ProgressSender {
    tx: Sender<ProgressMessage>,
}

impl ProgressSender {
    /// Push a message. Never blocks; a closed channel is ignored.
    pub fn send(&self, message: ProgressMessage) {
        let _ = self.tx.send(message);
    }
}

/// Consumer side, owned by the orchestrator.
#[derive(Debug)]
pub struct ProgressReceiver {
    rx: Receiver<ProgressMessage>,
}

impl ProgressReceiver {
    /// Take every message currently queued without waiting.
    pub fn drain(&self) -> Vec<ProgressMessage> {
        let mut messages = Vec::new();
        loop {
            match self.rx.try_recv() {
                Ok(message) => messages.push(message),
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }
        messages
    }
}

/// Create a progress channel.
pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    let (tx, rx) = crossbeam_channel::unbounded();
    (ProgressSender { tx }, ProgressReceiver { rx })
}

/// Engine progress callback bound to one worker.
///
/// Emits only every `REPORT_INTERVAL`th voxel and the final voxel.
#[derive(Debug)]
pub struct ProgressReporter {
    worker_id: usize,
    sender: ProgressSender,
    abort: AbortHandle,
}

impl ProgressReporter {
    pub fn new(worker_id: usize, sender: ProgressSender, abort: AbortHandle) -> Self {
        Self {
            worker_id,
            sender,
            abort,
        }
    }

    pub fn report(&mut self, done: usize, total: usize) {
        if self.abort.is_aborted() {
            return;
        }
        if done % REPORT_INTERVAL == 0 || done == total {
            self.sender.send(ProgressMessage {
                worker_id: self.worker_id,
                done,
                total,
            });
        }
    }
}

/// Folds worker messages into overall progress.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    voxels_done: Vec<usize>,
    voxels_todo: usize,
}

impl ProgressTracker {
    pub fn new(workers: usize, voxels_todo: usize) -> Self {
        Self {
            voxels_done: vec![0; workers],
            voxels_todo,
        }
    }

    /// Record a message. Returns `false` for an unknown worker id.
    ///
    /// A worker's count never goes backwards.
    pub fn apply(&mut self, message: ProgressMessage) -> bool {
        let Some(done) = self.voxels_done.get_mut(message.worker_id) else {
            tracing::warn!(
                "Progress from worker {} ignored (run has {} workers)",
                message.worker_id,
                self.voxels_done.len()
            );
            return false;
        };
        *done = (*done).max(message.done);
        true
    }

    /// Mark a worker as having processed all of its voxels.
    pub fn complete(&mut self, worker_id: usize, voxels: usize) {
        if let Some(done) = self.voxels_done.get_mut(worker_id) {
            *done = (*done).max(voxels);
        }
    }

    pub fn voxels_done(&self) -> usize {
        self.voxels_done.iter().sum()
    }

    pub fn voxels_todo(&self) -> usize {
        self.voxels_todo
    }

    /// Fraction of masked voxels processed. A run with nothing to do is complete.
    pub fn fraction(&self) -> f64 {
        if self.voxels_todo == 0 {
            return 1.0;
        }
        (self.voxels_done() as f64 / self.voxels_todo as f64).min(1.0)
    }
}

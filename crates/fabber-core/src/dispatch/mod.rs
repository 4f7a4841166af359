//! Parallel dispatch of a Fabber run.
//!
//! A run is split along the first axis of the mask's bounding box, one
//! partition per slice, and each partition is fitted by its own engine
//! instance on a worker thread.
//!
//! # Architecture
//!
//! ```text
//! FabberProcess::run(options)
//!     │
//!     ├── RunData::prepare          defaults, model group, consumed keys
//!     ├── partition                 bounding box -> one Partition per slice
//!     │
//!     └── WorkerPool::launch
//!             │
//!             └── run_worker (per partition)
//!                     ├── empty mask -> placeholder result
//!                     ├── EngineFactory::create -> Engine::run
//!                     └── ProgressReporter -> progress channel
//!
//! FabberProcess::poll()
//!     ├── drain progress channel -> ProgressTracker
//!     └── all results in -> aggregate -> DataStore::add_data
//! ```
//!
//! # Module Structure
//!
//! - `aggregate` - merging worker outputs and logs
//! - `context` - cancellation and host callbacks
//! - `partition` - splitting data into partitions
//! - `pool` - Rayon worker pool
//! - `process` - the orchestrator
//! - `progress` - progress channel and tracking
//! - `rundata` - run option derivation
//! - `worker` - per-partition engine invocation

mod aggregate;
mod context;
mod partition;
mod pool;
mod process;
mod progress;
mod rundata;
mod worker;

pub use aggregate::{Aggregate, LogPolicy, MergedOutput, RecombineLayout, aggregate};
pub use context::{AbortHandle, ProcessCallback};
pub use partition::{Partition, PartitionPlan, collect_extra_data, partition};
pub use pool::WorkerPool;
pub use process::{FabberProcess, POLL_INTERVAL, ProcessStatus};
pub use progress::{
    ProgressMessage, ProgressReceiver, ProgressReporter, ProgressSender, ProgressTracker, REPORT_INTERVAL,
    progress_channel,
};
pub use rundata::RunData;
pub use worker::{WorkerOutcome, WorkerResult, WorkerTask, run_worker};

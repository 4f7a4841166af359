//! Parallel dispatch layer for the Fabber Bayesian model-fitting engine.
//!
//! This crate provides:
//! - Partitioning of a masked 3-D/4-D volume into per-slice work
//! - Worker invocation of the native engine, one instance per partition
//! - Progress tracking across workers
//! - Recombination of partial outputs into full-volume results
//! - A polling orchestrator over a host data store

pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod options;
pub mod store;
pub mod volume;

pub use config::DispatchConfig;
pub use dispatch::{AbortHandle, FabberProcess, LogPolicy, ProcessCallback, ProcessStatus, RunData};
pub use engine::{
    DataBundle, Engine, EngineFactory, EngineSelection, LibraryLocator, NativeEngine, NativeEngineFactory,
    RunResult,
};
pub use error::{Error, Result};
pub use options::{OptionValue, RunOptions};
pub use store::{DataStore, MemoryStore};
pub use volume::{BoundingBox, Grid, Mask, Volume};

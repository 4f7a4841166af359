//! Error types for fabber-core.

use std::sync::Arc;

use thiserror::Error;

/// Result type for fabber-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in fabber-core.
///
/// Cloneable so a worker failure can be kept both in the raw per-worker
/// result sequence and as the failure surfaced to the host.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Malformed or inconsistent run options.
    #[error("configuration error: {0}")]
    Config(String),

    /// A partition handed to a worker violates its own invariants.
    #[error("invalid partition: {0}")]
    InvalidPartition(String),

    /// Array shapes do not line up (grid, mask, worker output).
    #[error("shape mismatch: {0}")]
    Shape(String),

    /// A named data item is not present in the data store.
    #[error("data item not found: {0}")]
    DataNotFound(String),

    /// The native engine rejected the configuration or failed during a run.
    #[error("engine error: {message}")]
    Engine {
        message: String,
        /// Whatever log text the engine produced before failing.
        log: String,
    },

    /// Failed to load a shared library.
    #[error("failed to load library: {0}")]
    LibraryLoad(#[from] Arc<libloading::Error>),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] Arc<std::io::Error>),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] Arc<serde_json::Error>),

    /// A worker panicked or disappeared without reporting.
    #[error("worker error: {0}")]
    Worker(String),

    /// Operation not valid in the current process state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The run was cancelled.
    #[error("run aborted")]
    Aborted,
}

impl Error {
    /// Shorthand for an engine failure carrying a partial log.
    pub fn engine(message: impl Into<String>, log: impl Into<String>) -> Self {
        Self::Engine {
            message: message.into(),
            log: log.into(),
        }
    }

    /// Partial log attached to the failure, if any.
    pub fn log(&self) -> Option<&str> {
        match self {
            Self::Engine { log, .. } if !log.is_empty() => Some(log),
            _ => None,
        }
    }
}

impl From<libloading::Error> for Error {
    fn from(e: libloading::Error) -> Self {
        Self::LibraryLoad(Arc::new(e))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(Arc::new(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_error_keeps_log() {
        let err = Error::engine("bad model", "Fabber starting\n");
        assert_eq!(err.log(), Some("Fabber starting\n"));
        assert_eq!(err.to_string(), "engine error: bad model");
    }

    #[test]
    fn test_empty_log_is_none() {
        assert_eq!(Error::engine("x", "").log(), None);
        assert_eq!(Error::Aborted.log(), None);
    }

    #[test]
    fn test_io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
    }
}

//! Dispatch configuration.

use serde::Deserialize;

use crate::dispatch::LogPolicy;

/// Settings for how a run is dispatched, as opposed to what is fitted.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Worker pool size; 0 uses one thread per CPU.
    pub threads: usize,

    /// Which worker logs make up the run log.
    pub log_policy: LogPolicy,

    /// Log each worker failure as it happens.
    pub trace_failures: bool,
}

impl DispatchConfig {
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn with_log_policy(mut self, log_policy: LogPolicy) -> Self {
        self.log_policy = log_policy;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DispatchConfig::default();
        assert_eq!(config.threads, 0);
        assert_eq!(config.log_policy, LogPolicy::First);
        assert!(!config.trace_failures);
    }

    #[test]
    fn test_deserialize_partial() {
        let config: DispatchConfig = serde_json::from_str(r#"{"log_policy": "concatenate"}"#).unwrap();
        assert_eq!(config.log_policy, LogPolicy::Concatenate);
        assert_eq!(config.threads, 0);
    }
}

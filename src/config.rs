//! Manager configuration.
//!
//! Every option is optional so a partially specified configuration (for
//! example deserialized from a caller's own settings file) falls back to the
//! defaults below.

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_AUTOCOMMIT: bool = false;
pub const DEFAULT_OMNI_LOG: bool = false;
pub const DEFAULT_LOG_RESULTS: bool = true;
pub const DEFAULT_CREATE_IF_MISSING: bool = true;
pub const DEFAULT_BUSY_TIMEOUT_SECS: u64 = 5;

// History buffer defaults
pub const DEFAULT_HISTORY_LENGTH: usize = 10;
pub const DEFAULT_HISTORY_TOLERANCE: usize = 5;

/// Options controlling manager-wide policies.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Commit after every statement unless overridden per call (default: false)
    pub autocommit: Option<bool>,
    /// Log every statement at info level unless overridden per call (default: false)
    pub omni_log: Option<bool>,
    /// Record executed statements with the history recorder (default: true)
    pub log_results: Option<bool>,
    /// Create missing database files on connect (default: true)
    pub create_if_missing: Option<bool>,
    /// How long the engine waits on a locked database in seconds (default: 5)
    pub busy_timeout_secs: Option<u64>,
    /// History buffer length before a flush is due (default: 10)
    pub history_length: Option<usize>,
    /// Extra entries tolerated past `history_length` (default: 5)
    pub history_tolerance: Option<usize>,
}

impl ManagerConfig {
    /// Create a configuration with all defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the manager-wide autocommit policy.
    pub fn with_autocommit(mut self, autocommit: bool) -> Self {
        self.autocommit = Some(autocommit);
        self
    }

    /// Set the omni-log policy.
    pub fn with_omni_log(mut self, omni_log: bool) -> Self {
        self.omni_log = Some(omni_log);
        self
    }

    /// Enable or disable history recording.
    pub fn with_log_results(mut self, log_results: bool) -> Self {
        self.log_results = Some(log_results);
        self
    }

    /// Set the engine busy timeout.
    pub fn with_busy_timeout_secs(mut self, secs: u64) -> Self {
        self.busy_timeout_secs = Some(secs);
        self
    }

    pub fn autocommit_or_default(&self) -> bool {
        self.autocommit.unwrap_or(DEFAULT_AUTOCOMMIT)
    }

    pub fn omni_log_or_default(&self) -> bool {
        self.omni_log.unwrap_or(DEFAULT_OMNI_LOG)
    }

    pub fn log_results_or_default(&self) -> bool {
        self.log_results.unwrap_or(DEFAULT_LOG_RESULTS)
    }

    pub fn create_if_missing_or_default(&self) -> bool {
        self.create_if_missing.unwrap_or(DEFAULT_CREATE_IF_MISSING)
    }

    /// Busy timeout as a `Duration`.
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_secs(self.busy_timeout_secs.unwrap_or(DEFAULT_BUSY_TIMEOUT_SECS))
    }

    pub fn history_length_or_default(&self) -> usize {
        self.history_length.unwrap_or(DEFAULT_HISTORY_LENGTH)
    }

    pub fn history_tolerance_or_default(&self) -> usize {
        self.history_tolerance.unwrap_or(DEFAULT_HISTORY_TOLERANCE)
    }
}

//! Runtime Configuration
//!
//! A [`Config`] controls how a [`Runtime`](crate::reactive::Runtime)
//! schedules and reports. It can be built in code or deserialized from JSON:
//!
//! ```rust,ignore
//! let config = Config::from_json(r#"{ "sync": true, "silent": true }"#)?;
//! let runtime = Runtime::with_config(config);
//! ```

use serde::Deserialize;

/// Default re-entry ceiling for a single node within one flush.
pub const DEFAULT_MAX_UPDATE_COUNT: usize = 100;

/// Scheduler and diagnostic settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Flush synchronously as soon as a node is queued, instead of
    /// deferring to the host's next tick.
    pub sync: bool,

    /// How many times a node may be re-queued within one flush before the
    /// flush is aborted as a runaway update loop.
    pub max_update_count: usize,

    /// Suppress diagnostics (runaway updates, misuse warnings). The
    /// corrective behaviour still applies.
    pub silent: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sync: false,
            max_update_count: DEFAULT_MAX_UPDATE_COUNT,
            silent: false,
        }
    }
}

impl Config {
    /// Parse a configuration from a JSON document. Missing fields take
    /// their default values.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn with_sync(mut self, sync: bool) -> Self {
        self.sync = sync;
        self
    }

    pub fn with_max_update_count(mut self, max_update_count: usize) -> Self {
        self.max_update_count = max_update_count;
        self
    }

    pub fn with_silent(mut self, silent: bool) -> Self {
        self.silent = silent;
        self
    }
}

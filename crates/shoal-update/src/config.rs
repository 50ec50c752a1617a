//! Updater tuning knobs that are not part of a service's spec.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Process-wide updater settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdaterConfig {
    /// Monitor window used when a spec leaves `monitor` at zero.
    pub default_monitor_ms: u64,
    /// Attempts for a store transaction that fails transiently.
    pub commit_retries: u32,
    /// Base backoff between transaction attempts, multiplied by the attempt number.
    pub retry_backoff_ms: u64,
    /// Capacity of the store's change-notification queue.
    pub event_buffer: usize,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            default_monitor_ms: 5_000,
            commit_retries: 5,
            retry_backoff_ms: 50,
            event_buffer: 1024,
        }
    }
}

impl UpdaterConfig {
    pub fn default_monitor(&self) -> Duration {
        Duration::from_millis(self.default_monitor_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

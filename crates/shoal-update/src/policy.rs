//! Rollout policy — a service's update config resolved against updater defaults.

use std::time::Duration;

use shoal_state::{FailureAction, UpdateConfig};

use crate::config::UpdaterConfig;

/// Effective policy for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct RolloutPolicy {
    /// Max concurrent slot replacements. 0 means every targeted slot at once.
    pub parallelism: usize,
    /// Minimum spacing between batch starts.
    pub delay: Duration,
    /// How long to watch each new task for RUNNING or failure.
    pub monitor: Duration,
    /// Failures per targeted slot tolerated before `failure_action`.
    pub max_failure_ratio: f32,
    pub failure_action: FailureAction,
}

impl RolloutPolicy {
    /// Resolve a spec's update config, filling the monitor window from `defaults`.
    pub fn resolve(update: &UpdateConfig, defaults: &UpdaterConfig) -> Self {
        let monitor = if update.monitor.is_zero() {
            defaults.default_monitor()
        } else {
            update.monitor
        };
        Self {
            parallelism: usize::try_from(update.parallelism).unwrap_or(usize::MAX),
            delay: update.delay,
            monitor,
            max_failure_ratio: update.max_failure_ratio,
            failure_action: update.failure_action,
        }
    }

    /// Slots per batch for a run targeting `targeted` slots.
    ///
    /// Never more than the targeted slots, and never zero.
    pub fn batch_size(&self, targeted: usize) -> usize {
        if self.parallelism == 0 {
            targeted.max(1)
        } else {
            self.parallelism.min(targeted).max(1)
        }
    }

    /// Number of batches a run targeting `targeted` slots is split into.
    pub fn batch_count(&self, targeted: usize) -> usize {
        targeted.div_ceil(self.batch_size(targeted))
    }

    /// Whether a breach stops dispatch. `Continue` keeps going regardless.
    pub fn stops_on_breach(&self) -> bool {
        self.failure_action != FailureAction::Continue
    }
}

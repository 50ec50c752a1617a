//! Failure monitor — per-run outcome bookkeeping and per-task observation.
//!
//! Each slot worker watches the task it created for up to the monitor
//! window. Reaching `Running` is a success; reaching any terminal state
//! first is a failure and ends the wait at once. A window that expires with
//! the task still on its way is neutral: it neither succeeds nor counts
//! toward the failure ratio.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use shoal_state::{StateStore, StoreEvent, Subscription, Task, TaskState, WatchError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{UpdateError, UpdateResult};

/// How a monitored task resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotOutcome {
    /// Reached `Running` within the window.
    Running,
    /// Terminated before running, in the given state.
    Failed(TaskState),
    /// Still converging when the window closed.
    Unresolved,
}

/// Outcome counters for one run, shared by its slot workers.
///
/// Counters only grow, so the ratio never decreases within a run.
#[derive(Debug)]
pub struct FailureTracker {
    targeted: usize,
    succeeded: AtomicUsize,
    failed: AtomicUsize,
    unresolved: AtomicUsize,
}

impl FailureTracker {
    pub fn new(targeted: usize) -> Self {
        Self {
            targeted,
            succeeded: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            unresolved: AtomicUsize::new(0),
        }
    }

    pub fn record(&self, outcome: SlotOutcome) {
        let counter = match outcome {
            SlotOutcome::Running => &self.succeeded,
            SlotOutcome::Failed(_) => &self.failed,
            SlotOutcome::Unresolved => &self.unresolved,
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }

    pub fn targeted(&self) -> usize {
        self.targeted
    }

    pub fn failures(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    pub fn successes(&self) -> usize {
        self.succeeded.load(Ordering::SeqCst)
    }

    pub fn unresolved(&self) -> usize {
        self.unresolved.load(Ordering::SeqCst)
    }

    /// Failures over targeted slots.
    pub fn ratio(&self) -> f32 {
        if self.targeted == 0 {
            return 0.0;
        }
        self.failures() as f32 / self.targeted as f32
    }

    /// Strictly above `max_ratio`.
    pub fn exceeds(&self, max_ratio: f32) -> bool {
        self.ratio() > max_ratio
    }
}

/// Map a task snapshot to an outcome, if it has one yet.
pub fn classify(task: &Task) -> Option<SlotOutcome> {
    match task.status.state {
        TaskState::Running => Some(SlotOutcome::Running),
        state if state.is_terminal() => Some(SlotOutcome::Failed(state)),
        _ => None,
    }
}

/// Wait for `task_id` to run or fail, for at most `window`.
///
/// `events` must have been subscribed to task updates and deletions before
/// the task was created so no transition is missed. Returns `None` if
/// `token` is cancelled first.
pub async fn watch_task(
    events: &mut Subscription,
    store: &StateStore,
    task_id: &str,
    window: Duration,
    token: &CancellationToken,
) -> UpdateResult<Option<SlotOutcome>> {
    let deadline = Instant::now() + window;

    loop {
        let received = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(None),
            _ = tokio::time::sleep_until(deadline) => {
                debug!(task = %task_id, "monitor window elapsed");
                return Ok(Some(SlotOutcome::Unresolved));
            }
            received = events.recv() => received,
        };

        match received {
            Ok(StoreEvent::TaskUpdated(task)) if task.id == task_id => {
                if let Some(outcome) = classify(&task) {
                    return Ok(Some(outcome));
                }
            }
            Ok(StoreEvent::TaskDeleted(task)) if task.id == task_id => {
                return Ok(Some(SlotOutcome::Failed(TaskState::Remove)));
            }
            Ok(_) => {}
            Err(WatchError::Lagged(missed)) => {
                warn!(task = %task_id, missed, "task watch lagged, re-reading task");
                match store.get_task(task_id)? {
                    Some(task) => {
                        if let Some(outcome) = classify(&task) {
                            return Ok(Some(outcome));
                        }
                    }
                    None => return Ok(Some(SlotOutcome::Failed(TaskState::Remove))),
                }
            }
            Err(WatchError::Closed) => return Err(UpdateError::EventsClosed),
        }
    }
}

//! Rollback coordinator — the update status state machine.
//!
//! A run is either a primary update or a rollback. What a breach leads to
//! depends on both the run kind and the service's failure action; a
//! rollback run never starts another rollback.

use shoal_state::{FailureAction, UpdateState, UpdateStatus};

/// Which kind of run is driving a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunKind {
    /// Converging to a freshly changed spec.
    Update,
    /// Converging back to the spec that was in effect before a failed update.
    Rollback,
}

impl RunKind {
    /// A service whose status reads `RollbackStarted` is being rolled back.
    pub fn from_status(status: Option<&UpdateStatus>) -> Self {
        match status.map(|s| s.state) {
            Some(UpdateState::RollbackStarted) => Self::Rollback,
            _ => Self::Update,
        }
    }

    pub fn completed_state(self) -> UpdateState {
        match self {
            Self::Update => UpdateState::Completed,
            Self::Rollback => UpdateState::RollbackCompleted,
        }
    }

    pub fn paused_state(self) -> UpdateState {
        match self {
            Self::Update => UpdateState::Paused,
            Self::Rollback => UpdateState::RollbackPaused,
        }
    }
}

/// What a run does once its failure ratio is exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreachDecision {
    /// Stop and publish the given paused state.
    Pause(UpdateState),
    /// Keep dispatching; the ratio no longer gates this run.
    Continue,
    /// Revert to the previous spec.
    Rollback,
}

pub fn on_breach(kind: RunKind, action: FailureAction) -> BreachDecision {
    match (kind, action) {
        (_, FailureAction::Continue) => BreachDecision::Continue,
        (RunKind::Update, FailureAction::Rollback) => BreachDecision::Rollback,
        (kind, _) => BreachDecision::Pause(kind.paused_state()),
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// All slots converged; carries `Completed` or `RollbackCompleted`.
    Completed(UpdateState),
    /// Stopped on a breach; carries `Paused` or `RollbackPaused`.
    Paused(UpdateState),
    /// Handed over to a rollback run.
    RollbackStarted,
    /// The target spec was invalid.
    Aborted,
    /// A newer run took over before this one finished.
    Superseded,
    /// Nothing needed to change.
    NothingToDo,
}

/// Whether the status may move from `from` to `to`.
pub fn transition_allowed(from: Option<UpdateState>, to: UpdateState) -> bool {
    use UpdateState::*;
    match to {
        // Any run may start fresh unless a rollback is in progress.
        Updating => from != Some(RollbackStarted),
        Completed | Paused | RollbackStarted => from == Some(Updating),
        RollbackCompleted | RollbackPaused => from == Some(RollbackStarted),
        Aborted => true,
    }
}

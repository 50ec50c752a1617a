//! Update status publisher.
//!
//! Every write re-reads the service inside its transaction and only lands
//! if the service still carries the spec this run was started for; a run
//! whose spec has since changed, or whose token is cancelled, writes
//! nothing.

use shoal_state::{ServiceId, ServiceSpec, StateStore, UpdateState, UpdateStatus, epoch_secs};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::UpdaterConfig;
use crate::controller::transition_allowed;
use crate::error::UpdateResult;
use crate::retry::commit;

/// Result of a status write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Published {
    Written,
    /// The run no longer owns the service.
    Superseded,
    /// A rollback was requested but no previous spec is recorded.
    NoPreviousSpec,
    /// The state machine does not allow this transition.
    Rejected,
}

pub struct StatusPublisher {
    store: StateStore,
    config: UpdaterConfig,
    service_id: ServiceId,
    target: ServiceSpec,
    token: CancellationToken,
}

impl StatusPublisher {
    pub fn new(
        store: StateStore,
        config: UpdaterConfig,
        service_id: &str,
        target: ServiceSpec,
        token: CancellationToken,
    ) -> Self {
        Self {
            store,
            config,
            service_id: service_id.to_string(),
            target,
            token,
        }
    }

    /// Mark the start of a primary update.
    ///
    /// `replaced` is the spec in effect before the change that started this
    /// run; when known it becomes the service's previous spec.
    pub async fn start_update(&self, replaced: Option<&ServiceSpec>) -> UpdateResult<Published> {
        self.write(UpdateState::Updating, "update in progress", |service| {
            if let Some(spec) = replaced {
                service.previous_spec = Some(spec.clone());
            }
            Published::Written
        })
        .await
    }

    /// Publish `state` with `message`.
    pub async fn publish(&self, state: UpdateState, message: &str) -> UpdateResult<Published> {
        self.write(state, message, |_| Published::Written).await
    }

    /// Start a rollback: promote the previous spec to the live spec.
    ///
    /// The status, the spec swap and clearing the previous spec commit
    /// together; the resulting spec change starts the rollback run.
    pub async fn start_rollback(&self, message: &str) -> UpdateResult<Published> {
        self.write(UpdateState::RollbackStarted, message, |service| {
            match service.previous_spec.take() {
                Some(previous) => {
                    service.spec = previous;
                    Published::Written
                }
                None => Published::NoPreviousSpec,
            }
        })
        .await
    }

    async fn write<F>(&self, state: UpdateState, message: &str, mut apply: F) -> UpdateResult<Published>
    where
        F: FnMut(&mut shoal_state::Service) -> Published,
    {
        if self.token.is_cancelled() {
            debug!(service = %self.service_id, ?state, "run cancelled, status not written");
            return Ok(Published::Superseded);
        }

        let result = commit(&self.store, &self.config, &self.token, |tx| {
            let Some(mut service) = tx.get_service(&self.service_id)? else {
                return Ok(Published::Superseded);
            };
            if service.spec != self.target {
                return Ok(Published::Superseded);
            }
            let from = service.update_status.as_ref().map(|s| s.state);
            if !transition_allowed(from, state) {
                return Ok(Published::Rejected);
            }

            let outcome = apply(&mut service);
            if outcome != Published::Written {
                return Ok(outcome);
            }

            let now = epoch_secs();
            let started_at = match state {
                UpdateState::Updating | UpdateState::RollbackStarted => Some(now),
                _ => service.update_status.as_ref().and_then(|s| s.started_at),
            };
            service.update_status = Some(UpdateStatus {
                state,
                message: message.to_string(),
                started_at,
                completed_at: state.is_terminal().then_some(now),
            });
            tx.update_service(&mut service)?;
            Ok(Published::Written)
        })
        .await?
        .unwrap_or(Published::Superseded);

        match result {
            Published::Written => {
                info!(service = %self.service_id, ?state, %message, "update status published")
            }
            Published::Rejected => {
                warn!(service = %self.service_id, ?state, "status transition rejected")
            }
            other => debug!(service = %self.service_id, ?state, ?other, "status not written"),
        }
        Ok(result)
    }
}

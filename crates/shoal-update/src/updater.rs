//! Updater — drives one service through a single run.
//!
//! A run reads the service once, plans its slots against the current spec,
//! dispatches them through the [`BatchScheduler`], and publishes the
//! resulting status. Whether the run is a primary update or a rollback is
//! read from the status the service carries when the run starts.

use std::sync::Arc;

use shoal_state::{ServiceSpec, StateStore, TaskState, UpdateState};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::UpdaterConfig;
use crate::controller::{on_breach, BreachDecision, RunKind, RunOutcome};
use crate::error::{UpdateError, UpdateResult};
use crate::monitor::FailureTracker;
use crate::planner::plan;
use crate::policy::RolloutPolicy;
use crate::retry::commit;
use crate::scheduler::{BatchScheduler, DispatchEnd};
use crate::status::{Published, StatusPublisher};

/// Reject specs that cannot be turned into tasks.
pub fn validate(spec: &ServiceSpec) -> UpdateResult<()> {
    if spec.task.container.image.trim().is_empty() {
        return Err(UpdateError::InvalidSpec("container image is empty".to_string()));
    }
    let ratio = spec.update.max_failure_ratio;
    if !ratio.is_finite() || !(0.0..=1.0).contains(&ratio) {
        return Err(UpdateError::InvalidSpec(format!(
            "max_failure_ratio {ratio} is outside [0, 1]"
        )));
    }
    if usize::try_from(spec.replicas).is_err() {
        return Err(UpdateError::InvalidSpec(format!(
            "replicas {} is not addressable",
            spec.replicas
        )));
    }
    Ok(())
}

/// One run for one service.
pub struct Updater {
    store: StateStore,
    config: UpdaterConfig,
    service_id: String,
    token: CancellationToken,
    replaced: Option<ServiceSpec>,
}

impl Updater {
    pub fn new(store: StateStore, config: UpdaterConfig, service_id: &str, token: CancellationToken) -> Self {
        Self {
            store,
            config,
            service_id: service_id.to_string(),
            token,
            replaced: None,
        }
    }

    /// The spec in effect before the change that triggered this run.
    pub fn with_replaced_spec(mut self, spec: Option<ServiceSpec>) -> Self {
        self.replaced = spec;
        self
    }

    pub async fn run(self) -> UpdateResult<RunOutcome> {
        if self.token.is_cancelled() {
            return Ok(RunOutcome::Superseded);
        }
        let Some(service) = self.store.get_service(&self.service_id)? else {
            debug!(service = %self.service_id, "service gone, nothing to update");
            return Ok(RunOutcome::NothingToDo);
        };

        let kind = RunKind::from_status(service.update_status.as_ref());
        let target = service.spec.clone();
        let publisher = StatusPublisher::new(
            self.store.clone(),
            self.config.clone(),
            &self.service_id,
            target.clone(),
            self.token.clone(),
        );

        if let Err(e) = validate(&target) {
            warn!(service = %self.service_id, error = %e, "aborting run");
            return Ok(match publisher.publish(UpdateState::Aborted, &e.to_string()).await? {
                Published::Superseded => RunOutcome::Superseded,
                _ => RunOutcome::Aborted,
            });
        }

        let tasks = self.store.list_tasks_for_service(&self.service_id)?;
        let slot_plan = plan(&target, &tasks);

        if slot_plan.is_empty() {
            let active = service
                .update_status
                .as_ref()
                .is_some_and(|s| !s.state.is_terminal());
            if !active {
                debug!(service = %self.service_id, "already converged");
                return Ok(RunOutcome::NothingToDo);
            }
            return self.finish(&publisher, kind).await;
        }

        if kind == RunKind::Update {
            let started = publisher.start_update(self.replaced.as_ref()).await?;
            if started == Published::Superseded {
                return Ok(RunOutcome::Superseded);
            }
        }

        let policy = RolloutPolicy::resolve(&target.update, &self.config);
        info!(
            service = %self.service_id,
            ?kind,
            targeted = slot_plan.targeted(),
            surplus = slot_plan.surplus.len(),
            parallelism = policy.parallelism,
            monitor_ms = policy.monitor.as_millis() as u64,
            "run started"
        );

        if !slot_plan.surplus.is_empty() {
            self.retire(&slot_plan.surplus).await?;
        }

        let scheduler = BatchScheduler::new(
            self.store.clone(),
            self.config.clone(),
            &self.service_id,
            target.task.clone(),
            policy.clone(),
            Arc::new(FailureTracker::new(slot_plan.targeted())),
        );

        match scheduler.drive(slot_plan.actions, &self.token).await? {
            DispatchEnd::Cancelled => {
                info!(service = %self.service_id, "run superseded");
                Ok(RunOutcome::Superseded)
            }
            DispatchEnd::Exhausted => self.finish(&publisher, kind).await,
            DispatchEnd::Breached => {
                self.breached(&publisher, kind, &policy, scheduler.tracker()).await
            }
        }
    }

    async fn finish(&self, publisher: &StatusPublisher, kind: RunKind) -> UpdateResult<RunOutcome> {
        let state = kind.completed_state();
        let message = match kind {
            RunKind::Update => "update completed",
            RunKind::Rollback => "rollback completed",
        };
        Ok(match publisher.publish(state, message).await? {
            Published::Superseded => RunOutcome::Superseded,
            _ => RunOutcome::Completed(state),
        })
    }

    async fn breached(
        &self,
        publisher: &StatusPublisher,
        kind: RunKind,
        policy: &RolloutPolicy,
        tracker: &FailureTracker,
    ) -> UpdateResult<RunOutcome> {
        let reason = format!(
            "{} of {} tasks failed, ratio {:.2} exceeds {:.2}",
            tracker.failures(),
            tracker.targeted(),
            tracker.ratio(),
            policy.max_failure_ratio
        );
        warn!(service = %self.service_id, ?kind, %reason, "failure threshold breached");

        match on_breach(kind, policy.failure_action) {
            BreachDecision::Pause(state) => {
                let verb = match kind {
                    RunKind::Update => "update",
                    RunKind::Rollback => "rollback",
                };
                self.pause(publisher, state, &format!("{verb} paused: {reason}")).await
            }
            BreachDecision::Continue => self.finish(publisher, kind).await,
            BreachDecision::Rollback => {
                match publisher.start_rollback(&format!("rollback started: {reason}")).await? {
                    Published::Written => Ok(RunOutcome::RollbackStarted),
                    Published::NoPreviousSpec => {
                        let message = format!("update paused, no previous spec to roll back to: {reason}");
                        self.pause(publisher, UpdateState::Paused, &message).await
                    }
                    Published::Superseded => Ok(RunOutcome::Superseded),
                    Published::Rejected => Ok(RunOutcome::Paused(UpdateState::Paused)),
                }
            }
        }
    }

    async fn pause(
        &self,
        publisher: &StatusPublisher,
        state: UpdateState,
        message: &str,
    ) -> UpdateResult<RunOutcome> {
        Ok(match publisher.publish(state, message).await? {
            Published::Superseded => RunOutcome::Superseded,
            _ => RunOutcome::Paused(state),
        })
    }

    /// Move surplus tasks to REMOVE in one transaction.
    async fn retire(&self, surplus: &[shoal_state::Task]) -> UpdateResult<()> {
        if self.token.is_cancelled() {
            return Ok(());
        }
        let retired = commit(&self.store, &self.config, &self.token, |tx| {
            let mut retired = 0usize;
            for task in surplus {
                if let Some(mut current) = tx.get_task(&task.id)? {
                    if current.is_live() {
                        current.desired_state = TaskState::Remove;
                        tx.update_task(&mut current)?;
                        retired += 1;
                    }
                }
            }
            Ok(retired)
        })
        .await?;
        if let Some(retired) = retired {
            debug!(service = %self.service_id, retired, "surplus tasks retired");
        }
        Ok(())
    }
}

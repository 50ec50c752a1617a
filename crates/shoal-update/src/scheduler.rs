//! Batch scheduler — drives planned slots through replacement.
//!
//! Slots are dispatched in ascending order. A semaphore sized to the
//! batch size bounds how many slots are mid-replacement at once; each slot
//! worker holds its permit from the create transaction until its monitor
//! window resolves. The first slot of every batch waits until `delay` has
//! passed since the previous batch started. Before each dispatch the
//! failure ratio is consulted.

use std::sync::Arc;
use std::time::Duration;

use shoal_state::{
    EventKind, EventSource, ServiceId, StateStore, Task, TaskSpec, TaskState,
};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::UpdaterConfig;
use crate::error::{UpdateError, UpdateResult};
use crate::monitor::{watch_task, FailureTracker};
use crate::planner::SlotAction;
use crate::policy::RolloutPolicy;
use crate::retry::commit;

/// Events a slot worker needs to follow its task.
pub const TASK_EVENTS: &[EventKind] = &[EventKind::TaskUpdated, EventKind::TaskDeleted];

/// Why dispatch stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchEnd {
    /// Every planned slot was dispatched and its worker finished.
    Exhausted,
    /// The failure ratio was exceeded under a stopping failure action.
    Breached,
    /// The run was superseded.
    Cancelled,
}

/// Dispatches one run's slot actions.
pub struct BatchScheduler {
    worker: Arc<SlotWorker>,
    policy: RolloutPolicy,
}

impl BatchScheduler {
    pub fn new(
        store: StateStore,
        config: UpdaterConfig,
        service_id: &str,
        target: TaskSpec,
        policy: RolloutPolicy,
        tracker: Arc<FailureTracker>,
    ) -> Self {
        let worker = SlotWorker {
            store,
            config,
            service_id: service_id.to_string(),
            target,
            monitor: policy.monitor,
            tracker,
        };
        Self {
            worker: Arc::new(worker),
            policy,
        }
    }

    pub fn tracker(&self) -> &FailureTracker {
        &self.worker.tracker
    }

    /// Dispatch `actions` until exhausted, breached, or `token` is cancelled.
    ///
    /// Always waits for every spawned worker before returning, so no write
    /// from this run can land after it.
    pub async fn drive(
        &self,
        actions: Vec<SlotAction>,
        token: &CancellationToken,
    ) -> UpdateResult<DispatchEnd> {
        let targeted = actions.len();
        let batch_size = self.policy.batch_size(targeted);
        let limiter = Arc::new(Semaphore::new(batch_size));
        let workers = token.child_token();
        let mut running: JoinSet<UpdateResult<()>> = JoinSet::new();
        let mut batch_started: Option<Instant> = None;
        let mut breach_logged = false;
        let service = self.worker.service_id.as_str();

        info!(
            service = %service,
            targeted,
            batch_size,
            batches = self.policy.batch_count(targeted),
            "dispatching slots"
        );

        let end = 'dispatch: {
            for (index, action) in actions.into_iter().enumerate() {
                let first_in_batch = index % batch_size == 0;

                if first_in_batch {
                    if let Some(previous) = batch_started {
                        let ready = previous + self.policy.delay;
                        tokio::select! {
                            biased;
                            _ = token.cancelled() => break 'dispatch DispatchEnd::Cancelled,
                            _ = tokio::time::sleep_until(ready) => {}
                        }
                    }
                }

                let permit = tokio::select! {
                    biased;
                    _ = token.cancelled() => break 'dispatch DispatchEnd::Cancelled,
                    permit = Arc::clone(&limiter).acquire_owned() => {
                        permit.map_err(|e| UpdateError::Worker(e.to_string()))?
                    }
                };

                while let Some(joined) = running.try_join_next() {
                    if let Err(e) = flatten(joined) {
                        workers.cancel();
                        running.shutdown().await;
                        return Err(e);
                    }
                }

                let tracker = self.tracker();
                if tracker.exceeds(self.policy.max_failure_ratio) {
                    if self.policy.stops_on_breach() {
                        warn!(
                            service = %service,
                            failures = tracker.failures(),
                            targeted,
                            "failure ratio exceeded, stopping dispatch"
                        );
                        break 'dispatch DispatchEnd::Breached;
                    }
                    if !breach_logged {
                        warn!(
                            service = %service,
                            failures = tracker.failures(),
                            targeted,
                            "failure ratio exceeded, continuing"
                        );
                        breach_logged = true;
                    }
                }

                if first_in_batch {
                    batch_started = Some(Instant::now());
                    debug!(service = %service, batch = index / batch_size + 1, "batch started");
                }

                let worker = Arc::clone(&self.worker);
                let worker_token = workers.clone();
                running.spawn(async move { worker.replace(action, worker_token, permit).await });
            }
            DispatchEnd::Exhausted
        };

        if end != DispatchEnd::Exhausted {
            workers.cancel();
        }
        while let Some(joined) = running.join_next().await {
            if let Err(e) = flatten(joined) {
                workers.cancel();
                running.shutdown().await;
                return Err(e);
            }
        }

        if token.is_cancelled() {
            return Ok(DispatchEnd::Cancelled);
        }
        if end == DispatchEnd::Exhausted
            && self.policy.stops_on_breach()
            && self.tracker().exceeds(self.policy.max_failure_ratio)
        {
            return Ok(DispatchEnd::Breached);
        }
        Ok(end)
    }
}

fn flatten(joined: Result<UpdateResult<()>, JoinError>) -> UpdateResult<()> {
    joined.map_err(|e| UpdateError::Worker(e.to_string()))?
}

/// Everything a slot worker needs, shared across a run's workers.
struct SlotWorker {
    store: StateStore,
    config: UpdaterConfig,
    service_id: ServiceId,
    target: TaskSpec,
    monitor: Duration,
    tracker: Arc<FailureTracker>,
}

impl SlotWorker {
    /// Create the slot's new task, retire its occupants, and watch the result.
    async fn replace(
        &self,
        action: SlotAction,
        token: CancellationToken,
        _permit: OwnedSemaphorePermit,
    ) -> UpdateResult<()> {
        if token.is_cancelled() {
            return Ok(());
        }

        let mut events = self.store.subscribe(TASK_EVENTS);
        let task = Task::new(&self.service_id, action.slot, self.target.clone());

        let created = commit(&self.store, &self.config, &token, |tx| {
            // A spec change since planning means a newer run owns this slot.
            let current = tx.get_service(&self.service_id)?;
            if current.is_none_or(|s| s.spec.task != self.target) {
                return Ok(false);
            }
            for occupant in &action.occupants {
                if let Some(mut old) = tx.get_task(&occupant.id)? {
                    if old.is_live() {
                        old.desired_state = TaskState::Remove;
                        tx.update_task(&mut old)?;
                    }
                }
            }
            tx.create_task(&task)?;
            Ok(true)
        })
        .await?;

        let Some(created) = created else {
            events.unsubscribe();
            return Ok(());
        };
        if !created {
            debug!(service = %self.service_id, slot = action.slot, "target changed, slot skipped");
            events.unsubscribe();
            return Ok(());
        }
        info!(
            service = %self.service_id,
            slot = action.slot,
            task = %task.id,
            kind = ?action.kind,
            "slot dispatched"
        );

        let outcome = watch_task(&mut events, &self.store, &task.id, self.monitor, &token).await?;
        events.unsubscribe();

        if let Some(outcome) = outcome {
            self.tracker.record(outcome);
            debug!(
                service = %self.service_id,
                slot = action.slot,
                task = %task.id,
                ?outcome,
                "slot resolved"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shoal_state::{
        ContainerSpec, FailureAction, Service, ServiceSpec, StoreEvent, UpdateConfig,
    };

    use crate::planner::plan;

    fn spec(image: &str, replicas: u64) -> ServiceSpec {
        ServiceSpec {
            name: "web".to_string(),
            labels: Default::default(),
            task: TaskSpec {
                container: ContainerSpec {
                    image: image.to_string(),
                    ..Default::default()
                },
                force_update: 0,
            },
            replicas,
            update: UpdateConfig {
                monitor: Duration::from_millis(200),
                ..Default::default()
            },
        }
    }

    fn seeded(target: &ServiceSpec) -> (StateStore, Vec<SlotAction>) {
        let store = StateStore::open_in_memory().unwrap();
        let service = Service::new("svc-1", target.clone());
        store.update(|tx| tx.create_service(&service)).unwrap();
        let actions = plan(target, &[]).actions;
        (store, actions)
    }

    fn scheduler(store: &StateStore, target: &ServiceSpec, targeted: usize) -> BatchScheduler {
        let policy = RolloutPolicy::resolve(&target.update, &UpdaterConfig::default());
        BatchScheduler::new(
            store.clone(),
            UpdaterConfig::default(),
            "svc-1",
            target.task.clone(),
            policy,
            Arc::new(FailureTracker::new(targeted)),
        )
    }

    /// Moves every created task straight to `state`.
    fn spawn_agent(store: &StateStore, state: TaskState) -> tokio::task::JoinHandle<()> {
        let mut events = store.subscribe(&[EventKind::TaskCreated]);
        let store = store.clone();
        tokio::spawn(async move {
            while let Ok(StoreEvent::TaskCreated(task)) = events.recv().await {
                store
                    .update(|tx| {
                        let mut task = tx.get_task(&task.id)?.unwrap();
                        task.status.state = state;
                        tx.update_task(&mut task)
                    })
                    .unwrap();
            }
        })
    }

    fn created(store: &StateStore) -> usize {
        store.list_tasks_for_service("svc-1").unwrap().len()
    }

    #[tokio::test]
    async fn cancelled_run_dispatches_nothing() {
        let target = spec("image1", 3);
        let (store, actions) = seeded(&target);
        let token = CancellationToken::new();
        token.cancel();

        let end = scheduler(&store, &target, 3).drive(actions, &token).await.unwrap();
        assert_eq!(end, DispatchEnd::Cancelled);
        assert_eq!(created(&store), 0);
    }

    #[tokio::test]
    async fn healthy_slots_are_exhausted() {
        let target = spec("image1", 3);
        let (store, actions) = seeded(&target);
        let agent = spawn_agent(&store, TaskState::Running);

        let sched = scheduler(&store, &target, 3);
        let end = sched.drive(actions, &CancellationToken::new()).await.unwrap();
        assert_eq!(end, DispatchEnd::Exhausted);
        assert_eq!(sched.tracker().successes(), 3);
        assert_eq!(created(&store), 3);
        agent.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn silent_tasks_resolve_unresolved() {
        let target = spec("image1", 2);
        let (store, actions) = seeded(&target);

        let sched = scheduler(&store, &target, 2);
        let end = sched.drive(actions, &CancellationToken::new()).await.unwrap();
        assert_eq!(end, DispatchEnd::Exhausted);
        assert_eq!(sched.tracker().unresolved(), 2);
        assert_eq!(sched.tracker().failures(), 0);
    }

    #[tokio::test]
    async fn breach_stops_dispatch() {
        let target = spec("image1", 4);
        let (store, actions) = seeded(&target);
        let agent = spawn_agent(&store, TaskState::Failed);

        let sched = scheduler(&store, &target, 4);
        let end = sched.drive(actions, &CancellationToken::new()).await.unwrap();
        assert_eq!(end, DispatchEnd::Breached);
        assert_eq!(created(&store), 1);
        agent.abort();
    }

    #[tokio::test]
    async fn continue_ignores_breach() {
        let mut target = spec("image1", 3);
        target.update.failure_action = FailureAction::Continue;
        let (store, actions) = seeded(&target);
        let agent = spawn_agent(&store, TaskState::Failed);

        let sched = scheduler(&store, &target, 3);
        let end = sched.drive(actions, &CancellationToken::new()).await.unwrap();
        assert_eq!(end, DispatchEnd::Exhausted);
        assert_eq!(sched.tracker().failures(), 3);
        assert_eq!(created(&store), 3);
        agent.abort();
    }

    #[tokio::test]
    async fn unbounded_parallelism_dispatches_every_slot() {
        let mut target = spec("image1", 2);
        target.update.parallelism = u64::MAX;
        let (store, actions) = seeded(&target);
        let agent = spawn_agent(&store, TaskState::Running);

        let sched = scheduler(&store, &target, 2);
        let end = sched.drive(actions, &CancellationToken::new()).await.unwrap();
        assert_eq!(end, DispatchEnd::Exhausted);
        assert_eq!(sched.tracker().successes(), 2);
        assert_eq!(created(&store), 2);
        agent.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn delay_spaces_batch_starts() {
        let mut target = spec("image1", 3);
        target.update.delay = Duration::from_secs(10);
        let (store, actions) = seeded(&target);
        let agent = spawn_agent(&store, TaskState::Running);

        let started = Instant::now();
        let end = scheduler(&store, &target, 3)
            .drive(actions, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(end, DispatchEnd::Exhausted);
        assert!(started.elapsed() >= Duration::from_secs(20));
        agent.abort();
    }

    #[tokio::test]
    async fn replacement_retires_occupant_atomically() {
        let old_spec = spec("image1", 1);
        let store = StateStore::open_in_memory().unwrap();
        let mut old = Task::new("svc-1", 1, old_spec.task.clone());
        old.status.state = TaskState::Running;
        store.update(|tx| tx.create_task(&old)).unwrap();

        let target = spec("image2", 1);
        store
            .update(|tx| tx.create_service(&Service::new("svc-1", target.clone())))
            .unwrap();
        let actions = plan(&target, &[old.clone()]).actions;

        let mut events = store.subscribe(&[EventKind::TaskCreated, EventKind::TaskUpdated]);
        let agent = spawn_agent(&store, TaskState::Running);
        scheduler(&store, &target, 1)
            .drive(actions, &CancellationToken::new())
            .await
            .unwrap();

        // Retirement of the occupant is published before the creation, from one commit.
        match events.recv().await.unwrap() {
            StoreEvent::TaskUpdated(t) => {
                assert_eq!(t.id, old.id);
                assert_eq!(t.desired_state, TaskState::Remove);
            }
            other => panic!("unexpected event {other:?}"),
        }
        match events.recv().await.unwrap() {
            StoreEvent::TaskCreated(t) => assert_eq!(t.spec.container.image, "image2"),
            other => panic!("unexpected event {other:?}"),
        }
        agent.abort();
    }

    #[tokio::test]
    async fn changed_target_skips_slot() {
        let target = spec("image1", 2);
        let (store, actions) = seeded(&target);
        store
            .update(|tx| {
                let mut svc = tx.get_service("svc-1")?.unwrap();
                svc.spec = spec("image9", 2);
                tx.update_service(&mut svc)
            })
            .unwrap();

        let end = scheduler(&store, &target, 2)
            .drive(actions, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(end, DispatchEnd::Exhausted);
        assert_eq!(created(&store), 0);
    }
}

//! Orchestrator — starts, supersedes and stops update runs.
//!
//! A single loop consumes service events in arrival order. A service whose
//! spec differs from the last one observed gets a new run: the previous
//! run's token is cancelled at once and the new run waits for the old one
//! to finish before touching the store, so at most one run per service is
//! ever active. Deleting a service retires its tasks the same way, behind
//! whatever run it had, so the loop itself never waits on a run.

use std::collections::HashMap;

use shoal_state::{
    EventKind, EventSource, Service, ServiceId, ServiceSpec, StateStore, StoreEvent, Task,
    TaskState, UpdateState, WatchError,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::UpdaterConfig;
use crate::controller::RunOutcome;
use crate::error::{UpdateError, UpdateResult};
use crate::planner::plan;
use crate::retry::commit;
use crate::updater::{Updater, validate};

const SERVICE_EVENTS: &[EventKind] = &[
    EventKind::ServiceCreated,
    EventKind::ServiceUpdated,
    EventKind::ServiceDeleted,
];

/// How a run ended, sent to an optional observer.
#[derive(Debug)]
pub struct RunReport {
    pub service_id: ServiceId,
    pub result: UpdateResult<RunOutcome>,
}

/// The active run of one service.
struct RunSlot {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Watches services and keeps one update run per changed service.
pub struct Orchestrator {
    store: StateStore,
    config: UpdaterConfig,
    /// Active runs: service_id → slot.
    runs: HashMap<ServiceId, RunSlot>,
    /// Last spec seen per service.
    observed: HashMap<ServiceId, ServiceSpec>,
    reports: Option<mpsc::UnboundedSender<RunReport>>,
    /// Parent of every run token; cancelled on shutdown.
    shutdown: CancellationToken,
}

impl Orchestrator {
    pub fn new(store: StateStore, config: UpdaterConfig) -> Self {
        Self {
            store,
            config,
            runs: HashMap::new(),
            observed: HashMap::new(),
            reports: None,
            shutdown: CancellationToken::new(),
        }
    }

    /// Send every finished run's outcome to `tx`.
    pub fn with_reports(mut self, tx: mpsc::UnboundedSender<RunReport>) -> Self {
        self.reports = Some(tx);
        self
    }

    /// Process service events until `shutdown` flips or its sender drops.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> UpdateResult<()> {
        let mut events = self.store.subscribe(SERVICE_EVENTS);
        self.resume_all().await?;
        info!(services = self.observed.len(), "orchestrator started");

        loop {
            let event = tokio::select! {
                _ = shutdown.changed() => break,
                event = events.recv() => event,
            };

            match event {
                Ok(StoreEvent::ServiceCreated(service)) => self.on_created(service).await,
                Ok(StoreEvent::ServiceUpdated(service)) => self.on_updated(service),
                Ok(StoreEvent::ServiceDeleted(service)) => self.on_deleted(&service.id),
                Ok(_) => {}
                Err(WatchError::Lagged(missed)) => {
                    warn!(missed, "service watch lagged, resyncing");
                    if let Err(e) = self.resync().await {
                        error!(error = %e, "resync failed");
                    }
                }
                Err(WatchError::Closed) => {
                    self.stop_all().await;
                    return Err(UpdateError::EventsClosed);
                }
            }
        }

        self.stop_all().await;
        info!("orchestrator stopped");
        Ok(())
    }

    async fn on_created(&mut self, service: Service) {
        self.observed.insert(service.id.clone(), service.spec.clone());
        if validate(&service.spec).is_err() {
            // The run publishes why.
            self.start_run(&service.id, None);
            return;
        }
        if let Some(pending) = self.runs.remove(&service.id) {
            // An earlier service under this id is still being retired.
            let token = self.shutdown.child_token();
            let store = self.store.clone();
            let config = self.config.clone();
            let id = service.id.clone();
            let placement = token.clone();
            let handle = tokio::spawn(async move {
                let _ = pending.handle.await;
                if let Err(e) = place_initial(&store, &config, &placement, &id).await {
                    error!(service = %id, error = %e, "initial placement failed");
                }
            });
            self.runs.insert(service.id, RunSlot { token, handle });
            return;
        }
        if let Err(e) = place_initial(&self.store, &self.config, &self.shutdown, &service.id).await {
            error!(service = %service.id, error = %e, "initial placement failed");
        }
    }

    fn on_updated(&mut self, service: Service) {
        match self.observed.insert(service.id.clone(), service.spec.clone()) {
            Some(previous) if previous == service.spec => {
                debug!(service = %service.id, "status-only update");
            }
            previous => self.start_run(&service.id, previous),
        }
    }

    /// Cancel the service's run and retire its tasks once that run is done.
    fn on_deleted(&mut self, service_id: &str) {
        self.observed.remove(service_id);
        self.runs.retain(|_, run| !run.handle.is_finished());
        let previous = self.runs.remove(service_id);
        if let Some(prev) = &previous {
            prev.token.cancel();
            info!(service = %service_id, "run cancelled, service deleted");
        }

        // Later work for this id waits on the slot; only shutdown stops the retirement.
        let token = self.shutdown.child_token();
        let retirement = self.shutdown.clone();
        let store = self.store.clone();
        let config = self.config.clone();
        let id = service_id.to_string();
        let handle = tokio::spawn(async move {
            if let Some(prev) = previous {
                let _ = prev.handle.await;
            }
            if let Err(e) = retire_all(&store, &config, &retirement, &id).await {
                error!(service = %id, error = %e, "failed to retire tasks of deleted service");
            }
        });
        self.runs.insert(service_id.to_string(), RunSlot { token, handle });
    }

    /// Cancel the service's current run and start a new one behind it.
    fn start_run(&mut self, service_id: &str, replaced: Option<ServiceSpec>) {
        self.runs.retain(|_, run| !run.handle.is_finished());

        let previous = self.runs.remove(service_id);
        if let Some(prev) = &previous {
            prev.token.cancel();
            debug!(service = %service_id, "superseding active run");
        }

        let token = self.shutdown.child_token();
        let updater = Updater::new(self.store.clone(), self.config.clone(), service_id, token.clone())
            .with_replaced_spec(replaced);
        let reports = self.reports.clone();
        let id = service_id.to_string();

        let handle = tokio::spawn(async move {
            if let Some(prev) = previous {
                let _ = prev.handle.await;
            }
            let result = updater.run().await;
            match &result {
                Ok(outcome) => info!(service = %id, ?outcome, "run finished"),
                Err(e) => error!(service = %id, error = %e, "run failed"),
            }
            if let Some(tx) = reports {
                let _ = tx.send(RunReport {
                    service_id: id,
                    result,
                });
            }
        });

        self.runs.insert(service_id.to_string(), RunSlot { token, handle });
        info!(service = %service_id, "run scheduled");
    }

    /// Pick up every stored service after a restart.
    async fn resume_all(&mut self) -> UpdateResult<()> {
        for service in self.store.list_services()? {
            self.observed.insert(service.id.clone(), service.spec.clone());
            match service.update_status.as_ref().map(|s| s.state) {
                Some(UpdateState::Updating | UpdateState::RollbackStarted) => {
                    info!(service = %service.id, "resuming interrupted run");
                    self.start_run(&service.id, None);
                }
                Some(_) => {}
                None => {
                    let tasks = self.store.list_tasks_for_service(&service.id)?;
                    if !tasks.iter().any(Task::is_live) && validate(&service.spec).is_ok() {
                        place_initial(&self.store, &self.config, &self.shutdown, &service.id).await?;
                    } else if !plan(&service.spec, &tasks).is_empty() {
                        self.start_run(&service.id, None);
                    }
                }
            }
        }
        Ok(())
    }

    /// Reconcile after missed events.
    async fn resync(&mut self) -> UpdateResult<()> {
        let services = self.store.list_services()?;
        let gone: Vec<ServiceId> = self
            .observed
            .keys()
            .filter(|id| !services.iter().any(|s| &s.id == *id))
            .cloned()
            .collect();
        for id in gone {
            self.on_deleted(&id);
        }
        for service in services {
            self.on_updated(service);
        }
        Ok(())
    }

    async fn stop_all(&mut self) {
        self.shutdown.cancel();
        for (id, run) in self.runs.drain() {
            let _ = run.handle.await;
            debug!(service = %id, "run stopped");
        }
    }
}

/// Give a service with no live tasks one NEW task per slot.
async fn place_initial(
    store: &StateStore,
    config: &UpdaterConfig,
    token: &CancellationToken,
    service_id: &str,
) -> UpdateResult<usize> {
    let placed = commit(store, config, token, |tx| {
        let Some(service) = tx.get_service(service_id)? else {
            return Ok(0);
        };
        let tasks = tx.list_tasks_for_service(service_id)?;
        if tasks.iter().any(Task::is_live) {
            return Ok(0);
        }
        for slot in 1..=service.spec.replicas {
            tx.create_task(&Task::new(service_id, slot, service.spec.task.clone()))?;
        }
        Ok(service.spec.replicas as usize)
    })
    .await?
    .unwrap_or(0);
    info!(service = %service_id, placed, "initial tasks placed");
    Ok(placed)
}

/// Move every live task of a deleted service to REMOVE.
async fn retire_all(
    store: &StateStore,
    config: &UpdaterConfig,
    token: &CancellationToken,
    service_id: &str,
) -> UpdateResult<usize> {
    let retired = commit(store, config, token, |tx| {
        let mut retired = 0;
        for mut task in tx.list_tasks_for_service(service_id)? {
            if task.is_live() {
                task.desired_state = TaskState::Remove;
                tx.update_task(&mut task)?;
                retired += 1;
            }
        }
        Ok(retired)
    })
    .await?
    .unwrap_or(0);
    debug!(service = %service_id, retired, "tasks retired");
    Ok(retired)
}

//! Shared harness for rollout tests: an in-memory store, a running
//! orchestrator, and a fake agent that plays the part of the dispatcher.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use shoal_state::*;
use shoal_update::{Orchestrator, RunOutcome, RunReport, UpdaterConfig};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

pub const TIMEOUT: Duration = Duration::from_secs(10);
pub const SERVICE: &str = "svc-web";

#[derive(Default)]
struct AgentRules {
    /// Per image: how many of its tasks have started since the rule was set.
    alternating: HashMap<String, usize>,
    held: HashSet<String>,
    start_delay: Duration,
}

/// Advances task status the way a node agent would.
///
/// New tasks go to RUNNING, or FAILED for images set to fail alternately
/// (first fails, second runs, third fails, ...). Tasks of held images stay
/// NEW. Tasks whose desired state moved past RUNNING are shut down to it.
pub struct FakeAgent {
    rules: Arc<Mutex<AgentRules>>,
    handle: JoinHandle<()>,
}

impl FakeAgent {
    pub fn spawn(store: &StateStore) -> Self {
        let rules = Arc::new(Mutex::new(AgentRules::default()));
        let mut events = store.subscribe(&[EventKind::TaskCreated, EventKind::TaskUpdated]);
        let store = store.clone();
        let loop_rules = Arc::clone(&rules);

        let handle = tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(WatchError::Lagged(_)) => continue,
                    Err(WatchError::Closed) => return,
                };
                match event {
                    StoreEvent::TaskCreated(task) if task.desired_state == TaskState::Running => {
                        let image = task.spec.container.image.clone();
                        let (outcome, delay) = {
                            let mut rules = loop_rules.lock().unwrap();
                            if rules.held.contains(&image) {
                                continue;
                            }
                            let outcome = match rules.alternating.get_mut(&image) {
                                Some(started) => {
                                    let fail = *started % 2 == 0;
                                    *started += 1;
                                    if fail { TaskState::Failed } else { TaskState::Running }
                                }
                                None => TaskState::Running,
                            };
                            (outcome, rules.start_delay)
                        };
                        let store = store.clone();
                        tokio::spawn(async move {
                            if !delay.is_zero() {
                                tokio::time::sleep(delay).await;
                            }
                            set_status(&store, &task.id, TaskState::Starting);
                            set_status(&store, &task.id, outcome);
                        });
                    }
                    StoreEvent::TaskUpdated(task)
                        if task.desired_state > TaskState::Running
                            && task.status.state != task.desired_state =>
                    {
                        set_status(&store, &task.id, task.desired_state);
                    }
                    _ => {}
                }
            }
        });

        Self { rules, handle }
    }

    /// Tasks of `image` started from now on fail, run, fail, run, ...
    pub fn fail_alternating(&self, image: &str) {
        self.rules.lock().unwrap().alternating.insert(image.to_string(), 0);
    }

    /// Tasks of `image` never leave NEW.
    pub fn hold(&self, image: &str) {
        self.rules.lock().unwrap().held.insert(image.to_string());
    }

    pub fn set_start_delay(&self, delay: Duration) {
        self.rules.lock().unwrap().start_delay = delay;
    }
}

impl Drop for FakeAgent {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn set_status(store: &StateStore, id: &str, state: TaskState) {
    store
        .update(|tx| {
            let Some(mut task) = tx.get_task(id)? else {
                return Ok(());
            };
            // Status only moves forward.
            if task.status.state >= state {
                return Ok(());
            }
            task.status.state = state;
            task.status.message = format!("{state:?}").to_lowercase();
            task.status.timestamp = epoch_secs();
            tx.update_task(&mut task)
        })
        .unwrap();
}

/// Store + agent + orchestrator.
pub struct Harness {
    pub store: StateStore,
    pub agent: FakeAgent,
    reports: mpsc::UnboundedReceiver<RunReport>,
    stop: watch::Sender<bool>,
    orchestrator: JoinHandle<()>,
}

impl Harness {
    pub async fn start() -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "warn".parse().unwrap()),
            )
            .with_test_writer()
            .try_init();

        let store = StateStore::open_in_memory().unwrap();
        let agent = FakeAgent::spawn(&store);
        let (tx, reports) = mpsc::unbounded_channel();
        let (stop, stop_rx) = watch::channel(false);
        let orchestrator = Orchestrator::new(store.clone(), UpdaterConfig::default()).with_reports(tx);
        let orchestrator = tokio::spawn(async move {
            orchestrator.run(stop_rx).await.unwrap();
        });

        // Agent and orchestrator both subscribe before events matter.
        let queue = store.watch_queue().clone();
        tokio::time::timeout(TIMEOUT, async {
            while queue.subscriber_count() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("orchestrator did not subscribe");

        Self {
            store,
            agent,
            reports,
            stop,
            orchestrator,
        }
    }

    /// Create the service and wait until every slot runs.
    pub async fn create_service(&self, spec: ServiceSpec) {
        let replicas = spec.replicas as usize;
        self.store
            .update(|tx| tx.create_service(&Service::new(SERVICE, spec.clone())))
            .unwrap();
        self.wait_until(|tasks| {
            tasks
                .iter()
                .filter(|t| t.is_live() && t.status.state == TaskState::Running)
                .count()
                == replicas
        })
        .await;
    }

    /// Change the spec the way an API caller does: clear the status, then mutate.
    pub fn change_spec(&self, change: impl Fn(&mut ServiceSpec)) {
        self.store
            .update(|tx| {
                let mut service = tx.get_service(SERVICE)?.unwrap();
                service.update_status = None;
                change(&mut service.spec);
                tx.update_service(&mut service)
            })
            .unwrap();
    }

    pub async fn next_report(&mut self) -> RunOutcome {
        let report = tokio::time::timeout(TIMEOUT, self.reports.recv())
            .await
            .expect("no run report in time")
            .expect("report channel closed");
        assert_eq!(report.service_id, SERVICE);
        report.result.expect("run failed")
    }

    pub async fn wait_until(&self, check: impl Fn(&[Task]) -> bool) {
        tokio::time::timeout(TIMEOUT, async {
            loop {
                let tasks = self.store.list_tasks_for_service(SERVICE).unwrap();
                if check(&tasks) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    pub fn service(&self) -> Service {
        self.store.get_service(SERVICE).unwrap().unwrap()
    }

    pub fn live_tasks(&self) -> Vec<Task> {
        self.store
            .list_tasks_for_service(SERVICE)
            .unwrap()
            .into_iter()
            .filter(|t| t.is_live())
            .collect()
    }

    pub async fn shutdown(self) {
        self.stop.send(true).unwrap();
        tokio::time::timeout(TIMEOUT, self.orchestrator)
            .await
            .expect("orchestrator did not stop")
            .unwrap();
    }
}

/// What the outside world saw, in commit order.
#[derive(Debug, Clone, PartialEq)]
pub enum Seen {
    Created(String),
    Status(UpdateState),
}

/// Records task creations and status changes until `last` is published.
pub async fn record_until(events: &mut Subscription, last: UpdateState) -> Vec<Seen> {
    let mut seen = Vec::new();
    tokio::time::timeout(TIMEOUT, async {
        loop {
            match events.recv().await.unwrap() {
                StoreEvent::TaskCreated(task) => {
                    seen.push(Seen::Created(task.spec.container.image));
                }
                StoreEvent::ServiceUpdated(service) => {
                    let Some(status) = service.update_status else {
                        continue;
                    };
                    let entry = Seen::Status(status.state);
                    if seen.last() != Some(&entry) {
                        seen.push(entry);
                    }
                    if status.state == last {
                        return;
                    }
                }
                _ => {}
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{last:?} not published; saw {seen:?}"));
    seen
}

pub fn timeline_events(store: &StateStore) -> Subscription {
    store.subscribe(&[EventKind::TaskCreated, EventKind::ServiceUpdated])
}

pub fn service_spec(image: &str, replicas: u64, update: UpdateConfig) -> ServiceSpec {
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
        update,
    }
}

pub fn images(tasks: &[Task]) -> Vec<String> {
    tasks.iter().map(|t| t.spec.container.image.clone()).collect()
}

pub fn repeated(image: &str, n: usize) -> Vec<Seen> {
    vec![Seen::Created(image.to_string()); n]
}

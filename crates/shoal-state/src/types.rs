//! Domain types for the shoal cluster store.
//!
//! These types represent the persisted state of services and the tasks
//! that realise them. All types are serializable to/from JSON for
//! storage in redb tables.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Unique identifier for a service.
pub type ServiceId = String;

/// Unique identifier for a task.
pub type TaskId = String;

/// Replica position within a service, starting at 1.
pub type Slot = u64;

// ── Service ───────────────────────────────────────────────────────

/// A replicated service and its rollout bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Service {
    pub id: ServiceId,
    /// Desired state of the service.
    pub spec: ServiceSpec,
    /// Value copy of the spec being replaced by the current rollout.
    pub previous_spec: Option<ServiceSpec>,
    /// Rollout progress, `None` until a run starts.
    pub update_status: Option<UpdateStatus>,
    /// Unix timestamp (seconds) when this service was created.
    pub created_at: u64,
    /// Unix timestamp (seconds) of the last write.
    pub updated_at: u64,
}

/// Desired state of a service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceSpec {
    pub name: String,
    /// Identity metadata; never affects task runtime behaviour.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Template for every task of the service.
    pub task: TaskSpec,
    /// Number of slots.
    pub replicas: u64,
    /// Rolling update policy.
    #[serde(default)]
    pub update: UpdateConfig,
}

/// Runtime-relevant template copied into every task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct TaskSpec {
    pub container: ContainerSpec,
    /// Bumping this counter forces every slot to be replaced.
    #[serde(default)]
    pub force_update: u64,
}

/// Container runtime parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ContainerSpec {
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Rolling update policy embedded in a service spec.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UpdateConfig {
    /// Max concurrent slot replacements; 0 means all slots at once.
    pub parallelism: u64,
    /// Pacing interval between batch starts.
    pub delay: Duration,
    /// How long to watch a new task before giving up on it.
    pub monitor: Duration,
    /// Fraction of targeted slots that may fail before `failure_action` fires.
    pub max_failure_ratio: f32,
    pub failure_action: FailureAction,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            parallelism: 1,
            delay: Duration::ZERO,
            monitor: Duration::ZERO,
            max_failure_ratio: 0.0,
            failure_action: FailureAction::Pause,
        }
    }
}

/// What to do once the failure ratio is exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailureAction {
    #[default]
    Pause,
    Continue,
    Rollback,
}

/// Rollout progress recorded on the service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpdateStatus {
    pub state: UpdateState,
    pub message: String,
    pub started_at: Option<u64>,
    pub completed_at: Option<u64>,
}

/// Rollout state machine values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateState {
    Updating,
    Paused,
    Completed,
    RollbackStarted,
    RollbackPaused,
    RollbackCompleted,
    /// The target spec could not be turned into tasks.
    Aborted,
}

impl UpdateState {
    /// Terminal states end a run; only a new spec change moves on from them.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Updating | Self::RollbackStarted)
    }
}

// ── Task ──────────────────────────────────────────────────────────

/// One replica of a service occupying a slot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: TaskId,
    pub service_id: ServiceId,
    pub slot: Slot,
    /// Snapshot of the service's task template at creation time.
    pub spec: TaskSpec,
    pub desired_state: TaskState,
    pub status: TaskStatus,
    pub created_at: u64,
    pub updated_at: u64,
}

/// Observed state of a task, reported by whatever runs it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskStatus {
    pub state: TaskState,
    pub message: String,
    pub timestamp: u64,
}

/// Task lifecycle. Declaration order is lifecycle order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    New,
    Pending,
    Assigned,
    Accepted,
    Preparing,
    Ready,
    Starting,
    Running,
    Complete,
    Shutdown,
    Failed,
    Rejected,
    Remove,
    Orphaned,
}

impl TaskState {
    /// Anything past `Running` is terminal.
    pub fn is_terminal(self) -> bool {
        self > Self::Running
    }
}

impl Task {
    /// Build a fresh task for `slot` that should be running `spec`.
    pub fn new(service_id: &str, slot: Slot, spec: TaskSpec) -> Self {
        let now = epoch_secs();
        Self {
            id: generate_task_id(service_id, slot),
            service_id: service_id.to_string(),
            slot,
            spec,
            desired_state: TaskState::Running,
            status: TaskStatus {
                state: TaskState::New,
                message: "created".to_string(),
                timestamp: now,
            },
            created_at: now,
            updated_at: now,
        }
    }

    /// A live task is still wanted; its desired state has not moved past `Running`.
    pub fn is_live(&self) -> bool {
        self.desired_state <= TaskState::Running
    }
}

impl Service {
    /// Wrap a spec in a fresh service record.
    pub fn new(id: &str, spec: ServiceSpec) -> Self {
        let now = epoch_secs();
        Self {
            id: id.to_string(),
            spec,
            previous_spec: None,
            update_status: None,
            created_at: now,
            updated_at: now,
        }
    }
}

static TASK_SEQ: AtomicU64 = AtomicU64::new(0);

fn generate_task_id(service_id: &str, slot: Slot) -> TaskId {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let mut hasher = Sha256::new();
    hasher.update(service_id.as_bytes());
    hasher.update(slot.to_le_bytes());
    hasher.update(nanos.to_le_bytes());
    hasher.update(TASK_SEQ.fetch_add(1, Ordering::Relaxed).to_le_bytes());
    format!("task-{}", &hex::encode(hasher.finalize())[..16])
}

/// Current Unix epoch in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

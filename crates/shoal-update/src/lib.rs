//! shoal rolling updates — batched task replacement with automatic rollback.
//!
//! When a service's spec changes, the [`Orchestrator`] cancels any run in
//! flight for that service and starts an [`Updater`]. The updater plans
//! which replica slots need a new task, replaces them in parallelism-bounded
//! batches while watching each new task, and publishes the service's update
//! status. If too many replacements fail it pauses, continues, or rolls the
//! service back to its previous spec, as the spec's failure action says.

pub mod config;
pub mod controller;
pub mod error;
pub mod monitor;
pub mod orchestrator;
pub mod planner;
pub mod policy;
pub mod retry;
pub mod scheduler;
pub mod status;
pub mod updater;

pub use config::UpdaterConfig;
pub use controller::{BreachDecision, RunKind, RunOutcome};
pub use error::{UpdateError, UpdateResult};
pub use monitor::{FailureTracker, SlotOutcome};
pub use orchestrator::{Orchestrator, RunReport};
pub use planner::{SlotAction, SlotActionKind, SlotPlan};
pub use policy::RolloutPolicy;
pub use scheduler::{BatchScheduler, DispatchEnd};
pub use status::{Published, StatusPublisher};
pub use updater::Updater;

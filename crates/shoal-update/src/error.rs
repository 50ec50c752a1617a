//! Updater error types.

use shoal_state::StateError;
use thiserror::Error;

/// Errors that end a run abnormally.
///
/// Supersession by a newer run is not an error; runs report it as
/// [`RunOutcome::Superseded`](crate::RunOutcome::Superseded).
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("invalid service spec: {0}")]
    InvalidSpec(String),

    #[error("store unavailable after {attempts} attempts: {source}")]
    StoreUnavailable {
        attempts: u32,
        #[source]
        source: StateError,
    },

    #[error("event stream closed")]
    EventsClosed,

    #[error("slot worker failed: {0}")]
    Worker(String),
}

pub type UpdateResult<T> = Result<T, UpdateError>;

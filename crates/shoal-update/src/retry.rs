//! Store commits with bounded retry of transient failures.

use shoal_state::{StateResult, StateStore, Tx};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::UpdaterConfig;
use crate::error::{UpdateError, UpdateResult};

/// Run `f` in a write transaction, retrying transient failures.
///
/// `f` may run more than once and must rebuild its writes from what it reads
/// inside the transaction. After `commit_retries` transient failures the
/// store is considered unavailable. Returns `None`, with nothing written, once
/// `token` is cancelled; the backoff between attempts wakes on cancellation.
pub async fn commit<T, F>(
    store: &StateStore,
    config: &UpdaterConfig,
    token: &CancellationToken,
    mut f: F,
) -> UpdateResult<Option<T>>
where
    F: FnMut(&mut Tx<'_>) -> StateResult<T>,
{
    let attempts = config.commit_retries.max(1);
    let mut attempt = 0;
    loop {
        if token.is_cancelled() {
            debug!(attempt, "commit abandoned, cancelled");
            return Ok(None);
        }
        attempt += 1;
        match store.update(&mut f) {
            Ok(value) => return Ok(Some(value)),
            Err(e) if e.is_transient() && attempt < attempts => {
                warn!(attempt, error = %e, "transaction failed, retrying");
                tokio::select! {
                    biased;
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep(config.retry_backoff() * attempt) => {}
                }
            }
            Err(e) if e.is_transient() => {
                return Err(UpdateError::StoreUnavailable {
                    attempts: attempt,
                    source: e,
                });
            }
            Err(e) => return Err(UpdateError::State(e)),
        }
    }
}

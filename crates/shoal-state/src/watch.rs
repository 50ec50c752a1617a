//! Change notifications for committed transactions.
//!
//! Every committed transaction publishes one event per record it created,
//! updated, or deleted, in commit order, carrying the post-mutation record.
//! Subscribers pick the event kinds they care about; everything else is
//! skipped on receive.

use thiserror::Error;
use tokio::sync::broadcast;
use tracing::trace;

use crate::types::{Service, Task};

/// A committed mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    ServiceCreated(Service),
    ServiceUpdated(Service),
    ServiceDeleted(Service),
    TaskCreated(Task),
    TaskUpdated(Task),
    TaskDeleted(Task),
}

/// Discriminant of [`StoreEvent`], used as a subscription filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ServiceCreated,
    ServiceUpdated,
    ServiceDeleted,
    TaskCreated,
    TaskUpdated,
    TaskDeleted,
}

impl StoreEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::ServiceCreated(_) => EventKind::ServiceCreated,
            Self::ServiceUpdated(_) => EventKind::ServiceUpdated,
            Self::ServiceDeleted(_) => EventKind::ServiceDeleted,
            Self::TaskCreated(_) => EventKind::TaskCreated,
            Self::TaskUpdated(_) => EventKind::TaskUpdated,
            Self::TaskDeleted(_) => EventKind::TaskDeleted,
        }
    }

    /// The service this event belongs to.
    pub fn service_id(&self) -> &str {
        match self {
            Self::ServiceCreated(s) | Self::ServiceUpdated(s) | Self::ServiceDeleted(s) => &s.id,
            Self::TaskCreated(t) | Self::TaskUpdated(t) | Self::TaskDeleted(t) => &t.service_id,
        }
    }
}

/// Errors surfaced while waiting on a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WatchError {
    /// The subscriber fell behind and `0` events were dropped.
    #[error("subscription lagged, {0} events dropped")]
    Lagged(u64),

    #[error("event queue closed")]
    Closed,
}

/// Anything that can hand out filtered event subscriptions.
///
/// The store implements this; tests may substitute their own source.
pub trait EventSource: Send + Sync {
    /// Start receiving events of the given kinds. An empty slice means all kinds.
    fn subscribe(&self, kinds: &[EventKind]) -> Subscription;
}

/// Fan-out queue for committed events.
#[derive(Clone)]
pub struct WatchQueue {
    tx: broadcast::Sender<StoreEvent>,
}

impl WatchQueue {
    /// Create a queue holding at most `capacity` undelivered events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Deliver events to current subscribers. Events with no subscriber are dropped.
    pub fn publish(&self, events: Vec<StoreEvent>) {
        for event in events {
            trace!(kind = ?event.kind(), service = %event.service_id(), "publishing event");
            // Err only means nobody is listening.
            let _ = self.tx.send(event);
        }
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl EventSource for WatchQueue {
    fn subscribe(&self, kinds: &[EventKind]) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
            kinds: kinds.to_vec(),
        }
    }
}

/// A filtered view of the event queue. Dropping it unsubscribes.
pub struct Subscription {
    rx: broadcast::Receiver<StoreEvent>,
    kinds: Vec<EventKind>,
}

impl Subscription {
    /// Wait for the next event matching this subscription's kinds.
    pub async fn recv(&mut self) -> Result<StoreEvent, WatchError> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.accepts(&event) => return Ok(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => return Err(WatchError::Lagged(n)),
                Err(broadcast::error::RecvError::Closed) => return Err(WatchError::Closed),
            }
        }
    }

    /// Stop receiving events.
    pub fn unsubscribe(self) {}

    fn accepts(&self, event: &StoreEvent) -> bool {
        self.kinds.is_empty() || self.kinds.contains(&event.kind())
    }
}

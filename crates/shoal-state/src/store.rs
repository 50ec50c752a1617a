//! StateStore — redb-backed cluster store for shoal.
//!
//! Provides serializable read/modify/write transactions over services and
//! tasks. All values are JSON-serialized into redb's `&[u8]` value columns.
//! Each committed write transaction publishes its change events, in commit
//! order, to the store's [`WatchQueue`]. The store supports both on-disk
//! and in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::{Arc, Mutex};

use redb::{Database, ReadTransaction, ReadableDatabase, ReadableTable, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;
use crate::watch::{EventKind, EventSource, StoreEvent, Subscription, WatchQueue};

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Default per-subscriber event buffer.
pub const DEFAULT_EVENT_BUFFER: usize = 1024;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
    /// Held from begin to publish so events leave in commit order.
    writer: Arc<Mutex<()>>,
    queue: WatchQueue,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::from_database(db);
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::from_database(db);
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Replace the event queue with one of the given capacity.
    ///
    /// Existing subscriptions keep listening to the old queue, so call
    /// this before subscribing.
    pub fn with_event_buffer(mut self, capacity: usize) -> Self {
        self.queue = WatchQueue::new(capacity);
        self
    }

    fn from_database(db: Database) -> Self {
        Self {
            db: Arc::new(db),
            writer: Arc::new(Mutex::new(())),
            queue: WatchQueue::new(DEFAULT_EVENT_BUFFER),
        }
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(SERVICES).map_err(map_err!(Table))?;
        txn.open_table(TASKS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Run `f` inside a single write transaction.
    ///
    /// Either every write in `f` commits and its events are published, or
    /// `f` returned an error and nothing happened.
    pub fn update<T, F>(&self, f: F) -> StateResult<T>
    where
        F: FnOnce(&mut Tx<'_>) -> StateResult<T>,
    {
        let _guard = self
            .writer
            .lock()
            .map_err(|_| StateError::Transaction("writer lock poisoned".to_string()))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;

        let mut tx = Tx {
            txn: &txn,
            events: Vec::new(),
        };
        let value = match f(&mut tx) {
            Ok(value) => value,
            Err(e) => {
                drop(tx);
                txn.abort().map_err(map_err!(Transaction))?;
                return Err(e);
            }
        };
        let events = tx.events;

        txn.commit().map_err(map_err!(Transaction))?;
        self.queue.publish(events);
        Ok(value)
    }

    /// Run `f` against a consistent read snapshot.
    pub fn view<T, F>(&self, f: F) -> StateResult<T>
    where
        F: FnOnce(&ReadTx<'_>) -> StateResult<T>,
    {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        f(&ReadTx { txn: &txn })
    }

    /// Get a service by ID.
    pub fn get_service(&self, id: &str) -> StateResult<Option<Service>> {
        self.view(|tx| tx.get_service(id))
    }

    /// List all services.
    pub fn list_services(&self) -> StateResult<Vec<Service>> {
        self.view(|tx| tx.list_services())
    }

    /// Get a task by ID.
    pub fn get_task(&self, id: &str) -> StateResult<Option<Task>> {
        self.view(|tx| tx.get_task(id))
    }

    /// List all tasks belonging to a service, ordered by slot then age.
    pub fn list_tasks_for_service(&self, service_id: &str) -> StateResult<Vec<Task>> {
        self.view(|tx| tx.list_tasks_for_service(service_id))
    }

    /// The queue committed events are published to.
    pub fn watch_queue(&self) -> &WatchQueue {
        &self.queue
    }
}

impl EventSource for StateStore {
    fn subscribe(&self, kinds: &[EventKind]) -> Subscription {
        self.queue.subscribe(kinds)
    }
}

/// A read-only snapshot.
pub struct ReadTx<'a> {
    txn: &'a ReadTransaction,
}

impl ReadTx<'_> {
    pub fn get_service(&self, id: &str) -> StateResult<Option<Service>> {
        let table = self.txn.open_table(SERVICES).map_err(map_err!(Table))?;
        get_json(&table, id)
    }

    pub fn list_services(&self) -> StateResult<Vec<Service>> {
        let table = self.txn.open_table(SERVICES).map_err(map_err!(Table))?;
        scan_json(&table, |_: &Service| true)
    }

    pub fn get_task(&self, id: &str) -> StateResult<Option<Task>> {
        let table = self.txn.open_table(TASKS).map_err(map_err!(Table))?;
        get_json(&table, id)
    }

    pub fn list_tasks_for_service(&self, service_id: &str) -> StateResult<Vec<Task>> {
        let table = self.txn.open_table(TASKS).map_err(map_err!(Table))?;
        let mut tasks = scan_json(&table, |t: &Task| t.service_id == service_id)?;
        sort_tasks(&mut tasks);
        Ok(tasks)
    }
}

/// A write transaction in progress. Writes are visible to later reads in
/// the same transaction and become durable, with their events, on commit.
pub struct Tx<'a> {
    txn: &'a WriteTransaction,
    events: Vec<StoreEvent>,
}

impl Tx<'_> {
    // ── Services ───────────────────────────────────────────────────

    pub fn get_service(&self, id: &str) -> StateResult<Option<Service>> {
        let table = self.txn.open_table(SERVICES).map_err(map_err!(Table))?;
        get_json(&table, id)
    }

    pub fn list_services(&self) -> StateResult<Vec<Service>> {
        let table = self.txn.open_table(SERVICES).map_err(map_err!(Table))?;
        scan_json(&table, |_: &Service| true)
    }

    /// Insert a new service. Fails if the ID is taken.
    pub fn create_service(&mut self, service: &Service) -> StateResult<()> {
        if self.get_service(&service.id)?.is_some() {
            return Err(StateError::AlreadyExists(service.id.clone()));
        }
        self.put(SERVICES, &service.id, service)?;
        debug!(service = %service.id, "service created");
        self.events.push(StoreEvent::ServiceCreated(service.clone()));
        Ok(())
    }

    /// Overwrite an existing service, stamping `updated_at`.
    pub fn update_service(&mut self, service: &mut Service) -> StateResult<()> {
        if self.get_service(&service.id)?.is_none() {
            return Err(StateError::NotFound(service.id.clone()));
        }
        service.updated_at = epoch_secs();
        self.put(SERVICES, &service.id, service)?;
        self.events.push(StoreEvent::ServiceUpdated(service.clone()));
        Ok(())
    }

    /// Delete a service. Returns the removed record if it existed.
    pub fn delete_service(&mut self, id: &str) -> StateResult<Option<Service>> {
        let removed: Option<Service> = self.remove(SERVICES, id)?;
        if let Some(service) = &removed {
            debug!(service = %id, "service deleted");
            self.events.push(StoreEvent::ServiceDeleted(service.clone()));
        }
        Ok(removed)
    }

    // ── Tasks ──────────────────────────────────────────────────────

    pub fn get_task(&self, id: &str) -> StateResult<Option<Task>> {
        let table = self.txn.open_table(TASKS).map_err(map_err!(Table))?;
        get_json(&table, id)
    }

    pub fn list_tasks_for_service(&self, service_id: &str) -> StateResult<Vec<Task>> {
        let table = self.txn.open_table(TASKS).map_err(map_err!(Table))?;
        let mut tasks = scan_json(&table, |t: &Task| t.service_id == service_id)?;
        sort_tasks(&mut tasks);
        Ok(tasks)
    }

    /// Insert a new task. Fails if the ID is taken.
    pub fn create_task(&mut self, task: &Task) -> StateResult<()> {
        if self.get_task(&task.id)?.is_some() {
            return Err(StateError::AlreadyExists(task.id.clone()));
        }
        self.put(TASKS, &task.id, task)?;
        self.events.push(StoreEvent::TaskCreated(task.clone()));
        Ok(())
    }

    /// Overwrite an existing task, stamping `updated_at`.
    pub fn update_task(&mut self, task: &mut Task) -> StateResult<()> {
        if self.get_task(&task.id)?.is_none() {
            return Err(StateError::NotFound(task.id.clone()));
        }
        task.updated_at = epoch_secs();
        self.put(TASKS, &task.id, task)?;
        self.events.push(StoreEvent::TaskUpdated(task.clone()));
        Ok(())
    }

    /// Delete a task. Returns the removed record if it existed.
    pub fn delete_task(&mut self, id: &str) -> StateResult<Option<Task>> {
        let removed: Option<Task> = self.remove(TASKS, id)?;
        if let Some(task) = &removed {
            self.events.push(StoreEvent::TaskDeleted(task.clone()));
        }
        Ok(removed)
    }

    // ── Internal helpers ───────────────────────────────────────────

    fn put<T: Serialize>(
        &self,
        def: JsonTable,
        key: &str,
        record: &T,
    ) -> StateResult<()> {
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let mut table = self.txn.open_table(def).map_err(map_err!(Table))?;
        table
            .insert(key, value.as_slice())
            .map_err(map_err!(Write))?;
        Ok(())
    }

    fn remove<T: DeserializeOwned>(
        &self,
        def: JsonTable,
        key: &str,
    ) -> StateResult<Option<T>> {
        let mut table = self.txn.open_table(def).map_err(map_err!(Table))?;
        let removed = table.remove(key).map_err(map_err!(Write))?;
        match removed {
            Some(guard) => Ok(Some(
                serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
            )),
            None => Ok(None),
        }
    }
}

fn get_json<T, R>(table: &R, key: &str) -> StateResult<Option<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    match table.get(key).map_err(map_err!(Read))? {
        Some(guard) => Ok(Some(
            serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
        )),
        None => Ok(None),
    }
}

fn scan_json<T, R, P>(table: &R, keep: P) -> StateResult<Vec<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
    P: Fn(&T) -> bool,
{
    let mut results = Vec::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (_, value) = entry.map_err(map_err!(Read))?;
        let record: T = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
        if keep(&record) {
            results.push(record);
        }
    }
    Ok(results)
}

fn sort_tasks(tasks: &mut [Task]) {
    tasks.sort_by(|a, b| {
        a.slot
            .cmp(&b.slot)
            .then(a.created_at.cmp(&b.created_at))
            .then_with(|| a.id.cmp(&b.id))
    });
}

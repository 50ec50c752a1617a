//! shoal-state — cluster store for shoal.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for services and tasks, serializable transactions, and an ordered
//! change-notification stream.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Writes happen inside [`StateStore::update`], which runs a closure against
//! a single redb write transaction. On commit, the events the closure
//! produced are published to a [`WatchQueue`] in commit order; subscribers
//! obtain filtered [`Subscription`]s through the [`EventSource`] trait.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;
pub mod watch;

pub use error::{StateError, StateResult};
pub use store::{ReadTx, StateStore, Tx};
pub use types::*;
pub use watch::{EventKind, EventSource, StoreEvent, Subscription, WatchError, WatchQueue};

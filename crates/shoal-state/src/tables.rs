//! redb table definitions for the shoal cluster store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Shape shared by every table: string keys, JSON values.
pub type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Services keyed by `{service_id}`.
pub const SERVICES: JsonTable = TableDefinition::new("services");

/// Tasks keyed by `{task_id}`.
pub const TASKS: JsonTable = TableDefinition::new("tasks");

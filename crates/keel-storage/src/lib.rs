//! Storage contracts for the Keel engine.
//!
//! A [`StorageAdapter`] provides, per namespace, the two structures every
//! repository is built on: the append-only **event log** (source of truth)
//! and the **state table** (latest materialized payload per record), plus
//! deterministic queries and reactive query streams. The [`ConfigStore`]
//! capability holds the small primitive metadata strategies need (cursors,
//! session ids).
//!
//! Two adapters ship with the crate: [`MemoryStorage`], the in-memory
//! reference implementation used throughout the test suites, and
//! [`RedbStorage`], the embedded production backend over `redb`.

mod config;
mod memory;
mod notify;
mod query;
mod redb_store;


use async_trait::async_trait;
use futures::stream::BoxStream;
use keel_core::{Event, EventId, FormatError, Payload};
use snafu::{Location, OptionExt as _, Snafu};
use tokio::task::JoinError;

pub use self::config::{ConfigError, ConfigResult, ConfigStore, ConfigValue};
pub use self::memory::MemoryStorage;
pub use self::query::{Filter, FilterOp, Query, SortSpec};
pub use self::redb_store::RedbStorage;

const LOG_TARGET: &str = "keel::storage";

/// Reserved row key linking a state row to the event that produced it.
pub const LAST_EVENT_ID_FIELD: &str = "_last_event_id";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StorageError {
    #[snafu(display("Adapter is closed"))]
    NamespaceClosed {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("Rows of `{repository}` do not match the declared schema: {reason}"))]
    SchemaMismatch {
        repository: String,
        reason: String,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("No row `{id}` in `{repository}`"))]
    UnknownRow {
        repository: String,
        id: String,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("No event `{event_id}` in `{repository}`"))]
    UnknownEvent {
        repository: String,
        event_id: EventId,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("Row `{id}` in `{repository}` is missing its event link"))]
    CorruptRow {
        repository: String,
        id: String,
        #[snafu(implicit)]
        location: Location,
    },
    Database {
        source: redb::DatabaseError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(transparent)]
    Table {
        source: redb::TableError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(transparent)]
    Storage {
        source: redb::StorageError,
        #[snafu(implicit)]
        location: Location,
    },
    Transaction {
        #[snafu(source(from(redb::TransactionError, Box::new)))]
        source: Box<redb::TransactionError>,
        #[snafu(implicit)]
        location: Location,
    },
    Commit {
        source: redb::CommitError,
        #[snafu(implicit)]
        location: Location,
    },
    Join {
        source: JoinError,
        #[snafu(implicit)]
        location: Location,
    },
    Encoding {
        source: serde_json::Error,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(transparent)]
    Format {
        source: FormatError,
        #[snafu(implicit)]
        location: Location,
    },
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Snapshot stream of a watched query. Ends when the adapter closes.
pub type QueryStream = BoxStream<'static, Vec<Event>>;

/// One materialized record: the latest accepted payload plus the id of the
/// event that produced it.
#[derive(Clone, Debug, PartialEq)]
pub struct StateRow {
    pub id: String,
    pub payload: Payload,
    pub last_event_id: EventId,
}

impl StateRow {
    pub fn new(id: impl Into<String>, payload: Payload, last_event_id: EventId) -> Self {
        Self {
            id: id.into(),
            payload,
            last_event_id,
        }
    }

    /// Flatten into the persisted row shape (payload plus
    /// [`LAST_EVENT_ID_FIELD`]).
    pub fn into_row(self) -> Payload {
        let mut row = self.payload;
        row.insert(
            LAST_EVENT_ID_FIELD.to_owned(),
            serde_json::Value::String(self.last_event_id.to_string()),
        );
        row
    }

    /// Parse the persisted row shape back.
    pub fn from_row(repository: &str, id: &str, mut row: Payload) -> StorageResult<Self> {
        let last_event_id = row
            .remove(LAST_EVENT_ID_FIELD)
            .as_ref()
            .and_then(serde_json::Value::as_str)
            .and_then(|raw| raw.parse::<EventId>().ok())
            .context(CorruptRowSnafu {
                repository,
                id,
            })?;
        Ok(Self {
            id: id.to_owned(),
            payload: row,
            last_event_id,
        })
    }
}

/// Namespace-scoped storage capability set.
///
/// Implementations serialize mutations internally and present sequentially
/// consistent effects: a state-table write and its log append become visible
/// together, and writes by a single caller complete in call order.
#[async_trait]
pub trait StorageAdapter: Send + Sync + 'static {
    /// Open the backing store and scope it to `namespace`.
    async fn open(&self, namespace: &str) -> StorageResult<()>;

    /// Release the backing store. Subsequent operations fail with
    /// [`StorageError::NamespaceClosed`]; live query streams end.
    async fn close(&self) -> StorageResult<()>;

    /// Switch the scoping namespace. A barrier: operations issued after the
    /// switch see only the new namespace, while query streams subscribed
    /// under the old one stay bound to it and never observe the new
    /// namespace. No-op switches are tolerated.
    async fn use_namespace(&self, namespace: &str) -> StorageResult<()>;

    /// Currently scoped namespace, `None` when closed.
    fn namespace(&self) -> Option<String>;

    /// Declare the logical shape of a repository. Idempotent. Fails with
    /// [`StorageError::SchemaMismatch`] when persisted rows are incompatible
    /// with the declared id field.
    async fn ensure_schema(
        &self,
        repository: &str,
        fields: &[String],
        id_field: &str,
    ) -> StorageResult<()>;

    // State table.
    async fn insert(&self, repository: &str, row: Payload, id_field: &str) -> StorageResult<()>;
    async fn update(&self, repository: &str, id: &str, row: Payload) -> StorageResult<()>;
    async fn delete(&self, repository: &str, id: &str) -> StorageResult<()>;
    async fn get_by_id(&self, repository: &str, id: &str) -> StorageResult<Option<StateRow>>;
    async fn contains(&self, repository: &str, id: &str) -> StorageResult<bool>;
    async fn get_all(&self, repository: &str) -> StorageResult<Vec<StateRow>>;
    async fn delete_all(&self, repository: &str) -> StorageResult<()>;

    // Event log. `insert_event` is durable before it acknowledges; the log
    // is the source of truth.
    async fn insert_event(&self, repository: &str, event: &Event) -> StorageResult<()>;
    async fn update_event(
        &self,
        repository: &str,
        event_id: EventId,
        event: &Event,
    ) -> StorageResult<()>;
    async fn get_event(&self, repository: &str, event_id: EventId)
    -> StorageResult<Option<Event>>;
    /// All log events, ascending by `event_id` (and therefore by creation
    /// time).
    async fn get_all_events(&self, repository: &str) -> StorageResult<Vec<Event>>;
    async fn delete_event(&self, repository: &str, event_id: EventId) -> StorageResult<()>;
    async fn delete_all_events(&self, repository: &str) -> StorageResult<()>;

    /// Evaluate a query against the current namespace.
    async fn query(&self, query: &Query) -> StorageResult<Vec<Event>>;

    /// Watch a query: emits the current snapshot immediately, then a new
    /// snapshot whenever a write to the repository invalidates the result.
    /// Synchronous write bursts coalesce into a single emission. The stream
    /// stays bound to the namespace current at subscription time.
    fn watch_query(&self, query: Query) -> QueryStream;

    /// Wipe state, log and config of the current namespace.
    async fn clear_all_data(&self) -> StorageResult<()>;

    /// The adapter's own config capability.
    fn config_store(&self) -> std::sync::Arc<dyn ConfigStore>;
}

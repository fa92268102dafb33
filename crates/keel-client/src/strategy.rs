//! Sync strategy contracts and the periodic strategy.
//!
//! A strategy owns the remote side of the engine: it receives freshly
//! logged events through [`SyncStrategy::on_push_to_remote`], drives pull
//! cycles against the client, and reports connectivity. Retries are the
//! strategy's responsibility; failure must never lose an event: anything
//! not acknowledged stays `Pending` in the log for the next cycle.

mod periodic;

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::stream::BoxStream;
use keel_core::{Event, EventId, SyncStatus};
use keel_storage::ConfigError;
use snafu::Snafu;

use crate::repository::RepositoryError;
use crate::{ClientError, ClientHandle};

pub use self::periodic::PeriodicSync;

pub(crate) const LOG_TARGET: &str = "keel::sync";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StrategyError {
    #[snafu(display("Push to remote failed: {message}"))]
    PushFailed { message: String },
    #[snafu(display("Not authenticated with the remote"))]
    NotAuthenticated,
    #[snafu(display("Strategy is already attached"))]
    AlreadyAttached,
    #[snafu(display("Client was dropped"))]
    ClientGone,
    #[snafu(transparent)]
    Client {
        #[snafu(source(from(ClientError, Box::new)))]
        source: Box<ClientError>,
    },
    #[snafu(transparent)]
    Repository { source: RepositoryError },
    #[snafu(transparent)]
    Config { source: ConfigError },
}

pub type StrategyResult<T> = std::result::Result<T, StrategyError>;

/// Pluggable driver that pushes pending events and pulls remote ones.
#[async_trait]
pub trait SyncStrategy: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Single-shot binding to the owning client; called before `start`.
    async fn attach(&self, client: ClientHandle) -> StrategyResult<()>;

    /// Whether this strategy handles the event at all; declined events are
    /// skipped by the push pipeline.
    fn supports_event(&self, _event: &Event) -> bool {
        true
    }

    /// Invoked by a repository right after the state write and log append.
    /// `Pending` defers (e.g. while disconnected); an error marks the event
    /// `Failed`. Either way the event stays in the log for later cycles.
    async fn on_push_to_remote(&self, event: &Event) -> StrategyResult<SyncStatus>;

    async fn start(&self) -> StrategyResult<()>;
    async fn stop(&self) -> StrategyResult<()>;

    /// Connectivity over the strategy's lifetime.
    fn connection_changes(&self) -> BoxStream<'static, bool>;

    fn is_connected(&self) -> bool {
        false
    }
}

/// Sequences the remote assigned to pushed events.
#[derive(Debug, Default)]
pub struct PushAck {
    pub sequences: BTreeMap<EventId, i64>,
}

/// The backend a [`PeriodicSync`] drives. Concrete WebSocket/HTTP
/// transports are external collaborators; the test suite ships an
/// in-memory one.
#[async_trait]
pub trait RemoteTransport: Send + Sync + 'static {
    /// Push a batch for one repository; the ack carries the server-assigned
    /// sequence per accepted event.
    async fn push_events(&self, repository: &str, events: &[Event]) -> StrategyResult<PushAck>;

    /// Wire events for one repository after the given cursor.
    async fn fetch_events(
        &self,
        repository: &str,
        after_sequence: Option<i64>,
    ) -> StrategyResult<Vec<serde_json::Value>>;

    /// Cheap connectivity probe.
    async fn connected(&self) -> bool;
}

/// Config key holding a repository's pull cursor.
pub fn cursor_key(namespace: &str, repository: &str) -> String {
    format!("{namespace}__last_sequence__{repository}")
}

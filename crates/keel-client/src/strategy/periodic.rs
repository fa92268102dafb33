//! Interval-driven sync: drain the pending queue, pull after the stored
//! cursor, advance the cursor to the highest `server_sequence` observed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::Retryable as _;
use futures::StreamExt as _;
use futures::stream::BoxStream;
use keel_core::{Event, SyncStatus};
use keel_storage::{ConfigStore as _, ConfigValue};
use snafu::OptionExt as _;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, warn};

use super::{
    AlreadyAttachedSnafu, ClientGoneSnafu, LOG_TARGET, RemoteTransport, StrategyResult,
    SyncStrategy, cursor_key,
};
use crate::{Client, ClientHandle};

pub struct PeriodicSync {
    inner: Arc<PeriodicInner>,
    interval: Duration,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

struct PeriodicInner {
    transport: Arc<dyn RemoteTransport>,
    client: std::sync::OnceLock<ClientHandle>,
    connected_tx: watch::Sender<bool>,
}

impl PeriodicSync {
    pub fn new(transport: Arc<dyn RemoteTransport>, interval: Duration) -> Self {
        Self {
            inner: Arc::new(PeriodicInner {
                transport,
                client: std::sync::OnceLock::new(),
                connected_tx: watch::channel(false).0,
            }),
            interval,
            task: std::sync::Mutex::new(None),
        }
    }

    /// Run one full push/pull cycle right now (drain-on-reconnect, tests).
    pub async fn trigger_sync(&self) -> StrategyResult<()> {
        self.inner.run_cycle().await
    }
}

impl PeriodicInner {
    fn set_connected(&self, connected: bool) {
        self.connected_tx.send_if_modified(|state| {
            if *state != connected {
                *state = connected;
                true
            } else {
                false
            }
        });
    }

    fn owner(&self) -> StrategyResult<Arc<Client>> {
        self.client
            .get()
            .and_then(ClientHandle::upgrade)
            .context(ClientGoneSnafu)
    }

    async fn run_cycle(&self) -> StrategyResult<()> {
        let client = self.owner()?;

        if !self.transport.connected().await {
            self.set_connected(false);
            debug!(target: LOG_TARGET, "Remote unreachable, keeping events queued");
            return Ok(());
        }

        let Some(namespace) = client.current_namespace() else {
            // Storage closed under us; nothing to sync against.
            return Ok(());
        };

        let result: StrategyResult<()> = async {
            for repository in client.repository_names() {
                self.sync_repository(&client, &namespace, &repository).await?;
            }
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                self.set_connected(true);
                Ok(())
            }
            Err(err) => {
                self.set_connected(false);
                Err(err)
            }
        }
    }

    async fn sync_repository(
        &self,
        client: &Client,
        namespace: &str,
        repository: &str,
    ) -> StrategyResult<()> {
        // (a) Drain everything unacknowledged (Pending and Failed) in one
        // batch.
        let pending = client.repository_inner(repository)?.get_unsynced_events().await?;
        if !pending.is_empty() {
            let ack = (|| async { self.transport.push_events(repository, &pending).await })
                .retry(
                    backon::FibonacciBuilder::default()
                        .with_jitter()
                        .with_max_times(2),
                )
                .notify(|err, _| debug!(target: LOG_TARGET, err = %err, "Retrying push"))
                .await?;

            let repo = client.repository_inner(repository)?;
            for event in &pending {
                if let Some(sequence) = ack.sequences.get(&event.event_id) {
                    repo.mark_event_synced(event.event_id, Some(*sequence)).await?;
                }
            }
            debug!(
                target: LOG_TARGET,
                repository,
                pushed = pending.len(),
                "Drained pending events"
            );
        }

        // (b)–(d) Pull everything after the stored cursor, merge, advance.
        let key = cursor_key(namespace, repository);
        let cursor = client
            .config()
            .get(&key)
            .await?
            .and_then(|value| value.as_int());
        let fetched = self.transport.fetch_events(repository, cursor).await?;
        if fetched.is_empty() {
            return Ok(());
        }

        let merged = client.pull_changes(repository, &fetched).await?;
        let max_sequence = merged.iter().filter_map(|event| event.server_sequence).max();
        if let Some(max_sequence) = max_sequence {
            // The cursor only ever moves forward.
            if cursor.is_none_or(|current| current < max_sequence) {
                client.config().set(&key, ConfigValue::Int(max_sequence)).await?;
            }
        }
        debug!(
            target: LOG_TARGET,
            repository,
            pulled = merged.len(),
            "Pulled remote events"
        );
        Ok(())
    }
}

#[async_trait]
impl SyncStrategy for PeriodicSync {
    fn name(&self) -> &'static str {
        "periodic"
    }

    async fn attach(&self, client: ClientHandle) -> StrategyResult<()> {
        self.inner
            .client
            .set(client)
            .map_err(|_| AlreadyAttachedSnafu.build())
    }

    async fn on_push_to_remote(&self, event: &Event) -> StrategyResult<SyncStatus> {
        if !self.inner.transport.connected().await {
            self.inner.set_connected(false);
            return Ok(SyncStatus::Pending);
        }

        let ack = match self
            .inner
            .transport
            .push_events(&event.repository, std::slice::from_ref(event))
            .await
        {
            Ok(ack) => ack,
            Err(err) => {
                self.inner.set_connected(false);
                return Err(err);
            }
        };
        self.inner.set_connected(true);

        match ack.sequences.get(&event.event_id).copied() {
            Some(sequence) => {
                // Record the sequence first; the repository persists the Ok
                // transition on top of it.
                if let Ok(client) = self.inner.owner() {
                    if let Ok(repo) = client.repository_inner(&event.repository) {
                        if let Err(err) =
                            repo.mark_event_synced(event.event_id, Some(sequence)).await
                        {
                            warn!(
                                target: LOG_TARGET,
                                err = %err,
                                "Could not record server sequence"
                            );
                        }
                    }
                }
                Ok(SyncStatus::Ok)
            }
            None => Ok(SyncStatus::Pending),
        }
    }

    async fn start(&self) -> StrategyResult<()> {
        let inner = self.inner.clone();
        let interval = self.interval;
        let task = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(err) = inner.run_cycle().await {
                    debug!(target: LOG_TARGET, err = %err, "Sync cycle failed");
                }
            }
        });
        *self.task.lock().expect("Mutex poisoned") = Some(task);
        Ok(())
    }

    async fn stop(&self) -> StrategyResult<()> {
        if let Some(task) = self.task.lock().expect("Mutex poisoned").take() {
            task.abort();
        }
        self.inner.set_connected(false);
        Ok(())
    }

    fn connection_changes(&self) -> BoxStream<'static, bool> {
        WatchStream::new(self.inner.connected_tx.subscribe()).boxed()
    }

    fn is_connected(&self) -> bool {
        *self.inner.connected_tx.borrow()
    }
}

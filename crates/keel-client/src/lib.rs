//! The Keel client: owner of storage, config, repositories and sync
//! strategies.
//!
//! A [`Client`] is an explicit value owned by the application root; there
//! is no process-global instance. Components that need to reach back (sync
//! strategies, repositories) hold a non-owning [`ClientHandle`] obtained at
//! attach time, so the ownership graph stays acyclic.

pub mod repository;
pub mod strategy;

#[cfg(test)]
mod tests;

use std::sync::{Arc, Weak};

use futures::StreamExt as _;
use futures::stream::{self, BoxStream};
use keel_core::{ChangeBatch, Event, FormatError, namespace};
use keel_storage::{ConfigError, ConfigStore, StorageAdapter, StorageError};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use snafu::{OptionExt as _, Snafu};
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, warn};

use crate::repository::{Repository, RepositoryDef, RepositoryError, RepositoryInner};
use crate::strategy::{StrategyError, SyncStrategy};

pub use crate::repository::{ConflictFn, last_write_wins, last_write_wins_prefer_filled};

const LOG_TARGET: &str = "keel::client";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ClientError {
    #[snafu(display("Client is not initialized"))]
    NotInitialized,
    #[snafu(display("Repository `{name}` is already registered"))]
    DuplicateRepository { name: String },
    #[snafu(display("Repositories and strategies must be registered before initialization"))]
    LateRegistration,
    #[snafu(display("No repository named `{name}`"))]
    UnknownRepository { name: String },
    #[snafu(transparent)]
    Storage { source: StorageError },
    #[snafu(transparent)]
    Config { source: ConfigError },
    #[snafu(transparent)]
    Format { source: FormatError },
    #[snafu(transparent)]
    Repository { source: RepositoryError },
    #[snafu(transparent)]
    Strategy { source: StrategyError },
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;

/// Non-owning link back to the [`Client`].
///
/// Repositories and strategies receive one when they are registered or
/// attached; [`ClientHandle::upgrade`] yields the owning client for the
/// duration of one operation. Because the link is weak, the ownership
/// graph stays acyclic: the application root owns the client, the client
/// owns its components, and nothing owns the client back.
#[derive(Clone)]
pub struct ClientHandle {
    inner: Weak<Client>,
}

impl ClientHandle {
    fn new(inner: Weak<Client>) -> Self {
        Self { inner }
    }

    /// The owning client, while it is still alive. Returns `None` once the
    /// application root has dropped it; callers treat that as "stop doing
    /// work", never as an error worth retrying.
    pub fn upgrade(&self) -> Option<Arc<Client>> {
        self.inner.upgrade()
    }
}

pub struct Client {
    /// Weak self-reference handed out to repositories and strategies.
    handle: ClientHandle,

    storage: Arc<dyn StorageAdapter>,
    config: Arc<dyn ConfigStore>,
    initial_namespace: String,

    repositories: std::sync::RwLock<Vec<Arc<RepositoryInner>>>,
    strategies: std::sync::RwLock<Vec<Arc<dyn SyncStrategy>>>,

    init_once: tokio::sync::OnceCell<()>,
    initialized_tx: watch::Sender<bool>,
    connection_tx: watch::Sender<bool>,
    tasks: std::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

#[bon::bon]
impl Client {
    /// Build a client. Repositories and strategies can also be added with
    /// [`Client::add_repository`] / [`Client::add_strategy`], but only
    /// before [`Client::initialize`].
    #[builder(finish_fn(name = "build"))]
    pub fn new(
        storage: Arc<dyn StorageAdapter>,
        /// Defaults to the storage adapter's own config capability.
        config: Option<Arc<dyn ConfigStore>>,
        #[builder(default)] repositories: Vec<RepositoryDef>,
        #[builder(default)] strategies: Vec<Arc<dyn SyncStrategy>>,
        #[builder(into, default = String::from(namespace::DEFAULT_NAMESPACE))] namespace: String,
    ) -> ClientResult<Arc<Client>> {
        let config = config.unwrap_or_else(|| storage.config_store());
        let initial_namespace = namespace::sanitize(&namespace);

        let client = Arc::new_cyclic(|weak: &Weak<Client>| Client {
            handle: ClientHandle::new(weak.clone()),
            storage,
            config,
            initial_namespace,
            repositories: std::sync::RwLock::new(Vec::new()),
            strategies: std::sync::RwLock::new(strategies),
            init_once: tokio::sync::OnceCell::new(),
            initialized_tx: watch::channel(false).0,
            connection_tx: watch::channel(false).0,
            tasks: std::sync::Mutex::new(Vec::new()),
        });

        for def in repositories {
            client.add_repository(def)?;
        }
        Ok(client)
    }
}

impl Client {
    /// Register a repository. Names are unique; registration closes at
    /// [`Client::initialize`].
    pub fn add_repository(&self, def: RepositoryDef) -> ClientResult<()> {
        if self.is_initialized() {
            return LateRegistrationSnafu.fail();
        }
        let mut repositories = self.repositories.write().expect("Mutex poisoned");
        if repositories.iter().any(|repo| repo.name() == def.name) {
            return DuplicateRepositorySnafu { name: def.name }.fail();
        }
        repositories.push(Arc::new(RepositoryInner::new(
            def,
            self.storage.clone(),
            self.handle.clone(),
        )));
        Ok(())
    }

    /// Register a sync strategy. Registration closes at
    /// [`Client::initialize`].
    pub fn add_strategy(&self, strategy: Arc<dyn SyncStrategy>) -> ClientResult<()> {
        if self.is_initialized() {
            return LateRegistrationSnafu.fail();
        }
        self.strategies
            .write()
            .expect("Mutex poisoned")
            .push(strategy);
        Ok(())
    }

    /// Open storage, declare schemas, attach and start strategies.
    /// Idempotent: concurrent calls collapse into a single effort.
    pub async fn initialize(&self) -> ClientResult<()> {
        self.init_once
            .get_or_try_init(|| async {
                debug!(target: LOG_TARGET, namespace = %self.initial_namespace, "Initializing");
                self.storage.open(&self.initial_namespace).await?;
                self.config.use_namespace(&self.initial_namespace).await?;

                for repo in self.repositories_snapshot() {
                    repo.ensure_schema().await?;
                }

                let strategies = self.strategies_snapshot();
                for strategy in &strategies {
                    strategy.attach(self.handle.clone()).await?;
                }
                for strategy in &strategies {
                    strategy.start().await?;
                }
                self.spawn_connection_aggregator(&strategies);

                self.initialized_tx.send_replace(true);
                Ok::<_, ClientError>(())
            })
            .await?;
        Ok(())
    }

    /// Resolves once [`Client::initialize`] has completed.
    pub async fn await_initialization(&self) {
        let mut rx = self.initialized_tx.subscribe();
        let _ = rx.wait_for(|ready| *ready).await;
    }

    pub fn is_initialized(&self) -> bool {
        *self.initialized_tx.borrow()
    }

    fn ensure_initialized(&self) -> ClientResult<()> {
        if !self.is_initialized() {
            return NotInitializedSnafu.fail();
        }
        Ok(())
    }

    /// Typed handle to a registered repository.
    pub fn repository<T>(&self, name: &str) -> ClientResult<Repository<T>>
    where
        T: Serialize + DeserializeOwned + Send + Sync,
    {
        Ok(Repository::from_inner(self.repository_inner(name)?))
    }

    pub(crate) fn repository_inner(&self, name: &str) -> ClientResult<Arc<RepositoryInner>> {
        self.repositories
            .read()
            .expect("Mutex poisoned")
            .iter()
            .find(|repo| repo.name() == name)
            .cloned()
            .context(UnknownRepositorySnafu { name })
    }

    pub fn repository_names(&self) -> Vec<String> {
        self.repositories
            .read()
            .expect("Mutex poisoned")
            .iter()
            .map(|repo| repo.name().to_owned())
            .collect()
    }

    fn repositories_snapshot(&self) -> Vec<Arc<RepositoryInner>> {
        self.repositories.read().expect("Mutex poisoned").clone()
    }

    pub(crate) fn strategies_snapshot(&self) -> Vec<Arc<dyn SyncStrategy>> {
        self.strategies.read().expect("Mutex poisoned").clone()
    }

    pub fn config(&self) -> &Arc<dyn ConfigStore> {
        &self.config
    }

    /// Currently scoped namespace (sanitized), `None` when storage is
    /// closed.
    pub fn current_namespace(&self) -> Option<String> {
        self.storage.namespace()
    }

    /// Switch every namespace-scoped capability at once. No-op switches are
    /// tolerated.
    pub async fn use_namespace(&self, raw: &str) -> ClientResult<()> {
        self.ensure_initialized()?;
        self.storage.use_namespace(raw).await?;
        self.config.use_namespace(raw).await?;
        debug!(target: LOG_TARGET, namespace = %namespace::sanitize(raw), "Switched namespace");
        Ok(())
    }

    /// Route remote wire events to the named repository. Malformed payloads
    /// fail with a [`FormatError`]; the local store stays consistent.
    /// Returns the decoded events (useful for cursor accounting).
    pub async fn pull_changes(
        &self,
        repository: &str,
        events: &[Value],
    ) -> ClientResult<Vec<Event>> {
        self.ensure_initialized()?;
        let repo = self.repository_inner(repository)?;
        let mut merged = Vec::with_capacity(events.len());
        for raw in events {
            let event = Event::from_wire(repository, raw)?;
            repo.merge_remote_event(event.clone()).await?;
            merged.push(event);
        }
        Ok(merged)
    }

    /// Decompose a batch per repository and merge everything it carries.
    pub async fn apply_batch(&self, batch: &ChangeBatch) -> ClientResult<Vec<Event>> {
        let mut merged = Vec::new();
        for (repository, events) in &batch.changes {
            merged.extend(self.pull_changes(repository, events).await?);
        }
        Ok(merged)
    }

    pub async fn get_all_pending_events(&self, repository: &str) -> ClientResult<Vec<Event>> {
        self.ensure_initialized()?;
        Ok(self.repository_inner(repository)?.get_pending_events().await?)
    }

    /// Wipe the current namespace and re-declare every repository schema.
    pub async fn clear_all_data(&self) -> ClientResult<()> {
        self.ensure_initialized()?;
        self.storage.clear_all_data().await?;
        for repo in self.repositories_snapshot() {
            repo.reset();
            repo.ensure_schema().await?;
        }
        Ok(())
    }

    /// Merged connectivity across strategies: true while any strategy is
    /// connected. Emits the current value first.
    pub fn connection_changes(&self) -> BoxStream<'static, bool> {
        WatchStream::new(self.connection_tx.subscribe()).boxed()
    }

    pub fn latest_connection_state(&self) -> bool {
        *self.connection_tx.borrow()
    }

    fn spawn_connection_aggregator(&self, strategies: &[Arc<dyn SyncStrategy>]) {
        if strategies.is_empty() {
            return;
        }
        let streams: Vec<BoxStream<'static, (usize, bool)>> = strategies
            .iter()
            .enumerate()
            .map(|(idx, strategy)| {
                strategy
                    .connection_changes()
                    .map(move |connected| (idx, connected))
                    .boxed()
            })
            .collect();
        let mut merged = stream::select_all(streams);

        let connection_tx = self.connection_tx.clone();
        let count = strategies.len();
        let task = tokio::spawn(async move {
            let mut states = vec![false; count];
            while let Some((idx, connected)) = merged.next().await {
                states[idx] = connected;
                let any = states.iter().any(|connected| *connected);
                connection_tx.send_if_modified(|state| {
                    if *state != any {
                        *state = any;
                        true
                    } else {
                        false
                    }
                });
            }
        });
        self.tasks.lock().expect("Mutex poisoned").push(task);
    }

    /// Stop strategies and close storage. Terminal.
    pub async fn dispose(&self) -> ClientResult<()> {
        for strategy in self.strategies_snapshot() {
            if let Err(err) = strategy.stop().await {
                warn!(
                    target: LOG_TARGET,
                    strategy = strategy.name(),
                    err = %err,
                    "Strategy failed to stop"
                );
            }
        }
        for task in self.tasks.lock().expect("Mutex poisoned").drain(..) {
            task.abort();
        }
        self.storage.close().await?;
        Ok(())
    }
}

//! Embedded production adapter over `redb`.
//!
//! Layout per namespace: `{ns}__data__{repo}` (record id → row JSON incl.
//! the event link), `{ns}__events__{repo}` (event id → wire JSON, so key
//! order is creation order) and `{ns}__config`. Every mutation commits its
//! transaction (fsync) before acknowledging. Writers record which
//! repositories they touched and `write_with` notifies watchers only after
//! the commit succeeds, so watched queries never observe uncommitted data.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use async_stream::stream;
use async_trait::async_trait;
use keel_core::{Event, EventId, Payload, namespace};
use redb::{ReadTransaction, ReadableTable as _, TableDefinition, TableHandle as _};
use serde_json::Value;
use snafu::{OptionExt as _, ResultExt as _};
use tracing::debug;

use crate::notify::ChangeNotifier;
use crate::{
    CommitSnafu, ConfigResult, ConfigStore, ConfigValue, CorruptRowSnafu, DatabaseSnafu,
    EncodingSnafu, JoinSnafu, LOG_TARGET, NamespaceClosedSnafu, Query, QueryStream,
    SchemaMismatchSnafu, StateRow, StorageAdapter, StorageResult, TransactionSnafu,
    UnknownEventSnafu, UnknownRowSnafu,
};

type Def<'a> = TableDefinition<'a, &'static str, &'static [u8]>;

fn data_table_name(ns: &str, repository: &str) -> String {
    format!("{ns}__data__{repository}")
}

fn events_table_name(ns: &str, repository: &str) -> String {
    format!("{ns}__events__{repository}")
}

fn config_table_name(ns: &str) -> String {
    format!("{ns}__config")
}

/// Repositories a write transaction touched. Watcher notification waits
/// until the commit has gone through.
#[derive(Default)]
struct Touched {
    repos: Vec<(String, String)>,
}

impl Touched {
    fn mark(&mut self, ns: &str, repository: &str) {
        self.repos.push((ns.to_owned(), repository.to_owned()));
    }
}

enum Backend {
    File(PathBuf),
    InMemory,
}

struct RedbInner {
    backend: Backend,
    db: std::sync::Mutex<Option<redb::Database>>,
    current: std::sync::Mutex<Option<String>>,
    notifier: ChangeNotifier,
}

#[derive(Clone)]
pub struct RedbStorage {
    inner: Arc<RedbInner>,
}

impl RedbStorage {
    /// Adapter backed by a database file; created lazily on [`open`].
    ///
    /// [`open`]: StorageAdapter::open
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_backend(Backend::File(path.into()))
    }

    /// Adapter backed by redb's in-memory backend. Useful where the full
    /// production code path matters but no file should be written.
    pub fn in_memory() -> Self {
        Self::with_backend(Backend::InMemory)
    }

    fn with_backend(backend: Backend) -> Self {
        Self {
            inner: Arc::new(RedbInner {
                backend,
                db: std::sync::Mutex::new(None),
                current: std::sync::Mutex::new(None),
                notifier: ChangeNotifier::new(),
            }),
        }
    }

    fn current_ns(&self) -> StorageResult<String> {
        self.inner
            .current
            .lock()
            .expect("Mutex poisoned")
            .clone()
            .context(NamespaceClosedSnafu)
    }

    /// Run `f` in a write transaction, commit, then fan the touched-repo
    /// notifications out to watchers.
    fn write_with<T>(
        &self,
        f: impl FnOnce(&redb::WriteTransaction, &mut Touched) -> StorageResult<T>,
    ) -> StorageResult<T> {
        tokio::task::block_in_place(|| {
            let guard = self.inner.db.lock().expect("Mutex poisoned");
            let db = guard.as_ref().context(NamespaceClosedSnafu)?;
            let dbtx = db.begin_write().context(TransactionSnafu)?;

            let mut touched = Touched::default();
            let res = f(&dbtx, &mut touched)?;
            dbtx.commit().context(CommitSnafu)?;

            for (ns, repository) in touched.repos {
                self.inner.notifier.notify(&ns, &repository);
            }
            Ok(res)
        })
    }

    fn read_with<T>(
        &self,
        f: impl FnOnce(&ReadTransaction) -> StorageResult<T>,
    ) -> StorageResult<T> {
        tokio::task::block_in_place(|| {
            let guard = self.inner.db.lock().expect("Mutex poisoned");
            let db = guard.as_ref().context(NamespaceClosedSnafu)?;
            let dbtx = db.begin_read().context(TransactionSnafu)?;

            f(&dbtx)
        })
    }

    fn query_in(&self, ns: &str, query: &Query) -> StorageResult<Vec<Event>> {
        let data_name = data_table_name(ns, query.repository());
        let events_name = events_table_name(ns, query.repository());
        let repository = query.repository().to_owned();

        self.read_with(|tx| {
            let rows_table = open_read_table(tx, &data_name)?;
            let events_table = open_read_table(tx, &events_name)?;

            let mut candidates = Vec::new();
            let mut live_ids: HashSet<String> = HashSet::new();

            if let Some(rows) = &rows_table {
                for entry in rows.iter()? {
                    let (key, value) = entry?;
                    let id = key.value().to_owned();
                    let row = decode_row(&repository, &id, value.value())?;
                    let state_row = StateRow::from_row(&repository, &id, row)?;
                    live_ids.insert(id);

                    let Some(events) = &events_table else {
                        continue;
                    };
                    let event_key = state_row.last_event_id.to_string();
                    match events.get(event_key.as_str())? {
                        Some(guard) => {
                            candidates.push(decode_event(&repository, guard.value())?);
                        }
                        None => {
                            debug!(
                                target: LOG_TARGET,
                                id = %state_row.id,
                                "State row without its log event"
                            );
                        }
                    }
                }
            }

            if query.include_deleted() {
                if let Some(events) = &events_table {
                    let mut latest: HashMap<String, Event> = HashMap::new();
                    for entry in events.iter()? {
                        let (_, value) = entry?;
                        // Key order is ascending, so later events overwrite.
                        let event = decode_event(&repository, value.value())?;
                        latest.insert(event.data_id.clone(), event);
                    }
                    for event in latest.into_values() {
                        if event.is_delete() && !live_ids.contains(&event.data_id) {
                            candidates.push(event);
                        }
                    }
                }
            }

            Ok(query.apply(candidates))
        })
    }
}

fn open_read_table(
    tx: &ReadTransaction,
    name: &str,
) -> StorageResult<Option<redb::ReadOnlyTable<&'static str, &'static [u8]>>> {
    match tx.open_table(Def::new(name)) {
        Ok(table) => Ok(Some(table)),
        Err(redb::TableError::TableDoesNotExist(_)) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn decode_row(repository: &str, id: &str, bytes: &[u8]) -> StorageResult<Payload> {
    let value: Value = serde_json::from_slice(bytes).context(EncodingSnafu)?;
    match value {
        Value::Object(row) => Ok(row),
        _ => CorruptRowSnafu { repository, id }.fail(),
    }
}

fn decode_event(repository: &str, bytes: &[u8]) -> StorageResult<Event> {
    let value: Value = serde_json::from_slice(bytes).context(EncodingSnafu)?;
    Ok(Event::from_wire(repository, &value)?)
}

fn encode_json(value: &Value) -> StorageResult<Vec<u8>> {
    serde_json::to_vec(value).context(EncodingSnafu)
}

#[async_trait]
impl StorageAdapter for RedbStorage {
    async fn open(&self, raw: &str) -> StorageResult<()> {
        let needs_db = self.inner.db.lock().expect("Mutex poisoned").is_none();
        if needs_db {
            let db = match &self.inner.backend {
                Backend::File(path) => {
                    debug!(target: LOG_TARGET, path = %path.display(), "Opening database");
                    let path = path.clone();
                    tokio::task::spawn_blocking(move || redb::Database::create(path))
                        .await
                        .context(JoinSnafu)?
                        .context(DatabaseSnafu)?
                }
                Backend::InMemory => redb::Database::builder()
                    .create_with_backend(redb::backends::InMemoryBackend::new())
                    .context(DatabaseSnafu)?,
            };
            let mut guard = self.inner.db.lock().expect("Mutex poisoned");
            if guard.is_none() {
                *guard = Some(db);
            }
        }
        *self.inner.current.lock().expect("Mutex poisoned") = Some(namespace::sanitize(raw));
        Ok(())
    }

    async fn close(&self) -> StorageResult<()> {
        *self.inner.current.lock().expect("Mutex poisoned") = None;
        let db = self.inner.db.lock().expect("Mutex poisoned").take();
        drop(db);
        self.inner.notifier.close();
        Ok(())
    }

    async fn use_namespace(&self, raw: &str) -> StorageResult<()> {
        let mut current = self.inner.current.lock().expect("Mutex poisoned");
        if current.is_none() {
            return NamespaceClosedSnafu.fail();
        }
        *current = Some(namespace::sanitize(raw));
        Ok(())
    }

    fn namespace(&self) -> Option<String> {
        self.inner.current.lock().expect("Mutex poisoned").clone()
    }

    async fn ensure_schema(
        &self,
        repository: &str,
        _fields: &[String],
        id_field: &str,
    ) -> StorageResult<()> {
        let ns = self.current_ns()?;
        let data_name = data_table_name(&ns, repository);
        let events_name = events_table_name(&ns, repository);
        let config_name = config_table_name(&ns);

        self.write_with(|tx, _touched| {
            // Creating the tables up front keeps later reads simple.
            let data_table = tx.open_table(Def::new(&data_name))?;
            tx.open_table(Def::new(&events_name))?;
            tx.open_table(Def::new(&config_name))?;

            for entry in data_table.iter()? {
                let (key, value) = entry?;
                let id = key.value();
                let row = decode_row(repository, id, value.value())?;
                match row.get(id_field) {
                    Some(Value::String(_)) => {}
                    Some(_) => {
                        return SchemaMismatchSnafu {
                            repository,
                            reason: format!("row `{id}` has a non-string `{id_field}`"),
                        }
                        .fail();
                    }
                    None => {
                        return SchemaMismatchSnafu {
                            repository,
                            reason: format!("row `{id}` is missing `{id_field}`"),
                        }
                        .fail();
                    }
                }
            }
            Ok(())
        })
    }

    async fn insert(&self, repository: &str, row: Payload, id_field: &str) -> StorageResult<()> {
        let ns = self.current_ns()?;
        let id = row
            .get(id_field)
            .and_then(Value::as_str)
            .map(str::to_owned)
            .context(SchemaMismatchSnafu {
                repository,
                reason: format!("inserted row is missing `{id_field}`"),
            })?;
        let bytes = encode_json(&Value::Object(row))?;
        let name = data_table_name(&ns, repository);

        self.write_with(|tx, touched| {
            let mut table = tx.open_table(Def::new(&name))?;
            table.insert(id.as_str(), bytes.as_slice())?;
            touched.mark(&ns, repository);
            Ok(())
        })
    }

    async fn update(&self, repository: &str, id: &str, row: Payload) -> StorageResult<()> {
        let ns = self.current_ns()?;
        let bytes = encode_json(&Value::Object(row))?;
        let name = data_table_name(&ns, repository);

        self.write_with(|tx, touched| {
            let mut table = tx.open_table(Def::new(&name))?;
            if table.get(id)?.is_none() {
                return UnknownRowSnafu { repository, id }.fail();
            }
            table.insert(id, bytes.as_slice())?;
            touched.mark(&ns, repository);
            Ok(())
        })
    }

    async fn delete(&self, repository: &str, id: &str) -> StorageResult<()> {
        let ns = self.current_ns()?;
        let name = data_table_name(&ns, repository);

        self.write_with(|tx, touched| {
            let mut table = tx.open_table(Def::new(&name))?;
            if table.remove(id)?.is_some() {
                touched.mark(&ns, repository);
            }
            Ok(())
        })
    }

    async fn get_by_id(&self, repository: &str, id: &str) -> StorageResult<Option<StateRow>> {
        let ns = self.current_ns()?;
        let name = data_table_name(&ns, repository);

        self.read_with(|tx| {
            let Some(table) = open_read_table(tx, &name)? else {
                return Ok(None);
            };
            let Some(guard) = table.get(id)? else {
                return Ok(None);
            };
            let row = decode_row(repository, id, guard.value())?;
            StateRow::from_row(repository, id, row).map(Some)
        })
    }

    async fn contains(&self, repository: &str, id: &str) -> StorageResult<bool> {
        let ns = self.current_ns()?;
        let name = data_table_name(&ns, repository);

        self.read_with(|tx| {
            let Some(table) = open_read_table(tx, &name)? else {
                return Ok(false);
            };
            Ok(table.get(id)?.is_some())
        })
    }

    async fn get_all(&self, repository: &str) -> StorageResult<Vec<StateRow>> {
        let ns = self.current_ns()?;
        let name = data_table_name(&ns, repository);

        self.read_with(|tx| {
            let Some(table) = open_read_table(tx, &name)? else {
                return Ok(Vec::new());
            };
            let mut rows = Vec::new();
            for entry in table.iter()? {
                let (key, value) = entry?;
                let id = key.value();
                let row = decode_row(repository, id, value.value())?;
                rows.push(StateRow::from_row(repository, id, row)?);
            }
            Ok(rows)
        })
    }

    async fn delete_all(&self, repository: &str) -> StorageResult<()> {
        let ns = self.current_ns()?;
        let name = data_table_name(&ns, repository);

        self.write_with(|tx, touched| {
            if tx.delete_table(Def::new(&name))? {
                touched.mark(&ns, repository);
            }
            Ok(())
        })
    }

    async fn insert_event(&self, repository: &str, event: &Event) -> StorageResult<()> {
        let ns = self.current_ns()?;
        let name = events_table_name(&ns, repository);
        let key = event.event_id.to_string();
        let bytes = encode_json(&event.to_wire())?;

        self.write_with(|tx, touched| {
            let mut table = tx.open_table(Def::new(&name))?;
            table.insert(key.as_str(), bytes.as_slice())?;
            touched.mark(&ns, repository);
            Ok(())
        })
    }

    async fn update_event(
        &self,
        repository: &str,
        event_id: EventId,
        event: &Event,
    ) -> StorageResult<()> {
        let ns = self.current_ns()?;
        let name = events_table_name(&ns, repository);
        let key = event_id.to_string();
        let bytes = encode_json(&event.to_wire())?;

        self.write_with(|tx, touched| {
            let mut table = tx.open_table(Def::new(&name))?;
            if table.get(key.as_str())?.is_none() {
                return UnknownEventSnafu {
                    repository,
                    event_id,
                }
                .fail();
            }
            table.insert(key.as_str(), bytes.as_slice())?;
            touched.mark(&ns, repository);
            Ok(())
        })
    }

    async fn get_event(
        &self,
        repository: &str,
        event_id: EventId,
    ) -> StorageResult<Option<Event>> {
        let ns = self.current_ns()?;
        let name = events_table_name(&ns, repository);
        let key = event_id.to_string();

        self.read_with(|tx| {
            let Some(table) = open_read_table(tx, &name)? else {
                return Ok(None);
            };
            let Some(guard) = table.get(key.as_str())? else {
                return Ok(None);
            };
            decode_event(repository, guard.value()).map(Some)
        })
    }

    async fn get_all_events(&self, repository: &str) -> StorageResult<Vec<Event>> {
        let ns = self.current_ns()?;
        let name = events_table_name(&ns, repository);

        self.read_with(|tx| {
            let Some(table) = open_read_table(tx, &name)? else {
                return Ok(Vec::new());
            };
            let mut events = Vec::new();
            for entry in table.iter()? {
                let (_, value) = entry?;
                events.push(decode_event(repository, value.value())?);
            }
            Ok(events)
        })
    }

    async fn delete_event(&self, repository: &str, event_id: EventId) -> StorageResult<()> {
        let ns = self.current_ns()?;
        let name = events_table_name(&ns, repository);
        let key = event_id.to_string();

        self.write_with(|tx, touched| {
            let mut table = tx.open_table(Def::new(&name))?;
            if table.remove(key.as_str())?.is_some() {
                touched.mark(&ns, repository);
            }
            Ok(())
        })
    }

    async fn delete_all_events(&self, repository: &str) -> StorageResult<()> {
        let ns = self.current_ns()?;
        let name = events_table_name(&ns, repository);

        self.write_with(|tx, touched| {
            if tx.delete_table(Def::new(&name))? {
                touched.mark(&ns, repository);
            }
            Ok(())
        })
    }

    async fn query(&self, query: &Query) -> StorageResult<Vec<Event>> {
        let ns = self.current_ns()?;
        self.query_in(&ns, query)
    }

    fn watch_query(&self, query: Query) -> QueryStream {
        let this = self.clone();
        // Bind to the namespace active right now; a switch between this
        // call and the first poll must not rebind the subscription.
        let bound = self.namespace().map(|ns| {
            let changes = self.inner.notifier.subscribe(&ns, query.repository());
            (ns, changes)
        });
        Box::pin(stream! {
            let Some((ns, mut changes)) = bound else { return };
            loop {
                let snapshot = match this.query_in(&ns, &query) {
                    Ok(snapshot) => snapshot,
                    Err(err) => {
                        debug!(target: LOG_TARGET, err = %err, "Watched query ended");
                        break;
                    }
                };
                yield snapshot;
                if changes.changed().await.is_err() {
                    break;
                }
            }
        })
    }

    async fn clear_all_data(&self) -> StorageResult<()> {
        let ns = self.current_ns()?;
        let prefix = format!("{ns}__");

        self.write_with(|tx, touched| {
            let names: Vec<String> = tx
                .list_tables()?
                .map(|handle| handle.name().to_owned())
                .filter(|name| name.starts_with(&prefix))
                .collect();

            let mut repositories = HashSet::new();
            for name in &names {
                if let Some(repo) = name.strip_prefix(&format!("{ns}__data__")) {
                    repositories.insert(repo.to_owned());
                }
                if let Some(repo) = name.strip_prefix(&format!("{ns}__events__")) {
                    repositories.insert(repo.to_owned());
                }
                tx.delete_table(Def::new(name))?;
            }
            for repository in repositories {
                touched.mark(&ns, &repository);
            }
            Ok(())
        })
    }

    fn config_store(&self) -> Arc<dyn ConfigStore> {
        Arc::new(self.clone())
    }
}

#[async_trait]
impl ConfigStore for RedbStorage {
    async fn set(&self, key: &str, value: ConfigValue) -> ConfigResult<()> {
        let ns = self.current_ns()?;
        let name = config_table_name(&ns);
        let bytes = encode_json(&value.into_json())?;

        self.write_with(|tx, _touched| {
            let mut table = tx.open_table(Def::new(&name))?;
            table.insert(key, bytes.as_slice())?;
            Ok(())
        })?;
        Ok(())
    }

    async fn get(&self, key: &str) -> ConfigResult<Option<ConfigValue>> {
        let ns = self.current_ns()?;
        let name = config_table_name(&ns);

        let raw = self.read_with(|tx| {
            let Some(table) = open_read_table(tx, &name)? else {
                return Ok(None);
            };
            let Some(guard) = table.get(key)? else {
                return Ok(None);
            };
            let value: Value = serde_json::from_slice(guard.value()).context(EncodingSnafu)?;
            Ok(Some(value))
        })?;
        raw.map(ConfigValue::try_from).transpose()
    }

    async fn contains(&self, key: &str) -> ConfigResult<bool> {
        let ns = self.current_ns()?;
        let name = config_table_name(&ns);

        let contained = self.read_with(|tx| {
            let Some(table) = open_read_table(tx, &name)? else {
                return Ok(false);
            };
            Ok(table.get(key)?.is_some())
        })?;
        Ok(contained)
    }

    async fn remove(&self, key: &str) -> ConfigResult<()> {
        let ns = self.current_ns()?;
        let name = config_table_name(&ns);

        self.write_with(|tx, _touched| {
            let mut table = tx.open_table(Def::new(&name))?;
            table.remove(key)?;
            Ok(())
        })?;
        Ok(())
    }

    async fn keys(&self) -> ConfigResult<Vec<String>> {
        let ns = self.current_ns()?;
        let name = config_table_name(&ns);

        let keys = self.read_with(|tx| {
            let Some(table) = open_read_table(tx, &name)? else {
                return Ok(Vec::new());
            };
            let mut keys = Vec::new();
            for entry in table.iter()? {
                let (key, _) = entry?;
                keys.push(key.value().to_owned());
            }
            Ok(keys)
        })?;
        Ok(keys)
    }

    async fn clear(&self) -> ConfigResult<()> {
        let ns = self.current_ns()?;
        let name = config_table_name(&ns);

        self.write_with(|tx, _touched| {
            tx.delete_table(Def::new(&name))?;
            Ok(())
        })?;
        Ok(())
    }

    async fn use_namespace(&self, raw: &str) -> ConfigResult<()> {
        StorageAdapter::use_namespace(self, raw).await?;
        Ok(())
    }
}

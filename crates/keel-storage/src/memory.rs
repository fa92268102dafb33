//! In-memory reference adapter.
//!
//! Meets every `StorageAdapter`/`ConfigStore` contract (ordering, namespace
//! isolation, watch-query coalescing) with per-namespace `BTreeMap`s, so
//! the ordered-by-`event_id` log guarantee falls out of the key type. Used
//! as the test storage throughout the workspace.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_stream::stream;
use async_trait::async_trait;
use keel_core::{Event, EventId, Payload, namespace};
use serde_json::Value;
use snafu::OptionExt as _;
use tracing::debug;

use crate::notify::ChangeNotifier;
use crate::{
    ConfigResult, ConfigStore, ConfigValue, LOG_TARGET, NamespaceClosedSnafu, Query, QueryStream,
    SchemaMismatchSnafu, StateRow, StorageAdapter, StorageResult, UnknownEventSnafu,
    UnknownRowSnafu,
};

#[derive(Default)]
struct NamespaceData {
    rows: HashMap<String, BTreeMap<String, Payload>>,
    events: HashMap<String, BTreeMap<EventId, Event>>,
    config: BTreeMap<String, Value>,
}

struct MemoryState {
    namespaces: HashMap<String, NamespaceData>,
    current: Option<String>,
}

struct MemoryInner {
    state: std::sync::Mutex<MemoryState>,
    notifier: ChangeNotifier,
}

impl MemoryInner {
    /// Run `f` against the current namespace's data; returns the namespace
    /// alongside so callers can notify watchers after the lock is released.
    fn with_current<T>(
        &self,
        f: impl FnOnce(&mut NamespaceData) -> StorageResult<T>,
    ) -> StorageResult<(T, String)> {
        let mut state = self.state.lock().expect("Mutex poisoned");
        let ns = state.current.clone().context(NamespaceClosedSnafu)?;
        let data = state.namespaces.entry(ns.clone()).or_default();
        let out = f(data)?;
        Ok((out, ns))
    }
}

#[derive(Clone)]
pub struct MemoryStorage {
    inner: Arc<MemoryInner>,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                state: std::sync::Mutex::new(MemoryState {
                    namespaces: HashMap::new(),
                    current: None,
                }),
                notifier: ChangeNotifier::new(),
            }),
        }
    }

    fn switch_namespace(&self, raw: &str) -> StorageResult<()> {
        let ns = namespace::sanitize(raw);
        let mut state = self.inner.state.lock().expect("Mutex poisoned");
        if state.current.is_none() {
            return NamespaceClosedSnafu.fail();
        }
        state.namespaces.entry(ns.clone()).or_default();
        state.current = Some(ns);
        Ok(())
    }

    /// Evaluate a query against an explicitly named namespace. Watched
    /// queries stay pinned to the namespace they subscribed under, even
    /// across later switches.
    fn query_in(&self, ns: &str, query: &Query) -> StorageResult<Vec<Event>> {
        let state = self.inner.state.lock().expect("Mutex poisoned");
        let Some(data) = state.namespaces.get(ns) else {
            return Ok(Vec::new());
        };
        let candidates = collect_candidates(data, query)?;
        Ok(query.apply(candidates))
    }
}

/// Latest event per live record, plus, with `with_deleted`, the latest
/// Delete event of each erased record.
fn collect_candidates(data: &NamespaceData, query: &Query) -> StorageResult<Vec<Event>> {
    let rows = data.rows.get(query.repository());
    let events = data.events.get(query.repository());

    let mut candidates = Vec::new();
    if let Some(rows) = rows {
        for (id, row) in rows {
            let state_row = StateRow::from_row(query.repository(), id, row.clone())?;
            match events.and_then(|events| events.get(&state_row.last_event_id)) {
                Some(event) => candidates.push(event.clone()),
                None => {
                    debug!(target: LOG_TARGET, id = %id, "State row without its log event");
                }
            }
        }
    }

    if query.include_deleted() {
        if let Some(events) = events {
            let mut latest: HashMap<&str, &Event> = HashMap::new();
            for event in events.values() {
                // Ascending iteration: later events overwrite earlier ones.
                latest.insert(event.data_id.as_str(), event);
            }
            for event in latest.into_values() {
                let live = rows.is_some_and(|rows| rows.contains_key(&event.data_id));
                if event.is_delete() && !live {
                    candidates.push(event.clone());
                }
            }
        }
    }

    Ok(candidates)
}

#[async_trait]
impl StorageAdapter for MemoryStorage {
    async fn open(&self, raw: &str) -> StorageResult<()> {
        let ns = namespace::sanitize(raw);
        let mut state = self.inner.state.lock().expect("Mutex poisoned");
        state.namespaces.entry(ns.clone()).or_default();
        state.current = Some(ns);
        Ok(())
    }

    async fn close(&self) -> StorageResult<()> {
        let mut state = self.inner.state.lock().expect("Mutex poisoned");
        state.current = None;
        drop(state);
        self.inner.notifier.close();
        Ok(())
    }

    async fn use_namespace(&self, raw: &str) -> StorageResult<()> {
        self.switch_namespace(raw)
    }

    fn namespace(&self) -> Option<String> {
        self.inner.state.lock().expect("Mutex poisoned").current.clone()
    }

    async fn ensure_schema(
        &self,
        repository: &str,
        _fields: &[String],
        id_field: &str,
    ) -> StorageResult<()> {
        let (_, _ns) = self.inner.with_current(|data| {
            if let Some(rows) = data.rows.get(repository) {
                for (id, row) in rows {
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
            }
            Ok(())
        })?;
        Ok(())
    }

    async fn insert(&self, repository: &str, row: Payload, id_field: &str) -> StorageResult<()> {
        let id = row
            .get(id_field)
            .and_then(Value::as_str)
            .map(str::to_owned)
            .context(SchemaMismatchSnafu {
                repository,
                reason: format!("inserted row is missing `{id_field}`"),
            })?;
        let (_, ns) = self.inner.with_current(|data| {
            data.rows.entry(repository.to_owned()).or_default().insert(id, row);
            Ok(())
        })?;
        self.inner.notifier.notify(&ns, repository);
        Ok(())
    }

    async fn update(&self, repository: &str, id: &str, row: Payload) -> StorageResult<()> {
        let (_, ns) = self.inner.with_current(|data| {
            let rows = data
                .rows
                .get_mut(repository)
                .context(UnknownRowSnafu { repository, id })?;
            if !rows.contains_key(id) {
                return UnknownRowSnafu { repository, id }.fail();
            }
            rows.insert(id.to_owned(), row);
            Ok(())
        })?;
        self.inner.notifier.notify(&ns, repository);
        Ok(())
    }

    async fn delete(&self, repository: &str, id: &str) -> StorageResult<()> {
        let (removed, ns) = self.inner.with_current(|data| {
            Ok(data
                .rows
                .get_mut(repository)
                .and_then(|rows| rows.remove(id))
                .is_some())
        })?;
        if removed {
            self.inner.notifier.notify(&ns, repository);
        }
        Ok(())
    }

    async fn get_by_id(&self, repository: &str, id: &str) -> StorageResult<Option<StateRow>> {
        let (row, _ns) = self.inner.with_current(|data| {
            Ok(data
                .rows
                .get(repository)
                .and_then(|rows| rows.get(id))
                .cloned())
        })?;
        row.map(|row| StateRow::from_row(repository, id, row)).transpose()
    }

    async fn contains(&self, repository: &str, id: &str) -> StorageResult<bool> {
        let (contained, _ns) = self.inner.with_current(|data| {
            Ok(data
                .rows
                .get(repository)
                .is_some_and(|rows| rows.contains_key(id)))
        })?;
        Ok(contained)
    }

    async fn get_all(&self, repository: &str) -> StorageResult<Vec<StateRow>> {
        let (rows, _ns) = self.inner.with_current(|data| {
            Ok(data
                .rows
                .get(repository)
                .map(|rows| {
                    rows.iter()
                        .map(|(id, row)| (id.clone(), row.clone()))
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default())
        })?;
        rows.into_iter()
            .map(|(id, row)| StateRow::from_row(repository, &id, row))
            .collect()
    }

    async fn delete_all(&self, repository: &str) -> StorageResult<()> {
        let (removed, ns) = self
            .inner
            .with_current(|data| Ok(data.rows.remove(repository).is_some()))?;
        if removed {
            self.inner.notifier.notify(&ns, repository);
        }
        Ok(())
    }

    async fn insert_event(&self, repository: &str, event: &Event) -> StorageResult<()> {
        let (_, ns) = self.inner.with_current(|data| {
            data.events
                .entry(repository.to_owned())
                .or_default()
                .insert(event.event_id, event.clone());
            Ok(())
        })?;
        self.inner.notifier.notify(&ns, repository);
        Ok(())
    }

    async fn update_event(
        &self,
        repository: &str,
        event_id: EventId,
        event: &Event,
    ) -> StorageResult<()> {
        let (_, ns) = self.inner.with_current(|data| {
            let events = data
                .events
                .get_mut(repository)
                .context(UnknownEventSnafu {
                    repository,
                    event_id,
                })?;
            if !events.contains_key(&event_id) {
                return UnknownEventSnafu {
                    repository,
                    event_id,
                }
                .fail();
            }
            events.insert(event_id, event.clone());
            Ok(())
        })?;
        self.inner.notifier.notify(&ns, repository);
        Ok(())
    }

    async fn get_event(
        &self,
        repository: &str,
        event_id: EventId,
    ) -> StorageResult<Option<Event>> {
        let (event, _ns) = self.inner.with_current(|data| {
            Ok(data
                .events
                .get(repository)
                .and_then(|events| events.get(&event_id))
                .cloned())
        })?;
        Ok(event)
    }

    async fn get_all_events(&self, repository: &str) -> StorageResult<Vec<Event>> {
        let (events, _ns) = self.inner.with_current(|data| {
            Ok(data
                .events
                .get(repository)
                .map(|events| events.values().cloned().collect::<Vec<_>>())
                .unwrap_or_default())
        })?;
        Ok(events)
    }

    async fn delete_event(&self, repository: &str, event_id: EventId) -> StorageResult<()> {
        let (removed, ns) = self.inner.with_current(|data| {
            Ok(data
                .events
                .get_mut(repository)
                .and_then(|events| events.remove(&event_id))
                .is_some())
        })?;
        if removed {
            self.inner.notifier.notify(&ns, repository);
        }
        Ok(())
    }

    async fn delete_all_events(&self, repository: &str) -> StorageResult<()> {
        let (removed, ns) = self
            .inner
            .with_current(|data| Ok(data.events.remove(repository).is_some()))?;
        if removed {
            self.inner.notifier.notify(&ns, repository);
        }
        Ok(())
    }

    async fn query(&self, query: &Query) -> StorageResult<Vec<Event>> {
        let ns = self.namespace().context(NamespaceClosedSnafu)?;
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
        let (repositories, ns) = self.inner.with_current(|data| {
            let repositories: Vec<String> = data
                .rows
                .keys()
                .chain(data.events.keys())
                .cloned()
                .collect();
            *data = NamespaceData::default();
            Ok(repositories)
        })?;
        for repository in repositories {
            self.inner.notifier.notify(&ns, &repository);
        }
        Ok(())
    }

    fn config_store(&self) -> Arc<dyn ConfigStore> {
        Arc::new(self.clone())
    }
}

#[async_trait]
impl ConfigStore for MemoryStorage {
    async fn set(&self, key: &str, value: ConfigValue) -> ConfigResult<()> {
        self.inner.with_current(|data| {
            data.config.insert(key.to_owned(), value.into_json());
            Ok(())
        })?;
        Ok(())
    }

    async fn get(&self, key: &str) -> ConfigResult<Option<ConfigValue>> {
        let (value, _ns) = self
            .inner
            .with_current(|data| Ok(data.config.get(key).cloned()))?;
        value.map(ConfigValue::try_from).transpose()
    }

    async fn contains(&self, key: &str) -> ConfigResult<bool> {
        let (contained, _ns) = self
            .inner
            .with_current(|data| Ok(data.config.contains_key(key)))?;
        Ok(contained)
    }

    async fn remove(&self, key: &str) -> ConfigResult<()> {
        self.inner.with_current(|data| {
            data.config.remove(key);
            Ok(())
        })?;
        Ok(())
    }

    async fn keys(&self) -> ConfigResult<Vec<String>> {
        let (keys, _ns) = self
            .inner
            .with_current(|data| Ok(data.config.keys().cloned().collect()))?;
        Ok(keys)
    }

    async fn clear(&self) -> ConfigResult<()> {
        self.inner.with_current(|data| {
            data.config.clear();
            Ok(())
        })?;
        Ok(())
    }

    async fn use_namespace(&self, namespace: &str) -> ConfigResult<()> {
        self.switch_namespace(namespace)?;
        Ok(())
    }
}

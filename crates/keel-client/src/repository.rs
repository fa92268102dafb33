//! Typed repositories over the event log and state table.
//!
//! A repository owns one kind of record. Every local write appends an event
//! to the log first (the log is the source of truth), then materializes the
//! state row, then supersedes any older pending event for the same record,
//! and only then hands the event to the push pipeline. Remote events enter
//! through [`RepositoryInner::merge_remote_event`], which is idempotent and
//! resolves overlapping updates through the injected conflict function.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use futures::StreamExt as _;
use futures::stream::BoxStream;
use keel_core::{Event, EventId, Payload, SyncOperation, SyncStatus};
use keel_storage::{FilterOp, Query, QueryStream, StateRow, StorageAdapter, StorageError};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use snafu::{Location, OptionExt as _, ResultExt as _, Snafu};
use tracing::{debug, info, warn};

use crate::{ClientHandle, LOG_TARGET};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum RepositoryError {
    #[snafu(display("Repository `{name}` is not initialized"))]
    NotInitialized { name: String },
    #[snafu(display("Items of `{name}` must serialize to JSON objects"))]
    ItemNotAnObject { name: String },
    #[snafu(display("Item in `{name}` is missing its id field `{id_field}`"))]
    MissingIdField { name: String, id_field: String },
    #[snafu(display("No event `{event_id}` in `{name}`"))]
    UnknownEvent { name: String, event_id: EventId },
    #[snafu(display("Conflict between local {local} and remote {remote} left unresolved"))]
    ConflictUnresolved {
        local: EventId,
        remote: EventId,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(transparent)]
    Storage { source: StorageError },
    #[snafu(display("Item (de)serialization failed"))]
    Serde { source: serde_json::Error },
}

pub type RepositoryResult<T> = std::result::Result<T, RepositoryError>;

/// Pure conflict policy: pick the winning event of an overlapping update.
/// Must not mutate its inputs; `None` means the conflict stays unresolved
/// and the merge fails.
pub type ConflictFn = Arc<dyn Fn(&Event, &Event) -> Option<Event> + Send + Sync>;

/// Last-write-wins by `sync_created_at`; the remote side wins exact ties.
pub fn last_write_wins(local: &Event, remote: &Event) -> Option<Event> {
    match local.sync_created_at.cmp(&remote.sync_created_at) {
        Ordering::Greater => Some(local.clone()),
        Ordering::Less | Ordering::Equal => Some(remote.clone()),
    }
}

/// Last-write-wins; exact timestamp ties go to the side with more populated
/// fields, and to the remote when that count ties too.
pub fn last_write_wins_prefer_filled(local: &Event, remote: &Event) -> Option<Event> {
    fn filled(event: &Event) -> usize {
        event
            .payload()
            .map(|p| p.values().filter(|v| !v.is_null()).count())
            .unwrap_or(0)
    }

    match local.sync_created_at.cmp(&remote.sync_created_at) {
        Ordering::Greater => Some(local.clone()),
        Ordering::Less => Some(remote.clone()),
        Ordering::Equal => {
            if filled(remote) < filled(local) {
                Some(local.clone())
            } else {
                Some(remote.clone())
            }
        }
    }
}

/// Declaration a repository is registered from.
pub struct RepositoryDef {
    pub name: String,
    pub id_field: String,
    pub fields: Vec<String>,
    pub conflict: ConflictFn,
}

impl RepositoryDef {
    pub fn new<I, S>(name: impl Into<String>, id_field: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            id_field: id_field.into(),
            fields: fields.into_iter().map(Into::into).collect(),
            conflict: Arc::new(last_write_wins),
        }
    }

    pub fn with_conflict(mut self, conflict: ConflictFn) -> Self {
        self.conflict = conflict;
        self
    }
}

/// New fields win; fields absent from the new payload survive from the old
/// one.
fn merge_new_field_wins(mut old: Payload, new: Payload) -> Payload {
    for (key, value) in new {
        old.insert(key, value);
    }
    old
}

pub(crate) struct RepositoryInner {
    name: String,
    id_field: String,
    fields: Vec<String>,
    conflict: ConflictFn,
    storage: Arc<dyn StorageAdapter>,
    client: ClientHandle,
    initialized: AtomicBool,
}

impl RepositoryInner {
    pub(crate) fn new(
        def: RepositoryDef,
        storage: Arc<dyn StorageAdapter>,
        client: ClientHandle,
    ) -> Self {
        Self {
            name: def.name,
            id_field: def.id_field,
            fields: def.fields,
            conflict: def.conflict,
            storage,
            client,
            initialized: AtomicBool::new(false),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn storage(&self) -> &Arc<dyn StorageAdapter> {
        &self.storage
    }

    pub(crate) async fn ensure_schema(&self) -> RepositoryResult<()> {
        self.storage
            .ensure_schema(&self.name, &self.fields, &self.id_field)
            .await?;
        self.initialized
            .store(true, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    /// Clear the in-process initialized flag; persisted data is untouched.
    pub(crate) fn reset(&self) {
        self.initialized
            .store(false, std::sync::atomic::Ordering::SeqCst);
    }

    fn ensure_initialized(&self) -> RepositoryResult<()> {
        if !self.initialized.load(std::sync::atomic::Ordering::SeqCst) {
            return NotInitializedSnafu { name: &self.name }.fail();
        }
        Ok(())
    }

    pub(crate) async fn upsert_value(
        &self,
        item: Value,
        need_sync: bool,
    ) -> RepositoryResult<Event> {
        self.ensure_initialized()?;
        let Value::Object(new_payload) = item else {
            return ItemNotAnObjectSnafu { name: &self.name }.fail();
        };
        let id = new_payload
            .get(&self.id_field)
            .and_then(Value::as_str)
            .map(str::to_owned)
            .context(MissingIdFieldSnafu {
                name: &self.name,
                id_field: &self.id_field,
            })?;

        let existing = self.storage.get_by_id(&self.name, &id).await?;
        let (operation, merged) = match &existing {
            None => (SyncOperation::Insert, new_payload),
            Some(row) => (
                SyncOperation::Update,
                merge_new_field_wins(row.payload.clone(), new_payload),
            ),
        };

        let status = if need_sync {
            SyncStatus::Pending
        } else {
            SyncStatus::Ok
        };
        let event = Event::state()
            .repository(self.name.as_str())
            .data_id(id.clone())
            .payload(merged.clone())
            .operation(operation)
            .status(status)
            .build();

        // Log first: the caller must not see success before the event is
        // durable.
        self.storage.insert_event(&self.name, &event).await?;
        let row = StateRow::new(id.clone(), merged, event.event_id).into_row();
        match existing {
            Some(_) => self.storage.update(&self.name, &id, row).await?,
            None => self.storage.insert(&self.name, row, &self.id_field).await?,
        }
        self.mark_older_pending_ok(&id, event.event_id).await?;

        debug!(
            target: LOG_TARGET,
            repository = %self.name,
            data_id = %id,
            event_id = %event.event_id,
            operation = ?operation,
            "Local write"
        );

        if need_sync {
            return Ok(self.push_event(event).await);
        }
        Ok(event)
    }

    pub(crate) async fn delete(&self, id: &str, need_sync: bool) -> RepositoryResult<Event> {
        self.ensure_initialized()?;
        let status = if need_sync {
            SyncStatus::Pending
        } else {
            SyncStatus::Ok
        };
        let event = Event::delete()
            .repository(self.name.as_str())
            .data_id(id)
            .status(status)
            .build();

        self.storage.insert_event(&self.name, &event).await?;
        self.storage.delete(&self.name, id).await?;
        self.mark_older_pending_ok(id, event.event_id).await?;

        debug!(
            target: LOG_TARGET,
            repository = %self.name,
            data_id = %id,
            event_id = %event.event_id,
            "Local delete"
        );

        if need_sync {
            return Ok(self.push_event(event).await);
        }
        Ok(event)
    }

    /// Hand a freshly logged event to the attached strategies, in
    /// registration order. The first `Ok` finalizes; `Pending` leaves the
    /// event queued; a push error marks it `Failed` and stops the pipeline.
    /// Never propagates errors out of the surrounding write.
    async fn push_event(&self, event: Event) -> Event {
        let Some(client) = self.client.upgrade() else {
            return event;
        };

        let mut current = event;
        for strategy in client.strategies_snapshot() {
            if !strategy.supports_event(&current) {
                continue;
            }
            match strategy.on_push_to_remote(&current).await {
                Ok(SyncStatus::Ok) => {
                    current = self.finalize_status(current, SyncStatus::Ok).await;
                    break;
                }
                Ok(SyncStatus::Pending) => {
                    // This strategy deferred; the event stays in its queue.
                }
                Ok(SyncStatus::Failed) => {
                    current = self.finalize_status(current, SyncStatus::Failed).await;
                    break;
                }
                Err(err) => {
                    warn!(
                        target: LOG_TARGET,
                        repository = %self.name,
                        strategy = strategy.name(),
                        event_id = %current.event_id,
                        err = %err,
                        "Push failed"
                    );
                    current = self.finalize_status(current, SyncStatus::Failed).await;
                    break;
                }
            }
        }
        current
    }

    /// Persist a status transition, keeping whatever `server_sequence` the
    /// strategy may already have recorded on the stored copy.
    async fn finalize_status(&self, event: Event, status: SyncStatus) -> Event {
        let stored = match self.storage.get_event(&self.name, event.event_id).await {
            Ok(stored) => stored.unwrap_or(event),
            Err(err) => {
                warn!(
                    target: LOG_TARGET,
                    repository = %self.name,
                    err = %err,
                    "Could not reload event for status transition"
                );
                event
            }
        };
        let updated = stored.with_sync_status(status);
        if let Err(err) = self
            .storage
            .update_event(&self.name, updated.event_id, &updated)
            .await
        {
            warn!(
                target: LOG_TARGET,
                repository = %self.name,
                event_id = %updated.event_id,
                err = %err,
                "Could not persist status transition"
            );
        }
        updated
    }

    /// Supersede: any still-pending event for `data_id` strictly older than
    /// `newer_than` is locally satisfied and will not be pushed.
    async fn mark_older_pending_ok(
        &self,
        data_id: &str,
        newer_than: EventId,
    ) -> RepositoryResult<usize> {
        let mut superseded = 0;
        for event in self.storage.get_all_events(&self.name).await? {
            if event.data_id == data_id
                && event.sync_status == SyncStatus::Pending
                && event.event_id < newer_than
            {
                let updated = event.with_sync_status(SyncStatus::Ok);
                self.storage
                    .update_event(&self.name, updated.event_id, &updated)
                    .await?;
                superseded += 1;
            }
        }
        if 0 < superseded {
            debug!(
                target: LOG_TARGET,
                repository = %self.name,
                data_id = %data_id,
                superseded,
                "Superseded pending events"
            );
        }
        Ok(superseded)
    }

    pub(crate) async fn get_pending_events(&self) -> RepositoryResult<Vec<Event>> {
        self.ensure_initialized()?;
        Ok(self
            .storage
            .get_all_events(&self.name)
            .await?
            .into_iter()
            .filter(|event| event.sync_status == SyncStatus::Pending)
            .collect())
    }

    /// Everything the remote has not acknowledged yet: Pending plus Failed,
    /// ascending. Strategies drain this on their cycles, so a failed push
    /// is retried rather than lost.
    pub(crate) async fn get_unsynced_events(&self) -> RepositoryResult<Vec<Event>> {
        self.ensure_initialized()?;
        Ok(self
            .storage
            .get_all_events(&self.name)
            .await?
            .into_iter()
            .filter(|event| {
                matches!(event.sync_status, SyncStatus::Pending | SyncStatus::Failed)
            })
            .collect())
    }

    async fn latest_event_for(&self, data_id: &str) -> RepositoryResult<Option<Event>> {
        Ok(self
            .storage
            .get_all_events(&self.name)
            .await?
            .into_iter()
            .filter(|event| event.data_id == data_id)
            .next_back())
    }

    /// Apply one remote-sourced event.
    ///
    /// Idempotent: a known `event_id` is a no-op and keeps its stored
    /// `server_sequence`. A losing remote event is still appended to the
    /// log (with `Ok`) so it is never pulled twice; in particular a State
    /// event that loses to a local Delete does not resurrect the row.
    pub(crate) async fn merge_remote_event(&self, remote: Event) -> RepositoryResult<()> {
        self.ensure_initialized()?;

        if self
            .storage
            .get_event(&self.name, remote.event_id)
            .await?
            .is_some()
        {
            debug!(
                target: LOG_TARGET,
                repository = %self.name,
                event_id = %remote.event_id,
                "Duplicate remote event ignored"
            );
            return Ok(());
        }

        let data_id = remote.data_id.clone();

        if remote.is_delete() {
            let stored = remote.with_sync_status(SyncStatus::Ok);
            self.storage.insert_event(&self.name, &stored).await?;
            self.storage.delete(&self.name, &data_id).await?;
            self.mark_older_pending_ok(&data_id, stored.event_id).await?;
            info!(
                target: LOG_TARGET,
                repository = %self.name,
                data_id = %data_id,
                event_id = %stored.event_id,
                "Remote delete merged"
            );
            return Ok(());
        }

        // The record's latest local event: through the live row, or the
        // newest log entry when the row was erased. Delete tombstones must
        // keep winning over older remote states.
        let local_row = self.storage.get_by_id(&self.name, &data_id).await?;
        let local_event = match &local_row {
            Some(row) => self.storage.get_event(&self.name, row.last_event_id).await?,
            None => self.latest_event_for(&data_id).await?,
        };

        let Some(local_event) = local_event else {
            let stored = remote.with_sync_status(SyncStatus::Ok);
            self.storage.insert_event(&self.name, &stored).await?;
            let payload = stored.payload().cloned().unwrap_or_default();
            let row = StateRow::new(data_id.clone(), payload, stored.event_id).into_row();
            self.storage.insert(&self.name, row, &self.id_field).await?;
            info!(
                target: LOG_TARGET,
                repository = %self.name,
                data_id = %data_id,
                event_id = %stored.event_id,
                "Remote event merged as new record"
            );
            return Ok(());
        };

        let winner = (self.conflict)(&local_event, &remote).context(ConflictUnresolvedSnafu {
            local: local_event.event_id,
            remote: remote.event_id,
        })?;

        // The remote event enters the log either way; that is what makes
        // re-delivery a no-op.
        let stored_remote = remote.clone().with_sync_status(SyncStatus::Ok);
        self.storage.insert_event(&self.name, &stored_remote).await?;

        if winner.event_id == local_event.event_id {
            // The winner's event reads Ok in the log no matter which side
            // it came from.
            let upgraded = local_event.clone().with_sync_status(SyncStatus::Ok);
            self.storage
                .update_event(&self.name, upgraded.event_id, &upgraded)
                .await?;
        } else {
            if winner.event_id != stored_remote.event_id
                && self
                    .storage
                    .get_event(&self.name, winner.event_id)
                    .await?
                    .is_none()
            {
                // A synthesized merge event also belongs in the log.
                let synthesized = winner.clone().with_sync_status(SyncStatus::Ok);
                self.storage.insert_event(&self.name, &synthesized).await?;
            }
            match winner.payload() {
                Some(payload) => {
                    let row =
                        StateRow::new(data_id.clone(), payload.clone(), winner.event_id).into_row();
                    match &local_row {
                        Some(_) => self.storage.update(&self.name, &data_id, row).await?,
                        None => self.storage.insert(&self.name, row, &self.id_field).await?,
                    }
                }
                None => self.storage.delete(&self.name, &data_id).await?,
            }
        }

        self.mark_older_pending_ok(&data_id, remote.event_id).await?;
        info!(
            target: LOG_TARGET,
            repository = %self.name,
            data_id = %data_id,
            remote = %remote.event_id,
            winner = %winner.event_id,
            "Remote event merged"
        );
        Ok(())
    }

    /// Push acknowledgement: Pending/Failed → Ok plus the one-time server
    /// sequence assignment.
    pub(crate) async fn mark_event_synced(
        &self,
        event_id: EventId,
        server_sequence: Option<i64>,
    ) -> RepositoryResult<Event> {
        let stored = self
            .storage
            .get_event(&self.name, event_id)
            .await?
            .context(UnknownEventSnafu {
                name: &self.name,
                event_id,
            })?;
        let mut updated = stored.with_sync_status(SyncStatus::Ok);
        if let Some(sequence) = server_sequence {
            updated = updated.with_server_sequence(sequence);
        }
        self.storage
            .update_event(&self.name, event_id, &updated)
            .await?;
        Ok(updated)
    }

    /// Bound log growth: drop events that are acknowledged remotely
    /// (`server_sequence` assigned), not referenced by any state row, and
    /// older than every still-pending event.
    pub(crate) async fn prune_synced_events(&self) -> RepositoryResult<usize> {
        self.ensure_initialized()?;
        let events = self.storage.get_all_events(&self.name).await?;
        let oldest_pending = events
            .iter()
            .find(|event| event.sync_status == SyncStatus::Pending)
            .map(|event| event.event_id);
        let referenced: HashSet<EventId> = self
            .storage
            .get_all(&self.name)
            .await?
            .into_iter()
            .map(|row| row.last_event_id)
            .collect();

        let mut pruned = 0;
        for event in events {
            if event.server_sequence.is_none() {
                continue;
            }
            if referenced.contains(&event.event_id) {
                continue;
            }
            if oldest_pending.is_some_and(|pending| pending <= event.event_id) {
                continue;
            }
            self.storage.delete_event(&self.name, event.event_id).await?;
            pruned += 1;
        }
        if 0 < pruned {
            info!(
                target: LOG_TARGET,
                repository = %self.name,
                pruned,
                "Pruned acknowledged events"
            );
        }
        Ok(pruned)
    }

    pub(crate) async fn get_row(&self, id: &str) -> RepositoryResult<Option<StateRow>> {
        self.ensure_initialized()?;
        Ok(self.storage.get_by_id(&self.name, id).await?)
    }

    pub(crate) async fn get_all_rows(&self) -> RepositoryResult<Vec<StateRow>> {
        self.ensure_initialized()?;
        Ok(self.storage.get_all(&self.name).await?)
    }

    pub(crate) async fn contains(&self, id: &str) -> RepositoryResult<bool> {
        self.ensure_initialized()?;
        Ok(self.storage.contains(&self.name, id).await?)
    }
}

/// Typed façade over a registered repository.
pub struct Repository<T> {
    inner: Arc<RepositoryInner>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Repository<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _marker: PhantomData,
        }
    }
}

fn decode_payload<T: DeserializeOwned>(payload: Payload) -> RepositoryResult<T> {
    serde_json::from_value(Value::Object(payload)).context(SerdeSnafu)
}

impl<T> Repository<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    pub(crate) fn from_inner(inner: Arc<RepositoryInner>) -> Self {
        Self {
            inner,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// Write an item locally; with `need_sync` the event is queued for the
    /// push pipeline. Existing records merge new-field-wins.
    pub async fn upsert(&self, item: &T, need_sync: bool) -> RepositoryResult<Event> {
        let value = serde_json::to_value(item).context(SerdeSnafu)?;
        self.inner.upsert_value(value, need_sync).await
    }

    /// Erase the record locally via a Delete event. Pending events for the
    /// same record are superseded.
    pub async fn delete(&self, id: &str, need_sync: bool) -> RepositoryResult<Event> {
        self.inner.delete(id, need_sync).await
    }

    pub async fn get(&self, id: &str) -> RepositoryResult<Option<T>> {
        self.inner
            .get_row(id)
            .await?
            .map(|row| decode_payload(row.payload))
            .transpose()
    }

    pub async fn get_all(&self) -> RepositoryResult<Vec<T>> {
        self.inner
            .get_all_rows()
            .await?
            .into_iter()
            .map(|row| decode_payload(row.payload))
            .collect()
    }

    pub async fn contains(&self, id: &str) -> RepositoryResult<bool> {
        self.inner.contains(id).await
    }

    /// Query builder over live records.
    pub fn query(&self) -> RepoQuery<T> {
        RepoQuery::new(self.inner.clone(), false)
    }

    /// Query builder that also surfaces erased records through their latest
    /// Delete events.
    pub fn query_with_deleted(&self) -> RepoQuery<T> {
        RepoQuery::new(self.inner.clone(), true)
    }

    pub async fn get_pending_events(&self) -> RepositoryResult<Vec<Event>> {
        self.inner.get_pending_events().await
    }

    pub async fn merge_remote_event(&self, event: Event) -> RepositoryResult<()> {
        self.inner.merge_remote_event(event).await
    }

    pub async fn mark_event_synced(
        &self,
        event_id: EventId,
        server_sequence: Option<i64>,
    ) -> RepositoryResult<Event> {
        self.inner.mark_event_synced(event_id, server_sequence).await
    }

    pub async fn prune_synced_events(&self) -> RepositoryResult<usize> {
        self.inner.prune_synced_events().await
    }

    pub fn reset(&self) {
        self.inner.reset();
    }
}

/// Typed query bound to a repository and its storage.
pub struct RepoQuery<T> {
    inner: Arc<RepositoryInner>,
    query: Query,
    _marker: PhantomData<fn() -> T>,
}

impl<T> RepoQuery<T>
where
    T: DeserializeOwned,
{
    fn new(inner: Arc<RepositoryInner>, include_deleted: bool) -> Self {
        let query = Query::new(inner.name()).with_deleted(include_deleted);
        Self {
            inner,
            query,
            _marker: PhantomData,
        }
    }

    pub fn where_field(
        mut self,
        field: impl Into<String>,
        op: FilterOp,
        value: impl Into<Value>,
    ) -> Self {
        self.query = self.query.where_field(field, op, value);
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, descending: bool) -> Self {
        self.query = self.query.order_by(field, descending);
        self
    }

    pub fn limit_to(mut self, limit: usize) -> Self {
        self.query = self.query.limit_to(limit);
        self
    }

    pub fn start_after(mut self, offset: usize) -> Self {
        self.query = self.query.start_after(offset);
        self
    }

    /// The matching events, deterministically ordered.
    pub async fn get_events(&self) -> RepositoryResult<Vec<Event>> {
        self.inner.ensure_initialized()?;
        Ok(self.inner.storage().query(&self.query).await?)
    }

    /// The matching records. Delete events (visible only with
    /// `query_with_deleted`) carry no payload and are skipped here.
    pub async fn get(&self) -> RepositoryResult<Vec<T>> {
        Ok(self
            .get_events()
            .await?
            .into_iter()
            .filter_map(|event| event.payload().cloned())
            .map(decode_payload)
            .collect::<RepositoryResult<Vec<_>>>()?)
    }

    /// Reactive snapshots of the matching events.
    pub fn watch_events(&self) -> QueryStream {
        self.inner.storage().watch_query(self.query.clone())
    }

    /// Reactive snapshots of the matching records.
    pub fn watch(&self) -> BoxStream<'static, Vec<T>>
    where
        T: Send + 'static,
    {
        self.inner
            .storage()
            .watch_query(self.query.clone())
            .map(|events| {
                events
                    .into_iter()
                    .filter_map(|event| event.payload().cloned())
                    .filter_map(|payload| decode_payload(payload).ok())
                    .collect()
            })
            .boxed()
    }
}

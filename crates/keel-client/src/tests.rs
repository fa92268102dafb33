use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt as _;
use keel_core::{ChangeBatch, Event, Payload, SyncOperation, SyncStatus, Timestamp};
use keel_storage::{ConfigStore as _, MemoryStorage, RedbStorage, StorageAdapter};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::time::timeout;

use crate::repository::{RepositoryDef, RepositoryError};
use crate::strategy::{
    PeriodicSync, PushAck, PushFailedSnafu, RemoteTransport, StrategyResult, SyncStrategy,
    cursor_key,
};
use crate::{Client, ClientError};

type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;
type TestResult<T = ()> = std::result::Result<T, BoxedError>;

const LONG_INTERVAL: Duration = Duration::from_secs(3600);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct Todo {
    id: String,
    title: String,
    #[serde(default)]
    done: bool,
}

impl Todo {
    fn new(id: &str, title: &str) -> Self {
        Self {
            id: id.to_owned(),
            title: title.to_owned(),
            done: false,
        }
    }
}

fn payload_of(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        _ => panic!("Test payloads are objects"),
    }
}

fn todos_def() -> RepositoryDef {
    RepositoryDef::new("todos", "id", ["id", "title", "done"])
}

/// A remote another device could also push to, with a toggleable link.
struct TestRemote {
    state: std::sync::Mutex<RemoteState>,
}

struct RemoteState {
    connected: bool,
    fail_pushes: bool,
    next_sequence: i64,
    store: BTreeMap<String, Vec<Value>>,
}

impl TestRemote {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: std::sync::Mutex::new(RemoteState {
                connected: true,
                fail_pushes: false,
                next_sequence: 0,
                store: BTreeMap::new(),
            }),
        })
    }

    fn set_connected(&self, connected: bool) {
        self.state.lock().expect("Mutex poisoned").connected = connected;
    }

    fn set_fail_pushes(&self, fail: bool) {
        self.state.lock().expect("Mutex poisoned").fail_pushes = fail;
    }

    /// Pretend another device pushed this event.
    fn seed_remote_event(&self, event: &Event) -> i64 {
        let mut state = self.state.lock().expect("Mutex poisoned");
        state.next_sequence += 1;
        let sequence = state.next_sequence;
        let stored = event
            .clone()
            .with_sync_status(SyncStatus::Ok)
            .with_server_sequence(sequence);
        state
            .store
            .entry(event.repository.clone())
            .or_default()
            .push(stored.to_wire());
        sequence
    }
}

#[async_trait]
impl RemoteTransport for TestRemote {
    async fn push_events(&self, repository: &str, events: &[Event]) -> StrategyResult<PushAck> {
        let mut state = self.state.lock().expect("Mutex poisoned");
        if !state.connected || state.fail_pushes {
            return PushFailedSnafu {
                message: "remote rejected the batch",
            }
            .fail();
        }
        let mut ack = PushAck::default();
        for event in events {
            state.next_sequence += 1;
            let stored = event
                .clone()
                .with_sync_status(SyncStatus::Ok)
                .with_server_sequence(state.next_sequence);
            state
                .store
                .entry(repository.to_owned())
                .or_default()
                .push(stored.to_wire());
            ack.sequences.insert(event.event_id, state.next_sequence);
        }
        Ok(ack)
    }

    async fn fetch_events(
        &self,
        repository: &str,
        after_sequence: Option<i64>,
    ) -> StrategyResult<Vec<Value>> {
        let state = self.state.lock().expect("Mutex poisoned");
        if !state.connected {
            return PushFailedSnafu {
                message: "remote unreachable",
            }
            .fail();
        }
        Ok(state
            .store
            .get(repository)
            .map(|events| {
                events
                    .iter()
                    .filter(|raw| {
                        let sequence = raw.get("server_sequence").and_then(Value::as_i64);
                        match (after_sequence, sequence) {
                            (Some(cursor), Some(sequence)) => cursor < sequence,
                            _ => true,
                        }
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn connected(&self) -> bool {
        self.state.lock().expect("Mutex poisoned").connected
    }
}

async fn memory_client() -> TestResult<(Arc<Client>, Arc<MemoryStorage>)> {
    let storage = Arc::new(MemoryStorage::new());
    let client = Client::builder()
        .storage(storage.clone())
        .repositories(vec![todos_def()])
        .namespace("alice")
        .build()?;
    client.initialize().await?;
    Ok((client, storage))
}

async fn synced_client(
    remote: Arc<TestRemote>,
) -> TestResult<(Arc<Client>, Arc<PeriodicSync>, Arc<MemoryStorage>)> {
    let storage = Arc::new(MemoryStorage::new());
    let strategy = Arc::new(PeriodicSync::new(remote, LONG_INTERVAL));
    let client = Client::builder()
        .storage(storage.clone())
        .repositories(vec![todos_def()])
        .strategies(vec![strategy.clone() as Arc<dyn SyncStrategy>])
        .namespace("alice")
        .build()?;
    client.initialize().await?;
    Ok((client, strategy, storage))
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn offline_write_then_sync() -> TestResult {
    let remote = TestRemote::new();
    remote.set_connected(false);
    let (client, strategy, _storage) = synced_client(remote.clone()).await?;
    let todos = client.repository::<Todo>("todos")?;

    let event = todos.upsert(&Todo::new("t1", "milk"), true).await?;
    assert_eq!(event.sync_status, SyncStatus::Pending);
    assert!(todos.contains("t1").await?);
    assert_eq!(client.get_all_pending_events("todos").await?.len(), 1);

    let ns = client.current_namespace().expect("Storage open");
    let key = cursor_key(&ns, "todos");
    assert_eq!(client.config().get(&key).await?, None);

    remote.set_connected(true);
    strategy.trigger_sync().await?;

    assert!(client.get_all_pending_events("todos").await?.is_empty());
    let events = todos.query().get_events().await?;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].sync_status, SyncStatus::Ok);
    assert_eq!(events[0].server_sequence, Some(1));
    assert_eq!(
        client.config().get(&key).await?.and_then(|v| v.as_int()),
        Some(1)
    );
    assert!(strategy.is_connected());
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn concurrent_edit_last_write_wins() -> TestResult {
    let (client, storage) = memory_client().await?;
    let todos = client.repository::<Todo>("todos")?;

    let local = todos.upsert(&Todo::new("t1", "local title"), true).await?;
    assert_eq!(local.sync_status, SyncStatus::Pending);

    // The same record edited afterwards on another device.
    let remote = Event::state()
        .repository("todos")
        .data_id("t1")
        .payload(payload_of(
            json!({"id": "t1", "title": "remote title", "done": true}),
        ))
        .operation(SyncOperation::Update)
        .build()
        .with_server_sequence(7);
    todos.merge_remote_event(remote.clone()).await?;

    let row = todos.get("t1").await?.expect("Row present");
    assert_eq!(row.title, "remote title");
    assert!(row.done);

    let log = storage.get_all_events("todos").await?;
    assert_eq!(log.len(), 2);
    let local_stored = log
        .iter()
        .find(|e| e.event_id == local.event_id)
        .expect("Local event kept");
    assert_eq!(local_stored.sync_status, SyncStatus::Ok);
    let remote_stored = log
        .iter()
        .find(|e| e.event_id == remote.event_id)
        .expect("Remote event logged");
    assert_eq!(remote_stored.sync_status, SyncStatus::Ok);
    assert_eq!(remote_stored.server_sequence, Some(7));
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn newer_local_edit_beats_older_remote() -> TestResult {
    let (client, storage) = memory_client().await?;
    let todos = client.repository::<Todo>("todos")?;

    // The remote edit happened first; the local write lands strictly later.
    let remote = Event::state()
        .repository("todos")
        .data_id("t1")
        .payload(payload_of(json!({"id": "t1", "title": "remote title"})))
        .build()
        .with_server_sequence(4);
    tokio::time::sleep(Duration::from_millis(5)).await;
    let local = todos.upsert(&Todo::new("t1", "local title"), true).await?;
    assert_eq!(local.sync_status, SyncStatus::Pending);

    todos.merge_remote_event(remote.clone()).await?;

    // The local side wins: state keeps the local payload, and the winning
    // event reads Ok in the log just like the logged remote loser.
    let row = todos.get("t1").await?.expect("Row present");
    assert_eq!(row.title, "local title");

    let log = storage.get_all_events("todos").await?;
    assert_eq!(log.len(), 2);
    let winner = log
        .iter()
        .find(|e| e.event_id == local.event_id)
        .expect("Winning event kept");
    assert_eq!(winner.sync_status, SyncStatus::Ok);
    let loser = log
        .iter()
        .find(|e| e.event_id == remote.event_id)
        .expect("Losing event logged");
    assert_eq!(loser.sync_status, SyncStatus::Ok);
    assert_eq!(loser.server_sequence, Some(4));
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn idempotent_double_merge() -> TestResult {
    let (client, storage) = memory_client().await?;
    let todos = client.repository::<Todo>("todos")?;

    let remote = Event::state()
        .repository("todos")
        .data_id("t1")
        .payload(payload_of(json!({"id": "t1", "title": "milk"})))
        .build()
        .with_server_sequence(3);

    todos.merge_remote_event(remote.clone()).await?;
    let state_after_first = storage.get_all("todos").await?;

    // Re-delivery must change nothing, including the stored sequence.
    let replay = {
        let mut replay = remote.clone();
        replay.server_sequence = Some(99);
        replay
    };
    todos.merge_remote_event(replay).await?;

    assert_eq!(storage.get_all("todos").await?, state_after_first);
    let log = storage.get_all_events("todos").await?;
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].server_sequence, Some(3));
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn namespace_swap_keeps_data_apart() -> TestResult {
    let (client, _storage) = memory_client().await?;
    let todos = client.repository::<Todo>("todos")?;

    for (id, title) in [("t1", "milk"), ("t2", "eggs"), ("t3", "bread")] {
        todos.upsert(&Todo::new(id, title), false).await?;
    }

    client.use_namespace("bob").await?;
    assert!(todos.get_all().await?.is_empty());
    todos.upsert(&Todo::new("b1", "beer"), false).await?;
    assert_eq!(todos.get_all().await?.len(), 1);

    client.use_namespace("alice").await?;
    let back = todos.get_all().await?;
    assert_eq!(back.len(), 3);
    assert_eq!(
        back.iter().find(|t| t.id == "t1").expect("Still there").title,
        "milk"
    );
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn delete_wins_over_late_remote_state() -> TestResult {
    let (client, storage) = memory_client().await?;
    let todos = client.repository::<Todo>("todos")?;

    todos.upsert(&Todo::new("t1", "milk"), false).await?;

    // Built before the delete, so its id (and timestamp) is older.
    let stale_remote = Event::state()
        .repository("todos")
        .data_id("t1")
        .payload(payload_of(json!({"id": "t1", "title": "stale edit"})))
        .operation(SyncOperation::Update)
        .build();

    // Land the delete in a strictly later millisecond.
    tokio::time::sleep(Duration::from_millis(5)).await;
    todos.delete("t1", true).await?;
    todos.merge_remote_event(stale_remote.clone()).await?;

    // The tombstone wins: the row stays gone, the stale event is logged Ok.
    assert!(!todos.contains("t1").await?);
    let stored = storage
        .get_event("todos", stale_remote.event_id)
        .await?
        .expect("Late event logged");
    assert_eq!(stored.sync_status, SyncStatus::Ok);

    // The erased record is still reachable through its tombstone.
    let tombstones = todos.query_with_deleted().get_events().await?;
    assert!(
        tombstones
            .iter()
            .any(|event| event.is_delete() && event.data_id == "t1")
    );
    Ok(())
}

#[test]
fn tie_break_prefers_the_filled_payload() {
    let local = Event::state()
        .repository("todos")
        .data_id("x")
        .payload(payload_of(json!({"id": "x", "title": null})))
        .build();
    let mut remote = Event::state()
        .repository("todos")
        .data_id("x")
        .payload(payload_of(json!({"id": "x", "title": "set"})))
        .build();
    remote.sync_created_at = local.sync_created_at;

    let winner =
        crate::last_write_wins_prefer_filled(&local, &remote).expect("Policy always resolves");
    assert_eq!(winner.event_id, remote.event_id);

    // Flip it: now the local side carries more data on the same instant.
    let fuller_local = Event::state()
        .repository("todos")
        .data_id("x")
        .payload(payload_of(json!({"id": "x", "title": "a", "done": true})))
        .build();
    let mut sparse_remote = Event::state()
        .repository("todos")
        .data_id("x")
        .payload(payload_of(json!({"id": "x"})))
        .build();
    sparse_remote.sync_created_at = fuller_local.sync_created_at;

    let winner = crate::last_write_wins_prefer_filled(&fuller_local, &sparse_remote)
        .expect("Policy always resolves");
    assert_eq!(winner.event_id, fuller_local.event_id);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn delete_then_upsert_resurrects() -> TestResult {
    let (client, _storage) = memory_client().await?;
    let todos = client.repository::<Todo>("todos")?;

    todos.upsert(&Todo::new("t1", "milk"), false).await?;
    todos.delete("t1", false).await?;
    assert!(!todos.contains("t1").await?);

    todos.upsert(&Todo::new("t1", "milk again"), false).await?;
    let row = todos.get("t1").await?.expect("Resurrected");
    assert_eq!(row.title, "milk again");
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn pending_supersession_keeps_one_event_queued() -> TestResult {
    let (client, storage) = memory_client().await?;
    let todos = client.repository::<Todo>("todos")?;

    let first = todos.upsert(&Todo::new("t1", "milk"), true).await?;
    let second = todos.upsert(&Todo::new("t1", "oat milk"), true).await?;

    let pending = todos.get_pending_events().await?;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].event_id, second.event_id);

    let log = storage.get_all_events("todos").await?;
    assert_eq!(log.len(), 2);
    let superseded = log
        .iter()
        .find(|e| e.event_id == first.event_id)
        .expect("Still logged");
    assert_eq!(superseded.sync_status, SyncStatus::Ok);
    assert_eq!(superseded.server_sequence, None);
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn restart_replays_to_identical_state() -> TestResult {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("keel.redb");

    {
        let storage = Arc::new(RedbStorage::new(&path));
        let client = Client::builder()
            .storage(storage)
            .repositories(vec![todos_def()])
            .namespace("alice")
            .build()?;
        client.initialize().await?;
        let todos = client.repository::<Todo>("todos")?;

        todos.upsert(&Todo::new("t1", "milk"), true).await?;
        todos.upsert(&Todo::new("t2", "eggs"), false).await?;
        todos
            .upsert(
                &Todo {
                    id: "t1".to_owned(),
                    title: "oat milk".to_owned(),
                    done: true,
                },
                true,
            )
            .await?;
        todos.delete("t2", true).await?;
        client.dispose().await?;
    }

    let storage = Arc::new(RedbStorage::new(&path));
    let client = Client::builder()
        .storage(storage.clone())
        .repositories(vec![todos_def()])
        .namespace("alice")
        .build()?;
    client.initialize().await?;
    let todos = client.repository::<Todo>("todos")?;

    // The state table must equal a replay of the surviving log.
    let mut replayed: BTreeMap<String, Payload> = BTreeMap::new();
    for event in storage.get_all_events("todos").await? {
        match event.payload() {
            Some(payload) => {
                replayed.insert(event.data_id.clone(), payload.clone());
            }
            None => {
                replayed.remove(&event.data_id);
            }
        }
    }
    let rows = storage.get_all("todos").await?;
    assert_eq!(rows.len(), replayed.len());
    for row in &rows {
        assert_eq!(Some(&row.payload), replayed.get(&row.id));
    }

    let t1 = todos.get("t1").await?.expect("Survived the restart");
    assert_eq!(t1.title, "oat milk");
    assert!(t1.done);
    assert_eq!(todos.get("t2").await?, None);

    // The unsynced write is still queued after the restart.
    assert!(!todos.get_pending_events().await?.is_empty());
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn cursor_advances_and_never_decreases() -> TestResult {
    let remote = TestRemote::new();
    let (client, strategy, _storage) = synced_client(remote.clone()).await?;
    let todos = client.repository::<Todo>("todos")?;

    for (id, title) in [("r1", "from device two"), ("r2", "also remote")] {
        let event = Event::state()
            .repository("todos")
            .data_id(id)
            .payload(payload_of(json!({"id": id, "title": title})))
            .build();
        remote.seed_remote_event(&event);
    }

    strategy.trigger_sync().await?;
    assert_eq!(todos.get_all().await?.len(), 2);

    let ns = client.current_namespace().expect("Storage open");
    let key = cursor_key(&ns, "todos");
    let cursor = client.config().get(&key).await?.and_then(|v| v.as_int());
    assert_eq!(cursor, Some(2));

    // Idle cycles leave the cursor untouched.
    strategy.trigger_sync().await?;
    strategy.trigger_sync().await?;
    assert_eq!(
        client.config().get(&key).await?.and_then(|v| v.as_int()),
        Some(2)
    );

    let event = Event::state()
        .repository("todos")
        .data_id("r3")
        .payload(payload_of(json!({"id": "r3", "title": "third"})))
        .build();
    remote.seed_remote_event(&event);
    strategy.trigger_sync().await?;
    assert_eq!(
        client.config().get(&key).await?.and_then(|v| v.as_int()),
        Some(3)
    );
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn registration_rules() -> TestResult {
    // Duplicate names fail at build time.
    let err = Client::builder()
        .storage(Arc::new(MemoryStorage::new()) as Arc<dyn StorageAdapter>)
        .repositories(vec![todos_def(), todos_def()])
        .build()
        .err()
        .expect("Duplicate must be rejected");
    assert!(matches!(err, ClientError::DuplicateRepository { .. }));

    // Late registration fails after initialize.
    let (client, _storage) = memory_client().await?;
    let late_repo = client.add_repository(RepositoryDef::new("notes", "id", ["id"]));
    assert!(matches!(late_repo, Err(ClientError::LateRegistration)));
    let strategy = Arc::new(PeriodicSync::new(TestRemote::new(), LONG_INTERVAL));
    let late_strategy = client.add_strategy(strategy);
    assert!(matches!(late_strategy, Err(ClientError::LateRegistration)));

    // Unknown repositories are rejected.
    let unknown = client.repository::<Todo>("nope");
    assert!(matches!(unknown, Err(ClientError::UnknownRepository { .. })));

    // Initialization is idempotent.
    client.initialize().await?;
    client.await_initialization().await;
    assert!(client.is_initialized());

    // Before initialize, operations fail typed.
    let cold = Client::builder()
        .storage(Arc::new(MemoryStorage::new()) as Arc<dyn StorageAdapter>)
        .repositories(vec![todos_def()])
        .build()?;
    let todos = cold.repository::<Todo>("todos")?;
    let err = todos.upsert(&Todo::new("t1", "milk"), false).await;
    assert!(matches!(err, Err(RepositoryError::NotInitialized { .. })));
    let err = cold.use_namespace("bob").await;
    assert!(matches!(err, Err(ClientError::NotInitialized)));
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn connection_signal_follows_the_transport() -> TestResult {
    let remote = TestRemote::new();
    let (client, strategy, _storage) = synced_client(remote.clone()).await?;
    let mut changes = client.connection_changes();

    strategy.trigger_sync().await?;
    timeout(Duration::from_secs(5), async {
        while let Some(connected) = changes.next().await {
            if connected {
                break;
            }
        }
    })
    .await?;
    assert!(client.latest_connection_state());

    remote.set_connected(false);
    strategy.trigger_sync().await?;
    timeout(Duration::from_secs(5), async {
        while let Some(connected) = changes.next().await {
            if !connected {
                break;
            }
        }
    })
    .await?;
    assert!(!client.latest_connection_state());
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn failed_push_is_marked_and_retried() -> TestResult {
    let remote = TestRemote::new();
    remote.set_fail_pushes(true);
    let (client, strategy, storage) = synced_client(remote.clone()).await?;
    let todos = client.repository::<Todo>("todos")?;

    let event = todos.upsert(&Todo::new("t1", "milk"), true).await?;
    assert_eq!(event.sync_status, SyncStatus::Failed);
    let stored = storage
        .get_event("todos", event.event_id)
        .await?
        .expect("Logged");
    assert_eq!(stored.sync_status, SyncStatus::Failed);

    // The next successful cycle drains it; nothing was lost.
    remote.set_fail_pushes(false);
    strategy.trigger_sync().await?;
    let stored = storage
        .get_event("todos", event.event_id)
        .await?
        .expect("Logged");
    assert_eq!(stored.sync_status, SyncStatus::Ok);
    assert!(stored.server_sequence.is_some());
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn pull_rejects_malformed_payloads_and_unknown_repositories() -> TestResult {
    let (client, storage) = memory_client().await?;

    let err = client.pull_changes("todos", &[json!({"bogus": true})]).await;
    assert!(matches!(err, Err(ClientError::Format { .. })));
    // Nothing was half-applied.
    assert!(storage.get_all_events("todos").await?.is_empty());

    let err = client.pull_changes("nope", &[]).await;
    assert!(matches!(err, Err(ClientError::UnknownRepository { .. })));
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn apply_batch_routes_per_repository() -> TestResult {
    let (client, _storage) = memory_client().await?;
    let todos = client.repository::<Todo>("todos")?;

    let remote = Event::state()
        .repository("todos")
        .data_id("t1")
        .payload(payload_of(json!({"id": "t1", "title": "batched"})))
        .build();
    let mut batch = ChangeBatch::new(Timestamp::now());
    batch.push(&remote);

    let merged = client.apply_batch(&batch).await?;
    assert_eq!(merged.len(), 1);
    assert_eq!(todos.get("t1").await?.expect("Merged").title, "batched");

    let stranger = Event::delete().repository("strangers").data_id("s1").build();
    let mut bad = ChangeBatch::new(Timestamp::now());
    bad.push(&stranger);
    let err = client.apply_batch(&bad).await;
    assert!(matches!(err, Err(ClientError::UnknownRepository { .. })));
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn clear_all_data_resets_and_stays_usable() -> TestResult {
    let (client, storage) = memory_client().await?;
    let todos = client.repository::<Todo>("todos")?;

    todos.upsert(&Todo::new("t1", "milk"), true).await?;
    todos.upsert(&Todo::new("t2", "eggs"), false).await?;
    client
        .config()
        .set("session", keel_storage::ConfigValue::from("abc"))
        .await?;

    client.clear_all_data().await?;
    assert!(todos.get_all().await?.is_empty());
    assert!(storage.get_all_events("todos").await?.is_empty());
    assert!(client.config().keys().await?.is_empty());

    // Schemas were re-declared; the repositories keep working.
    todos.upsert(&Todo::new("t3", "bread"), false).await?;
    assert_eq!(todos.get_all().await?.len(), 1);
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn typed_watch_emits_snapshots() -> TestResult {
    let (client, _storage) = memory_client().await?;
    let todos = client.repository::<Todo>("todos")?;

    todos.upsert(&Todo::new("t1", "milk"), false).await?;
    let mut stream = todos.query().order_by("title", false).watch();

    let initial = stream.next().await.expect("Initial snapshot");
    assert_eq!(initial, vec![todos.get("t1").await?.expect("Row")]);

    todos.upsert(&Todo::new("t2", "eggs"), false).await?;
    let updated = timeout(Duration::from_secs(5), async {
        loop {
            let snapshot = stream.next().await.expect("Stream alive");
            if snapshot.len() == 2 {
                return snapshot;
            }
        }
    })
    .await?;
    assert_eq!(updated[0].title, "eggs");
    assert_eq!(updated[1].title, "milk");
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn prune_drops_acknowledged_history_only() -> TestResult {
    let remote = TestRemote::new();
    let (client, _strategy, storage) = synced_client(remote).await?;
    let todos = client.repository::<Todo>("todos")?;

    // Both versions push immediately (the transport is connected).
    let v1 = todos.upsert(&Todo::new("t1", "milk"), true).await?;
    let v2 = todos.upsert(&Todo::new("t1", "oat milk"), true).await?;
    assert_eq!(v2.sync_status, SyncStatus::Ok);

    let pruned = todos.prune_synced_events().await?;
    assert_eq!(pruned, 1);
    assert_eq!(storage.get_event("todos", v1.event_id).await?, None);
    // The row's own event is never pruned.
    assert!(storage.get_event("todos", v2.event_id).await?.is_some());

    assert_eq!(todos.prune_synced_events().await?, 0);
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn conflict_function_decides_and_may_refuse() -> TestResult {
    // A policy that always keeps the local side.
    let storage = Arc::new(MemoryStorage::new());
    let def = RepositoryDef::new("todos", "id", ["id", "title", "done"])
        .with_conflict(Arc::new(|local: &Event, _remote: &Event| Some(local.clone())));
    let client = Client::builder()
        .storage(storage.clone())
        .repositories(vec![def])
        .namespace("alice")
        .build()?;
    client.initialize().await?;
    let todos = client.repository::<Todo>("todos")?;

    todos.upsert(&Todo::new("t1", "local"), false).await?;
    let remote = Event::state()
        .repository("todos")
        .data_id("t1")
        .payload(payload_of(json!({"id": "t1", "title": "remote"})))
        .operation(SyncOperation::Update)
        .build();
    todos.merge_remote_event(remote.clone()).await?;

    // Local payload kept; remote event still logged for idempotency.
    assert_eq!(todos.get("t1").await?.expect("Row").title, "local");
    assert!(storage.get_event("todos", remote.event_id).await?.is_some());

    // A policy that refuses surfaces ConflictUnresolved.
    let refusing = RepositoryDef::new("notes", "id", ["id"])
        .with_conflict(Arc::new(|_: &Event, _: &Event| None));
    let client = Client::builder()
        .storage(Arc::new(MemoryStorage::new()) as Arc<dyn StorageAdapter>)
        .repositories(vec![refusing])
        .namespace("alice")
        .build()?;
    client.initialize().await?;
    let notes = client.repository::<Todo>("notes")?;
    notes.upsert(&Todo::new("n1", "mine"), false).await?;
    let remote = Event::state()
        .repository("notes")
        .data_id("n1")
        .payload(payload_of(json!({"id": "n1", "title": "theirs"})))
        .operation(SyncOperation::Update)
        .build();
    let err = notes.merge_remote_event(remote).await;
    assert!(matches!(
        err,
        Err(RepositoryError::ConflictUnresolved { .. })
    ));
    Ok(())
}

use serde_json::{Value, json};

use crate::{ChangeBatch, Event, FormatError, SyncOperation, SyncStatus, Timestamp};

fn payload_of(value: Value) -> crate::Payload {
    match value {
        Value::Object(map) => map,
        _ => panic!("Test payloads are objects"),
    }
}

#[test]
fn state_wire_round_trip() {
    let event = Event::state()
        .repository("todos")
        .data_id("t1")
        .payload(payload_of(json!({"id": "t1", "title": "milk", "done": false})))
        .operation(SyncOperation::Update)
        .status(SyncStatus::Pending)
        .build();

    let wire = event.to_wire();
    let obj = wire.as_object().expect("Wire events are objects");
    assert_eq!(obj["event_id"], json!(event.event_id.to_string()));
    assert_eq!(obj["data_id"], json!("t1"));
    assert_eq!(obj["sync_status"], json!(1));
    assert_eq!(obj["sync_operation"], json!(1));
    assert_eq!(obj["title"], json!("milk"));
    assert!(!obj.contains_key("server_sequence"));

    let parsed = Event::from_wire("todos", &wire).expect("Round-trips");
    assert_eq!(parsed, event);
}

#[test]
fn delete_wire_round_trip() {
    let event = Event::delete()
        .repository("todos")
        .data_id("t1")
        .build()
        .with_server_sequence(42);

    let wire = event.to_wire();
    let obj = wire.as_object().expect("Wire events are objects");
    assert_eq!(obj["sync_operation"], json!(2));
    assert_eq!(obj["server_sequence"], json!(42));

    let parsed = Event::from_wire("todos", &wire).expect("Round-trips");
    assert_eq!(parsed, event);
    assert!(parsed.is_delete());
    assert_eq!(parsed.payload(), None);
}

#[test]
fn created_at_is_normalized_to_the_id() {
    let event = Event::state()
        .repository("todos")
        .data_id("t1")
        .payload(payload_of(json!({"id": "t1"})))
        .build();
    assert_eq!(event.sync_created_at, event.event_id.timestamp());
}

#[test]
fn reserved_keys_win_over_payload_fields() {
    let event = Event::state()
        .repository("todos")
        .data_id("t1")
        .payload(payload_of(json!({"id": "t1", "sync_status": "bogus"})))
        .status(SyncStatus::Pending)
        .build();

    let wire = event.to_wire();
    assert_eq!(wire.as_object().expect("Object")["sync_status"], json!(1));
}

#[test]
fn server_sequence_is_assigned_once() {
    let event = Event::delete().repository("todos").data_id("t1").build();
    let event = event.with_server_sequence(7).with_server_sequence(9);
    assert_eq!(event.server_sequence, Some(7));
}

#[test]
fn malformed_wire_events_are_rejected() {
    let id = crate::EventId::generate().to_string();

    assert!(matches!(
        Event::from_wire("todos", &json!("nope")),
        Err(FormatError::NotAnObject)
    ));

    let missing_id = json!({
        "data_id": "t1",
        "sync_status": 0,
        "sync_operation": 0,
        "sync_created_at": "2025-01-01T00:00:00Z",
    });
    assert!(matches!(
        Event::from_wire("todos", &missing_id),
        Err(FormatError::MissingField { field: "event_id" })
    ));

    let unknown_status = json!({
        "event_id": id,
        "data_id": "t1",
        "sync_status": 9,
        "sync_operation": 0,
        "sync_created_at": "2025-01-01T00:00:00Z",
    });
    assert!(matches!(
        Event::from_wire("todos", &unknown_status),
        Err(FormatError::UnknownSyncStatus { code: 9 })
    ));

    let bad_timestamp = json!({
        "event_id": id,
        "data_id": "t1",
        "sync_status": 0,
        "sync_operation": 0,
        "sync_created_at": "yesterday",
    });
    assert!(matches!(
        Event::from_wire("todos", &bad_timestamp),
        Err(FormatError::BadTimestamp { .. })
    ));
}

#[test]
fn batch_round_trip() {
    let a = Event::state()
        .repository("todos")
        .data_id("t1")
        .payload(payload_of(json!({"id": "t1", "title": "milk"})))
        .build();
    let b = Event::delete().repository("notes").data_id("n1").build();

    let mut batch = ChangeBatch::new(Timestamp::now());
    assert!(batch.is_empty());
    batch.push(&a);
    batch.push(&b);
    assert!(!batch.is_empty());

    let serialized = serde_json::to_value(&batch).expect("Serializes");
    let batch: ChangeBatch = serde_json::from_value(serialized).expect("Deserializes");

    let decoded = batch.decode().expect("Well-formed batch");
    assert_eq!(decoded["todos"], vec![a]);
    assert_eq!(decoded["notes"], vec![b]);
}

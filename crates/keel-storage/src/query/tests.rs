use keel_core::{Event, Payload, SyncStatus};
use serde_json::{Value, json};

use super::{FilterOp, Query};

fn payload_of(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        _ => panic!("Test payloads are objects"),
    }
}

fn state_event(data_id: &str, payload: Value) -> Event {
    Event::state()
        .repository("scores")
        .data_id(data_id)
        .payload(payload_of(payload))
        .build()
}

fn delete_event(data_id: &str) -> Event {
    Event::delete().repository("scores").data_id(data_id).build()
}

fn score_rows() -> Vec<Event> {
    vec![
        state_event("a", json!({"id": "a", "score": 1})),
        state_event("b", json!({"id": "b", "score": 3})),
        state_event("c", json!({"id": "c", "score": 2})),
    ]
}

fn ids(events: &[Event]) -> Vec<&str> {
    events.iter().map(|e| e.data_id.as_str()).collect()
}

#[test]
fn filter_sort_offset_limit() {
    // Matches sorted ascending are [c(2), b(3)]; skipping one leaves the
    // third-lowest score overall.
    let query = Query::new("scores")
        .where_field("score", FilterOp::Gte, 2)
        .order_by("score", false)
        .limit_to(1)
        .start_after(1);

    let result = query.apply(score_rows());
    assert_eq!(ids(&result), vec!["b"]);
}

#[test]
fn identical_runs_return_identical_sequences() {
    let query = Query::new("scores")
        .where_field("score", FilterOp::Gte, 1)
        .order_by("score", true);

    let first = query.apply(score_rows());
    let second = query.apply(score_rows());
    assert_eq!(first, second);
    assert_eq!(ids(&first), vec!["b", "c", "a"]);
}

#[test]
fn empty_where_in_matches_nothing() {
    let query = Query::new("scores").where_field("id", FilterOp::In, json!([]));
    assert!(query.apply(score_rows()).is_empty());
}

#[test]
fn where_in_matches_listed_values() {
    let query = Query::new("scores").where_field("id", FilterOp::In, json!(["a", "c"]));
    assert_eq!(ids(&query.apply(score_rows())), vec!["a", "c"]);
}

#[test]
fn limit_boundaries() {
    let all = Query::new("scores").limit_to(10).apply(score_rows());
    assert_eq!(all.len(), 3);

    let none = Query::new("scores").limit_to(0).apply(score_rows());
    assert!(none.is_empty());
}

#[test]
fn numeric_widening_in_equality() {
    let query = Query::new("scores").where_field("score", FilterOp::Eq, 2.0);
    assert_eq!(ids(&query.apply(score_rows())), vec!["c"]);
}

#[test]
fn is_null_and_its_negation() {
    let rows = vec![
        state_event("x", json!({"id": "x", "note": null})),
        state_event("y", json!({"id": "y", "note": "set"})),
        state_event("z", json!({"id": "z"})),
    ];

    let nulls = Query::new("scores").where_field("note", FilterOp::IsNull, Value::Null);
    assert_eq!(ids(&nulls.apply(rows.clone())), vec!["x", "z"]);

    let set = Query::new("scores").where_field("note", FilterOp::IsNull, false);
    assert_eq!(ids(&set.apply(rows)), vec!["y"]);
}

#[test]
fn ties_break_by_event_id_ascending() {
    // Same score everywhere: output order must be creation order.
    let rows = vec![
        state_event("n1", json!({"id": "n1", "score": 5})),
        state_event("n2", json!({"id": "n2", "score": 5})),
        state_event("n3", json!({"id": "n3", "score": 5})),
    ];
    let query = Query::new("scores").order_by("score", false);
    assert_eq!(ids(&query.apply(rows)), vec!["n1", "n2", "n3"]);
}

#[test]
fn missing_sort_fields_sort_first() {
    let rows = vec![
        state_event("with", json!({"id": "with", "rank": 2})),
        state_event("without", json!({"id": "without"})),
    ];
    let query = Query::new("scores").order_by("rank", false);
    assert_eq!(ids(&query.apply(rows)), vec!["without", "with"]);
}

#[test]
fn delete_events_fail_value_filters_but_satisfy_is_null() {
    let rows = vec![
        state_event("live", json!({"id": "live", "score": 9})),
        delete_event("gone"),
    ];

    let by_score = Query::new("scores").where_field("score", FilterOp::Gte, 1);
    assert_eq!(ids(&by_score.apply(rows.clone())), vec!["live"]);

    let by_null = Query::new("scores").where_field("score", FilterOp::IsNull, Value::Null);
    assert_eq!(ids(&by_null.apply(rows)), vec!["gone"]);
}

#[test]
fn status_is_irrelevant_to_matching() {
    let pending = Event::state()
        .repository("scores")
        .data_id("p")
        .payload(payload_of(json!({"id": "p", "score": 4})))
        .status(SyncStatus::Pending)
        .build();
    let query = Query::new("scores").where_field("score", FilterOp::Eq, 4);
    assert_eq!(query.apply(vec![pending.clone()]), vec![pending]);
}

//! Flat-map wire format exchanged with strategies and persisted at the
//! storage boundary.
//!
//! A State event serializes to its record fields plus the reserved metadata
//! keys below (reserved keys win on collision); a Delete event carries the
//! metadata keys only. The batch shape is
//! `{timestamp: ISO-8601, changes: {repository: [event…]}}`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use snafu::{OptionExt as _, ResultExt as _, Snafu};

use super::{Event, EventBody, SyncOperation, SyncStatus};
use crate::{EventId, Timestamp, TimestampParseError};

pub const KEY_EVENT_ID: &str = "event_id";
pub const KEY_DATA_ID: &str = "data_id";
pub const KEY_SYNC_STATUS: &str = "sync_status";
pub const KEY_SYNC_OPERATION: &str = "sync_operation";
pub const KEY_SYNC_CREATED_AT: &str = "sync_created_at";
pub const KEY_SERVER_SEQUENCE: &str = "server_sequence";

#[derive(Debug, Snafu)]
pub enum FormatError {
    #[snafu(display("Wire event is not a JSON object"))]
    NotAnObject,
    #[snafu(display("Wire event is missing `{field}`"))]
    MissingField { field: &'static str },
    #[snafu(display("Wire event has a malformed `{field}`"))]
    MalformedField { field: &'static str },
    #[snafu(display("Unknown sync status code {code}"))]
    UnknownSyncStatus { code: i64 },
    #[snafu(display("Unknown sync operation code {code}"))]
    UnknownSyncOperation { code: i64 },
    #[snafu(display("Unparsable `sync_created_at`"))]
    BadTimestamp { source: TimestampParseError },
}

impl SyncStatus {
    pub fn code(self) -> i64 {
        match self {
            SyncStatus::Ok => 0,
            SyncStatus::Pending => 1,
            SyncStatus::Failed => 2,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(SyncStatus::Ok),
            1 => Some(SyncStatus::Pending),
            2 => Some(SyncStatus::Failed),
            _ => None,
        }
    }
}

impl SyncOperation {
    pub fn code(self) -> i64 {
        match self {
            SyncOperation::Insert => 0,
            SyncOperation::Update => 1,
            SyncOperation::Delete => 2,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(SyncOperation::Insert),
            1 => Some(SyncOperation::Update),
            2 => Some(SyncOperation::Delete),
            _ => None,
        }
    }
}

impl Event {
    pub fn to_wire(&self) -> Value {
        let mut map = match &self.body {
            EventBody::State { payload } => payload.clone(),
            EventBody::Delete => Map::new(),
        };
        map.insert(
            KEY_EVENT_ID.to_owned(),
            Value::String(self.event_id.to_string()),
        );
        map.insert(KEY_DATA_ID.to_owned(), Value::String(self.data_id.clone()));
        map.insert(
            KEY_SYNC_STATUS.to_owned(),
            Value::from(self.sync_status.code()),
        );
        map.insert(
            KEY_SYNC_OPERATION.to_owned(),
            Value::from(self.sync_operation.code()),
        );
        map.insert(
            KEY_SYNC_CREATED_AT.to_owned(),
            Value::String(self.sync_created_at.to_rfc3339()),
        );
        if let Some(sequence) = self.server_sequence {
            map.insert(KEY_SERVER_SEQUENCE.to_owned(), Value::from(sequence));
        }
        Value::Object(map)
    }

    pub fn from_wire(repository: &str, value: &Value) -> Result<Event, FormatError> {
        let obj = value.as_object().context(NotAnObjectSnafu)?;
        let mut payload = obj.clone();

        let event_id_raw = take_string(&mut payload, KEY_EVENT_ID)?;
        let event_id = event_id_raw
            .parse::<EventId>()
            .ok()
            .context(MalformedFieldSnafu {
                field: KEY_EVENT_ID,
            })?;
        let data_id = take_string(&mut payload, KEY_DATA_ID)?;

        let status_code = take_i64(&mut payload, KEY_SYNC_STATUS)?;
        let sync_status = SyncStatus::from_code(status_code).context(UnknownSyncStatusSnafu {
            code: status_code,
        })?;

        let op_code = take_i64(&mut payload, KEY_SYNC_OPERATION)?;
        let sync_operation =
            SyncOperation::from_code(op_code).context(UnknownSyncOperationSnafu { code: op_code })?;

        let created_raw = take_string(&mut payload, KEY_SYNC_CREATED_AT)?;
        let sync_created_at = Timestamp::from_rfc3339(&created_raw).context(BadTimestampSnafu)?;

        let server_sequence = match payload.remove(KEY_SERVER_SEQUENCE) {
            None | Some(Value::Null) => None,
            Some(value) => Some(value.as_i64().context(MalformedFieldSnafu {
                field: KEY_SERVER_SEQUENCE,
            })?),
        };

        let body = match sync_operation {
            SyncOperation::Delete => EventBody::Delete,
            SyncOperation::Insert | SyncOperation::Update => EventBody::State { payload },
        };

        Ok(Event {
            event_id,
            data_id,
            repository: repository.to_owned(),
            sync_status,
            sync_operation,
            sync_created_at,
            server_sequence,
            body,
        })
    }
}

fn take_string(map: &mut Map<String, Value>, field: &'static str) -> Result<String, FormatError> {
    let value = map.remove(field).context(MissingFieldSnafu { field })?;
    match value {
        Value::String(s) => Ok(s),
        _ => MalformedFieldSnafu { field }.fail(),
    }
}

fn take_i64(map: &mut Map<String, Value>, field: &'static str) -> Result<i64, FormatError> {
    let value = map.remove(field).context(MissingFieldSnafu { field })?;
    value.as_i64().context(MalformedFieldSnafu { field })
}

/// One pull/push payload: wire events grouped per repository.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChangeBatch {
    pub timestamp: Timestamp,
    pub changes: BTreeMap<String, Vec<Value>>,
}

impl ChangeBatch {
    pub fn new(timestamp: Timestamp) -> Self {
        Self {
            timestamp,
            changes: BTreeMap::new(),
        }
    }

    pub fn push(&mut self, event: &Event) {
        self.changes
            .entry(event.repository.clone())
            .or_default()
            .push(event.to_wire());
    }

    pub fn is_empty(&self) -> bool {
        self.changes.values().all(Vec::is_empty)
    }

    /// Decode every contained event, keyed by repository.
    pub fn decode(&self) -> Result<BTreeMap<String, Vec<Event>>, FormatError> {
        let mut out = BTreeMap::new();
        for (repository, events) in &self.changes {
            let decoded = events
                .iter()
                .map(|raw| Event::from_wire(repository, raw))
                .collect::<Result<Vec<_>, _>>()?;
            out.insert(repository.clone(), decoded);
        }
        Ok(out)
    }
}

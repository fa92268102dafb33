//! Change events and their wire representation.

use serde_json::{Map, Value};

use crate::{EventId, Timestamp};

mod wire;

#[cfg(test)]
mod tests;

pub use self::wire::{
    ChangeBatch, FormatError, KEY_DATA_ID, KEY_EVENT_ID, KEY_SERVER_SEQUENCE, KEY_SYNC_CREATED_AT,
    KEY_SYNC_OPERATION, KEY_SYNC_STATUS,
};

/// JSON object carried by State events.
pub type Payload = Map<String, Value>;

/// Remote acknowledgement state of an event.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum SyncStatus {
    /// Locally satisfied: acknowledged remotely, superseded by a newer local
    /// write, or never meant to sync.
    Ok,
    /// Waiting to be pushed.
    Pending,
    /// The last push attempt failed; strategies retry it on their next cycle.
    Failed,
}

/// The operation a change event performs on its record.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum SyncOperation {
    Insert,
    Update,
    Delete,
}

/// Event body: the record payload for state changes, nothing for deletions.
#[derive(Clone, Debug, PartialEq)]
pub enum EventBody {
    State { payload: Payload },
    Delete,
}

/// An immutable record of one change, carrying its sync metadata.
///
/// `sync_created_at` is normalized to the instant embedded in `event_id`,
/// so id order and creation order always agree. The only mutations events
/// ever see are `sync_status` transitions and a one-time `server_sequence`
/// assignment; both go through [`Event::with_sync_status`] and
/// [`Event::with_server_sequence`] on a copy that replaces the stored one.
#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    pub event_id: EventId,
    pub data_id: String,
    pub repository: String,
    pub sync_status: SyncStatus,
    pub sync_operation: SyncOperation,
    pub sync_created_at: Timestamp,
    pub server_sequence: Option<i64>,
    pub body: EventBody,
}

#[bon::bon]
impl Event {
    /// Build a State event with a freshly generated id.
    #[builder(finish_fn(name = "build"))]
    pub fn state(
        #[builder(into)] repository: String,
        #[builder(into)] data_id: String,
        payload: Payload,
        #[builder(default = SyncOperation::Insert)] operation: SyncOperation,
        #[builder(default = SyncStatus::Ok)] status: SyncStatus,
    ) -> Event {
        debug_assert!(
            operation != SyncOperation::Delete,
            "State events carry Insert or Update"
        );
        let event_id = EventId::generate();
        Event {
            event_id,
            data_id,
            repository,
            sync_status: status,
            sync_operation: operation,
            sync_created_at: event_id.timestamp(),
            server_sequence: None,
            body: EventBody::State { payload },
        }
    }

    /// Build a Delete event with a freshly generated id.
    #[builder(finish_fn(name = "build"))]
    pub fn delete(
        #[builder(into)] repository: String,
        #[builder(into)] data_id: String,
        #[builder(default = SyncStatus::Ok)] status: SyncStatus,
    ) -> Event {
        let event_id = EventId::generate();
        Event {
            event_id,
            data_id,
            repository,
            sync_status: status,
            sync_operation: SyncOperation::Delete,
            sync_created_at: event_id.timestamp(),
            server_sequence: None,
            body: EventBody::Delete,
        }
    }
}

impl Event {
    pub fn is_delete(&self) -> bool {
        matches!(self.body, EventBody::Delete)
    }

    pub fn payload(&self) -> Option<&Payload> {
        match &self.body {
            EventBody::State { payload } => Some(payload),
            EventBody::Delete => None,
        }
    }

    pub fn with_sync_status(mut self, status: SyncStatus) -> Self {
        self.sync_status = status;
        self
    }

    /// Assign the server sequence, once. An already-assigned sequence is
    /// retained no matter what the remote claims on re-ingest.
    pub fn with_server_sequence(mut self, sequence: i64) -> Self {
        if self.server_sequence.is_none() {
            self.server_sequence = Some(sequence);
        }
        self
    }
}

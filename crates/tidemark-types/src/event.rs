use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::identity::{EventTypeId, StreamId, TenantId};
use crate::position::{EventLogPosition, PartitionKey, ProcessingPosition, StreamPosition};

/// An event committed to the tenant's append-only event log.
///
/// The payload is opaque to the runtime; only the envelope fields are ever
/// inspected.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommittedEvent {
    pub event_log_position: EventLogPosition,
    pub occurred: DateTime<Utc>,
    pub event_type: EventTypeId,
    pub tenant: TenantId,
    pub partition: PartitionKey,
    /// Whether the event is visible across the event horizon.
    pub public: bool,
    pub payload: Value,
}

/// A committed event as it appears in a derived stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub event: CommittedEvent,
    pub stream: StreamId,
    pub stream_position: StreamPosition,
    pub partition: PartitionKey,
}

impl StreamEvent {
    /// The processing position this event sits at: its stream ordinal paired
    /// with the underlying event-log ordinal.
    pub fn processing_position(&self) -> ProcessingPosition {
        ProcessingPosition::new(self.stream_position, self.event.event_log_position)
    }
}

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::identity::{ConsumerId, ConsumerKind, EventTypeId, ProcessorId, ScopeId, StreamId};

/// How a consumer selects events from its source stream.
///
/// Each variant has a dedicated validator in the registry; adding a variant
/// means adding a validator, resolved explicitly at registration time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterSpec {
    /// Every event in the source stream is included.
    PassThrough,
    /// Only events whose type is in the set are included.
    EventTypes(BTreeSet<EventTypeId>),
}

impl FilterSpec {
    pub fn includes(&self, event_type: &EventTypeId) -> bool {
        match self {
            Self::PassThrough => true,
            Self::EventTypes(types) => types.contains(event_type),
        }
    }
}

/// The registered shape of one consumer: where it reads, where it writes,
/// and how events are selected and grouped.
///
/// Persisted on registration; a later registration with different semantics
/// is only accepted while the consumer's cursor is still at the origin.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerDefinition {
    pub scope: ScopeId,
    pub kind: ConsumerKind,
    pub consumer: ConsumerId,
    pub source_stream: StreamId,
    pub target_stream: StreamId,
    pub partitioned: bool,
    pub filter: FilterSpec,
}

impl ConsumerDefinition {
    pub fn processor_id(&self) -> ProcessorId {
        ProcessorId {
            scope: self.scope,
            kind: self.kind,
            consumer: self.consumer,
            source_stream: self.source_stream,
        }
    }

    /// Whether two definitions would produce the same derived stream.
    ///
    /// Compares source stream, target stream, the partitioning flag, and the
    /// filtered-type set; everything else (e.g. the consumer id itself) does
    /// not affect what ends up in the target stream.
    pub fn same_semantics(&self, other: &Self) -> bool {
        self.source_stream == other.source_stream
            && self.target_stream == other.target_stream
            && self.partitioned == other.partitioned
            && self.filter == other.filter
    }
}

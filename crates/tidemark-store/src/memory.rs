use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;
use serde_json::Value;

use tidemark_cursor::CursorState;
use tidemark_types::{
    CommittedEvent, ConsumerDefinition, PartitionKey, ProcessingPosition, ProcessorId, ScopeId,
    StreamEvent, StreamId, StreamPosition,
};

use crate::error::{StoreError, StoreResult};
use crate::traits::{DefinitionRepository, LogReader, StateRepository, StreamWriter};

#[derive(Default)]
struct StreamEntries {
    events: Vec<StreamEvent>,
    /// Idempotency keys already written through [`StreamWriter`].
    written_keys: BTreeSet<ProcessingPosition>,
}

/// In-memory event log and derived streams.
///
/// Intended for tests and embedding. Streams live behind a `RwLock`; events
/// are cloned on read. Implements both sides: [`LogReader`] for consumers and
/// [`StreamWriter`] for their target streams, so a filter's output can be
/// another consumer's input.
pub struct InMemoryEventLog {
    streams: RwLock<HashMap<StreamId, StreamEntries>>,
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self {
            streams: RwLock::new(HashMap::new()),
        }
    }

    /// Append an event directly to a stream, assigning the next stream
    /// position. Used to seed source streams.
    pub fn append(&self, stream: StreamId, event: CommittedEvent) -> StreamEvent {
        let mut streams = self.streams.write().expect("lock poisoned");
        let entries = streams.entry(stream).or_default();
        let stream_event = StreamEvent {
            partition: event.partition.clone(),
            event,
            stream,
            stream_position: StreamPosition::new(entries.events.len() as u64),
        };
        entries.events.push(stream_event.clone());
        stream_event
    }

    pub fn len(&self, stream: StreamId) -> usize {
        self.streams
            .read()
            .expect("lock poisoned")
            .get(&stream)
            .map_or(0, |entries| entries.events.len())
    }

    pub fn is_empty(&self, stream: StreamId) -> bool {
        self.len(stream) == 0
    }

    /// Snapshot of a stream's events, in order.
    pub fn events(&self, stream: StreamId) -> Vec<StreamEvent> {
        self.streams
            .read()
            .expect("lock poisoned")
            .get(&stream)
            .map_or_else(Vec::new, |entries| entries.events.clone())
    }
}

impl Default for InMemoryEventLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LogReader for InMemoryEventLog {
    async fn fetch(
        &self,
        stream: StreamId,
        position: StreamPosition,
    ) -> StoreResult<Option<StreamEvent>> {
        let streams = self.streams.read().expect("lock poisoned");
        Ok(streams
            .get(&stream)
            .and_then(|entries| entries.events.get(position.value() as usize))
            .cloned())
    }

    async fn find_next(
        &self,
        stream: StreamId,
        partition: &PartitionKey,
        from: StreamPosition,
    ) -> StoreResult<Option<StreamPosition>> {
        let streams = self.streams.read().expect("lock poisoned");
        let Some(entries) = streams.get(&stream) else {
            return Ok(None);
        };
        let position = entries
            .events
            .iter()
            .skip(from.value() as usize)
            .find(|e| partition.is_unpartitioned() || &e.partition == partition)
            .map(|e| e.stream_position);
        Ok(position)
    }
}

#[async_trait]
impl StreamWriter for InMemoryEventLog {
    async fn write(
        &self,
        event: &CommittedEvent,
        target: StreamId,
        partition: &PartitionKey,
        key: ProcessingPosition,
    ) -> StoreResult<()> {
        let mut streams = self.streams.write().expect("lock poisoned");
        let entries = streams.entry(target).or_default();
        // Idempotent: a key seen before was already written
        // (crash-and-resume re-delivery, or a partition catch-up replay).
        if !entries.written_keys.insert(key) {
            return Ok(());
        }
        let stream_event = StreamEvent {
            event: event.clone(),
            stream: target,
            stream_position: StreamPosition::new(entries.events.len() as u64),
            partition: partition.clone(),
        };
        entries.events.push(stream_event);
        Ok(())
    }
}

/// In-memory cursor-state repository.
///
/// Documents are stored as raw JSON values and decoded on read, so a corrupt
/// or type-mismatched document surfaces as [`StoreError::Consistency`]
/// exactly like a real document store would.
pub struct InMemoryStateRepository {
    docs: RwLock<HashMap<ProcessorId, Value>>,
}

impl InMemoryStateRepository {
    pub fn new() -> Self {
        Self {
            docs: RwLock::new(HashMap::new()),
        }
    }

    /// Plant a raw document, bypassing the typed interface. For tests of
    /// corrupt-state handling.
    pub fn insert_raw(&self, id: ProcessorId, doc: Value) {
        self.docs.write().expect("lock poisoned").insert(id, doc);
    }

    pub fn len(&self) -> usize {
        self.docs.read().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryStateRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateRepository for InMemoryStateRepository {
    async fn try_get(&self, id: &ProcessorId) -> StoreResult<Option<CursorState>> {
        let docs = self.docs.read().expect("lock poisoned");
        let Some(doc) = docs.get(id) else {
            return Ok(None);
        };
        let state = serde_json::from_value(doc.clone()).map_err(|e| StoreError::Consistency {
            reason: format!("cursor state for {id}: {e}"),
        })?;
        Ok(Some(state))
    }

    async fn save(&self, id: &ProcessorId, state: &CursorState) -> StoreResult<()> {
        let doc =
            serde_json::to_value(state).map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.docs.write().expect("lock poisoned").insert(*id, doc);
        Ok(())
    }
}

/// In-memory consumer-definition repository keyed by (scope, target stream).
pub struct InMemoryDefinitionRepository {
    definitions: RwLock<HashMap<(ScopeId, StreamId), ConsumerDefinition>>,
}

impl InMemoryDefinitionRepository {
    pub fn new() -> Self {
        Self {
            definitions: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryDefinitionRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DefinitionRepository for InMemoryDefinitionRepository {
    async fn try_get(
        &self,
        scope: ScopeId,
        stream: StreamId,
    ) -> StoreResult<Option<ConsumerDefinition>> {
        let definitions = self.definitions.read().expect("lock poisoned");
        Ok(definitions.get(&(scope, stream)).cloned())
    }

    async fn save(&self, definition: &ConsumerDefinition) -> StoreResult<()> {
        let key = (definition.scope, definition.target_stream);
        self.definitions
            .write()
            .expect("lock poisoned")
            .insert(key, definition.clone());
        Ok(())
    }
}

use async_trait::async_trait;

use tidemark_cursor::CursorState;
use tidemark_types::{
    CommittedEvent, ConsumerDefinition, PartitionKey, ProcessingPosition, ProcessorId, ScopeId,
    StreamEvent, StreamId, StreamPosition,
};

use crate::error::StoreResult;

/// Read boundary over the event log and its derived streams.
#[async_trait]
pub trait LogReader: Send + Sync {
    /// The event at `position` in `stream`. `Ok(None)` when the stream has
    /// not reached that position yet.
    async fn fetch(
        &self,
        stream: StreamId,
        position: StreamPosition,
    ) -> StoreResult<Option<StreamEvent>>;

    /// The position of the next event in `partition` at or after `from`.
    /// An unpartitioned key matches every event.
    async fn find_next(
        &self,
        stream: StreamId,
        partition: &PartitionKey,
        from: StreamPosition,
    ) -> StoreResult<Option<StreamPosition>>;
}

/// Write boundary for consumers' target streams.
#[async_trait]
pub trait StreamWriter: Send + Sync {
    /// Append `event` to `target`, keyed by the source `ProcessingPosition`.
    ///
    /// Idempotent on `key`: re-writing an event after a crash-and-resume, or
    /// again during a partition catch-up, is a no-op, never a duplicate.
    async fn write(
        &self,
        event: &CommittedEvent,
        target: StreamId,
        partition: &PartitionKey,
        key: ProcessingPosition,
    ) -> StoreResult<()>;
}

/// Persistence for one cursor state per processor.
///
/// The document for a given [`ProcessorId`] has exactly one writer (the
/// registry's single-active-processor invariant), so `save` is a plain
/// overwrite.
#[async_trait]
pub trait StateRepository: Send + Sync {
    /// `Ok(None)` on first registration; `Err(Consistency)` when the
    /// persisted document cannot be interpreted.
    async fn try_get(&self, id: &ProcessorId) -> StoreResult<Option<CursorState>>;

    async fn save(&self, id: &ProcessorId, state: &CursorState) -> StoreResult<()>;
}

/// Persistence for consumer definitions, keyed by scope and the stream the
/// definition produces (its target).
#[async_trait]
pub trait DefinitionRepository: Send + Sync {
    async fn try_get(
        &self,
        scope: ScopeId,
        stream: StreamId,
    ) -> StoreResult<Option<ConsumerDefinition>>;

    async fn save(&self, definition: &ConsumerDefinition) -> StoreResult<()>;
}

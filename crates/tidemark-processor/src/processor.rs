use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use tidemark_cursor::{CursorState, ProcessingResult};
use tidemark_protocol::RetryState;
use tidemark_store::{LogReader, StateRepository, StreamWriter};
use tidemark_types::{ConsumerDefinition, PartitionKey, ProcessorId, StreamEvent};

use crate::consumer::{ConsumerResponse, EventConsumer};
use crate::error::ProcessorResult;

#[derive(Clone, Debug)]
pub struct ProcessorConfig {
    /// How long to idle when neither the frontier nor any retry has work.
    pub poll_interval: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Drives one consumer over one source stream.
///
/// Each pass retries due failing partitions first, then evaluates the event
/// at the cursor's frontier. Every cursor transition is persisted before its
/// side effect, and target writes are keyed by the source position, so a
/// crash anywhere resumes without duplicating output.
pub struct StreamProcessor {
    id: ProcessorId,
    definition: ConsumerDefinition,
    consumer: Arc<dyn EventConsumer>,
    log: Arc<dyn LogReader>,
    writer: Arc<dyn StreamWriter>,
    states: Arc<dyn StateRepository>,
    config: ProcessorConfig,
}

impl StreamProcessor {
    pub fn new(
        definition: ConsumerDefinition,
        consumer: Arc<dyn EventConsumer>,
        log: Arc<dyn LogReader>,
        writer: Arc<dyn StreamWriter>,
        states: Arc<dyn StateRepository>,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            id: definition.processor_id(),
            definition,
            consumer,
            log,
            writer,
            states,
            config,
        }
    }

    pub fn id(&self) -> &ProcessorId {
        &self.id
    }

    /// Run until `shutdown` flips to true or a fatal fault occurs.
    ///
    /// Picks up from the persisted cursor state; a corrupt state document is
    /// fatal for this processor only.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> ProcessorResult<()> {
        let mut state = self.states.try_get(&self.id).await?.unwrap_or_default();
        info!(processor = %self.id, position = %state.position(), "processor started");
        loop {
            if *shutdown.borrow() {
                debug!(processor = %self.id, "shutdown requested");
                return Ok(());
            }
            let (next, progressed) = self.tick(state).await?;
            state = next;
            if !progressed {
                tokio::select! {
                    changed = shutdown.changed() => {
                        // A dropped sender counts as shutdown.
                        if changed.is_err() || *shutdown.borrow() {
                            debug!(processor = %self.id, "shutdown requested");
                            return Ok(());
                        }
                    }
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        }
    }

    /// One pass: drain due retries, then evaluate the frontier event if one
    /// has arrived. Returns whether anything happened.
    async fn tick(&self, state: CursorState) -> ProcessorResult<(CursorState, bool)> {
        let (state, retried) = self.retry_due_partitions(state).await?;
        let frontier = state.position().stream;
        match self.log.fetch(self.definition.source_stream, frontier).await? {
            Some(event) => {
                let state = self.process_frontier(state, event).await?;
                Ok((state, true))
            }
            None => Ok((state, retried)),
        }
    }

    async fn retry_due_partitions(
        &self,
        mut state: CursorState,
    ) -> ProcessorResult<(CursorState, bool)> {
        let now = Utc::now();
        let due: Vec<PartitionKey> = state
            .failing_partitions()
            .iter()
            .filter(|(_, failing)| failing.is_due(now))
            .map(|(partition, _)| partition.clone())
            .collect();
        let progressed = !due.is_empty();
        for partition in &due {
            state = self.catch_up_partition(state, partition).await?;
        }
        Ok((state, progressed))
    }

    /// Replay one failing partition from its stuck position until it catches
    /// up with the frontier (clearing its entry) or fails again (backing the
    /// entry off).
    async fn catch_up_partition(
        &self,
        mut state: CursorState,
        partition: &PartitionKey,
    ) -> ProcessorResult<CursorState> {
        loop {
            let Some(failing) = state.failing_partitions().get(partition) else {
                return Ok(state);
            };
            if !failing.is_due(Utc::now()) {
                return Ok(state);
            }
            let retry = RetryState {
                reason: failing.reason.clone(),
                retry_count: failing.retry_count,
            };
            let next_in_partition = self
                .log
                .find_next(self.definition.source_stream, partition, failing.position.stream)
                .await?;
            let position = match next_in_partition {
                Some(position) if position < state.position().stream => position,
                // Nothing left for this partition before the frontier.
                _ => {
                    state = state.with_retry_progress(partition, state.position(), Utc::now());
                    self.states.save(&self.id, &state).await?;
                    debug!(processor = %self.id, partition = %partition, "partition caught up");
                    return Ok(state);
                }
            };
            let Some(event) = self.log.fetch(self.definition.source_stream, position).await? else {
                state = state.with_retry_progress(partition, state.position(), Utc::now());
                self.states.save(&self.id, &state).await?;
                return Ok(state);
            };
            match self.evaluate(&event, Some(retry)).await {
                ConsumerResponse::Succeeded { include } => {
                    let processed = event.processing_position();
                    state = state.with_retry_progress(partition, processed.next(), Utc::now());
                    self.states.save(&self.id, &state).await?;
                    if include {
                        self.writer
                            .write(&event.event, self.definition.target_stream, partition, processed)
                            .await?;
                    }
                }
                ConsumerResponse::Failed {
                    reason,
                    retry_after,
                } => {
                    warn!(
                        processor = %self.id,
                        partition = %partition,
                        %reason,
                        "retry failed"
                    );
                    state = state.with_retry_failed(partition, reason, retry_after, Utc::now());
                    self.states.save(&self.id, &state).await?;
                    return Ok(state);
                }
            }
        }
    }

    async fn process_frontier(
        &self,
        state: CursorState,
        event: StreamEvent,
    ) -> ProcessorResult<CursorState> {
        let partition = self.effective_partition(&event);
        if state.is_failing(&partition) {
            // In-order within the partition: the catch-up pass will replay
            // this event from the stuck position.
            let next = state.with_event_deferred();
            self.states.save(&self.id, &next).await?;
            trace!(processor = %self.id, partition = %partition, "event deferred");
            return Ok(next);
        }
        let response = self.evaluate(&event, None).await;
        let (result, include) = match response {
            ConsumerResponse::Succeeded { include } => (ProcessingResult::Succeeded, include),
            ConsumerResponse::Failed {
                reason,
                retry_after,
            } => {
                warn!(
                    processor = %self.id,
                    partition = %partition,
                    %reason,
                    "processing failed"
                );
                (ProcessingResult::failed(reason, retry_after), false)
            }
        };
        let next = state.with_result(&result, &event, &partition, Utc::now());
        self.states.save(&self.id, &next).await?;
        if result.is_success() && include {
            self.writer
                .write(
                    &event.event,
                    self.definition.target_stream,
                    &partition,
                    event.processing_position(),
                )
                .await?;
        }
        Ok(next)
    }

    /// Apply the definition's type filter locally; only matching events are
    /// delivered to the consumer.
    async fn evaluate(&self, event: &StreamEvent, retry: Option<RetryState>) -> ConsumerResponse {
        if !self.definition.filter.includes(&event.event.event_type) {
            return ConsumerResponse::Succeeded { include: false };
        }
        self.consumer.process(event, retry).await
    }

    fn effective_partition(&self, event: &StreamEvent) -> PartitionKey {
        if self.definition.partitioned {
            event.partition.clone()
        } else {
            PartitionKey::unpartitioned()
        }
    }
}

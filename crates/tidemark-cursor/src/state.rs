use std::borrow::Cow;
use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use tidemark_types::{EventLogPosition, PartitionKey, ProcessingPosition, StreamEvent};

use crate::failing::{FailingPartitionState, ProcessingResult};

/// Read position and failure bookkeeping for one consumer of one stream.
///
/// Immutable: every transition returns a new state. The high-water
/// [`position`](Self::position) advances once per evaluated event; a failed
/// event leaves its partition stuck in [`failing_partitions`](Self::failing_partitions)
/// until a later retry succeeds at or beyond the stuck position.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorState {
    position: ProcessingPosition,
    failing_partitions: BTreeMap<PartitionKey, FailingPartitionState>,
    last_successfully_processed: DateTime<Utc>,
}

impl CursorState {
    /// The zero state: origin position, nothing failing, epoch timestamp.
    pub fn new() -> Self {
        Self {
            position: ProcessingPosition::origin(),
            failing_partitions: BTreeMap::new(),
            last_successfully_processed: DateTime::<Utc>::UNIX_EPOCH,
        }
    }

    /// High-water mark: the next frontier position to evaluate.
    pub fn position(&self) -> ProcessingPosition {
        self.position
    }

    pub fn failing_partitions(&self) -> &BTreeMap<PartitionKey, FailingPartitionState> {
        &self.failing_partitions
    }

    pub fn is_failing(&self, partition: &PartitionKey) -> bool {
        self.failing_partitions.contains_key(partition)
    }

    pub fn last_successfully_processed(&self) -> DateTime<Utc> {
        self.last_successfully_processed
    }

    /// The safe replay-from point: the minimum of the high-water position and
    /// every failing partition's stuck position. Nothing at or after this can
    /// be discarded without risking a missed retry.
    pub fn earliest_position(&self) -> ProcessingPosition {
        self.failing_partitions
            .values()
            .map(|f| f.position)
            .min()
            .map_or(self.position, |stuck| stuck.min(self.position))
    }

    /// Fold the result of evaluating the frontier event.
    ///
    /// The position advances one step in both coordinates regardless of the
    /// result: the event was read and evaluated, only its effect may be
    /// deferred. Success clears the event's partition from the failing map
    /// and stamps the last-success time; failure upserts the partition entry
    /// with an incremented retry count and leaves the timestamp alone.
    pub fn with_result(
        &self,
        result: &ProcessingResult,
        event: &StreamEvent,
        partition: &PartitionKey,
        now: DateTime<Utc>,
    ) -> Self {
        let mut next = self.clone();
        next.position = self.position.next();
        match result {
            ProcessingResult::Succeeded => {
                next.failing_partitions.remove(partition);
                next.last_successfully_processed = now;
            }
            ProcessingResult::Failed(failure) => {
                let retry_count = self
                    .failing_partitions
                    .get(partition)
                    .map_or(0, |f| f.retry_count)
                    + 1;
                next.failing_partitions.insert(
                    partition.clone(),
                    FailingPartitionState {
                        position: event.processing_position(),
                        retry_count,
                        reason: failure.reason.clone(),
                        last_failed: now,
                        retry_time: retry_time_from(now, failure.retry_after),
                    },
                );
            }
        }
        next
    }

    /// Fold a frontier event whose partition is already failing.
    ///
    /// The event is not evaluated; its partition's retry pass will replay it
    /// from the stuck position. Only the position advances.
    pub fn with_event_deferred(&self) -> Self {
        let mut next = self.clone();
        next.position = self.position.next();
        next
    }

    /// A retried event in a failing partition succeeded: move the stuck
    /// position forward to `next_position`. Once it reaches the high-water
    /// mark the partition has caught up and its entry is removed.
    ///
    /// The retry count resets and the partition stays due, so a catch-up run
    /// keeps draining without waiting out the old backoff.
    pub fn with_retry_progress(
        &self,
        partition: &PartitionKey,
        next_position: ProcessingPosition,
        now: DateTime<Utc>,
    ) -> Self {
        let mut next = self.clone();
        next.last_successfully_processed = now;
        if next_position >= self.position {
            next.failing_partitions.remove(partition);
        } else if let Some(state) = next.failing_partitions.get_mut(partition) {
            state.position = next_position;
            state.retry_count = 0;
            state.retry_time = now;
        }
        next
    }

    /// A retried event in a failing partition failed again: bump the retry
    /// count and push the retry time out. The stuck position is unchanged.
    /// No entry for the partition means no change.
    pub fn with_retry_failed(
        &self,
        partition: &PartitionKey,
        reason: impl Into<String>,
        retry_after: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        let mut next = self.clone();
        if let Some(state) = next.failing_partitions.get_mut(partition) {
            state.retry_count += 1;
            state.reason = reason.into();
            state.last_failed = now;
            state.retry_time = retry_time_from(now, retry_after);
        }
        next
    }

    /// Treat everything before `target` as already handled.
    ///
    /// Used when a consumer's definition changes and history before a
    /// known-consistent point is being abandoned. Moving forward clears all
    /// failing partitions (their deferred retries are part of the abandoned
    /// history) and advances only the event-log coordinate. A target at or
    /// before the current event-log position is a no-op returning
    /// `Cow::Borrowed(self)`, so callers can detect it by variant.
    pub fn skip_events_before(&self, target: EventLogPosition) -> Cow<'_, Self> {
        if target <= self.position.event_log {
            return Cow::Borrowed(self);
        }
        Cow::Owned(Self {
            position: ProcessingPosition::new(self.position.stream, target),
            failing_partitions: BTreeMap::new(),
            last_successfully_processed: self.last_successfully_processed,
        })
    }
}

impl Default for CursorState {
    fn default() -> Self {
        Self::new()
    }
}

fn retry_time_from(now: DateTime<Utc>, retry_after: Duration) -> DateTime<Utc> {
    let delta = TimeDelta::from_std(retry_after).unwrap_or(TimeDelta::MAX);
    now.checked_add_signed(delta).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

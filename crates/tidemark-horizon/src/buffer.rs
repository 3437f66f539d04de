use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::warn;

use tidemark_store::{LogReader, StoreResult};
use tidemark_types::{PartitionKey, StreamEvent, StreamId, StreamPosition};

/// Bounded in-memory window over one received stream.
///
/// The subscription's drain loop pushes events in producer order; the
/// subscription's processor reads them back through [`LogReader`]. Positions
/// are the producer's stream positions, so the buffer starts at the resume
/// position, not at zero. `push` waits for space once the window is full;
/// [`trim_below`](Self::trim_below) frees everything the cursor can no
/// longer need.
pub struct EventBuffer {
    stream: StreamId,
    capacity: usize,
    inner: Mutex<Inner>,
    space: Notify,
}

struct Inner {
    /// Producer position of the front event.
    base: u64,
    events: VecDeque<StreamEvent>,
}

impl EventBuffer {
    pub fn new(stream: StreamId, from: StreamPosition, capacity: usize) -> Self {
        Self {
            stream,
            capacity,
            inner: Mutex::new(Inner {
                base: from.value(),
                events: VecDeque::new(),
            }),
            space: Notify::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("lock poisoned").events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append the next event, waiting for space when the window is full.
    ///
    /// Out-of-sequence events are dropped: a re-delivery below the expected
    /// position is a reconnect overlap, anything above it is a gap the
    /// producer must not produce.
    pub async fn push(&self, event: StreamEvent) {
        loop {
            {
                let mut inner = self.inner.lock().expect("lock poisoned");
                let expected = inner.base + inner.events.len() as u64;
                let position = event.stream_position.value();
                if position != expected {
                    warn!(
                        stream = %self.stream,
                        position,
                        expected,
                        "dropping out-of-sequence event"
                    );
                    return;
                }
                if inner.events.len() < self.capacity {
                    inner.events.push_back(event);
                    return;
                }
            }
            self.space.notified().await;
        }
    }

    /// Drop buffered events below `position`. The caller passes the cursor's
    /// earliest position, so nothing still reachable is freed.
    pub fn trim_below(&self, position: StreamPosition) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        let mut freed = false;
        while inner
            .events
            .front()
            .is_some_and(|e| e.stream_position < position)
        {
            inner.events.pop_front();
            inner.base += 1;
            freed = true;
        }
        if freed {
            self.space.notify_one();
        }
    }
}

#[async_trait]
impl LogReader for EventBuffer {
    async fn fetch(
        &self,
        stream: StreamId,
        position: StreamPosition,
    ) -> StoreResult<Option<StreamEvent>> {
        if stream != self.stream {
            return Ok(None);
        }
        let inner = self.inner.lock().expect("lock poisoned");
        let Some(index) = position.value().checked_sub(inner.base) else {
            // Below the window: already trimmed, nothing to replay.
            return Ok(None);
        };
        Ok(inner.events.get(index as usize).cloned())
    }

    async fn find_next(
        &self,
        stream: StreamId,
        partition: &PartitionKey,
        from: StreamPosition,
    ) -> StoreResult<Option<StreamPosition>> {
        if stream != self.stream {
            return Ok(None);
        }
        let inner = self.inner.lock().expect("lock poisoned");
        let skip = from.value().saturating_sub(inner.base) as usize;
        Ok(inner
            .events
            .iter()
            .skip(skip)
            .find(|e| partition.is_unpartitioned() || &e.partition == partition)
            .map(|e| e.stream_position))
    }
}

use std::fmt;

use serde::{Deserialize, Serialize};

/// Ordinal within the raw, append-only event log.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct EventLogPosition(u64);

impl EventLogPosition {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// The first position in the log.
    pub const fn start() -> Self {
        Self(0)
    }

    pub const fn value(&self) -> u64 {
        self.0
    }

    pub const fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for EventLogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ordinal within the (possibly filtered) derived stream a consumer reads.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct StreamPosition(u64);

impl StreamPosition {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// The first position in the stream.
    pub const fn start() -> Self {
        Self(0)
    }

    pub const fn value(&self) -> u64 {
        self.0
    }

    pub const fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for StreamPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A consumer's read position: the stream coordinate and the event-log
/// coordinate it corresponds to.
///
/// Both coordinates only ever increase, except through the cursor's explicit
/// skip operation. Ordering follows the stream coordinate first; the two
/// coordinates advance together, so this matches event-log order for
/// positions within one stream.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ProcessingPosition {
    pub stream: StreamPosition,
    pub event_log: EventLogPosition,
}

impl ProcessingPosition {
    pub const fn new(stream: StreamPosition, event_log: EventLogPosition) -> Self {
        Self { stream, event_log }
    }

    /// The position before any event has been processed.
    pub const fn origin() -> Self {
        Self {
            stream: StreamPosition::start(),
            event_log: EventLogPosition::start(),
        }
    }

    pub const fn is_origin(&self) -> bool {
        self.stream.value() == 0 && self.event_log.value() == 0
    }

    /// Advance one step in both coordinates.
    pub const fn next(&self) -> Self {
        Self {
            stream: self.stream.next(),
            event_log: self.event_log.next(),
        }
    }
}

impl fmt::Display for ProcessingPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream {} / log {}", self.stream, self.event_log)
    }
}

/// Opaque grouping key carried by an event (e.g. the originating entity id).
///
/// Failures are tracked and retried per partition; a stuck partition blocks
/// only its own forward commitment.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionKey(String);

impl PartitionKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The single partition an unpartitioned consumer folds every event
    /// into. Matches any event when used as a lookup key.
    pub const fn unpartitioned() -> Self {
        Self(String::new())
    }

    pub fn is_unpartitioned(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unpartitioned() {
            write!(f, "<unpartitioned>")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl From<&str> for PartitionKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tidemark_types::ProcessingPosition;

/// The outcome of evaluating one event against a consumer.
///
/// A failure here is expected and transient: it is folded into the cursor's
/// failing-partitions map and retried later, never raised as an error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProcessingResult {
    Succeeded,
    Failed(ProcessingFailure),
}

impl ProcessingResult {
    pub fn failed(reason: impl Into<String>, retry_after: Duration) -> Self {
        Self::Failed(ProcessingFailure {
            reason: reason.into(),
            retry_after,
        })
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

/// Why an event failed and how long to wait before retrying its partition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessingFailure {
    pub reason: String,
    pub retry_after: Duration,
}

/// Bookkeeping for one partition whose most recent attempt failed.
///
/// Present in the cursor's map iff the partition is stuck; absence is the
/// only representation of "not failing".
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailingPartitionState {
    /// The position the partition is stuck at; retries replay from here.
    pub position: ProcessingPosition,
    pub retry_count: u32,
    pub reason: String,
    pub last_failed: DateTime<Utc>,
    /// No retry is attempted before this instant.
    pub retry_time: DateTime<Utc>,
}

impl FailingPartitionState {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.retry_time <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_constructor_carries_reason_and_timeout() {
        let r = ProcessingResult::failed("boom", Duration::from_secs(5));
        assert!(!r.is_success());
        let ProcessingResult::Failed(f) = r else {
            panic!("expected failure")
        };
        assert_eq!(f.reason, "boom");
        assert_eq!(f.retry_after, Duration::from_secs(5));
    }

    #[test]
    fn is_due_respects_retry_time() {
        let now = Utc::now();
        let state = FailingPartitionState {
            position: ProcessingPosition::origin(),
            retry_count: 1,
            reason: "boom".into(),
            last_failed: now,
            retry_time: now + chrono::Duration::seconds(10),
        };
        assert!(!state.is_due(now));
        assert!(state.is_due(now + chrono::Duration::seconds(10)));
        assert!(state.is_due(now + chrono::Duration::seconds(11)));
    }
}

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::warn;

use tidemark_duplex::Correlator;
use tidemark_protocol::RetryState;
use tidemark_types::StreamEvent;

/// What a consumer answered for one event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConsumerResponse {
    /// The event was handled; `include` says whether it belongs in the
    /// consumer's target stream.
    Succeeded { include: bool },
    /// The event was not handled; its partition backs off for `retry_after`.
    Failed {
        reason: String,
        retry_after: Duration,
    },
}

impl ConsumerResponse {
    pub fn failed(reason: impl Into<String>, retry_after: Duration) -> Self {
        Self::Failed {
            reason: reason.into(),
            retry_after,
        }
    }
}

/// The seam between a processor and the logic that evaluates its events.
#[async_trait]
pub trait EventConsumer: Send + Sync {
    /// Evaluate one event. `retry` is set when the event is being
    /// re-delivered after a failure. Never errors: delivery problems are
    /// reported as `Failed` and retried like any other failure.
    async fn process(&self, event: &StreamEvent, retry: Option<RetryState>) -> ConsumerResponse;
}

/// Backoff applied when the remote cannot be reached or answers garbage,
/// as opposed to a failure it reported itself.
const TRANSIENT_RETRY: Duration = Duration::from_secs(5);

/// Delivers events to a remote consumer as reverse calls over an active
/// duplex connection.
///
/// The event travels as its JSON encoding; the reply is a JSON document with
/// `succeeded`, and optionally `include` (default true), `reason`, and
/// `retry_after_ms`. A transport or decode problem is reported as a transient
/// failure so the partition backs off and retries instead of wedging.
pub struct CorrelatorConsumer {
    correlator: Correlator,
    transient_retry: Duration,
}

#[derive(Debug, Deserialize)]
struct ConsumerReply {
    succeeded: bool,
    #[serde(default = "default_include")]
    include: bool,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    retry_after_ms: Option<u64>,
}

fn default_include() -> bool {
    true
}

impl CorrelatorConsumer {
    pub fn new(correlator: Correlator) -> Self {
        Self {
            correlator,
            transient_retry: TRANSIENT_RETRY,
        }
    }

    pub fn with_transient_retry(mut self, retry_after: Duration) -> Self {
        self.transient_retry = retry_after;
        self
    }

    fn transient(&self, reason: String) -> ConsumerResponse {
        warn!(%reason, "reverse call did not complete");
        ConsumerResponse::Failed {
            reason,
            retry_after: self.transient_retry,
        }
    }
}

#[async_trait]
impl EventConsumer for CorrelatorConsumer {
    async fn process(&self, event: &StreamEvent, retry: Option<RetryState>) -> ConsumerResponse {
        let payload = match serde_json::to_vec(event) {
            Ok(payload) => payload,
            Err(e) => return self.transient(format!("event not encodable: {e}")),
        };
        let response = match self.correlator.call(payload, retry).await {
            Ok(response) => response,
            Err(e) => return self.transient(format!("reverse call failed: {e}")),
        };
        match serde_json::from_slice::<ConsumerReply>(&response) {
            Ok(reply) if reply.succeeded => ConsumerResponse::Succeeded {
                include: reply.include,
            },
            Ok(reply) => ConsumerResponse::Failed {
                reason: reply
                    .reason
                    .unwrap_or_else(|| "consumer reported failure".into()),
                retry_after: Duration::from_millis(reply.retry_after_ms.unwrap_or(0)),
            },
            Err(e) => self.transient(format!("undecodable consumer reply: {e}")),
        }
    }
}

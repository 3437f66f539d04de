use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use tidemark_types::{MicroserviceId, ScopeId, StreamEvent, StreamId, StreamPosition, TenantId};

use crate::error::HorizonResult;

/// Names one event-horizon subscription: which producer's public stream a
/// subscriber tenant receives, and into which local scope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId {
    pub producer_microservice: MicroserviceId,
    pub producer_tenant: TenantId,
    pub subscriber_tenant: TenantId,
    pub scope: ScopeId,
    pub stream: StreamId,
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{} stream {} into {}/{}",
            self.producer_tenant,
            self.producer_microservice,
            self.stream,
            self.subscriber_tenant,
            self.scope
        )
    }
}

/// The producer's grant for one subscription, issued on connect.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Consent(Uuid);

impl Consent {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub const fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for Consent {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Consent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Consent({})", self.0)
    }
}

impl fmt::Display for Consent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An established connection to a producer: the consent it granted and the
/// stream of public events from the requested position onward. The producer
/// closes the channel when the connection drops.
pub struct HorizonConnection {
    pub consent: Consent,
    pub events: mpsc::Receiver<StreamEvent>,
}

/// Transport seam for reaching a producer across the event horizon.
#[async_trait]
pub trait HorizonConnector: Send + Sync {
    /// Open `subscription`, requesting events from `from` onward.
    async fn connect(
        &self,
        subscription: &SubscriptionId,
        from: StreamPosition,
    ) -> HorizonResult<HorizonConnection>;
}

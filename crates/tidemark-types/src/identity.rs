use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TypeError;

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Mint a fresh (UUID v7) id.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            /// The nil id. Reserved; never assigned to a real entity.
            pub const fn nil() -> Self {
                Self(Uuid::nil())
            }

            pub const fn is_nil(&self) -> bool {
                self.0.is_nil()
            }

            pub const fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::nil()
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = TypeError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s)
                    .map(Self)
                    .map_err(|e| TypeError::InvalidId(e.to_string()))
            }
        }
    };
}

uuid_id! {
    /// Identifies one tenant; every event log is tenant-scoped.
    TenantId
}

uuid_id! {
    /// Identifies one microservice (a producer across the event horizon).
    MicroserviceId
}

uuid_id! {
    /// Identifies an event-log scope within a tenant. The nil scope is the
    /// default (public) scope.
    ScopeId
}

uuid_id! {
    /// Identifies one registered consumer (filter, handler, projection...).
    ConsumerId
}

uuid_id! {
    /// Identifies a stream: the raw log or a derived (filtered) stream.
    StreamId
}

uuid_id! {
    /// Identifies an event type, used by type-filtering consumers.
    EventTypeId
}

impl StreamId {
    /// The event log itself. Reserved: consumers may read from it but never
    /// write to it as a target stream.
    pub const fn event_log() -> Self {
        Self::nil()
    }
}

/// What kind of logic a consumer runs per event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ConsumerKind {
    Filter,
    EventHandler,
    Projection,
    Embedding,
}

impl ConsumerKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Filter => "filter",
            Self::EventHandler => "event-handler",
            Self::Projection => "projection",
            Self::Embedding => "embedding",
        }
    }
}

impl fmt::Display for ConsumerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ConsumerKind {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "filter" => Ok(Self::Filter),
            "event-handler" => Ok(Self::EventHandler),
            "projection" => Ok(Self::Projection),
            "embedding" => Ok(Self::Embedding),
            other => Err(TypeError::UnknownConsumerKind(other.to_string())),
        }
    }
}

/// Identifies one logical consumer of one stream.
///
/// At most one processor instance may be active per `ProcessorId` at a time;
/// the registry enforces this, and it is what makes overwrite-on-save of the
/// persisted cursor state correctness-preserving.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProcessorId {
    pub scope: ScopeId,
    pub kind: ConsumerKind,
    pub consumer: ConsumerId,
    pub source_stream: StreamId,
}

impl fmt::Display for ProcessorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{} on {}",
            self.scope, self.kind, self.consumer, self.source_stream
        )
    }
}

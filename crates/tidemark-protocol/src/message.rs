use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use tidemark_types::{ConsumerId, ConsumerKind, EventTypeId, ScopeId, StreamId, TenantId};

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Correlation id minted per outbound call; matches exactly one response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(u64);

impl CallId {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What the consumer announces on connect: who it is, what it reads, and how.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationRequest {
    pub tenant: TenantId,
    pub scope: ScopeId,
    pub kind: ConsumerKind,
    pub consumer: ConsumerId,
    pub source_stream: StreamId,
    pub partitioned: bool,
    /// Empty means pass-through: no type filtering.
    pub event_types: BTreeSet<EventTypeId>,
}

/// Typed reason a registration was refused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistrationFailureCode {
    NonWriteableTarget,
    AlreadyRegistered,
    DefinitionChanged,
    InvalidRequest,
}

/// The runtime's answer to a [`RegistrationRequest`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistrationResponse {
    Accepted,
    Rejected {
        code: RegistrationFailureCode,
        message: String,
    },
}

impl RegistrationResponse {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }
}

/// Carried on a request when the event is being re-delivered after a failure.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryState {
    pub reason: String,
    pub retry_count: u32,
}

/// Messages flowing consumer -> runtime.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsumerMessage {
    Registration(RegistrationRequest),
    Response { call: CallId, payload: Vec<u8> },
    Pong,
}

/// Messages flowing runtime -> consumer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuntimeMessage {
    Registration(RegistrationResponse),
    Request {
        call: CallId,
        payload: Vec<u8>,
        retry: Option<RetryState>,
    },
    Ping,
}

/// Common surface of both envelope directions, used by the codec.
pub trait Envelope {
    fn type_tag(&self) -> u8;
    fn type_name(&self) -> &'static str;
}

impl Envelope for ConsumerMessage {
    fn type_tag(&self) -> u8 {
        match self {
            Self::Registration(_) => 1,
            Self::Response { .. } => 2,
            Self::Pong => 3,
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            Self::Registration(_) => "Registration",
            Self::Response { .. } => "Response",
            Self::Pong => "Pong",
        }
    }
}

impl Envelope for RuntimeMessage {
    fn type_tag(&self) -> u8 {
        match self {
            Self::Registration(_) => 1,
            Self::Request { .. } => 2,
            Self::Ping => 3,
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            Self::Registration(_) => "Registration",
            Self::Request { .. } => "Request",
            Self::Ping => "Ping",
        }
    }
}

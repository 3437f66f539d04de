//! Wire protocol for Tidemark reverse calls.
//!
//! A consumer connects over a duplex stream, sends a [`RegistrationRequest`],
//! and — once accepted — answers [`RuntimeMessage::Request`]s with
//! [`ConsumerMessage::Response`]s matched by [`CallId`]. Payloads are opaque
//! bytes; their serialization format is out of this crate's scope.

pub mod codec;
pub mod error;
pub mod message;

pub use codec::WireCodec;
pub use error::{ProtocolError, ProtocolResult};
pub use message::{
    CallId, ConsumerMessage, Envelope, RegistrationFailureCode, RegistrationRequest,
    RegistrationResponse, RetryState, RuntimeMessage, MAX_MESSAGE_SIZE, PROTOCOL_VERSION,
};

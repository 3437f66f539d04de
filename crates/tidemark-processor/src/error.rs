use thiserror::Error;

use tidemark_duplex::DuplexError;
use tidemark_protocol::RegistrationFailureCode;
use tidemark_store::StoreError;
use tidemark_types::{ProcessorId, StreamId};

/// Fatal processor faults.
///
/// Failing to process an event is not an error: it is folded into the cursor
/// state and retried. An error here stops the one processor that hit it.
#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Duplex(#[from] DuplexError),

    /// The spawned processor task ended without producing a result.
    #[error("processor task halted abnormally")]
    Halted,
}

pub type ProcessorResult<T> = Result<T, ProcessorError>;

/// Why a registration was refused.
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("target stream {0} is not writeable")]
    NonWriteableTarget(StreamId),

    #[error("a processor for {0} is already active")]
    AlreadyRegistered(ProcessorId),

    #[error("definition for {0} changed after processing began")]
    DefinitionChanged(ProcessorId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RegistrationError {
    /// The wire code for refusals answered with a rejection. `None` for
    /// storage faults, which end the connection instead of rejecting it.
    pub fn failure_code(&self) -> Option<RegistrationFailureCode> {
        match self {
            Self::NonWriteableTarget(_) => Some(RegistrationFailureCode::NonWriteableTarget),
            Self::AlreadyRegistered(_) => Some(RegistrationFailureCode::AlreadyRegistered),
            Self::DefinitionChanged(_) => Some(RegistrationFailureCode::DefinitionChanged),
            Self::Store(_) => None,
        }
    }
}

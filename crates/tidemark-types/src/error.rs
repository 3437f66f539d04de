use thiserror::Error;

/// Errors produced when constructing or parsing foundation types.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TypeError {
    #[error("invalid id: {0}")]
    InvalidId(String),

    #[error("unknown consumer kind: {0}")]
    UnknownConsumerKind(String),
}

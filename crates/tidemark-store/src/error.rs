use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// A persisted document is corrupt or has the wrong shape. Fatal for the
    /// one processor that owns the document; siblings are unaffected.
    #[error("inconsistent persisted state: {reason}")]
    Consistency { reason: String },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

use thiserror::Error;

use tidemark_store::StoreError;

#[derive(Debug, Error)]
pub enum HorizonError {
    /// The producer could not be reached or refused the subscription.
    /// Transient: the subscription loop backs off and reconnects.
    #[error("connect failed: {0}")]
    Connect(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type HorizonResult<T> = Result<T, HorizonError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Attempted to mutate a run that already reached a terminal status.
    /// This is a programming error in the caller.
    #[error("Run {0} is terminal and immutable")]
    TerminalRunImmutable(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<StoreError> for crate::error::AshepError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::TerminalRunImmutable(_) => {
                crate::error::AshepError::LogicViolation(err.to_string())
            }
            StoreError::NotFound(what) => crate::error::AshepError::NotFound(what),
            StoreError::Sqlx(sqlx::Error::PoolTimedOut) => {
                crate::error::AshepError::TransientIo(err.to_string())
            }
            other => crate::error::AshepError::Storage(other.to_string()),
        }
    }
}

use thiserror::Error;

/// Errors from the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The on-disk schema version is newer than this binary understands.
    /// Fatal on startup.
    #[error("Schema mismatch: database at version {found}, binary supports up to {supported}")]
    SchemaMismatch { found: i64, supported: i64 },

    /// A foreign-key or uniqueness constraint was violated.
    #[error("Integrity violation: {0}")]
    IntegrityViolation(String),

    /// The backend reported a busy/locked conflict. Retried up to 3 times
    /// with jitter before being surfaced.
    #[error("Concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    #[error("Row not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The single-writer queue is gone (process shutting down).
    #[error("Writer unavailable: {0}")]
    WriterGone(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(inner, msg) => match inner.code {
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked => {
                    StoreError::ConcurrencyConflict(
                        msg.clone().unwrap_or_else(|| "database busy".to_string()),
                    )
                }
                rusqlite::ErrorCode::ConstraintViolation => StoreError::IntegrityViolation(
                    msg.clone().unwrap_or_else(|| "constraint violation".to_string()),
                ),
                _ => StoreError::Database(e),
            },
            _ => StoreError::Database(e),
        }
    }
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::ConcurrencyConflict(_))
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

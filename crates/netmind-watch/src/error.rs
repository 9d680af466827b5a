use thiserror::Error;

use netmind_store::StoreError;

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("Watch rule not found: {0}")]
    RuleNotFound(String),

    #[error("Watch rule carries an unroutable intent: {0}")]
    InvalidIntent(String),

    #[error("Watch engine is not running")]
    EngineGone,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, WatchError>;

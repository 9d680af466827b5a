use thiserror::Error;

use netmind_plugin::ExecutionError;
use netmind_store::StoreError;
use netmind_watch::WatchError;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Watch error: {0}")]
    Watch(#[from] WatchError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, ChatError>;

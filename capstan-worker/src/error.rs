//! Worker error types

use thiserror::Error;

use crate::process_watcher::ProcessError;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("process error: {0}")]
    Process(#[from] ProcessError),

    #[error("messenger error: {0}")]
    Messenger(#[from] capstan_messenger::MessengerError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Registration was refused by the master; retrying is pointless
    #[error("registration rejected: {0}")]
    Rejected(String),

    #[error("run aborted")]
    Aborted,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

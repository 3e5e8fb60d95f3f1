//! Master error types

use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum MasterError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("messenger error: {0}")]
    Messenger(#[from] capstan_messenger::MessengerError),

    #[error("authentication failed: {0}")]
    Auth(String),

    /// Duplicate or mismatched-owner registration; refuses the connection
    #[error("registration refused: {0}")]
    Registration(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serde_failure_converts() {
        let source = serde_json::from_str::<uuid::Uuid>("not json").unwrap_err();
        let err = MasterError::from(source);
        assert!(err.to_string().starts_with("serialization error"));
    }
}

//! Error types for the messenger

use thiserror::Error;

/// Result type alias for messenger operations
pub type Result<T> = std::result::Result<T, MessengerError>;

/// Errors that can occur on a messenger or its connection
#[derive(Debug, Error)]
pub enum MessengerError {
    /// The messenger was disposed while the exchange was queued or in flight
    #[error("messenger disposed, exchange cancelled")]
    Cancelled,

    /// The peer answered with an error payload
    #[error("remote error: {0}")]
    Remote(String),

    /// Malformed or unrecognized frame; fatal to the connection
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The underlying connection closed
    #[error("connection closed")]
    ConnectionClosed,

    /// Frame could not be serialized
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Transport-level I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl MessengerError {
    /// Whether this error means the connection is gone rather than a
    /// single exchange having failed
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Protocol(_) | Self::ConnectionClosed | Self::Io(_)
        )
    }
}

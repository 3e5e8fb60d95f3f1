//! Connection handshake
//!
//! The first line a worker writes after connecting is a `Hello`; the master
//! answers with a `HelloReply` and only then do messenger frames flow.

use serde::{Deserialize, Serialize};

use crate::domain::WorkerProperties;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    /// Basic-style credential presented to the master's authorizer
    pub token: String,
    /// Worker identifier the connection registers as
    pub worker: String,
    pub version: String,
    pub display_name: String,
    /// Capability tags; the master's record is refreshed from these on every
    /// registration
    pub properties: WorkerProperties,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum HelloReply {
    Accepted,
    /// Authentication or registration was refused; the connection closes
    /// with no further frames
    Rejected { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_round_trip() {
        let reply = HelloReply::Rejected {
            reason: "worker already active".into(),
        };
        let json = serde_json::to_string(&reply).unwrap();
        let back: HelloReply = serde_json::from_str(&json).unwrap();
        match back {
            HelloReply::Rejected { reason } => assert!(reason.contains("active")),
            _ => panic!("expected rejection"),
        }
    }
}

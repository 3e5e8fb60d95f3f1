//! Wire frame envelope
//!
//! One frame = one JSON object: `{"type": ..., "id": ..., "data"?, "error"?}`.
//! Request/response pairs correlate on `id`; updates are uncorrelated.
//! A frame whose `type` does not parse is a protocol error and tears the
//! connection down.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Request,
    Response,
    Update,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Envelope {
    pub fn request(data: serde_json::Value) -> Self {
        Self {
            kind: MessageKind::Request,
            id: Uuid::new_v4(),
            data: Some(data),
            error: None,
        }
    }

    /// Successful response correlated to a request
    pub fn response(id: Uuid, data: serde_json::Value) -> Self {
        Self {
            kind: MessageKind::Response,
            id,
            data: Some(data),
            error: None,
        }
    }

    /// Error response correlated to a request
    pub fn error_response(id: Uuid, error: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Response,
            id,
            data: None,
            error: Some(error.into()),
        }
    }

    pub fn update(data: serde_json::Value) -> Self {
        Self {
            kind: MessageKind::Update,
            id: Uuid::new_v4(),
            data: Some(data),
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_wire_shape() {
        let envelope = Envelope::request(serde_json::json!({"command": "list"}));
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["type"], "request");
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let frame = r#"{"type": "broadcast", "id": "00000000-0000-0000-0000-000000000000"}"#;
        assert!(serde_json::from_str::<Envelope>(frame).is_err());
    }

    #[test]
    fn test_error_response_has_no_data() {
        let envelope = Envelope::error_response(Uuid::new_v4(), "boom");
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["error"], "boom");
        assert!(json.get("data").is_none());
    }
}

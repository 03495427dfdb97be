//! Wire message shapes.
//!
//! Every frame on a session carries one message: a request, a matching
//! response, a server-pushed notification, or an error. Requests and
//! responses correlate by id; notifications have none.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use mesh_core::error::MeshError;

/// Message discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Request,
    Response,
    Notification,
    Error,
}

impl MessageKind {
    /// Numeric tag used in the binary frame header.
    pub fn as_u16(&self) -> u16 {
        match self {
            MessageKind::Request => 1,
            MessageKind::Response => 2,
            MessageKind::Notification => 3,
            MessageKind::Error => 4,
        }
    }

    pub fn from_u16(raw: u16) -> Option<Self> {
        match raw {
            1 => Some(MessageKind::Request),
            2 => Some(MessageKind::Response),
            3 => Some(MessageKind::Notification),
            4 => Some(MessageKind::Error),
            _ => None,
        }
    }
}

/// Error object carried by error responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl From<&MeshError> for ErrorObject {
    fn from(err: &MeshError) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
            data: err.data(),
        }
    }
}

/// One framed message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

impl WireMessage {
    pub fn request(id: impl Into<String>, method: impl Into<String>, params: Value) -> Self {
        Self {
            id: Some(id.into()),
            kind: MessageKind::Request,
            method: Some(method.into()),
            params: Some(params),
            result: None,
            error: None,
        }
    }

    pub fn response(id: Option<String>, result: Value) -> Self {
        Self {
            id,
            kind: MessageKind::Response,
            method: None,
            params: None,
            result: Some(result),
            error: None,
        }
    }

    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        Self {
            id: None,
            kind: MessageKind::Notification,
            method: Some(method.into()),
            params: Some(params),
            result: None,
            error: None,
        }
    }

    pub fn error_response(id: Option<String>, err: &MeshError) -> Self {
        Self {
            id,
            kind: MessageKind::Error,
            method: None,
            params: None,
            result: None,
            error: Some(ErrorObject::from(err)),
        }
    }

    pub fn is_request(&self) -> bool {
        self.kind == MessageKind::Request
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_roundtrip() {
        let msg = WireMessage::request("r1", "task.create", json!({"task_type": "review"}));
        let encoded = serde_json::to_string(&msg).unwrap();
        let decoded: WireMessage = serde_json::from_str(&encoded).unwrap();
        assert_eq!(msg, decoded);
        assert!(encoded.contains("\"type\":\"request\""));
    }

    #[test]
    fn test_error_response_carries_code_and_data() {
        let err = MeshError::TooManyRequests {
            retry_after_secs: 2,
        };
        let msg = WireMessage::error_response(Some("r1".into()), &err);
        let error = msg.error.unwrap();
        assert_eq!(error.code, 429);
        assert_eq!(error.data.unwrap()["retry_after"], 2);
    }

    #[test]
    fn test_notification_has_no_id() {
        let msg = WireMessage::notification("task.assigned", json!({}));
        assert!(msg.id.is_none());
        let encoded = serde_json::to_string(&msg).unwrap();
        assert!(!encoded.contains("\"id\""));
    }

    #[test]
    fn test_kind_tags() {
        for kind in [
            MessageKind::Request,
            MessageKind::Response,
            MessageKind::Notification,
            MessageKind::Error,
        ] {
            assert_eq!(MessageKind::from_u16(kind.as_u16()), Some(kind));
        }
        assert_eq!(MessageKind::from_u16(99), None);
    }
}

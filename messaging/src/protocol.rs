//! Wire envelope exchanged between nodes.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum EnvelopeKind {
    /// Expects exactly one `Response` or `Error` with the same id.
    Request,
    /// Fire-and-forget; never answered.
    Post,
    Response,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Envelope {
    pub kind: EnvelopeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub body: serde_json::Value,
}

impl Envelope {
    pub fn request(id: u64, endpoint: &str, method: &str, body: serde_json::Value) -> Self {
        Self {
            kind: EnvelopeKind::Request,
            id: Some(id),
            endpoint: endpoint.to_string(),
            method: method.to_string(),
            body,
        }
    }

    pub fn post(endpoint: &str, method: &str, body: serde_json::Value) -> Self {
        Self {
            kind: EnvelopeKind::Post,
            id: None,
            endpoint: endpoint.to_string(),
            method: method.to_string(),
            body,
        }
    }

    pub fn response(id: u64, body: serde_json::Value) -> Self {
        Self {
            kind: EnvelopeKind::Response,
            id: Some(id),
            endpoint: String::new(),
            method: String::new(),
            body,
        }
    }

    pub fn error(id: u64, message: &str) -> Self {
        Self {
            kind: EnvelopeKind::Error,
            id: Some(id),
            endpoint: String::new(),
            method: String::new(),
            body: serde_json::Value::String(message.to_string()),
        }
    }
}

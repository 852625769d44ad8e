//! NDJSON wire protocol: one request line in, one response line out.

use serde::Serialize;
use serde_json::{json, Value};

/// Response id used when the request's own id is absent or unparseable.
pub const UNKNOWN_ID: &str = "unknown";

/// One response line. `id` echoes the request's id verbatim (any JSON
/// scalar); `timing_ms` is attached by the connection handler to every
/// routed response.
#[derive(Debug, Clone, Serialize)]
pub struct Response {
    pub id: Value,
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timing_ms: Option<f64>,
}

impl Response {
    pub fn result(id: Value, payload: Value) -> Self {
        Self {
            id,
            kind: "result".to_string(),
            payload,
            timing_ms: None,
        }
    }

    pub fn pong(id: Value) -> Self {
        Self {
            id,
            kind: "pong".to_string(),
            payload: json!({}),
            timing_ms: None,
        }
    }

    pub fn error(id: Value, message: impl Into<String>) -> Self {
        Self {
            id,
            kind: "error".to_string(),
            payload: json!({ "error_message": message.into() }),
            timing_ms: None,
        }
    }

    /// Structurally invalid input (parsed JSON that is not an object).
    pub fn bad_request() -> Self {
        Self {
            id: Value::String(UNKNOWN_ID.to_string()),
            kind: "error".to_string(),
            payload: json!({ "error": "invalid request format", "code": "BAD_REQUEST" }),
            timing_ms: None,
        }
    }

    /// Serialize to a single newline-terminated wire line.
    pub fn to_line(&self) -> String {
        let mut line =
            serde_json::to_string(self).expect("response is built from JSON values only");
        line.push('\n');
        line
    }
}

pub fn unknown_id() -> Value {
    Value::String(UNKNOWN_ID.to_string())
}

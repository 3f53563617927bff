//! Line-framed JSON-RPC wire types for the agent subprocess protocol
//!
//! Every frame is one self-contained JSON object on its own line. Outbound
//! frames are requests `{id, method, params}` and notifications
//! `{method, params}`; responses to agent-originated requests are written
//! verbatim. Inbound frames are classified purely by shape.

use serde::Serialize;
use serde_json::Value;

/// Outbound request frame. The id is echoed verbatim in the response.
#[derive(Debug, Clone, Serialize)]
pub struct RpcRequest {
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// Outbound notification frame: no id, no correlated result
#[derive(Debug, Clone, Serialize)]
pub struct RpcNotification {
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// Shape classification of one inbound frame, in dispatch order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundFrame {
    /// Has both id and method: a request originated by the agent
    Request,
    /// Has id only: a response to one of our requests
    Response,
    /// Has method only: a notification
    Notification,
    /// Anything else; dropped by the caller
    Unrecognized,
}

/// Classify an inbound frame by shape
pub fn classify(frame: &Value) -> InboundFrame {
    if !frame.is_object() {
        return InboundFrame::Unrecognized;
    }
    let has_id = frame.get("id").is_some();
    let has_method = frame
        .get("method")
        .map(|m| m.is_string())
        .unwrap_or(false);
    match (has_id, has_method) {
        (true, true) => InboundFrame::Request,
        (true, false) => InboundFrame::Response,
        (false, true) => InboundFrame::Notification,
        (false, false) => InboundFrame::Unrecognized,
    }
}

/// Extract the numeric id of a response frame.
///
/// Ids we issue are numbers; a string echo of digits is accepted too.
pub fn response_id(frame: &Value) -> Option<u64> {
    match frame.get("id")? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Split a response frame into its success result or its error message
pub fn response_outcome(frame: &Value) -> std::result::Result<Value, String> {
    match frame.get("error") {
        Some(error) => Err(error_message(error)),
        None => Ok(frame.get("result").cloned().unwrap_or(Value::Null)),
    }
}

/// An error payload is either a bare string or an object with a message field
pub fn error_message(error: &Value) -> String {
    if let Some(s) = error.as_str() {
        return s.to_string();
    }
    if let Some(s) = error.get("message").and_then(Value::as_str) {
        return s.to_string();
    }
    error.to_string()
}

/// Coerce a string-or-number id value to its string form
pub(crate) fn coerce_id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

//! WebSocket wire messages for browser subscribers
//!
//! Type-tagged JSON, snake_case tags, camelCase payload fields. Inbound
//! messages may carry a caller-supplied `requestId` echoed in their
//! acknowledgement.

use crate::session::SessionStatus;
use crate::threads::ThreadSummary;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error code sent when a subscribe targets an unregistered repo
pub const ERROR_UNKNOWN_REPO: &str = "unknown_repo";

/// Messages a browser connection may send
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    Subscribe {
        repo_id: String,
        #[serde(default)]
        request_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Unsubscribe {
        repo_id: String,
        #[serde(default)]
        request_id: Option<String>,
    },
    /// Answer to a request the agent subprocess issued; forwarded verbatim
    #[serde(rename_all = "camelCase")]
    AppServerResponse {
        repo_id: String,
        message: Value,
        #[serde(default)]
        request_id: Option<String>,
    },
}

/// Messages pushed to browser connections
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    SubscribeAck {
        repo_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    UnsubscribeAck {
        repo_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    SubscribeError {
        repo_id: String,
        code: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    SessionStatus {
        repo_id: String,
        status: SessionStatus,
    },
    #[serde(rename_all = "camelCase")]
    ThreadListUpdated {
        repo_id: String,
        threads: Vec<ThreadSummary>,
    },
    #[serde(rename_all = "camelCase")]
    AppServerNotification {
        repo_id: String,
        message: Value,
    },
    #[serde(rename_all = "camelCase")]
    AppServerRequest {
        repo_id: String,
        message: Value,
    },
}

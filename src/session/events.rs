//! Session and manager event types
//!
//! Events flow through `mpsc` channels handed to constructors: a session
//! emits [`SessionEvent`]s in subprocess emission order, and the manager
//! re-emits them as repo-tagged [`ManagerEvent`]s for the bridge.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Session lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// No subprocess
    Stopped,
    /// Subprocess spawned, handshake not yet complete
    Starting,
    /// Handshake complete, requests can be issued
    Connected,
    /// Subprocess failed; cleared by the next start
    Error,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Connected => "connected",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Events emitted by a single session
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The status state machine advanced
    Status(SessionStatus),
    /// An agent notification frame `{method, params?}`
    Notification(Value),
    /// A request frame the agent originated `{id, method, params?}`
    Request(Value),
}

/// Session events tagged with their repository by the manager
#[derive(Debug, Clone)]
pub enum ManagerEvent {
    SessionStatus {
        repo_id: String,
        status: SessionStatus,
    },
    SessionNotification {
        repo_id: String,
        message: Value,
    },
    SessionRequest {
        repo_id: String,
        message: Value,
    },
}

//! WebSocket gateway for browser subscribers
//!
//! Browsers connect to `/ws`, subscribe to repositories by id, and receive
//! every session event for those repositories. Responses to agent-originated
//! requests come back over the same socket.

pub mod messages;
pub mod server;
pub mod subscriptions;

pub use messages::{ClientMessage, ServerMessage, ERROR_UNKNOWN_REPO};
pub use server::{build_app, build_router, start, App, AppState, Gateway, ServerHandle};
pub use subscriptions::{ConnId, SubscriptionIndex};

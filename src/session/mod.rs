//! Repository-scoped agent sessions
//!
//! One session per repository: a spawned agent subprocess, the line-framed
//! JSON-RPC conversation with it, and the manager that keys sessions by
//! repo id and re-emits their events repo-tagged.

pub mod events;
pub mod manager;
pub mod rpc;
pub mod session;

pub use events::{ManagerEvent, SessionEvent, SessionStatus};
pub use manager::{ProcessSessionFactory, SessionFactory, SessionManager};
pub use session::Session;

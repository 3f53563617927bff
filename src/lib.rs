//! Codedeck - Local control plane for repository-scoped coding agent sessions
//!
//! Codedeck spawns one agent subprocess per registered repository, speaks
//! newline-delimited JSON-RPC with it over stdio, and relays the whole
//! conversation to any number of browser subscribers over a WebSocket
//! gateway.
//!
//! ## Architecture
//!
//! ```text
//!  agent subprocess ──stdout lines──▶ Session ──typed events──▶ SessionManager
//!                                                                    │
//!                                                          repo-tagged events
//!                                                                    ▼
//!          TurnStateStore ◀── Bridge ──▶ ThreadListRefresher (debounced)
//!                                 │
//!                                 ▼
//!                              Gateway ──fan-out──▶ browser subscribers (/ws)
//! ```
//!
//! The reverse path: HTTP callers go through `SessionManager::get_or_start`
//! and `Session::request`; browsers answering agent-originated requests send
//! `app_server_response`, which routes back through
//! `SessionManager::send_response` into the session's stdin.
//!
//! ## Modules
//!
//! - [`session`]: subprocess lifecycle, RPC correlation, and the manager
//! - [`gateway`]: subscriber registry, fan-out, and the HTTP/WS server
//! - [`bridge`]: wires manager events into derived state and the gateway
//! - [`turns`]: turn lifecycle projection
//! - [`threads`]: debounced thread-list refresh and normalization
//! - [`registry`]: the on-disk repository registry
//! - [`api`]: thin REST routes over the core
//! - [`config`]: configuration management

pub mod api;
pub mod bridge;
pub mod config;
pub mod error;
pub mod gateway;
pub mod registry;
pub mod session;
pub mod threads;
pub mod turns;

pub use config::CodedeckConfig;
pub use error::{Error, Result};

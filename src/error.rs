//! Codedeck error types

use thiserror::Error;

/// Codedeck error type
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Repository registry error
    #[error("Registry error: {0}")]
    Registry(String),

    /// The repo id is not present in the registry
    #[error("Unknown repository: {0}")]
    UnknownRepo(String),

    /// Session lifecycle error
    #[error("Session error: {0}")]
    Session(String),

    /// The agent subprocess answered a request with an error payload
    #[error("Agent error: {0}")]
    Rpc(String),

    /// A pending request hit the hard RPC timeout
    #[error("RPC request timed out after {0}s")]
    RpcTimeout(u64),

    /// A starting session terminated before reaching connected
    #[error("Session failed to connect: {0}")]
    ConnectFailed(String),

    /// The bounded wait for a starting session elapsed.
    /// Distinct from [`Error::RpcTimeout`]: no request was in flight.
    #[error("Timed out waiting for session to connect")]
    ConnectTimeout,

    /// Gateway error
    #[error("Gateway error: {0}")]
    Gateway(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for codedeck operations
pub type Result<T> = std::result::Result<T, Error>;

//! Codedeck configuration management

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main codedeck configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CodedeckConfig {
    /// HTTP/WebSocket server configuration
    pub server: ServerConfig,

    /// Agent subprocess configuration
    pub agent: AgentConfig,

    /// Per-session protocol tuning
    pub session: SessionConfig,

    /// Storage configuration
    pub storage: StorageConfig,
}

impl CodedeckConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> crate::Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            crate::Error::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        toml::from_str(&raw)
            .map_err(|e| crate::Error::Config(format!("Failed to parse {}: {}", path.display(), e)))
    }

    /// Load configuration from an optional path, falling back to defaults
    pub fn load_or_default(path: Option<&Path>) -> crate::Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }
}

/// HTTP/WebSocket server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 18970,
        }
    }
}

/// Agent subprocess configuration.
///
/// The program is spawned once per repository with the repository path as
/// its working directory, and speaks newline-delimited JSON-RPC on stdio.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Program to spawn
    pub program: String,

    /// Arguments passed to the program
    pub args: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            program: "codex".to_string(),
            args: vec!["app-server".to_string()],
        }
    }
}

/// Per-session protocol tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Hard timeout for a single RPC request, in seconds
    pub request_timeout_secs: u64,

    /// Bound on waiting for a starting session to connect, in seconds
    pub connect_timeout_secs: u64,

    /// Grace window between SIGTERM and SIGKILL on stop, in milliseconds
    pub stop_grace_ms: u64,

    /// Debounce window for thread-list refreshes, in milliseconds
    pub refresh_debounce_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 60,
            connect_timeout_secs: 30,
            stop_grace_ms: 200,
            refresh_debounce_ms: 250,
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Base directory for codedeck state
    pub base_dir: PathBuf,
}

impl StorageConfig {
    /// Path of the repository registry file
    pub fn registry_file(&self) -> PathBuf {
        self.base_dir.join("repos.json")
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let base_dir = std::env::var_os("HOME")
            .map(|home| PathBuf::from(home).join(".codedeck"))
            .unwrap_or_else(|| PathBuf::from(".codedeck"));
        Self { base_dir }
    }
}

//! Error types for vpnpanel

use std::io;
use thiserror::Error;

use crate::protocol::ProtocolKind;

#[derive(Debug, Error)]
pub enum PanelError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Command execution failed
    #[error("Command '{cmd}' failed{}: {stderr}", .code.as_ref().map(|c| format!(" with code {}", c)).unwrap_or_default())]
    CommandFailed { cmd: String, code: Option<i32>, stderr: String },

    /// Username rejected before any side effect
    #[error("Invalid username: {0}")]
    InvalidUsername(String),

    /// Invalid parameter
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Username already taken
    #[error("Username already exists: {0}")]
    DuplicateUsername(String),

    /// Not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Native configuration could not be read, parsed or written
    #[error("{kind} configuration write failed: {reason}")]
    ConfigWrite { kind: ProtocolKind, reason: String },

    /// Service supervisor call failed or timed out
    #[error("{kind} service reload failed: {reason}")]
    ServiceReload { kind: ProtocolKind, reason: String },

    /// Credential store failure
    #[error("Store error: {0}")]
    Store(String),

    /// Account deletion aborted because some protocols still hold live state
    #[error("Account '{username}' still has live state in: {}", .kinds.iter().map(|k| k.as_str()).collect::<Vec<_>>().join(", "))]
    LiveState { username: String, kinds: Vec<ProtocolKind> },

    /// Timeout
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Parse error
    #[error("Parse error: {0}")]
    ParseError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Secret generation or hashing failure
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Permission denied
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
}

impl PanelError {
    /// Tag a lower-level failure as a config write error for `kind`
    pub fn config_write(kind: ProtocolKind, err: impl std::fmt::Display) -> Self {
        PanelError::ConfigWrite { kind, reason: err.to_string() }
    }

    /// Tag a lower-level failure as a service reload error for `kind`
    pub fn service_reload(kind: ProtocolKind, err: impl std::fmt::Display) -> Self {
        PanelError::ServiceReload { kind, reason: err.to_string() }
    }
}

impl From<rusqlite::Error> for PanelError {
    fn from(error: rusqlite::Error) -> Self {
        PanelError::Store(error.to_string())
    }
}

impl From<serde_json::Error> for PanelError {
    fn from(error: serde_json::Error) -> Self {
        PanelError::ParseError(error.to_string())
    }
}

pub type PanelResult<T> = Result<T, PanelError>;

//! Why a settings file could not be turned into [`SwitchboardSettings`].
//!
//! [`SwitchboardSettings`]: crate::SwitchboardSettings

use thiserror::Error;

/// Routes the server mounts itself; the WebSocket path may not shadow them.
pub const RESERVED_PATHS: [&str; 2] = ["/health", "/metrics"];

/// Settings load failure.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The file exists but could not be read.
    #[error("cannot read settings file: {0}")]
    Read(#[from] std::io::Error),
    /// The file is not JSON, or a field has the wrong shape.
    #[error("malformed settings: {0}")]
    Malformed(#[from] serde_json::Error),
    /// `server.wsPath` is not an absolute path.
    #[error("server.wsPath must start with '/', got {0:?}")]
    RelativeWsPath(String),
    /// `server.wsPath` would shadow a built-in route.
    #[error("server.wsPath {0:?} is reserved for a built-in route")]
    ReservedWsPath(String),
    /// `server.maxMessageSize` is zero.
    #[error("server.maxMessageSize must be at least 1 byte")]
    ZeroMessageSize,
    /// `logging.level` does not name a tracing level.
    #[error("logging.level {0:?} is not one of trace, debug, info, warn, error")]
    UnknownLogLevel(String),
}

/// Result type for settings operations.
pub type Result<T> = std::result::Result<T, SettingsError>;

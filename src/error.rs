use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::server::registry::ConnectionId;

/// Errors surfaced to whoever drives the server (startup and shutdown).
#[derive(Debug, Error)]
pub enum ServerError {
    /// The listen address could not be bound. Fatal at startup.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The configuration was rejected by `ServerConfig::validate`.
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("server already started")]
    AlreadyStarted,

    #[error("server is shutting down")]
    ShuttingDown,

    /// Shutdown did not finish inside its budget.
    #[error("shutdown deadline of {deadline:?} exceeded with {outstanding} session(s) still running")]
    DeadlineExceeded { deadline: Duration, outstanding: usize },

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Failures that end a single connection's session and nothing else.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("frame exceeds {limit} bytes")]
    FrameTooLarge { limit: usize },

    #[error("failed to decode message: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("failed to encode response: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("no complete frame within {0:?}")]
    ReadTimeout(Duration),

    #[error("response write did not finish within {0:?}")]
    WriteTimeout(Duration),
}

/// A connection that could not be closed while draining the registry.
#[derive(Debug, Error)]
#[error("failed to close {id}: {source}")]
pub struct CloseError {
    pub id: ConnectionId,
    #[source]
    pub source: io::Error,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("config root must be a JSON object")]
    NotAnObject,

    #[error("invalid config: {0}")]
    Invalid(String),
}

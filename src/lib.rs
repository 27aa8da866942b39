//! Bounded-concurrency TCP echo server with graceful, deadline-bounded shutdown.
//!
//! Each connection exchanges newline-delimited JSON messages; every message is
//! echoed back with its `time` field set to the server's receive instant.

// Settings for the server and its logger, with per-key defaults.
pub mod config;

// Error taxonomy for startup, sessions, shutdown and configuration.
pub mod error;

// Logging utilities for server lifecycle and per-connection events.
pub mod logger;

// Message type and line framing.
pub mod protocol;

// Admission gate, connection registry, sessions and shutdown.
pub mod server;

pub use config::{LoggerConfig, ServerConfig};
pub use error::{CloseError, ConfigError, ServerError, SessionError};
pub use logger::{Logger, init_logger};
pub use protocol::{Message, Transform};
pub use server::shutdown::{ShutdownPhase, ShutdownReport};
pub use server::{Server, run_server};

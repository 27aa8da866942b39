// We need Duration to turn seconds into a Rust time value
use std::time::Duration;

// Generic deserialization so one helper can pull any typed value out of JSON
use serde::de::DeserializeOwned;
use serde_json::{Map, Value as JsonValue};

use crate::error::ConfigError;

//////////////////////
// LoggerConfig     //
//////////////////////

/// Where and how log records are written.
#[derive(Debug, Clone)]
pub struct LoggerConfig {
    /// Minimum level as a string (`"debug"`, `"info"`, ...)
    pub log_level: String,

    /// Colored lines on stdout
    pub enable_console_log: bool,

    /// Lines appended to `<log_file_path>/<name>.log`
    pub enable_file_log: bool,

    /// Directory for the log file; empty means the working directory
    pub log_file_path: String,

    /// Emit file lines as JSON envelopes instead of plain text
    pub enable_json_log: bool,

    /// chrono format string for timestamps
    pub date_format: String,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            enable_console_log: true,
            enable_file_log: false,
            log_file_path: String::new(),
            enable_json_log: false,
            date_format: "%Y-%m-%d %H:%M:%S%.3f".to_string(),
        }
    }
}

//////////////////////
// ServerConfig     //
//////////////////////

/// All the settings the server needs. Built once at startup, never mutated.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// IP or hostname to listen on (e.g. `"0.0.0.0"`)
    pub host: String,

    /// Port number; `0` lets the OS pick one
    pub port: u16,

    /// Longest wait for one complete request frame
    pub read_timeout: Duration,

    /// Longest wait for one response frame to be written
    pub write_timeout: Duration,

    /// Capacity of the admission gate
    pub max_connections: usize,

    /// Budget handed to `Server::shutdown` on SIGINT/SIGTERM
    pub shutdown_timeout: Duration,

    /// Largest accepted request frame, newline excluded
    pub max_frame_bytes: usize,

    /// Milliseconds to pause after a failed accept
    pub accept_error_backoff_ms: u64,

    /// Whether shutdown waits for session tasks to exit after closing them
    pub wait_for_sessions: bool,

    /// How many Tokio worker threads to spin up (defaults to cpu-1)
    pub worker_threads: usize,

    pub logger: LoggerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(30),
            max_connections: 1_000_000,
            shutdown_timeout: Duration::from_secs(30),
            max_frame_bytes: 1024 * 1024,
            accept_error_backoff_ms: 100,
            wait_for_sessions: true,
            worker_threads: num_cpus::get().saturating_sub(1).max(1),
            logger: LoggerConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Read a JSON config file and fill in defaults for anything it leaves out.
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        let value: JsonValue = serde_json::from_str(&raw)?;
        Self::try_from(&value)
    }

    /// `"host:port"`, ready for `TcpListener::bind`.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Reject settings the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid("max_connections must be at least 1".into()));
        }
        // Draining acquires every permit in one call, which takes a u32.
        if self.max_connections > u32::MAX as usize {
            return Err(ConfigError::Invalid(format!(
                "max_connections must not exceed {}",
                u32::MAX
            )));
        }
        if self.max_frame_bytes == 0 {
            return Err(ConfigError::Invalid("max_frame_bytes must be at least 1".into()));
        }
        if self.read_timeout.is_zero() || self.write_timeout.is_zero() {
            return Err(ConfigError::Invalid("read/write timeouts must be non-zero".into()));
        }
        if self.shutdown_timeout.is_zero() {
            return Err(ConfigError::Invalid("shutdown_timeout_secs must be non-zero".into()));
        }
        Ok(())
    }
}

/////////////////////////////////////////////
// Converting from a JSON object into Rust //
/////////////////////////////////////////////

// Look up `key` in the object, or fall back to `default`.
// If the value has the wrong type, we warn but still use `default`.
fn extract_or<T: DeserializeOwned>(obj: &Map<String, JsonValue>, key: &str, default: T) -> T {
    match obj.get(key) {
        Some(JsonValue::Null) | None => default,
        Some(value) => match serde_json::from_value::<T>(value.clone()) {
            Ok(val) => val,
            Err(err) => {
                eprintln!("Warning: '{}' has wrong type: {}", key, err);
                default
            }
        },
    }
}

impl TryFrom<&JsonValue> for LoggerConfig {
    type Error = ConfigError;

    fn try_from(value: &JsonValue) -> Result<Self, ConfigError> {
        let obj = value.as_object().ok_or(ConfigError::NotAnObject)?;
        let d = LoggerConfig::default();

        Ok(LoggerConfig {
            log_level:          extract_or(obj, "log_level",          d.log_level),
            enable_console_log: extract_or(obj, "enable_console_log", d.enable_console_log),
            enable_file_log:    extract_or(obj, "enable_file_log",    d.enable_file_log),
            log_file_path:      extract_or(obj, "log_file_path",      d.log_file_path),
            enable_json_log:    extract_or(obj, "enable_json_log",    d.enable_json_log),
            date_format:        extract_or(obj, "date_format",        d.date_format),
        })
    }
}

impl TryFrom<&JsonValue> for ServerConfig {
    type Error = ConfigError;

    fn try_from(value: &JsonValue) -> Result<Self, ConfigError> {
        let obj = value.as_object().ok_or(ConfigError::NotAnObject)?;
        let d = ServerConfig::default();

        // Read each setting, supplying the default value
        let host                    = extract_or(obj, "host",                    d.host);
        let port                    = extract_or(obj, "port",                    d.port);
        let read_timeout_secs       = extract_or(obj, "read_timeout_secs",       d.read_timeout.as_secs());
        let write_timeout_secs      = extract_or(obj, "write_timeout_secs",      d.write_timeout.as_secs());
        let max_connections         = extract_or(obj, "max_connections",         d.max_connections);
        let shutdown_timeout_secs   = extract_or(obj, "shutdown_timeout_secs",   d.shutdown_timeout.as_secs());
        let max_frame_bytes         = extract_or(obj, "max_frame_bytes",         d.max_frame_bytes);
        let accept_error_backoff_ms = extract_or(obj, "accept_error_backoff_ms", d.accept_error_backoff_ms);
        let wait_for_sessions       = extract_or(obj, "wait_for_sessions",       d.wait_for_sessions);
        let worker_threads          = extract_or(obj, "worker_threads",          d.worker_threads);

        // Nested "logger" object; anything else keeps the logging defaults
        let logger = match obj.get("logger") {
            Some(sub @ JsonValue::Object(_)) => LoggerConfig::try_from(sub)?,
            Some(JsonValue::Null) | None => d.logger,
            Some(other) => {
                eprintln!("Warning: 'logger' should be an object, got {}", other);
                d.logger
            }
        };

        let config = ServerConfig {
            host,
            port,
            read_timeout: Duration::from_secs(read_timeout_secs),
            write_timeout: Duration::from_secs(write_timeout_secs),
            max_connections,
            shutdown_timeout: Duration::from_secs(shutdown_timeout_secs),
            max_frame_bytes,
            accept_error_backoff_ms,
            wait_for_sessions,
            worker_threads: worker_threads.max(1),
            logger,
        };
        config.validate()?;
        Ok(config)
    }
}

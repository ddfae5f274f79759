//! Error types for configuration, backend supervision and proxying

use std::process::ExitStatus;
use std::time::Duration;

/// Errors raised while resolving the startup configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required setting was given neither in the file nor on the command line
    #[error("missing required setting: {0}")]
    Missing(&'static str),

    /// A duration string could not be parsed
    #[error("invalid duration '{value}': {reason}")]
    InvalidDuration { value: String, reason: &'static str },

    /// A setting was present but unusable
    #[error("invalid setting '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

/// Fatal conditions reported by the process supervisor
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// The backend command could not be launched
    #[error("failed to start backend '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The backend exited while it was expected to be running
    #[error("backend (pid {pid}) exited unexpectedly: {}", describe_exit(.status))]
    BackendExited {
        pid: u32,
        status: Option<ExitStatus>,
    },
}

fn describe_exit(status: &Option<ExitStatus>) -> String {
    match status {
        Some(status) => status.to_string(),
        None => "exit status unavailable".to_string(),
    }
}

/// Errors from the connection acceptor and handlers
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// The listening socket could not be bound
    #[error("failed to listen on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The dial policy gave up before the backend accepted a connection
    #[error("backend at {addr} unreachable after {attempts} attempts over {waited:?}")]
    BackendUnreachable {
        addr: String,
        attempts: u32,
        waited: Duration,
    },
}

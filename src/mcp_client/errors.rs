//! Server lifecycle error types.
//!
//! The taxonomy mirrors how a caller should react: configuration and launch
//! failures are final for that operation, connect failures may be retried by
//! the caller with backoff, stop failures are reported per server. Nothing in
//! this crate retries on its own.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur during server lifecycle operations.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// Bad or incomplete server descriptor.
    #[error("config error for server '{name}': {reason}")]
    Config { name: String, reason: String },

    /// The process failed to start or exited within the startup grace period.
    #[error("failed to launch server '{name}': {reason}{}", format_tail(.stderr_tail))]
    Launch {
        name: String,
        reason: String,
        /// Last lines of the captured stderr log.
        stderr_tail: Vec<String>,
        stdout_log: Option<PathBuf>,
        stderr_log: Option<PathBuf>,
    },

    /// Transport-level failure to open a channel to a live process/endpoint.
    #[error("failed to connect to server '{name}': {reason}")]
    Connect { name: String, reason: String },

    /// Termination signal failed or the process outlived the forceful window.
    #[error("failed to stop server '{name}' (pid {pid}): {reason}")]
    Stop { name: String, pid: u32, reason: String },

    /// A live process was launched from a different configuration.
    #[error(
        "server '{name}' (pid {pid}) is running with a different configuration \
         (stored {stored_hash}, requested {requested_hash}); stop it first"
    )]
    ConfigDrift {
        name: String,
        pid: u32,
        stored_hash: String,
        requested_hash: String,
    },

    /// Server is not configured, or has no launch record.
    #[error("server '{name}' not found")]
    NotFound { name: String },

    /// Server is not running and auto-launch is disabled.
    #[error("server '{name}' is not running and auto-launch is disabled")]
    NotRunning { name: String },

    /// Request/response failure on an open channel.
    #[error("request '{method}' to server '{server}' failed: {reason}")]
    Rpc {
        server: String,
        method: String,
        reason: String,
    },

    /// Server answered with a JSON-RPC error object.
    #[error("server '{server}' error [{code}]: {message}")]
    ServerError {
        server: String,
        code: i32,
        message: String,
    },
}

impl LifecycleError {
    /// Whether the calling layer may retry the operation with backoff.
    ///
    /// Only transport-level failures qualify; the lifecycle core itself never
    /// retries.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connect { .. } | Self::Rpc { .. })
    }

    /// Captured stderr lines, if this is a launch failure.
    pub fn stderr_tail(&self) -> Option<&[String]> {
        match self {
            Self::Launch { stderr_tail, .. } => Some(stderr_tail),
            _ => None,
        }
    }

    /// Name of the server this error concerns.
    pub fn server_name(&self) -> &str {
        match self {
            Self::Config { name, .. }
            | Self::Launch { name, .. }
            | Self::Connect { name, .. }
            | Self::Stop { name, .. }
            | Self::ConfigDrift { name, .. }
            | Self::NotFound { name }
            | Self::NotRunning { name } => name,
            Self::Rpc { server, .. } | Self::ServerError { server, .. } => server,
        }
    }
}

/// Format a stderr suffix for launch errors (empty string if no stderr).
fn format_tail(lines: &[String]) -> String {
    if lines.is_empty() {
        String::new()
    } else {
        format!(" | stderr: {}", lines.join("\n").trim())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launch_error_includes_stderr_tail() {
        let err = LifecycleError::Launch {
            name: "echo".into(),
            reason: "exited with status 1".into(),
            stderr_tail: vec!["Traceback".into(), "ModuleNotFoundError: fastmcp".into()],
            stdout_log: None,
            stderr_log: Some(PathBuf::from("/tmp/echo_stderr.log")),
        };
        let msg = err.to_string();
        assert!(msg.contains("exited with status 1"));
        assert!(msg.contains("ModuleNotFoundError"));
        assert_eq!(err.stderr_tail().map(|t| t.len()), Some(2));
    }

    #[test]
    fn test_launch_error_without_stderr_has_no_suffix() {
        let err = LifecycleError::Launch {
            name: "echo".into(),
            reason: "boom".into(),
            stderr_tail: vec![],
            stdout_log: None,
            stderr_log: None,
        };
        assert!(!err.to_string().contains("stderr"));
    }

    #[test]
    fn test_only_transport_errors_are_retryable() {
        assert!(LifecycleError::Connect {
            name: "s".into(),
            reason: "refused".into(),
        }
        .is_retryable());
        assert!(!LifecycleError::Config {
            name: "s".into(),
            reason: "missing command".into(),
        }
        .is_retryable());
        assert!(!LifecycleError::NotFound { name: "s".into() }.is_retryable());
    }

    #[test]
    fn test_server_name() {
        let err = LifecycleError::Rpc {
            server: "fetch".into(),
            method: "ping".into(),
            reason: "closed".into(),
        };
        assert_eq!(err.server_name(), "fetch");
    }
}

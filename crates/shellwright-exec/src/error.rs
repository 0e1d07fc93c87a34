//! Error types for shellwright-exec

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while running commands or copying files
#[derive(Error, Debug, Clone)]
pub enum ExecError {
    /// Malformed input, rejected before any I/O
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A single attempt to reach the remote host failed
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Every allowed dial attempt failed
    #[error("{stage}: after {attempts} failed attempts: {cause}")]
    DialExhausted {
        /// Dial stage that gave up
        stage: String,
        /// Number of attempts made
        attempts: u32,
        /// Last underlying failure
        cause: String,
    },

    /// Failure on the bastion side of a proxied connection
    #[error("proxy: {0}")]
    Proxy(Box<ExecError>),

    /// Authentication failed
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Command exited unsuccessfully
    #[error("{reason}: running {command:?}:\n{output}")]
    CommandFailed {
        /// Command text that was run
        command: String,
        /// Exit status or signal description
        reason: String,
        /// Combined stdout and stderr captured before the failure
        output: String,
    },

    /// The caller cancelled the operation
    #[error("operation cancelled")]
    Cancelled,

    /// Operation timed out
    #[error("timed out after {timeout:?}")]
    Timeout {
        /// Timeout duration that was exceeded
        timeout: Duration,
    },

    /// SSH key error
    #[error("SSH key error: {0}")]
    SshKeyError(String),

    /// Process spawn error
    #[error("failed to spawn process: {0}")]
    SpawnError(String),

    /// I/O error during execution
    #[error("I/O error: {0}")]
    IoError(String),

    /// SSH channel or session error
    #[error("session error: {0}")]
    SessionError(String),

    /// The remote server refused an environment variable
    #[error("could not set environment variable {name:?}: {reason}")]
    SetEnv {
        /// Variable name
        name: String,
        /// Why the request failed
        reason: String,
    },

    /// SFTP protocol error
    #[error("sftp: {0}")]
    Sftp(String),

    /// A remote path has the wrong type for the requested copy
    #[error("remote path conflict: {0}")]
    RemoteConflict(String),

    /// Invalid asset or archive glob
    #[error("invalid glob: {0}")]
    Glob(String),
}

impl ExecError {
    /// Check if error is retryable
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            ExecError::ConnectionFailed(_)
            | ExecError::AuthenticationFailed(_)
            | ExecError::Timeout { .. } => true,
            ExecError::Proxy(inner) => inner.is_retryable(),
            _ => false,
        }
    }

    /// Wrap an error raised on the bastion side of a proxied connection
    #[must_use]
    pub fn proxy(self) -> Self {
        ExecError::Proxy(Box::new(self))
    }
}

//! Error types for siteops-exec

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur during remote execution
#[derive(Error, Debug, Clone)]
pub enum ExecError {
    /// Failed to connect to remote host
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Authentication failed
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// A checked command exited with a non-zero status
    #[error("Fail in command: {command} . Exit code: {status}")]
    CommandFailed {
        /// Command text as issued by the caller
        command: String,
        /// Exit status code
        status: i32,
        /// Combined stdout and stderr
        output: String,
    },

    /// Command timed out
    #[error("command timed out after {timeout:?}")]
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

    /// File transfer could not be decoded or written
    #[error("transfer of {path} failed: {reason}")]
    TransferFailed {
        /// Remote or local path involved
        path: String,
        /// What went wrong
        reason: String,
    },

    /// Connection not established
    #[error("not connected")]
    NotConnected,
}

impl ExecError {
    /// Check if error is retryable
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExecError::ConnectionFailed(_) | ExecError::Timeout { .. }
        )
    }

    /// Exit status of a failed checked command
    #[must_use]
    pub fn exit_status(&self) -> Option<i32> {
        match self {
            ExecError::CommandFailed { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_failed_message_names_command_and_code() {
        let err = ExecError::CommandFailed {
            command: "git pull origin master".to_string(),
            status: 128,
            output: "fatal: not a git repository".to_string(),
        };

        let message = err.to_string();
        assert!(message.contains("git pull origin master"));
        assert!(message.contains("128"));
        assert_eq!(err.exit_status(), Some(128));
        assert!(!err.is_retryable());
    }
}

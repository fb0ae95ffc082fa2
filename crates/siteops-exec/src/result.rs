//! Result types for command execution

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Result of a command execution
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandResult {
    /// Exit status code (0 for success)
    pub status: i32,
    /// stdout output
    pub stdout: String,
    /// stderr output
    pub stderr: String,
    /// Time taken to execute
    pub duration: Duration,
}

impl CommandResult {
    /// Check if command succeeded (exit code 0)
    #[must_use]
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Inverse of [`CommandResult::success`]
    #[must_use]
    pub fn failed(&self) -> bool {
        !self.success()
    }

    /// Combine stdout and stderr
    #[must_use]
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }

    /// Trimmed stdout, the way status probes compare it
    #[must_use]
    pub fn text(&self) -> &str {
        self.stdout.trim()
    }
}

/// Connection information for SSH
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Host address
    pub host: String,
    /// Port (default 22)
    #[serde(default = "default_port")]
    pub port: u16,
    /// Username
    pub user: String,
}

fn default_port() -> u16 {
    22
}

impl ConnectionInfo {
    /// Create new connection info
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            user: user.into(),
        }
    }

    /// Set custom port
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Parse a host string: `[user@]host[:port]`
    ///
    /// Parts missing from `host_string` fall back to `default_user` and port 22.
    pub fn parse(host_string: &str, default_user: &str) -> Self {
        let (user, rest) = match host_string.split_once('@') {
            Some((user, rest)) => (user, rest),
            None => (default_user, host_string),
        };
        match rest.rsplit_once(':') {
            Some((host, port)) if port.parse::<u16>().is_ok() => {
                let port = port.parse().unwrap_or(22);
                Self::new(host, user).with_port(port)
            }
            _ => Self::new(rest, user),
        }
    }

    /// Whether this connection targets the local machine
    #[must_use]
    pub fn is_local(&self) -> bool {
        self.host == "localhost" || self.host == "127.0.0.1"
    }
}

//! Error types for siteops-pkg

use siteops_exec::ExecError;
use thiserror::Error;

/// Errors that can occur during package operations
#[derive(Error, Debug)]
pub enum PackageError {
    /// A single package install exited non-zero; the run stops here
    #[error("Unable to install package {package} (exit code {status})")]
    InstallFailed {
        /// Package that failed
        package: String,
        /// Exit status of the install command
        status: i32,
        /// Combined command output
        output: String,
    },

    /// Repository metadata refresh failed
    #[error("Unable to update apt repository information: {0}")]
    RepositoryUnavailable(String),

    /// Lock file conflict (another process running)
    #[error("lock file conflict: {0}")]
    LockConflict(String),

    /// Insufficient permissions (need sudo)
    #[error("insufficient permissions: {0}")]
    PermissionDenied(String),

    /// Non-install command failed
    #[error("command failed: {status} - {message}")]
    CommandFailed {
        /// Exit status
        status: i32,
        /// Error message
        message: String,
    },

    /// Requirements file exists but could not be read
    #[error("failed to read requirements file {path}: {source}")]
    RequirementsUnreadable {
        /// File path
        path: String,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Execution error from remote executor
    #[error(transparent)]
    Exec(#[from] ExecError),
}

impl PackageError {
    /// Check if error is retryable
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            PackageError::LockConflict(_) | PackageError::RepositoryUnavailable(_) => true,
            PackageError::Exec(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Check if error indicates need for sudo
    #[must_use]
    pub fn needs_sudo(&self) -> bool {
        matches!(self, PackageError::PermissionDenied(_))
    }
}

//! Remote executor trait

use std::time::Duration;

use async_trait::async_trait;

use crate::error::ExecError;
use crate::result::CommandResult;

/// Runs shell command lines on one target host
///
/// A non-zero exit status is not an error at this level; callers inspect
/// [`CommandResult::success`] or go through [`crate::shell::Shell`]'s
/// checked variants.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Execute a command line and collect its output
    async fn run(&self, cmd: &str) -> Result<CommandResult, ExecError>;

    /// Execute a command line, failing with `ExecError::Timeout` past `timeout`
    async fn run_with_timeout(
        &self,
        cmd: &str,
        timeout: Duration,
    ) -> Result<CommandResult, ExecError>;

    /// Drop any cached session so the next command reconnects
    async fn reset(&self) {}

    /// Whether a session is currently established
    fn is_connected(&self) -> bool {
        false
    }

    /// Short label for logs
    fn executor_type(&self) -> &'static str;
}

//! systemd service lifecycle
//!
//! `start` and `stop` only act when the service is not already in the
//! requested state; `restart` falls back to `start` for inactive services.

use std::sync::Arc;

use siteops_exec::{ExecError, Shell, quote};
use tracing::{info, instrument};

/// What `systemctl is-active` prints for a running unit
pub const ACTIVE_STATE: &str = "active";

/// Redis unit installed by the bundled `install_server.sh`
pub const REDIS_SERVICE: &str = "redis_6379";

/// Issues systemctl commands on one host
#[derive(Debug, Clone)]
pub struct ServiceController {
    shell: Arc<Shell>,
}

impl ServiceController {
    /// Create a controller on top of `shell`
    pub fn new(shell: Arc<Shell>) -> Self {
        Self { shell }
    }

    /// Full `systemctl status` output; never fails on the unit's state
    ///
    /// # Errors
    /// Transport failures only
    pub async fn status(&self, name: &str) -> Result<String, ExecError> {
        let result = self
            .shell
            .sudo(&format!("systemctl status {} --no-pager -l", quote(name)))
            .await?;
        Ok(result.combined_output())
    }

    /// Whether the unit reports `active`
    ///
    /// # Errors
    /// Transport failures only
    pub async fn is_active(&self, name: &str) -> Result<bool, ExecError> {
        let result = self
            .shell
            .sudo(&format!("systemctl is-active {}", quote(name)))
            .await?;
        let state = result.text();
        let active = state == ACTIVE_STATE;
        info!(service = %name, state = %state, active, "Status {name}: {state}");
        Ok(active)
    }

    /// Start unless already active
    ///
    /// # Errors
    /// `ExecError::CommandFailed` if systemctl fails
    #[instrument(skip(self))]
    pub async fn start(&self, name: &str) -> Result<(), ExecError> {
        if !self.is_active(name).await? {
            self.systemctl("start", name).await?;
        }
        Ok(())
    }

    /// Stop if active
    ///
    /// # Errors
    /// `ExecError::CommandFailed` if systemctl fails
    #[instrument(skip(self))]
    pub async fn stop(&self, name: &str) -> Result<(), ExecError> {
        if self.is_active(name).await? {
            self.systemctl("stop", name).await?;
        }
        Ok(())
    }

    /// Restart an active unit, start an inactive one
    ///
    /// # Errors
    /// `ExecError::CommandFailed` if systemctl fails
    #[instrument(skip(self))]
    pub async fn restart(&self, name: &str) -> Result<(), ExecError> {
        let action = if self.is_active(name).await? {
            "restart"
        } else {
            "start"
        };
        self.systemctl(action, name).await
    }

    /// Enable the unit at boot
    ///
    /// # Errors
    /// `ExecError::CommandFailed` if systemctl fails
    pub async fn enable(&self, name: &str) -> Result<(), ExecError> {
        self.systemctl("enable", name).await
    }

    async fn systemctl(&self, action: &str, name: &str) -> Result<(), ExecError> {
        self.shell
            .sudo_check(&format!("systemctl {action} {}", quote(name)))
            .await?;
        Ok(())
    }
}

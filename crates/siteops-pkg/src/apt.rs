//! APT package manager (Debian/Ubuntu)

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use siteops_exec::Shell;
use tracing::{info, instrument};

use crate::error::PackageError;
use crate::traits::PackageManager;
use crate::types::{PackageManagerType, UpgradeSummary};

/// Requirements file for OS packages
pub const DEBIAN_REQUIREMENTS: &str = "debian-requirements.txt";

/// Marker file Debian/Ubuntu drop when an upgrade needs a reboot
pub const REBOOT_REQUIRED_FILE: &str = "/var/run/reboot-required";

/// APT package manager implementation
///
/// Every apt command runs through sudo.
#[derive(Debug, Clone)]
pub struct AptManager {
    shell: Arc<Shell>,
}

impl AptManager {
    /// Create a new APT manager
    pub fn new(shell: Arc<Shell>) -> Self {
        Self { shell }
    }

    /// Refresh the repository cache
    ///
    /// # Errors
    /// `PackageError::RepositoryUnavailable` when `apt-get update` fails
    #[instrument(skip(self), fields(host = %self.shell.host()))]
    pub async fn update(&self) -> Result<(), PackageError> {
        let result = self.shell.sudo("apt-get -y update").await?;
        if result.failed() {
            return Err(PackageError::RepositoryUnavailable(result.combined_output()));
        }
        Ok(())
    }

    /// Refresh the cache and upgrade every installed package
    ///
    /// # Errors
    /// Lock conflicts, permission problems and other failures are reported
    /// as distinct variants
    #[instrument(skip(self), fields(host = %self.shell.host()))]
    pub async fn upgrade(&self) -> Result<UpgradeSummary, PackageError> {
        self.update().await?;

        info!("starting apt upgrade");
        let result = self
            .shell
            .sudo("DEBIAN_FRONTEND=noninteractive apt-get -y upgrade")
            .await?;

        let output = result.combined_output();
        if result.failed() {
            if output.contains("Could not get lock") {
                return Err(PackageError::LockConflict(output));
            }
            if output.contains("Permission denied") {
                return Err(PackageError::PermissionDenied(output));
            }
            return Err(PackageError::CommandFailed {
                status: result.status,
                message: format!("Unable to upgrade apt packages: {output}"),
            });
        }

        let mut summary = Self::parse_upgrade_output(&output);
        summary.reboot_required = self.reboot_required().await?;

        info!(
            upgraded = summary.upgraded_count,
            reboot_required = summary.reboot_required,
            "apt upgrade completed"
        );

        Ok(summary)
    }

    /// Whether the host asks for a reboot
    ///
    /// # Errors
    /// Transport failures only
    pub async fn reboot_required(&self) -> Result<bool, PackageError> {
        Ok(self.shell.exists(REBOOT_REQUIRED_FILE, true).await?)
    }

    /// Parse the `X upgraded, Y newly installed, Z to remove` summary line
    fn parse_upgrade_output(output: &str) -> UpgradeSummary {
        let mut summary = UpgradeSummary::default();

        let Some(line) = output.lines().find(|l| l.contains("upgraded,")) else {
            return summary;
        };

        for part in line.split(',').map(str::trim) {
            let count = |suffix: &str| {
                part.find(suffix)
                    .and_then(|n| part[..n].trim().parse::<u32>().ok())
            };
            if let Some(n) = count(" upgraded") {
                summary.upgraded_count = n;
            } else if let Some(n) = count(" newly installed") {
                summary.new_count = n;
            } else if let Some(n) = count(" to remove") {
                summary.removed_count = n;
            }
        }

        summary
    }
}

#[async_trait]
impl PackageManager for AptManager {
    fn manager_type(&self) -> PackageManagerType {
        PackageManagerType::Apt
    }

    fn requirements_file(&self) -> &'static str {
        DEBIAN_REQUIREMENTS
    }

    fn install_command(&self, _upgrade: bool) -> String {
        "apt-get -y -q install".to_string()
    }

    fn use_sudo(&self) -> bool {
        true
    }

    async fn installed_packages(&self) -> Result<HashSet<String>, PackageError> {
        // apt-get install is already a no-op for present packages
        Ok(HashSet::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_upgrade_output() {
        let output = "Reading package lists...\n5 upgraded, 2 newly installed, 1 to remove and 0 not upgraded.";

        let summary = AptManager::parse_upgrade_output(output);

        assert_eq!(summary.upgraded_count, 5);
        assert_eq!(summary.new_count, 2);
        assert_eq!(summary.removed_count, 1);
    }

    #[test]
    fn test_parse_upgrade_output_without_summary() {
        let summary = AptManager::parse_upgrade_output("E: nothing");
        assert_eq!(summary.upgraded_count, 0);
    }
}

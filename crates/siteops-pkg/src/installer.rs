//! Requirement list installation

use std::collections::HashSet;
use std::sync::Arc;

use siteops_exec::{Privilege, Shell, quote};
use tracing::{info, instrument, warn};

use crate::error::PackageError;
use crate::requirements::RequirementSources;
use crate::traits::PackageManager;
use crate::types::InstallReport;

/// Placeholder for the package name inside an install command
pub const PACKAGE_PLACEHOLDER: &str = "{pkg}";

/// Installs requirement lists one package at a time
#[derive(Debug, Clone)]
pub struct PackageInstaller {
    shell: Arc<Shell>,
    sources: RequirementSources,
}

impl PackageInstaller {
    /// Create an installer reading lists from `sources`
    pub fn new(shell: Arc<Shell>, sources: RequirementSources) -> Self {
        Self { shell, sources }
    }

    /// Requirement file lookup
    #[must_use]
    pub fn sources(&self) -> &RequirementSources {
        &self.sources
    }

    /// Install everything `requirements_filename` lists, plus `explicit`
    ///
    /// Packages are installed in accumulation order; the first failure
    /// aborts the run.
    ///
    /// # Errors
    /// `PackageError::InstallFailed` naming the package that failed
    #[instrument(skip(self, explicit, installed), fields(host = %self.shell.host()))]
    pub async fn install(
        &self,
        install_command: &str,
        requirements_filename: &str,
        explicit: &[String],
        installed: &HashSet<String>,
        use_sudo: bool,
    ) -> Result<InstallReport, PackageError> {
        let report = self
            .sources
            .collect(requirements_filename, explicit, installed)?;

        info!(
            count = report.installed.len(),
            skipped = report.skipped.len(),
            "installing packages"
        );

        for package in &report.installed {
            let command = install_line(install_command, package);
            let result = self
                .shell
                .exec(&command, Privilege::sudo_if(use_sudo))
                .await?;
            if result.failed() {
                warn!(package = %package, status = result.status, "package install failed");
                return Err(PackageError::InstallFailed {
                    package: package.clone(),
                    status: result.status,
                    output: result.combined_output(),
                });
            }
        }

        Ok(report)
    }

    /// Install `manager`'s requirement list, skipping what it reports as installed
    ///
    /// # Errors
    /// Propagates probe and install failures
    pub async fn install_with(
        &self,
        manager: &dyn PackageManager,
        explicit: &[String],
        upgrade: bool,
    ) -> Result<InstallReport, PackageError> {
        let _activated = manager.activation().map(|cmd| self.shell.prefix(cmd));

        let installed = manager.installed_packages().await?;
        info!(
            manager = %manager.manager_type(),
            present = installed.len(),
            "probed installed packages"
        );

        self.install(
            &manager.install_command(upgrade),
            manager.requirements_file(),
            explicit,
            &installed,
            manager.use_sudo(),
        )
        .await
    }
}

/// Build the command line installing `package`
#[must_use]
pub fn install_line(install_command: &str, package: &str) -> String {
    let package = quote(package);
    if install_command.contains(PACKAGE_PLACEHOLDER) {
        install_command.replace(PACKAGE_PLACEHOLDER, &package)
    } else {
        format!("{} {}", install_command.trim_end(), package)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_line_appends() {
        assert_eq!(
            install_line("apt-get -y -q install", "nginx"),
            "apt-get -y -q install nginx"
        );
        assert_eq!(install_line("pip install ", "celery==4.0.2"), "pip install celery==4.0.2");
    }

    #[test]
    fn test_install_line_placeholder_and_quoting() {
        assert_eq!(
            install_line("pip install {pkg} --no-cache-dir", "requests>=2.0"),
            "pip install 'requests>=2.0' --no-cache-dir"
        );
    }
}

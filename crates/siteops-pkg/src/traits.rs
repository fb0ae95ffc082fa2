//! Package manager traits

use std::collections::HashSet;

use async_trait::async_trait;

use crate::error::PackageError;
use crate::types::PackageManagerType;

/// A package manager whose requirement lists [`crate::PackageInstaller`]
/// can install
#[async_trait]
pub trait PackageManager: Send + Sync {
    /// Which manager this is
    fn manager_type(&self) -> PackageManagerType;

    /// Requirements file name looked up in the base and host config dirs
    fn requirements_file(&self) -> &'static str;

    /// Install command; the package is appended, or replaces `{pkg}`
    fn install_command(&self, upgrade: bool) -> String;

    /// Whether installs need root
    fn use_sudo(&self) -> bool;

    /// Command that must precede installs, e.g. virtualenv activation
    fn activation(&self) -> Option<String> {
        None
    }

    /// Packages already present; matching requirement lines are skipped
    async fn installed_packages(&self) -> Result<HashSet<String>, PackageError>;
}

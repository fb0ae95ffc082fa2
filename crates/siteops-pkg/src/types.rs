//! Type definitions for package management

use serde::{Deserialize, Serialize};

/// Outcome of a full OS upgrade
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpgradeSummary {
    /// Number of packages upgraded
    pub upgraded_count: u32,
    /// Number of packages newly installed
    pub new_count: u32,
    /// Number of packages removed
    pub removed_count: u32,
    /// Whether a reboot is required
    pub reboot_required: bool,
}

/// Outcome of a requirements install run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallReport {
    /// Packages installed, in order
    pub installed: Vec<String>,
    /// Packages skipped because they were already present
    pub skipped: Vec<String>,
}

/// Package manager type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageManagerType {
    /// APT (Debian/Ubuntu)
    Apt,
    /// pip inside the project virtualenv
    Pip,
}

impl std::fmt::Display for PackageManagerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PackageManagerType::Apt => write!(f, "apt"),
            PackageManagerType::Pip => write!(f, "pip"),
        }
    }
}

//! siteops-pkg: Package installation
//!
//! Reads requirement lists from the base and host config directories and
//! installs them through apt or the project virtualenv's pip.

pub mod apt;
pub mod error;
pub mod installer;
pub mod pip;
pub mod requirements;
pub mod traits;
pub mod types;

pub use apt::{AptManager, DEBIAN_REQUIREMENTS};
pub use error::PackageError;
pub use installer::{PackageInstaller, install_line};
pub use pip::{PYTHON_REQUIREMENTS, PipManager};
pub use requirements::{RequirementSources, parse_requirements};
pub use traits::PackageManager;
pub use types::{InstallReport, PackageManagerType, UpgradeSummary};

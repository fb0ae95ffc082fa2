//! Requirement list files
//!
//! A requirements file holds one package per line. Only the first
//! comma-separated field of a line counts, so `name,comment` rows work too.
//! Blank lines and fields starting with `#` are skipped.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::PackageError;
use crate::types::InstallReport;

/// Comment marker for requirement lines
const COMMENT: char = '#';

/// Parse requirement file content into package names, in file order
#[must_use]
pub fn parse_requirements(content: &str) -> Vec<String> {
    content
        .lines()
        .filter_map(|line| {
            let field = line.split(',').next().unwrap_or_default().trim();
            if field.is_empty() || field.starts_with(COMMENT) {
                None
            } else {
                Some(field.to_string())
            }
        })
        .collect()
}

/// Where requirement files are looked up: the shared base directory
/// first, then the host-specific config directory
#[derive(Debug, Clone)]
pub struct RequirementSources {
    base_dir: PathBuf,
    host_dir: PathBuf,
}

impl RequirementSources {
    /// Create sources for a base and a host config directory
    pub fn new(base_dir: impl Into<PathBuf>, host_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            host_dir: host_dir.into(),
        }
    }

    /// Candidate files for `filename`, in lookup order
    ///
    /// When both directories are the same only one candidate is returned.
    #[must_use]
    pub fn candidates(&self, filename: &str) -> Vec<PathBuf> {
        let mut paths = vec![self.base_dir.join(filename)];
        if self.host_dir != self.base_dir {
            paths.push(self.host_dir.join(filename));
        }
        paths
    }

    /// Accumulate the packages to install for `filename`
    ///
    /// `explicit` packages come first. File entries found in `installed`
    /// go to the skipped list instead.
    ///
    /// # Errors
    /// `PackageError::RequirementsUnreadable` if an existing file cannot be read
    pub fn collect(
        &self,
        filename: &str,
        explicit: &[String],
        installed: &HashSet<String>,
    ) -> Result<InstallReport, PackageError> {
        let mut report = InstallReport {
            installed: explicit.to_vec(),
            skipped: Vec::new(),
        };

        for path in self.candidates(filename) {
            if !path.exists() {
                debug!(path = %path.display(), "no requirements file");
                continue;
            }
            for package in read_requirements(&path)? {
                if installed.contains(&package) {
                    info!(package = %package, "Package \"{package}\" already exists");
                    report.skipped.push(package);
                    continue;
                }
                report.installed.push(package);
            }
        }

        Ok(report)
    }
}

fn read_requirements(path: &Path) -> Result<Vec<String>, PackageError> {
    let content =
        std::fs::read_to_string(path).map_err(|source| PackageError::RequirementsUnreadable {
            path: path.display().to_string(),
            source,
        })?;
    Ok(parse_requirements(&content))
}

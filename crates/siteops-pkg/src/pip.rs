//! pip inside the project virtualenv

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use siteops_exec::{Shell, quote_path};

use crate::error::PackageError;
use crate::traits::PackageManager;
use crate::types::PackageManagerType;

/// Requirements file for Python packages
pub const PYTHON_REQUIREMENTS: &str = "python-requirements.txt";

/// pip package manager bound to one virtualenv
#[derive(Debug, Clone)]
pub struct PipManager {
    shell: Arc<Shell>,
    ve_bin: String,
}

impl PipManager {
    /// `ve_bin` is the virtualenv's `bin` directory
    pub fn new(shell: Arc<Shell>, ve_bin: impl Into<String>) -> Self {
        Self {
            shell,
            ve_bin: ve_bin.into(),
        }
    }

    /// Split `pip freeze` output into the installed set
    ///
    /// Entries keep their `name==version` form, so only requirement lines
    /// pinned to the exact installed version are skipped.
    #[must_use]
    pub fn parse_freeze(output: &str) -> HashSet<String> {
        output.split_whitespace().map(str::to_string).collect()
    }
}

#[async_trait]
impl PackageManager for PipManager {
    fn manager_type(&self) -> PackageManagerType {
        PackageManagerType::Pip
    }

    fn requirements_file(&self) -> &'static str {
        PYTHON_REQUIREMENTS
    }

    fn install_command(&self, upgrade: bool) -> String {
        if upgrade {
            "pip install -U".to_string()
        } else {
            "pip install".to_string()
        }
    }

    fn use_sudo(&self) -> bool {
        false
    }

    fn activation(&self) -> Option<String> {
        Some(format!(". {}/activate", quote_path(&self.ve_bin)))
    }

    async fn installed_packages(&self) -> Result<HashSet<String>, PackageError> {
        let result = self.shell.run_check("pip freeze").await?;
        Ok(Self::parse_freeze(&result.stdout))
    }
}

//! Celery background workers, driven through `celery multi` in the
//! project checkout

use std::sync::Arc;

use siteops_exec::Shell;

use crate::env::Environment;
use crate::error::CoreError;

/// Controls the project's Celery workers on one host
#[derive(Debug, Clone)]
pub struct CeleryWorkers {
    env: Arc<Environment>,
    shell: Arc<Shell>,
}

impl CeleryWorkers {
    /// Create a controller for `env`'s project on `shell`
    pub fn new(env: Arc<Environment>, shell: Arc<Shell>) -> Self {
        Self { env, shell }
    }

    fn celery(&self) -> Result<String, CoreError> {
        Ok(format!("{}/bin/celery", self.env.get("virtualenv_dir")?))
    }

    /// `celery multi start <worker> -A <app> -f <log> <opts>`
    ///
    /// # Errors
    /// Missing celery keys, or a failing command
    pub async fn start(&self) -> Result<(), CoreError> {
        let command = format!(
            "{} multi start {} -A {} -f {} {}",
            self.celery()?,
            self.env.get("celery_worker")?,
            self.env.get("celery_app")?,
            self.env.get("celery_log_file_name")?,
            self.env.get_opt("celery_opts").unwrap_or_default(),
        );
        let _dir = self.shell.cd(self.env.get("project_dir")?);
        self.shell.run_check(command.trim_end()).await?;
        Ok(())
    }

    /// `celery multi stop <app>`
    ///
    /// # Errors
    /// Missing celery keys, or a failing command
    pub async fn stop(&self) -> Result<(), CoreError> {
        let command = format!(
            "{} multi stop {}",
            self.celery()?,
            self.env.get("celery_app")?
        );
        let _dir = self.shell.cd(self.env.get("project_dir")?);
        self.shell.run_check(&command).await?;
        Ok(())
    }

    /// Registered and active tasks
    ///
    /// # Errors
    /// Missing celery keys, or a failing command
    pub async fn status(&self) -> Result<String, CoreError> {
        let celery = self.celery()?;
        let app = self.env.get("celery_app")?;
        let _dir = self.shell.cd(self.env.get("project_dir")?);

        let registered = self
            .shell
            .run_check(&format!("{celery} -A {app} inspect registered"))
            .await?;
        let active = self
            .shell
            .run_check(&format!("{celery} -A {app} inspect active"))
            .await?;
        Ok(format!("{}\n{}", registered.stdout.trim_end(), active.stdout.trim_end()))
    }

    /// Drop every queued task
    ///
    /// # Errors
    /// Missing celery keys, or a failing command
    pub async fn purge(&self) -> Result<(), CoreError> {
        let command = format!("{} -A {} purge -f", self.celery()?, self.env.get("celery_app")?);
        let _dir = self.shell.cd(self.env.get("project_dir")?);
        self.shell.run_check(&command).await?;
        Ok(())
    }
}

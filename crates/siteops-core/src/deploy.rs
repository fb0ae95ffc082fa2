//! Deployment procedures
//!
//! Every procedure is a fixed sequence of steps. The first failing step
//! aborts the rest; nothing is rolled back or retried.

use std::sync::Arc;

use chrono::Local;
use siteops_exec::{Privilege, Shell, quote_path};
use siteops_pkg::{PackageInstaller, RequirementSources};
use tracing::{info, instrument};

use crate::env::Environment;
use crate::error::CoreError;
use crate::service::ServiceController;
use crate::template::TemplateRenderer;
use crate::workers::CeleryWorkers;

/// Templates uploaded by a project install
pub const INSTALL_TEMPLATES: [&str; 6] = ["nginx", "uwsgi-init", "uwsgi", "settings", "run", "502"];

/// Templates refreshed by a full redeploy
pub const DEPLOY_TEMPLATES: [&str; 4] = ["nginx", "uwsgi-init", "uwsgi", "settings"];

/// How schema migrations are applied
///
/// A first install trusts the fresh checkout and skips the framework's
/// system checks; later deploys keep them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationMode {
    /// `force_migrate`, without system checks
    Force,
    /// `migrate --noinput`, with system checks
    Checked,
}

impl MigrationMode {
    /// Management command implementing this mode
    #[must_use]
    pub fn management_command(self) -> &'static str {
        match self {
            MigrationMode::Force => "force_migrate",
            MigrationMode::Checked => "migrate --noinput",
        }
    }
}

/// Everything a procedure needs for one host
#[derive(Debug, Clone)]
pub struct Deployer {
    pub(crate) env: Arc<Environment>,
    pub(crate) shell: Arc<Shell>,
    pub(crate) templates: TemplateRenderer,
    pub(crate) services: ServiceController,
    pub(crate) workers: CeleryWorkers,
    pub(crate) installer: PackageInstaller,
}

impl Deployer {
    /// Bind `env` (already specialised for the host) to `shell`
    pub fn new(env: Arc<Environment>, shell: Arc<Shell>) -> Self {
        let sources = RequirementSources::new(env.base_config_dir(), env.config_dir());
        Self {
            templates: TemplateRenderer::new(env.clone()),
            services: ServiceController::new(shell.clone()),
            workers: CeleryWorkers::new(env.clone(), shell.clone()),
            installer: PackageInstaller::new(shell.clone(), sources),
            env,
            shell,
        }
    }

    /// Resolved environment
    #[must_use]
    pub fn env(&self) -> &Environment {
        &self.env
    }

    /// Host shell
    #[must_use]
    pub fn shell(&self) -> &Shell {
        &self.shell
    }

    /// Template renderer
    #[must_use]
    pub fn templates(&self) -> &TemplateRenderer {
        &self.templates
    }

    /// systemd controller
    #[must_use]
    pub fn services(&self) -> &ServiceController {
        &self.services
    }

    /// Celery controller
    #[must_use]
    pub fn workers(&self) -> &CeleryWorkers {
        &self.workers
    }

    /// Requirement list installer
    #[must_use]
    pub fn installer(&self) -> &PackageInstaller {
        &self.installer
    }

    /// Fresh instance setup from a base Ubuntu image
    ///
    /// # Errors
    /// The first failing step
    #[instrument(skip(self), fields(host = %self.shell.host()))]
    pub async fn setup_new_app_instance(&self, install_project: bool) -> Result<(), CoreError> {
        self.debian_install(&[], true).await?;
        self.locales_install().await?;
        self.postgres_create().await?;
        self.init_daemon_install().await?;
        self.debian_upgrade_reboot().await?;
        self.create_base_directory(false).await?;
        self.python_install(false).await?;
        self.redis_install().await?;
        self.java_install().await?;
        self.elasticsearch_install().await?;

        if install_project {
            self.install_project_files().await?;
        }
        Ok(())
    }

    /// Check out the project and bring every service up
    ///
    /// # Errors
    /// The first failing step
    #[instrument(skip(self), fields(host = %self.shell.host()))]
    pub async fn install_project_files(&self) -> Result<(), CoreError> {
        self.git_clone(true).await?;
        self.create_dirs().await?;
        self.templates
            .upload_templates(&self.shell, Some(INSTALL_TEMPLATES.as_slice()))
            .await?;

        self.migrate(MigrationMode::Force).await?;
        self.create_superuser().await?;
        self.manage("update_index --remove").await?;
        self.manage("set_site").await?;
        self.manage("collectstatic -v 0 --noinput").await?;
        self.nltk_download().await?;
        self.ssl_install().await?;
        self.start().await
    }

    /// Full redeploy: stop, refresh code and dependencies, migrate, start
    ///
    /// # Errors
    /// The first failing step
    #[instrument(skip(self), fields(host = %self.shell.host()))]
    pub async fn deploy(&self, upload_templates: bool) -> Result<(), CoreError> {
        self.stop().await?;

        self.shell
            .sudo_check(&format!(
                "find {} -name \"*pyc\" -delete",
                quote_path(self.env.get("project_dir")?)
            ))
            .await?;

        if upload_templates {
            self.templates
                .upload_templates(&self.shell, Some(DEPLOY_TEMPLATES.as_slice()))
                .await?;
        }

        self.git_pull(None).await?;
        self.python_install(false).await?;
        self.migrate(MigrationMode::Checked).await?;
        self.start().await?;
        self.manage("collectstatic -v 0 --noinput").await
    }

    /// Fast redeploy: pull and restart, no migration or static collection
    ///
    /// # Errors
    /// The first failing step
    #[instrument(skip(self), fields(host = %self.shell.host()))]
    pub async fn deploy_fast(&self) -> Result<(), CoreError> {
        self.git_pull(None).await?;
        self.restart().await
    }

    /// nginx, the uWSGI unit, then Celery
    ///
    /// # Errors
    /// The first failing step
    pub async fn start(&self) -> Result<(), CoreError> {
        info!(host = %self.shell.host(), "starting services");
        self.services.start("nginx").await?;
        self.services.start(self.env.get("uwsgi_name")?).await?;
        self.workers.start().await
    }

    /// Same order as [`Deployer::start`]
    ///
    /// # Errors
    /// The first failing step
    pub async fn stop(&self) -> Result<(), CoreError> {
        info!(host = %self.shell.host(), "stopping services");
        self.services.stop("nginx").await?;
        self.services.stop(self.env.get("uwsgi_name")?).await?;
        self.workers.stop().await
    }

    /// Stop then start
    ///
    /// # Errors
    /// The first failing step
    pub async fn restart(&self) -> Result<(), CoreError> {
        self.stop().await?;
        self.start().await
    }

    /// Apply schema migrations in `mode`
    ///
    /// # Errors
    /// A failing management command
    pub async fn migrate(&self, mode: MigrationMode) -> Result<(), CoreError> {
        self.manage(mode.management_command()).await
    }

    /// Run `manage.py <command>` as root in the project checkout
    ///
    /// # Errors
    /// A failing management command
    pub async fn manage(&self, command: &str) -> Result<(), CoreError> {
        let python = self.env.get("python_bin")?;
        let _dir = self.shell.cd(self.env.get("project_dir")?);
        self.shell
            .sudo_check(&format!("{python} manage.py {command}"))
            .await?;
        Ok(())
    }

    /// Create the admin account when `superuser_username` is configured
    ///
    /// # Errors
    /// Missing password/email keys or a failing management command
    pub async fn create_superuser(&self) -> Result<(), CoreError> {
        let Some(username) = self.env.get_opt("superuser_username").filter(|u| !u.is_empty())
        else {
            info!("no superuser_username configured, skipping superuser");
            return Ok(());
        };
        let password = self.env.get("superuser_password")?;
        let email = self.env.get("superuser_email")?;
        let python = self.env.get("python_bin")?;

        let _dir = self.shell.cd(self.env.get("project_dir")?);
        self.shell
            .exec_check_masked(
                &format!(
                    "{python} manage.py create_superuser --username {username} --password {password} --email {email}"
                ),
                password,
                Privilege::Root,
            )
            .await?;
        Ok(())
    }

    /// Clone the repository into `base_dir`
    ///
    /// An existing checkout is pulled when `recreate` is false, or moved
    /// aside to `<checkout>.<timestamp>` before cloning afresh.
    ///
    /// # Errors
    /// A failing git or mv command
    #[instrument(skip(self), fields(host = %self.shell.host()))]
    pub async fn git_clone(&self, recreate: bool) -> Result<(), CoreError> {
        let project_dir = self.env.get("project_dir")?;
        let base_dir = self.env.get("base_dir")?;

        if self.shell.exists(project_dir, false).await? {
            if !recreate {
                return self.git_pull(None).await;
            }
            let checkout = checkout_root(project_dir);
            let backup = format!("{checkout}.{}", Local::now().format("%Y%m%d%H%M%S"));
            info!(from = %checkout, to = %backup, "moving existing checkout aside");
            self.shell
                .run_check(&format!("mv {} {}", quote_path(&checkout), quote_path(&backup)))
                .await?;
        }

        let _dir = self.shell.cd(base_dir);
        self.shell
            .run_check(&format!(
                "git clone --branch {} {}",
                self.env.get("git_branch")?,
                self.env.get("git_uri")?
            ))
            .await?;
        Ok(())
    }

    /// Fetch, check out and pull `branch` (default `git_branch`), then
    /// drop compiled Python files
    ///
    /// # Errors
    /// A failing git command
    #[instrument(skip(self), fields(host = %self.shell.host()))]
    pub async fn git_pull(&self, branch: Option<&str>) -> Result<(), CoreError> {
        let branch = match branch.filter(|b| !b.is_empty()) {
            Some(branch) => branch,
            None => self.env.get("git_branch")?,
        };

        let _dir = self.shell.cd(self.env.get("project_dir")?);
        self.shell.run_check("git fetch").await?;
        self.shell
            .run_check(&format!("git checkout {branch}"))
            .await?;
        self.shell
            .run_check(&format!("git pull origin {branch}"))
            .await?;
        self.shell
            .sudo_check("find . -name \"*pyc\" -delete")
            .await?;
        Ok(())
    }

    /// Directories and log files the project and its services expect
    ///
    /// # Errors
    /// A failing mkdir/touch/chown
    #[instrument(skip(self), fields(host = %self.shell.host()))]
    pub async fn create_dirs(&self) -> Result<(), CoreError> {
        let user = self.env.user();
        let project_dir = self.env.get("project_dir")?;
        let media_root = self.env.get("media_root")?;

        self.shell
            .sudo_check("rm -f /etc/nginx/sites-enabled/default")
            .await?;

        self.shell
            .mkdir(self.env.get("static_root")?, user, user, true)
            .await?;
        self.shell.mkdir(media_root, user, user, true).await?;
        let documents = format!(
            "{}/{}",
            media_root.trim_end_matches('/'),
            self.env.get("filebrowser_directory")?
        );
        self.shell.mkdir(&documents, user, user, true).await?;

        // celery won't register tasks without the tika log
        self.shell.run_check("touch /tmp/tika.log").await?;
        self.shell
            .sudo_check(&format!("chown -R {user}:{user} /tmp/tika.log"))
            .await?;

        for log_key in ["log_file_name", "celery_log_file_name"] {
            let log_path = format!("{}/{}", project_dir, self.env.get(log_key)?);
            let quoted = quote_path(&log_path);
            self.shell.sudo_check(&format!("touch {quoted}")).await?;
            self.shell
                .sudo_check(&format!("chown -R {user}:{user} {quoted}"))
                .await?;
        }
        Ok(())
    }
}

/// Top-level directory of the checkout holding `project_dir`
fn checkout_root(project_dir: &str) -> String {
    let trimmed = project_dir.trim_end_matches('/');
    match trimmed.rsplit_once('/') {
        Some((parent, _)) if !parent.is_empty() => parent.to_string(),
        _ => trimmed.to_string(),
    }
}

//! Host provisioning steps
//!
//! System packages, language runtimes and the auxiliary services a fresh
//! Ubuntu host needs before the project can be installed.

use std::time::Duration;

use siteops_exec::{Privilege, quote, quote_path};
use siteops_pkg::{AptManager, InstallReport, PipManager};
use tracing::{info, instrument, warn};

use crate::deploy::Deployer;
use crate::error::CoreError;
use crate::service::REDIS_SERVICE;

/// How long to wait for a host to come back after a reboot
pub const REBOOT_TIME: Duration = Duration::from_secs(300);

/// uWSGI LTS release installed when `uwsgi_version` is unset
pub const DEFAULT_UWSGI_VERSION: &str = "2.0.14";

/// Elasticsearch release installed when `elasticsearch_version` is unset
pub const DEFAULT_ELASTICSEARCH_VERSION: &str = "2.3.1";

const ELASTICSEARCH_DEB_URL: &str =
    "https://download.elastic.co/elasticsearch/release/org/elasticsearch/distribution/deb/elasticsearch";

const REDIS_TARBALL_URL: &str = "http://download.redis.io/releases/redis-stable.tar.gz";

const NLTK_CORPORA: [&str; 5] = [
    "averaged_perceptron_tagger",
    "punkt",
    "stopwords",
    "words",
    "maxent_ne_chunker",
];

impl Deployer {
    fn apt(&self) -> AptManager {
        AptManager::new(self.shell.clone())
    }

    /// Refresh the apt cache
    ///
    /// # Errors
    /// `PackageError::RepositoryUnavailable`
    pub async fn debian_update(&self) -> Result<(), CoreError> {
        self.apt().update().await?;
        Ok(())
    }

    /// Install the OS requirement lists plus `packages`, then uWSGI and yuglify
    ///
    /// # Errors
    /// The first package that fails to install
    #[instrument(skip(self, packages), fields(host = %self.shell.host()))]
    pub async fn debian_install(
        &self,
        packages: &[String],
        update_cache: bool,
    ) -> Result<InstallReport, CoreError> {
        let apt = self.apt();
        if update_cache {
            apt.update().await?;
        }

        let report = self.installer.install_with(&apt, packages, false).await?;
        self.uwsgi_install(false).await?;
        self.yuglify_install().await?;
        Ok(report)
    }

    /// Update and upgrade every installed OS package
    ///
    /// # Errors
    /// Lock, permission or other apt failures
    pub async fn debian_upgrade(&self) -> Result<bool, CoreError> {
        let summary = self.apt().upgrade().await?;
        Ok(summary.reboot_required)
    }

    /// [`Deployer::debian_upgrade`], rebooting when the host asks for it
    ///
    /// # Errors
    /// Upgrade failures, or the host not returning within [`REBOOT_TIME`]
    #[instrument(skip(self), fields(host = %self.shell.host()))]
    pub async fn debian_upgrade_reboot(&self) -> Result<(), CoreError> {
        if self.debian_upgrade().await? {
            info!("upgrade requires a reboot");
            self.shell.reboot(REBOOT_TIME).await?;
        }
        Ok(())
    }

    /// Install the pinned uWSGI release system-wide
    ///
    /// # Errors
    /// A failing pip or ln command
    pub async fn uwsgi_install(&self, launch: bool) -> Result<(), CoreError> {
        let version = self
            .env
            .get_opt("uwsgi_version")
            .unwrap_or(DEFAULT_UWSGI_VERSION);
        self.shell
            .sudo_check(&format!("pip install uwsgi=={version}"))
            .await?;
        self.shell
            .sudo_check("ln -sf /usr/local/bin/uwsgi /usr/bin/uwsgi")
            .await?;

        if launch {
            self.services.start(self.env.get("uwsgi_name")?).await?;
        }
        Ok(())
    }

    /// The asset compressor used by the static pipeline
    ///
    /// # Errors
    /// A failing npm or ln command
    pub async fn yuglify_install(&self) -> Result<(), CoreError> {
        self.shell.sudo_check("npm -g install yuglify").await?;
        self.shell
            .sudo_check("ln -sf /usr/bin/nodejs /usr/bin/node")
            .await?;
        Ok(())
    }

    /// Oracle Java 8 through the webupd8 PPA
    ///
    /// # Errors
    /// A failing apt step
    #[instrument(skip(self), fields(host = %self.shell.host()))]
    pub async fn java_install(&self) -> Result<(), CoreError> {
        for command in [
            "apt-get install -y python-software-properties debconf-utils",
            "add-apt-repository -y ppa:webupd8team/java",
            "apt-get update",
            "echo \"oracle-java8-installer shared/accepted-oracle-license-v1-1 select true\" | debconf-set-selections",
            "apt-get install -y oracle-java8-installer",
        ] {
            self.shell.sudo_check(command).await?;
        }
        self.shell.run_check("java -version").await?;
        Ok(())
    }

    /// Build Redis from the stable tarball and register its service
    ///
    /// # Errors
    /// A failing download, build or install step
    #[instrument(skip(self), fields(host = %self.shell.host()))]
    pub async fn redis_install(&self) -> Result<(), CoreError> {
        {
            let _tmp = self.shell.cd("/tmp");
            self.shell
                .run_check(&format!("wget -q {REDIS_TARBALL_URL}"))
                .await?;
            self.shell.run_check("tar xzf redis-stable.tar.gz").await?;

            let _src = self.shell.cd("redis-stable");
            self.shell.run_check("make").await?;
            self.shell.sudo_check("make install").await?;

            let _utils = self.shell.cd("utils");
            self.shell
                .sudo_check("echo -n | ./install_server.sh")
                .await?;
        }
        self.start_redis().await
    }

    /// Install the Elasticsearch deb, its data dirs and config, then restart
    ///
    /// # Errors
    /// A failing install step or template upload
    #[instrument(skip(self), fields(host = %self.shell.host()))]
    pub async fn elasticsearch_install(&self) -> Result<(), CoreError> {
        let version = self
            .env
            .get_opt("elasticsearch_version")
            .unwrap_or(DEFAULT_ELASTICSEARCH_VERSION);
        let package = format!("elasticsearch-{version}.deb");

        {
            let _tmp = self.shell.cd("/tmp");
            self.shell
                .run_check(&format!("wget -q {ELASTICSEARCH_DEB_URL}/{version}/{package}"))
                .await?;
            self.shell
                .sudo_check(&format!("dpkg -i {}", quote(&package)))
                .await?;
        }

        let user = self.env.user();
        self.shell.mkdir("/usr/local/var/", user, user, true).await?;
        for dir in ["/usr/local/var/data/", "/usr/local/var/log/"] {
            self.shell
                .mkdir(dir, "elasticsearch", "elasticsearch", true)
                .await?;
        }

        self.templates
            .upload_template_and_reload(&self.shell, "elasticsearch")
            .await?;
        self.services.enable("elasticsearch").await?;
        self.services.restart("elasticsearch").await?;
        Ok(())
    }

    /// Generate the en_US locales postgres needs
    ///
    /// # Errors
    /// A failing locale-gen or write
    pub async fn locales_install(&self) -> Result<(), CoreError> {
        self.shell
            .sudo_check("locale-gen --purge en_US en_US.UTF-8")
            .await?;
        self.shell
            .write_file(
                "/etc/default/locale",
                b"LANG=\"en_US.UTF-8\"\nLANGUAGE=\"en_US:en\"\n",
                true,
            )
            .await?;
        Ok(())
    }

    /// Replace upstart with systemd, rebooting into it
    ///
    /// # Errors
    /// A failing apt/initramfs step, or the host not returning
    #[instrument(skip(self), fields(host = %self.shell.host()))]
    pub async fn init_daemon_install(&self) -> Result<(), CoreError> {
        let init = self.shell.sudo_check("stat /proc/1/exe").await?;
        if !init.stdout.contains("upstart") {
            info!("init daemon is not upstart, nothing to switch");
            return Ok(());
        }

        info!("switching init daemon from upstart to systemd");
        self.shell
            .sudo_check("apt-get -y install systemd-sysv ubuntu-standard")
            .await?;
        self.shell.sudo_check("update-initramfs -u").await?;
        self.shell.reboot(REBOOT_TIME).await?;
        Ok(())
    }

    /// Create `base_dir` and the project virtualenv inside it
    ///
    /// # Errors
    /// `CoreError::NotImplemented` when asked to clean an existing base
    /// dir; `CoreError::SetupFailed` when the interpreter or pip is missing
    /// afterwards
    #[instrument(skip(self), fields(host = %self.shell.host()))]
    pub async fn create_base_directory(&self, clean: bool) -> Result<(), CoreError> {
        let base_dir = self.env.get("base_dir")?;
        if clean && self.shell.exists(base_dir, false).await? {
            return Err(CoreError::NotImplemented("clean_base_directory"));
        }

        let user = self.env.user();
        self.shell.mkdir(base_dir, user, user, true).await?;

        let virtualenv = self
            .shell
            .run(&format!(
                "virtualenv -p python3 {}",
                quote_path(self.env.get("virtualenv_dir")?)
            ))
            .await?;
        if virtualenv.failed() {
            warn!(status = virtualenv.status, "virtualenv exited non-zero");
        }

        for (label, key) in [("PYTHON_BIN", "python_bin"), ("PIP_BIN", "pip_bin")] {
            let path = self.env.get(key)?;
            if !self.shell.exists(path, false).await? {
                return Err(CoreError::SetupFailed(format!(
                    "{label} {path} does not exist; setup failed."
                )));
            }
        }
        Ok(())
    }

    /// Install the Python requirement lists into the virtualenv
    ///
    /// # Errors
    /// The first package that fails to install
    #[instrument(skip(self), fields(host = %self.shell.host()))]
    pub async fn python_install(&self, upgrade: bool) -> Result<InstallReport, CoreError> {
        let pip = PipManager::new(self.shell.clone(), self.env.get("ve_bin")?);
        let _dir = self.shell.cd(self.env.get("base_dir")?);
        Ok(self.installer.install_with(&pip, &[], upgrade).await?)
    }

    /// Install one requirement list with an arbitrary command
    ///
    /// # Errors
    /// The first package that fails to install
    pub async fn install_packages(
        &self,
        install_command: &str,
        requirements_filename: &str,
        packages: &[String],
        use_sudo: bool,
    ) -> Result<InstallReport, CoreError> {
        Ok(self
            .installer
            .install(
                install_command,
                requirements_filename,
                packages,
                &Default::default(),
                use_sudo,
            )
            .await?)
    }

    /// Request a letsencrypt certificate when `https_redirect` is set
    ///
    /// # Errors
    /// Missing `cert_email`, or letsencrypt failing
    pub async fn ssl_install(&self) -> Result<(), CoreError> {
        if !self.env.flag("https_redirect") {
            info!("https_redirect not set, skipping certificate");
            return Ok(());
        }
        let email = self.env.get("cert_email")?;
        let domain = self.env.get("host")?;
        self.shell
            .sudo_check(&format!(
                "letsencrypt certonly --email {} --text --agree-tos -d {}",
                quote(email),
                quote(domain)
            ))
            .await?;
        Ok(())
    }

    /// Fetch the NLTK corpora the project uses
    ///
    /// # Errors
    /// A failing downloader run
    pub async fn nltk_download(&self) -> Result<(), CoreError> {
        let python = self.env.get("python_bin")?;
        let _dir = self.shell.cd(self.env.get("project_dir")?);
        self.shell
            .exec_check(
                &format!("{python} -m nltk.downloader {}", NLTK_CORPORA.join(" ")),
                Privilege::Root,
            )
            .await?;
        Ok(())
    }

    /// Start the Redis service
    ///
    /// # Errors
    /// A failing systemctl command
    pub async fn start_redis(&self) -> Result<(), CoreError> {
        self.services.start(REDIS_SERVICE).await?;
        Ok(())
    }

    /// Stop the Redis service
    ///
    /// # Errors
    /// A failing systemctl command
    pub async fn stop_redis(&self) -> Result<(), CoreError> {
        self.services.stop(REDIS_SERVICE).await?;
        Ok(())
    }
}

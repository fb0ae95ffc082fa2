//! Operational helpers: SSH keys, database backups, process control and
//! the local `print_*` reports

use std::path::PathBuf;

use chrono::Local;
use siteops_exec::{Privilege, quote, quote_path};
use tracing::{info, instrument};

use crate::deploy::Deployer;
use crate::env::Environment;
use crate::error::CoreError;

/// Deploy key created on the host for repository access
pub const HOST_KEY: &str = "~/.ssh/id_rsa";

impl Deployer {
    /// Generate the host's deploy key and print its public half
    ///
    /// # Errors
    /// A failing ssh-keygen/ssh-add step
    #[instrument(skip(self), fields(host = %self.shell.host()))]
    pub async fn create_ssh_keys(&self) -> Result<String, CoreError> {
        self.shell
            .run_check(&format!("echo y | ssh-keygen -q -t rsa -N '' -f {HOST_KEY}"))
            .await?;
        self.shell.run_check(&format!("chmod 600 {HOST_KEY}")).await?;
        self.shell
            .run_check(&format!("eval \"$(ssh-agent -s)\" && ssh-add {HOST_KEY}"))
            .await?;
        self.print_ssh_key().await
    }

    /// Public half of the deploy key
    ///
    /// # Errors
    /// Missing key file
    pub async fn print_ssh_key(&self) -> Result<String, CoreError> {
        let result = self
            .shell
            .run_check(&format!("cat {HOST_KEY}.pub"))
            .await?;
        Ok(result.stdout)
    }

    /// Drop the deploy key from the agent
    ///
    /// # Errors
    /// ssh-add failing
    pub async fn ssh_agent_remove_key(&self) -> Result<(), CoreError> {
        self.shell.run_check(&format!("ssh-add -d {HOST_KEY}")).await?;
        Ok(())
    }

    /// Dump the project database and fetch the archive into `config_dir`
    ///
    /// Returns the local path of the downloaded archive.
    ///
    /// # Errors
    /// Missing `db_*` keys, pg_dump failing or the transfer failing
    #[instrument(skip(self), fields(host = %self.shell.host()))]
    pub async fn get_db_backup(&self) -> Result<PathBuf, CoreError> {
        let file_name = format!("db_backup_{}.sql.tgz", Local::now().format("%Y-%m-%d-%H%M"));
        let backup_dir = format!("{}/backups", self.env.get("base_dir")?.trim_end_matches('/'));
        let backup_file = format!("{backup_dir}/{file_name}");

        let user = self.env.user();
        self.shell.mkdir(&backup_dir, user, user, false).await?;

        let password = self.env.get("db_password")?;
        let command = format!(
            "PGPASSWORD={} /usr/bin/pg_dump -Ft -v -b -c -O -h{} -p{} -U{} -w -f{} {}",
            quote(password),
            quote(self.env.get("db_host")?),
            quote(self.env.get("db_port")?),
            quote(self.env.get("db_user")?),
            quote_path(&backup_file),
            quote(self.env.get("db_name")?),
        );
        self.shell
            .exec_check_masked(&command, password, Privilege::User)
            .await?;

        let local_path = self.env.config_dir().join(&file_name);
        self.shell.download(&backup_file, &local_path).await?;
        self.shell
            .run_check(&format!("rm {}", quote_path(&backup_file)))
            .await?;

        info!(local = %local_path.display(), "database backup saved");
        Ok(local_path)
    }

    /// `pkill -f <pattern>`; no match is not an error
    ///
    /// # Errors
    /// Transport failures only
    pub async fn kill(&self, pattern: &str) -> Result<(), CoreError> {
        let result = self.shell.run(&format!("pkill -f {}", quote(pattern))).await?;
        if result.failed() {
            info!(pattern = %pattern, status = result.status, "no process killed");
        }
        Ok(())
    }

    /// Kill the Tika server
    ///
    /// # Errors
    /// Transport failures only
    pub async fn kill_tika(&self) -> Result<(), CoreError> {
        self.kill("TikaServer").await
    }
}

/// The whole environment as JSON, or the value of one key
///
/// # Errors
/// `ConfigError::MissingKey` for an unknown attribute
pub fn print_env(env: &Environment, attr: Option<&str>) -> Result<String, CoreError> {
    match attr {
        Some(key) => Ok(env.get(key)?.to_string()),
        None => serde_json::to_string_pretty(env)
            .map_err(|e| CoreError::Io(std::io::Error::other(e))),
    }
}

/// Remote base directory
///
/// # Errors
/// `base_dir` unset
pub fn print_base_dir(env: &Environment) -> Result<String, CoreError> {
    Ok(env.get("base_dir")?.to_string())
}

/// Local host configuration directory
#[must_use]
pub fn print_config_dir(env: &Environment) -> String {
    env.config_dir().display().to_string()
}

/// Repository location
///
/// # Errors
/// `git_uri` unset
pub fn print_git_creds(env: &Environment) -> Result<String, CoreError> {
    Ok(format!("Git URI: {}", env.get("git_uri")?))
}

/// Deployed branch
///
/// # Errors
/// `git_branch` unset
pub fn print_git_branch(env: &Environment) -> Result<String, CoreError> {
    Ok(format!("Git branch: {}", env.get("git_branch")?))
}

/// Database name, role and password
///
/// # Errors
/// Any of the `db_*` keys unset
pub fn print_db_creds(env: &Environment) -> Result<String, CoreError> {
    Ok(format!(
        "DATABASE_NAME: {}\nPOSTGRES_USER: {}\nPOSTGRES_PASSWORD: {}",
        env.get("db_name")?,
        env.get("db_user")?,
        env.get("db_password")?
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::EnvironmentBuilder;

    fn env() -> Environment {
        EnvironmentBuilder::new("/srv/deploy")
            .overrides([
                ("base_dir", "/data"),
                ("project_path", "app/services"),
                ("ve_dir", "ve"),
                ("templates_prefix", "acme"),
                ("git_uri", "git@example.org:acme/app.git"),
                ("git_branch", "main"),
                ("db_name", "acme"),
                ("db_user", "acme"),
                ("db_password", "s3cret"),
            ])
            .skip_key_resolution()
            .build()
            .unwrap()
    }

    #[test]
    fn test_print_reports() {
        let env = env();
        assert_eq!(print_base_dir(&env).unwrap(), "/data");
        assert_eq!(print_git_creds(&env).unwrap(), "Git URI: git@example.org:acme/app.git");
        assert_eq!(print_git_branch(&env).unwrap(), "Git branch: main");
        assert_eq!(
            print_db_creds(&env).unwrap(),
            "DATABASE_NAME: acme\nPOSTGRES_USER: acme\nPOSTGRES_PASSWORD: s3cret"
        );
    }

    #[test]
    fn test_print_env() {
        let env = env();
        assert_eq!(print_env(&env, Some("git_branch")).unwrap(), "main");
        assert!(print_env(&env, Some("nope")).is_err());

        let json: serde_json::Value = serde_json::from_str(&print_env(&env, None).unwrap()).unwrap();
        assert_eq!(json["db_name"], "acme");
    }
}

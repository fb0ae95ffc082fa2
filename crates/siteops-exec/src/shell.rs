//! Host shell: privileged/unprivileged, checked/unchecked execution with
//! scoped working directory and command prefixes

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tracing::{debug, info, instrument, warn};

use crate::error::ExecError;
use crate::result::CommandResult;
use crate::traits::RemoteExecutor;

const REBOOT_PROBE_INTERVAL: Duration = Duration::from_secs(5);
const REBOOT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const REBOOT_SETTLE: Duration = Duration::from_secs(15);

/// Who a command runs as
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Privilege {
    /// The connecting user
    User,
    /// root, through sudo
    Root,
    /// Another account, through `sudo -u`
    As(String),
}

impl Privilege {
    /// `Root` when `use_sudo`, `User` otherwise
    #[must_use]
    pub fn sudo_if(use_sudo: bool) -> Self {
        if use_sudo { Self::Root } else { Self::User }
    }
}

#[derive(Debug, Default)]
struct Scope {
    dirs: Vec<String>,
    prefixes: Vec<String>,
}

/// Command runner bound to one host
///
/// Every command is logged as `$ <command>` before it is sent. The
/// working directory and prefix stacks are changed only through the
/// guards returned by [`Shell::cd`] and [`Shell::prefix`].
pub struct Shell {
    host: String,
    executor: Arc<dyn RemoteExecutor>,
    sudo_password: Option<String>,
    command_timeout: Option<Duration>,
    scope: Mutex<Scope>,
}

impl std::fmt::Debug for Shell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shell")
            .field("host", &self.host)
            .field("executor", &self.executor.executor_type())
            .field("command_timeout", &self.command_timeout)
            .finish_non_exhaustive()
    }
}

impl Shell {
    /// Create a shell for `host` on top of `executor`
    pub fn new(host: impl Into<String>, executor: Arc<dyn RemoteExecutor>) -> Self {
        Self {
            host: host.into(),
            executor,
            sudo_password: None,
            command_timeout: None,
            scope: Mutex::new(Scope::default()),
        }
    }

    /// Feed this password to `sudo -S` instead of requiring passwordless sudo
    #[must_use]
    pub fn with_sudo_password(mut self, password: Option<String>) -> Self {
        self.sudo_password = password.filter(|p| !p.is_empty());
        self
    }

    /// Apply a timeout to every command
    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Host label this shell talks to
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Underlying executor
    #[must_use]
    pub fn executor(&self) -> &Arc<dyn RemoteExecutor> {
        &self.executor
    }

    fn scope(&self) -> MutexGuard<'_, Scope> {
        self.scope.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enter `path` for every command issued while the guard lives
    ///
    /// Relative paths resolve against the enclosing scope.
    #[must_use = "the directory scope ends when the guard is dropped"]
    pub fn cd(&self, path: impl AsRef<str>) -> DirGuard<'_> {
        let path = path.as_ref();
        let mut scope = self.scope();
        let resolved = match scope.dirs.last() {
            Some(parent) if !path.starts_with('/') && !path.starts_with('~') => {
                format!("{}/{}", parent.trim_end_matches('/'), path)
            }
            _ => path.to_string(),
        };
        scope.dirs.push(resolved);
        DirGuard { shell: self }
    }

    /// Run `command &&` before every command issued while the guard lives
    #[must_use = "the prefix scope ends when the guard is dropped"]
    pub fn prefix(&self, command: impl Into<String>) -> PrefixGuard<'_> {
        self.scope().prefixes.push(command.into());
        PrefixGuard { shell: self }
    }

    /// Current scoped working directory, if any
    #[must_use]
    pub fn current_dir(&self) -> Option<String> {
        self.scope().dirs.last().cloned()
    }

    /// Build the exact command line sent to the executor
    #[must_use]
    pub fn command_line(&self, command: &str, privilege: &Privilege) -> String {
        let inner = {
            let scope = self.scope();
            let mut parts = Vec::with_capacity(scope.prefixes.len() + 2);
            if let Some(dir) = scope.dirs.last() {
                parts.push(format!("cd {}", quote_path(dir)));
            }
            parts.extend(scope.prefixes.iter().cloned());
            parts.push(command.to_string());
            parts.join(" && ")
        };

        let user = match privilege {
            Privilege::User => return inner,
            Privilege::Root => String::new(),
            Privilege::As(user) => format!(" -u {}", quote(user)),
        };

        match &self.sudo_password {
            Some(password) => format!(
                "printf '%s\\n' {} | sudo -S -p '' -H{user} sh -c {}",
                quote(password),
                quote(&inner)
            ),
            None => format!("sudo -n -H{user} sh -c {}", quote(&inner)),
        }
    }

    /// Run a command and return its result whatever the exit status
    ///
    /// # Errors
    /// Only transport failures (connection, spawn, timeout)
    pub async fn exec(
        &self,
        command: &str,
        privilege: Privilege,
    ) -> Result<CommandResult, ExecError> {
        self.dispatch(command, command, privilege).await
    }

    #[instrument(skip(self, command, shown), fields(host = %self.host))]
    async fn dispatch(
        &self,
        command: &str,
        shown: &str,
        privilege: Privilege,
    ) -> Result<CommandResult, ExecError> {
        info!(privilege = ?privilege, "$ {shown}");
        let line = self.command_line(command, &privilege);

        let result = match self.command_timeout {
            Some(limit) => self.executor.run_with_timeout(&line, limit).await?,
            None => self.executor.run(&line).await?,
        };

        let output = result.combined_output();
        if !output.trim().is_empty() {
            debug!(status = result.status, "{}", output.trim_end());
        }
        Ok(result)
    }

    /// Run a command and fail on a non-zero exit status
    ///
    /// # Errors
    /// `ExecError::CommandFailed` carrying the command text and exit code
    pub async fn exec_check(
        &self,
        command: &str,
        privilege: Privilege,
    ) -> Result<CommandResult, ExecError> {
        self.checked(command, command, privilege).await
    }

    /// Checked execution of a command embedding `secret`; logs and errors
    /// show `****` in its place
    ///
    /// # Errors
    /// `ExecError::CommandFailed` on non-zero exit
    pub async fn exec_check_masked(
        &self,
        command: &str,
        secret: &str,
        privilege: Privilege,
    ) -> Result<CommandResult, ExecError> {
        let shown = if secret.is_empty() {
            command.to_string()
        } else {
            command.replace(secret, "****")
        };
        self.checked(command, &shown, privilege).await
    }

    async fn checked(
        &self,
        command: &str,
        shown: &str,
        privilege: Privilege,
    ) -> Result<CommandResult, ExecError> {
        let result = self.dispatch(command, shown, privilege).await?;
        if result.failed() {
            warn!(host = %self.host, command = %shown, status = result.status, "command failed");
            return Err(ExecError::CommandFailed {
                command: shown.to_string(),
                status: result.status,
                output: result.combined_output(),
            });
        }
        Ok(result)
    }

    /// Unchecked, as the connecting user
    ///
    /// # Errors
    /// Transport failures only
    pub async fn run(&self, command: &str) -> Result<CommandResult, ExecError> {
        self.exec(command, Privilege::User).await
    }

    /// Unchecked, as root
    ///
    /// # Errors
    /// Transport failures only
    pub async fn sudo(&self, command: &str) -> Result<CommandResult, ExecError> {
        self.exec(command, Privilege::Root).await
    }

    /// Unchecked, as `user`
    ///
    /// # Errors
    /// Transport failures only
    pub async fn sudo_as(&self, user: &str, command: &str) -> Result<CommandResult, ExecError> {
        self.exec(command, Privilege::As(user.to_string())).await
    }

    /// Checked, as the connecting user
    ///
    /// # Errors
    /// `ExecError::CommandFailed` on non-zero exit
    pub async fn run_check(&self, command: &str) -> Result<CommandResult, ExecError> {
        self.exec_check(command, Privilege::User).await
    }

    /// Checked, as root
    ///
    /// # Errors
    /// `ExecError::CommandFailed` on non-zero exit
    pub async fn sudo_check(&self, command: &str) -> Result<CommandResult, ExecError> {
        self.exec_check(command, Privilege::Root).await
    }

    /// Whether `path` exists on the host
    ///
    /// # Errors
    /// Transport failures only
    pub async fn exists(&self, path: &str, use_sudo: bool) -> Result<bool, ExecError> {
        let probe = format!("test -e {}", quote_path(path));
        Ok(self
            .exec(&probe, Privilege::sudo_if(use_sudo))
            .await?
            .success())
    }

    /// Read a remote file byte-for-byte; `None` when it does not exist
    ///
    /// # Errors
    /// Transport failures, or output that is not valid base64
    pub async fn read_file(&self, path: &str, use_sudo: bool) -> Result<Option<Vec<u8>>, ExecError> {
        let privilege = Privilege::sudo_if(use_sudo);
        let quoted = quote_path(path);
        let probe = self
            .exec(&format!("test -f {quoted}"), privilege.clone())
            .await?;
        if probe.failed() {
            return Ok(None);
        }

        let encoded = self
            .exec_check(&format!("base64 {quoted}"), privilege)
            .await?;
        let compact: String = encoded
            .stdout
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        STANDARD
            .decode(compact)
            .map(Some)
            .map_err(|e| ExecError::TransferFailed {
                path: path.to_string(),
                reason: e.to_string(),
            })
    }

    /// Replace a remote file with `content`
    ///
    /// # Errors
    /// `ExecError::CommandFailed` if the file cannot be written
    pub async fn write_file(
        &self,
        path: &str,
        content: &[u8],
        use_sudo: bool,
    ) -> Result<(), ExecError> {
        let command = format!(
            "printf '%s' '{}' | base64 -d > {}",
            STANDARD.encode(content),
            quote_path(path)
        );
        self.exec_check(&command, Privilege::sudo_if(use_sudo))
            .await?;
        Ok(())
    }

    /// Copy a remote file to `local_path`
    ///
    /// # Errors
    /// `ExecError::TransferFailed` when the remote file is missing or the
    /// local write fails
    pub async fn download(&self, remote_path: &str, local_path: &Path) -> Result<(), ExecError> {
        let content = self
            .read_file(remote_path, false)
            .await?
            .ok_or_else(|| ExecError::TransferFailed {
                path: remote_path.to_string(),
                reason: "remote file does not exist".to_string(),
            })?;

        tokio::fs::write(local_path, &content)
            .await
            .map_err(|e| ExecError::TransferFailed {
                path: local_path.display().to_string(),
                reason: e.to_string(),
            })?;

        info!(
            host = %self.host,
            remote = %remote_path,
            local = %local_path.display(),
            bytes = content.len(),
            "downloaded file"
        );
        Ok(())
    }

    /// `mkdir -p` then hand the tree to `owner:group`
    ///
    /// # Errors
    /// `ExecError::CommandFailed` if either step fails
    pub async fn mkdir(
        &self,
        path: &str,
        owner: &str,
        group: &str,
        use_sudo: bool,
    ) -> Result<(), ExecError> {
        let quoted = quote_path(path);
        self.exec_check(&format!("mkdir -p {quoted}"), Privilege::sudo_if(use_sudo))
            .await?;
        self.sudo_check(&format!("chown -R {owner}:{group} {quoted}"))
            .await?;
        Ok(())
    }

    /// Reboot the host and wait for it to answer again
    ///
    /// # Errors
    /// `ExecError::Timeout` if the host is not back within `wait`
    #[instrument(skip(self), fields(host = %self.host))]
    pub async fn reboot(&self, wait: Duration) -> Result<(), ExecError> {
        info!("rebooting host");

        // the session usually dies before an exit status arrives
        if let Err(e) = self.sudo("reboot").await {
            debug!(error = %e, "reboot command lost its connection");
        }
        self.executor.reset().await;

        let deadline = Instant::now() + wait;
        tokio::time::sleep(REBOOT_SETTLE.min(wait)).await;

        loop {
            match self
                .executor
                .run_with_timeout("true", REBOOT_PROBE_TIMEOUT)
                .await
            {
                Ok(result) if result.success() => {
                    info!("host is back");
                    return Ok(());
                }
                Ok(result) => debug!(status = result.status, "host not ready"),
                Err(e) => debug!(error = %e, "host not reachable yet"),
            }

            if Instant::now() >= deadline {
                return Err(ExecError::Timeout { timeout: wait });
            }
            self.executor.reset().await;
            tokio::time::sleep(REBOOT_PROBE_INTERVAL).await;
        }
    }
}

/// Leaves the directory scope it was created for
#[derive(Debug)]
pub struct DirGuard<'a> {
    shell: &'a Shell,
}

impl Drop for DirGuard<'_> {
    fn drop(&mut self) {
        self.shell.scope().dirs.pop();
    }
}

/// Leaves the prefix scope it was created for
#[derive(Debug)]
pub struct PrefixGuard<'a> {
    shell: &'a Shell,
}

impl Drop for PrefixGuard<'_> {
    fn drop(&mut self) {
        self.shell.scope().prefixes.pop();
    }
}

/// Single-quote `value` for `sh` unless it is made of safe characters only
#[must_use]
pub fn quote(value: &str) -> String {
    let safe = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-+=:,@%".contains(c));
    if safe {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

/// Like [`quote`], but keeps a leading `~/` outside the quotes so the
/// remote shell still expands it
#[must_use]
pub fn quote_path(path: &str) -> String {
    match path.strip_prefix("~/") {
        Some(rest) if !rest.is_empty() => format!("~/{}", quote(rest)),
        _ if path == "~" => path.to_string(),
        _ => quote(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Recorder {
        calls: Mutex<Vec<String>>,
        status: i32,
        stdout: String,
    }

    impl Recorder {
        fn new(status: i32, stdout: &str) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                status,
                stdout: stdout.to_string(),
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RemoteExecutor for Recorder {
        async fn run(&self, cmd: &str) -> Result<CommandResult, ExecError> {
            self.calls.lock().unwrap().push(cmd.to_string());
            Ok(CommandResult {
                status: self.status,
                stdout: self.stdout.clone(),
                ..CommandResult::default()
            })
        }

        async fn run_with_timeout(
            &self,
            cmd: &str,
            _timeout: Duration,
        ) -> Result<CommandResult, ExecError> {
            self.run(cmd).await
        }

        fn executor_type(&self) -> &'static str {
            "recorder"
        }
    }

    #[tokio::test]
    async fn test_run_check_success_returns_output() {
        let recorder = Recorder::new(0, "deployed\n");
        let shell = Shell::new("web1", recorder.clone());

        let result = shell.run_check("echo deployed").await.unwrap();
        assert_eq!(result.text(), "deployed");
        assert_eq!(recorder.calls(), vec!["echo deployed"]);
    }

    #[tokio::test]
    async fn test_run_check_failure_carries_command_and_code() {
        let recorder = Recorder::new(3, "");
        let shell = Shell::new("web1", recorder);

        let err = shell.run_check("git fetch").await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("git fetch"));
        assert!(message.contains('3'));
        assert_eq!(err.exit_status(), Some(3));
    }

    #[tokio::test]
    async fn test_masked_failure_hides_secret() {
        let recorder = Recorder::new(1, "");
        let shell = Shell::new("db1", recorder.clone());

        let err = shell
            .exec_check_masked("PGPASSWORD=hunter2 pg_dump app", "hunter2", Privilege::User)
            .await
            .unwrap_err();

        assert_eq!(
            err.to_string(),
            "Fail in command: PGPASSWORD=**** pg_dump app . Exit code: 1"
        );
        assert_eq!(recorder.calls(), vec!["PGPASSWORD=hunter2 pg_dump app"]);
    }

    #[tokio::test]
    async fn test_unchecked_run_reports_failure_flag() {
        let recorder = Recorder::new(1, "");
        let shell = Shell::new("web1", recorder);

        let result = shell.run("false").await.unwrap();
        assert!(result.failed());
    }

    #[tokio::test]
    async fn test_cd_scope_is_restored() {
        let recorder = Recorder::new(0, "");
        let shell = Shell::new("web1", recorder.clone());

        {
            let _dir = shell.cd("/srv/app");
            shell.run("ls").await.unwrap();
            {
                let _inner = shell.cd("static");
                shell.run("ls").await.unwrap();
            }
            shell.run("pwd").await.unwrap();
        }
        shell.run("pwd").await.unwrap();

        assert_eq!(
            recorder.calls(),
            vec![
                "cd /srv/app && ls",
                "cd /srv/app/static && ls",
                "cd /srv/app && pwd",
                "pwd",
            ]
        );
        assert_eq!(shell.current_dir(), None);
    }

    #[tokio::test]
    async fn test_cd_scope_restored_on_error() {
        let recorder = Recorder::new(2, "");
        let shell = Shell::new("web1", recorder);

        async fn failing(shell: &Shell) -> Result<(), ExecError> {
            let _dir = shell.cd("/tmp/build");
            shell.run_check("make").await?;
            Ok(())
        }

        assert!(failing(&shell).await.is_err());
        assert_eq!(shell.current_dir(), None);
    }

    #[test]
    fn test_sudo_wrapping() {
        let shell = Shell::new("web1", Recorder::new(0, ""));
        let _dir = shell.cd("/srv/app");
        let _venv = shell.prefix("source /srv/ve/bin/activate");

        let line = shell.command_line("pip freeze", &Privilege::Root);
        assert_eq!(
            line,
            "sudo -n -H sh -c 'cd /srv/app && source /srv/ve/bin/activate && pip freeze'"
        );

        let line = shell.command_line("psql -c 'SELECT 1'", &Privilege::As("postgres".into()));
        assert!(line.starts_with("sudo -n -H -u postgres sh -c "));
        assert!(line.contains(r"'\''SELECT 1'\''"));
    }

    #[test]
    fn test_sudo_password_is_piped() {
        let shell =
            Shell::new("web1", Recorder::new(0, "")).with_sudo_password(Some("s3cret".into()));
        let line = shell.command_line("whoami", &Privilege::Root);
        assert_eq!(line, "printf '%s\\n' s3cret | sudo -S -p '' -H sh -c whoami");
    }

    #[tokio::test]
    async fn test_read_file_missing() {
        let recorder = Recorder::new(1, "");
        let shell = Shell::new("web1", recorder.clone());

        let content = shell.read_file("/etc/nginx/x.conf", false).await.unwrap();
        assert!(content.is_none());
        assert_eq!(recorder.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_read_file_decodes_base64() {
        let recorder = Recorder::new(0, "aGVsbG8K\n");
        let shell = Shell::new("web1", recorder);

        let content = shell.read_file("/tmp/x", false).await.unwrap();
        assert_eq!(content.as_deref(), Some(b"hello\n".as_slice()));
    }

    #[tokio::test]
    async fn test_write_file_encodes_content() {
        let recorder = Recorder::new(0, "");
        let shell = Shell::new("web1", recorder.clone());

        shell.write_file("/tmp/x", b"hello\n", false).await.unwrap();
        assert_eq!(
            recorder.calls(),
            vec!["printf '%s' 'aGVsbG8K' | base64 -d > /tmp/x"]
        );
    }

    #[tokio::test]
    async fn test_reboot_returns_when_host_answers() {
        let recorder = Recorder::new(0, "");
        let shell = Shell::new("web1", recorder.clone());

        shell.reboot(Duration::ZERO).await.unwrap();
        assert_eq!(recorder.calls(), vec!["sudo -n -H sh -c reboot", "true"]);
    }

    #[test]
    fn test_quote() {
        assert_eq!(quote("/srv/app"), "/srv/app");
        assert_eq!(quote("it's"), r"'it'\''s'");
        assert_eq!(quote(""), "''");
        assert_eq!(quote_path("~/run.sh"), "~/run.sh");
        assert_eq!(quote_path("~/my dir"), "~/'my dir'");
    }
}

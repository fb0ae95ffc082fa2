//! Command table
//!
//! Every task the CLI exposes is an entry here: a name, a one-line
//! description, its parameter names and a handler function. Invocations
//! follow `name[:arg,...,key=value]`; a backslash escapes `,` and `=`.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::str::FromStr;

use futures::future::LocalBoxFuture;

use crate::deploy::Deployer;
use crate::env::{Environment, parse_bool};
use crate::error::CoreError;
use crate::ops;

/// What a handler prints on success, if anything
pub type TaskResult = Result<Option<String>, CoreError>;

/// Future returned by remote handlers
pub type TaskFuture<'a> = LocalBoxFuture<'a, TaskResult>;

/// Handler that only reads the environment
pub type LocalHandler = fn(&Environment, &TaskArgs) -> TaskResult;

/// Handler that talks to a host
pub type RemoteHandler = for<'a> fn(&'a Deployer, &'a TaskArgs) -> TaskFuture<'a>;

/// Handler kind
#[derive(Clone, Copy)]
pub enum Handler {
    /// Reads the environment only; no host connection
    Local(LocalHandler),
    /// Drives a [`Deployer`] bound to one host
    Remote(RemoteHandler),
}

/// One command table entry
#[derive(Clone, Copy)]
pub struct Task {
    /// Name used on the command line
    pub name: &'static str,
    /// One-line summary shown by `--list`
    pub about: &'static str,
    /// Parameter names, positional order
    pub params: &'static [&'static str],
    /// What running the task calls
    pub handler: Handler,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("local", &self.is_local())
            .finish_non_exhaustive()
    }
}

impl Task {
    /// Whether the task runs without a host connection
    #[must_use]
    pub fn is_local(&self) -> bool {
        matches!(self.handler, Handler::Local(_))
    }

    /// `name:param,...` usage line
    #[must_use]
    pub fn usage(&self) -> String {
        if self.params.is_empty() {
            self.name.to_string()
        } else {
            format!("{}:{}", self.name, self.params.join(","))
        }
    }

    /// Run against a host
    ///
    /// # Errors
    /// Whatever the handler returns
    pub async fn run(&self, deployer: &Deployer, args: &TaskArgs) -> TaskResult {
        match self.handler {
            Handler::Local(handler) => handler(deployer.env(), args),
            Handler::Remote(handler) => handler(deployer, args).await,
        }
    }

    /// Run a local task without any host
    ///
    /// # Errors
    /// `CoreError::BadArgument` for a remote task, otherwise the handler's error
    pub fn run_local(&self, env: &Environment, args: &TaskArgs) -> TaskResult {
        match self.handler {
            Handler::Local(handler) => handler(env, args),
            Handler::Remote(_) => Err(CoreError::BadArgument {
                task: self.name.to_string(),
                message: "needs a host".to_string(),
            }),
        }
    }
}

/// Arguments of one task invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskArgs {
    task: String,
    positional: Vec<String>,
    named: BTreeMap<String, String>,
}

impl TaskArgs {
    /// Arguments for `task`
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            ..Self::default()
        }
    }

    /// Append a positional argument
    #[must_use]
    pub fn arg(mut self, value: impl Into<String>) -> Self {
        self.positional.push(value.into());
        self
    }

    /// Set a named argument
    #[must_use]
    pub fn named(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.named.insert(key.into(), value.into());
        self
    }

    /// Named argument `name`, else positional `index`
    #[must_use]
    pub fn get(&self, index: usize, name: &str) -> Option<&str> {
        self.named
            .get(name)
            .or_else(|| self.positional.get(index))
            .map(String::as_str)
    }

    /// Like [`TaskArgs::get`], failing when absent or empty
    ///
    /// # Errors
    /// `CoreError::BadArgument`
    pub fn require(&self, index: usize, name: &str) -> Result<&str, CoreError> {
        self.get(index, name)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| self.bad(format!("missing argument `{name}`")))
    }

    /// Boolean argument with a default
    ///
    /// # Errors
    /// `CoreError::BadArgument` for values other than true/false/1/0/yes/no
    pub fn flag(&self, index: usize, name: &str, default: bool) -> Result<bool, CoreError> {
        match self.get(index, name) {
            None | Some("") => Ok(default),
            Some(raw) => {
                parse_bool(raw).ok_or_else(|| self.bad(format!("`{name}` is not a boolean: {raw}")))
            }
        }
    }

    /// Whitespace separated list argument
    #[must_use]
    pub fn list(&self, index: usize, name: &str) -> Option<Vec<String>> {
        self.get(index, name)
            .map(|v| v.split_whitespace().map(str::to_string).collect())
    }

    /// Positional arguments from `index` on, re-joined with commas
    ///
    /// Lets free-form commands containing commas pass through unescaped.
    #[must_use]
    pub fn rest(&self, index: usize, name: &str) -> Option<String> {
        if let Some(value) = self.named.get(name) {
            return Some(value.clone());
        }
        (index < self.positional.len()).then(|| self.positional[index..].join(","))
    }

    fn bad(&self, message: String) -> CoreError {
        CoreError::BadArgument {
            task: self.task.clone(),
            message,
        }
    }
}

/// A parsed `name[:args]` word from the command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInvocation {
    pub name: String,
    pub args: TaskArgs,
}

impl FromStr for TaskInvocation {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, raw_args) = s.split_once(':').unwrap_or((s, ""));
        let name = name.trim();
        if name.is_empty() {
            return Err(CoreError::UnknownTask(s.to_string()));
        }

        let mut args = TaskArgs::new(name);
        if !raw_args.is_empty() {
            for word in split_unescaped(raw_args, ',') {
                if let Some((key, value)) = split_named(&word) {
                    args.named.insert(key, value);
                } else {
                    args.positional.push(unescape(&word));
                }
            }
        }

        Ok(Self {
            name: name.to_string(),
            args,
        })
    }
}

/// Split on `sep` unless preceded by a backslash; escapes are kept
fn split_unescaped(input: &str, sep: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut chars = input.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                current.push(c);
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            c if c == sep => parts.push(std::mem::take(&mut current)),
            c => current.push(c),
        }
    }
    parts.push(current);
    parts
}

/// `key=value` with an identifier key and an unescaped `=`
fn split_named(word: &str) -> Option<(String, String)> {
    let mut parts = split_unescaped(word, '=').into_iter();
    let key = parts.next()?;
    let rest: Vec<String> = parts.collect();
    if rest.is_empty()
        || key.is_empty()
        || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return None;
    }
    Some((key, unescape(&rest.join("="))))
}

fn unescape(word: &str) -> String {
    let mut out = String::with_capacity(word.len());
    let mut chars = word.chars();
    while let Some(c) = chars.next() {
        match (c, chars.clone().next()) {
            ('\\', Some(next @ (',' | '=' | '\\'))) => {
                out.push(next);
                chars.next();
            }
            _ => out.push(c),
        }
    }
    out
}

fn remote<'a>(future: impl Future<Output = TaskResult> + 'a) -> TaskFuture<'a> {
    Box::pin(future)
}

fn done<T>(_: T) -> TaskResult {
    Ok(None)
}

fn output(text: impl Into<String>) -> TaskResult {
    Ok(Some(text.into()))
}

macro_rules! remote_task {
    ($name:literal, $about:literal, [$($param:literal),*], |$d:ident, $a:ident| $body:expr) => {
        Task {
            name: $name,
            about: $about,
            params: &[$($param),*],
            handler: Handler::Remote(|$d, $a| remote(async move { $body })),
        }
    };
}

macro_rules! local_task {
    ($name:literal, $about:literal, [$($param:literal),*], |$e:ident, $a:ident| $body:expr) => {
        Task {
            name: $name,
            about: $about,
            params: &[$($param),*],
            handler: Handler::Local(|$e, $a| $body),
        }
    };
}

/// Name → task lookup built once at startup
#[derive(Debug, Clone)]
pub struct TaskRegistry {
    tasks: BTreeMap<&'static str, Task>,
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl TaskRegistry {
    /// Registry holding every built-in task
    #[must_use]
    pub fn builtin() -> Self {
        let tasks = builtin_tasks().into_iter().map(|t| (t.name, t)).collect();
        Self { tasks }
    }

    /// Look up a task
    ///
    /// # Errors
    /// `CoreError::UnknownTask`
    pub fn get(&self, name: &str) -> Result<&Task, CoreError> {
        self.tasks
            .get(name)
            .ok_or_else(|| CoreError::UnknownTask(name.to_string()))
    }

    /// Tasks sorted by name
    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    /// Number of tasks
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether the registry is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Parse and look up every word before anything runs
    ///
    /// # Errors
    /// The first unknown task name
    pub fn resolve<S: AsRef<str>>(
        &self,
        words: &[S],
    ) -> Result<Vec<(&Task, TaskArgs)>, CoreError> {
        words
            .iter()
            .map(|word| {
                let invocation: TaskInvocation = word.as_ref().parse()?;
                let task = self.get(&invocation.name)?;
                Ok((task, invocation.args))
            })
            .collect()
    }

    /// Aligned `usage  description` listing
    #[must_use]
    pub fn listing(&self) -> String {
        let width = self.iter().map(|t| t.usage().len()).max().unwrap_or(0);
        self.iter()
            .map(|t| format!("    {:width$}  {}", t.usage(), t.about))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[allow(clippy::too_many_lines)]
fn builtin_tasks() -> Vec<Task> {
    vec![
        // procedures
        remote_task!("setup_new_app_instance", "Set up a new app instance from a base Ubuntu image", ["install_project"], |d, a| {
            d.setup_new_app_instance(a.flag(0, "install_project", false)?).await.and_then(done)
        }),
        remote_task!("install_project_files", "Clone the project and bring every service up", [], |d, _a| {
            d.install_project_files().await.and_then(done)
        }),
        remote_task!("deploy", "Full redeploy: stop, pull, install, migrate, start", ["upload_templates"], |d, a| {
            d.deploy(a.flag(0, "upload_templates", false)?).await.and_then(done)
        }),
        remote_task!("deploy1", "Fast redeploy: pull and restart", [], |d, _a| {
            d.deploy_fast().await.and_then(done)
        }),
        remote_task!("start", "Start nginx, uwsgi and celery", [], |d, _a| d.start().await.and_then(done)),
        remote_task!("stop", "Stop nginx, uwsgi and celery", [], |d, _a| d.stop().await.and_then(done)),
        remote_task!("restart", "Stop then start every service", [], |d, _a| d.restart().await.and_then(done)),
        remote_task!("git_clone", "Clone the repository into base_dir", ["recreate"], |d, a| {
            d.git_clone(a.flag(0, "recreate", true)?).await.and_then(done)
        }),
        remote_task!("git_pull", "Pull a branch (default git_branch)", ["branch"], |d, a| {
            d.git_pull(a.get(0, "branch")).await.and_then(done)
        }),
        remote_task!("create_dirs", "Create static, media and log paths", [], |d, _a| {
            d.create_dirs().await.and_then(done)
        }),
        remote_task!("create_base_directory", "Create base_dir and the virtualenv", ["clean"], |d, a| {
            d.create_base_directory(a.flag(0, "clean", false)?).await.and_then(done)
        }),
        remote_task!("manage", "Run a manage.py command", ["cmd"], |d, a| {
            let command = a.rest(0, "cmd").filter(|c| !c.is_empty());
            let command = command.ok_or_else(|| a.bad("missing argument `cmd`".to_string()))?;
            d.manage(&command).await.and_then(done)
        }),
        remote_task!("create_superuser", "Create the admin account", [], |d, _a| {
            d.create_superuser().await.and_then(done)
        }),
        // provisioning
        remote_task!("debian_update", "Refresh the apt cache", [], |d, _a| d.debian_update().await.and_then(done)),
        remote_task!("debian_install", "Install OS requirement lists", ["packages", "update_cache"], |d, a| {
            let packages = a.list(0, "packages").unwrap_or_default();
            d.debian_install(&packages, a.flag(1, "update_cache", true)?).await.and_then(done)
        }),
        remote_task!("debian_upgrade", "Upgrade every OS package", [], |d, _a| {
            d.debian_upgrade().await.and_then(done)
        }),
        remote_task!("debian_upgrade_reboot", "Upgrade, rebooting when required", [], |d, _a| {
            d.debian_upgrade_reboot().await.and_then(done)
        }),
        remote_task!("python_install", "Install Python requirement lists", ["upgrade"], |d, a| {
            d.python_install(a.flag(0, "upgrade", false)?).await.and_then(done)
        }),
        remote_task!("install_packages", "Install a requirement list with a custom command", ["install_command", "requirements_filename", "packages", "use_sudo"], |d, a| {
            let packages = a.list(2, "packages").unwrap_or_default();
            d.install_packages(
                a.require(0, "install_command")?,
                a.require(1, "requirements_filename")?,
                &packages,
                a.flag(3, "use_sudo", false)?,
            )
            .await
            .and_then(done)
        }),
        remote_task!("locales_install", "Generate en_US locales", [], |d, _a| d.locales_install().await.and_then(done)),
        remote_task!("postgres_create", "Create the database role and database", [], |d, _a| {
            d.postgres_create().await.and_then(done)
        }),
        remote_task!("init_daemon_install", "Switch upstart to systemd", [], |d, _a| {
            d.init_daemon_install().await.and_then(done)
        }),
        remote_task!("uwsgi_install", "Install the pinned uWSGI release", ["launch"], |d, a| {
            d.uwsgi_install(a.flag(0, "launch", false)?).await.and_then(done)
        }),
        remote_task!("yuglify_install", "Install yuglify", [], |d, _a| d.yuglify_install().await.and_then(done)),
        remote_task!("java_install", "Install Java 8", [], |d, _a| d.java_install().await.and_then(done)),
        remote_task!("redis_install", "Build and start Redis", [], |d, _a| d.redis_install().await.and_then(done)),
        remote_task!("elasticsearch_install", "Install and start Elasticsearch", [], |d, _a| {
            d.elasticsearch_install().await.and_then(done)
        }),
        remote_task!("ssl_install", "Request a letsencrypt certificate", [], |d, _a| d.ssl_install().await.and_then(done)),
        remote_task!("nltk_download", "Download NLTK corpora", [], |d, _a| d.nltk_download().await.and_then(done)),
        // templates
        remote_task!("upload_template_and_reload", "Upload one template if changed", ["name"], |d, a| {
            let outcome = d
                .templates()
                .upload_template_and_reload(d.shell(), a.require(0, "name")?)
                .await?;
            output(outcome.to_string())
        }),
        remote_task!("upload_templates", "Upload templates (default: all)", ["names"], |d, a| {
            let names = a.list(0, "names");
            let names: Option<Vec<&str>> = names.as_ref().map(|n| n.iter().map(String::as_str).collect());
            let outcomes = d.templates().upload_templates(d.shell(), names.as_deref()).await?;
            output(
                outcomes
                    .iter()
                    .map(|(name, outcome)| format!("{name}: {outcome}"))
                    .collect::<Vec<_>>()
                    .join("\n"),
            )
        }),
        // services
        remote_task!("status_service", "systemctl status", ["name"], |d, a| {
            output(d.services().status(a.require(0, "name")?).await?)
        }),
        remote_task!("is_active", "Whether a service is active", ["name"], |d, a| {
            output(d.services().is_active(a.require(0, "name")?).await?.to_string())
        }),
        remote_task!("start_service", "Start a service unless active", ["name"], |d, a| {
            d.services().start(a.require(0, "name")?).await?;
            done(())
        }),
        remote_task!("stop_service", "Stop a service if active", ["name"], |d, a| {
            d.services().stop(a.require(0, "name")?).await?;
            done(())
        }),
        remote_task!("restart_service", "Restart a service, starting it if inactive", ["name"], |d, a| {
            d.services().restart(a.require(0, "name")?).await?;
            done(())
        }),
        remote_task!("start_celery", "Start the celery workers", [], |d, _a| d.workers().start().await.and_then(done)),
        remote_task!("stop_celery", "Stop the celery workers", [], |d, _a| d.workers().stop().await.and_then(done)),
        remote_task!("status_celery", "Registered and active celery tasks", [], |d, _a| {
            output(d.workers().status().await?)
        }),
        remote_task!("purge_celery", "Drop every queued celery task", [], |d, _a| d.workers().purge().await.and_then(done)),
        remote_task!("start_redis", "Start Redis", [], |d, _a| d.start_redis().await.and_then(done)),
        remote_task!("stop_redis", "Stop Redis", [], |d, _a| d.stop_redis().await.and_then(done)),
        // shell access
        remote_task!("run", "Run a command as the login user", ["command"], |d, a| {
            let command = a.rest(0, "command").unwrap_or_default();
            output(d.shell().run_check(&command).await?.stdout)
        }),
        remote_task!("sudo", "Run a command as root", ["command"], |d, a| {
            let command = a.rest(0, "command").unwrap_or_default();
            output(d.shell().sudo_check(&command).await?.stdout)
        }),
        remote_task!("kill", "pkill -f a process pattern", ["process_name"], |d, a| {
            d.kill(a.require(0, "process_name")?).await.and_then(done)
        }),
        remote_task!("kill_tika", "Kill the Tika server", [], |d, _a| d.kill_tika().await.and_then(done)),
        // keys and backups
        remote_task!("create_ssh_keys", "Create the host deploy key", [], |d, _a| {
            output(d.create_ssh_keys().await?)
        }),
        remote_task!("print_ssh_key", "Print the host deploy key", [], |d, _a| {
            output(d.print_ssh_key().await?)
        }),
        remote_task!("ssh_agent_remove_key", "Remove the deploy key from ssh-agent", [], |d, _a| {
            d.ssh_agent_remove_key().await.and_then(done)
        }),
        remote_task!("get_db_backup", "Dump the database into config_dir", [], |d, _a| {
            let path = d.get_db_backup().await?;
            output(path.display().to_string())
        }),
        // local reports
        local_task!("print_env", "Print the environment or one key", ["attr_name"], |e, a| {
            ops::print_env(e, a.get(0, "attr_name")).map(Some)
        }),
        local_task!("print_base_dir", "Print base_dir", [], |e, _a| ops::print_base_dir(e).map(Some)),
        local_task!("print_config_dir", "Print config_dir", [], |e, _a| output(ops::print_config_dir(e))),
        local_task!("print_git_creds", "Print the repository URI", [], |e, _a| ops::print_git_creds(e).map(Some)),
        local_task!("print_git_branch", "Print the deployed branch", [], |e, _a| ops::print_git_branch(e).map(Some)),
        local_task!("print_db_creds", "Print database credentials", [], |e, _a| ops::print_db_creds(e).map(Some)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_invocation() {
        let inv: TaskInvocation = "deploy".parse().unwrap();
        assert_eq!(inv.name, "deploy");
        assert_eq!(inv.args, TaskArgs::new("deploy"));

        let inv: TaskInvocation = "git_pull:develop".parse().unwrap();
        assert_eq!(inv.args.get(0, "branch"), Some("develop"));

        let inv: TaskInvocation = "debian_install:update_cache=no,packages=vim htop".parse().unwrap();
        assert!(!inv.args.flag(1, "update_cache", true).unwrap());
        assert_eq!(
            inv.args.list(0, "packages"),
            Some(vec!["vim".to_string(), "htop".to_string()])
        );
    }

    #[test]
    fn test_escapes() {
        let inv: TaskInvocation = r"run:echo a\,b,c".parse().unwrap();
        assert_eq!(inv.args.rest(0, "command").as_deref(), Some("echo a,b,c"));

        let inv: TaskInvocation = r"sudo:FOO\=1 env".parse().unwrap();
        assert_eq!(inv.args.get(0, "command"), Some("FOO=1 env"));
    }

    #[test]
    fn test_flags() {
        let args = TaskArgs::new("deploy").arg("yes");
        assert!(args.flag(0, "upload_templates", false).unwrap());
        assert!(TaskArgs::new("deploy").flag(0, "x", true).unwrap());

        let err = TaskArgs::new("deploy").arg("maybe").flag(0, "upload_templates", false);
        assert!(matches!(err, Err(CoreError::BadArgument { .. })));
    }

    #[test]
    fn test_require() {
        let args = TaskArgs::new("kill");
        let err = args.require(0, "process_name").unwrap_err();
        assert_eq!(err.to_string(), "task kill: missing argument `process_name`");

        let args = args.named("process_name", "celery");
        assert_eq!(args.require(0, "process_name").unwrap(), "celery");
    }

    #[test]
    fn test_registry_covers_command_surface() {
        let registry = TaskRegistry::builtin();
        for name in [
            "setup_new_app_instance", "install_project_files", "deploy", "deploy1", "start",
            "stop", "restart", "git_clone", "git_pull", "create_dirs", "create_base_directory",
            "debian_install", "debian_update", "debian_upgrade", "debian_upgrade_reboot",
            "python_install", "install_packages", "locales_install", "postgres_create",
            "init_daemon_install", "uwsgi_install", "yuglify_install", "java_install",
            "redis_install", "elasticsearch_install", "ssl_install", "nltk_download",
            "create_superuser", "manage", "upload_template_and_reload", "upload_templates",
            "status_service", "is_active", "start_service", "stop_service", "restart_service",
            "start_celery", "stop_celery", "status_celery", "purge_celery", "start_redis",
            "stop_redis", "run", "sudo", "create_ssh_keys", "print_ssh_key",
            "ssh_agent_remove_key", "print_env", "print_base_dir", "print_config_dir",
            "print_git_creds", "print_git_branch", "print_db_creds", "get_db_backup", "kill",
            "kill_tika",
        ] {
            assert!(registry.get(name).is_ok(), "missing task {name}");
        }
        assert_eq!(registry.len(), builtin_tasks().len(), "duplicate task names");
    }

    #[test]
    fn test_unknown_task_rejected_before_running() {
        let registry = TaskRegistry::builtin();
        let err = registry.resolve(&["deploy", "frobnicate:1"]).unwrap_err();
        assert!(matches!(err, CoreError::UnknownTask(name) if name == "frobnicate"));
    }

    #[test]
    fn test_local_tasks() {
        let registry = TaskRegistry::builtin();
        assert!(registry.get("print_env").unwrap().is_local());
        assert!(!registry.get("deploy").unwrap().is_local());
        assert_eq!(registry.get("git_pull").unwrap().usage(), "git_pull:branch");
        assert!(registry.listing().contains("deploy1"));
    }
}

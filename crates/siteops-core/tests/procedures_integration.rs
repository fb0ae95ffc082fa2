use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

use siteops_core::*;
use siteops_exec::{CommandResult, ExecError, RemoteExecutor, Shell};

/// Minimal stand-in for a host: tracks active systemd units and a few
/// readable files, records every command line it receives
#[derive(Default)]
struct FakeHost {
    calls: Mutex<Vec<String>>,
    active: Mutex<HashSet<String>>,
    files: Mutex<HashMap<String, String>>,
    replies: Vec<(String, String)>,
    fail_on: Vec<String>,
}

impl FakeHost {
    fn new() -> Self {
        Self::default()
    }

    fn failing_on(mut self, pattern: &str) -> Self {
        self.fail_on.push(pattern.to_string());
        self
    }

    fn replying(mut self, pattern: &str, stdout: &str) -> Self {
        self.replies.push((pattern.to_string(), stdout.to_string()));
        self
    }

    fn with_active(self, unit: &str) -> Self {
        self.active.lock().unwrap().insert(unit.to_string());
        self
    }

    fn with_file(self, path: &str, content: &str) -> Self {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), STANDARD.encode(content));
        self
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn count(&self, pattern: &str) -> usize {
        self.calls().iter().filter(|c| c.contains(pattern)).count()
    }

    fn position(&self, pattern: &str) -> usize {
        self.calls()
            .iter()
            .position(|c| c.contains(pattern))
            .unwrap_or_else(|| panic!("no command containing {pattern:?}"))
    }
}

/// Argument following `marker`, up to the closing quote of `sh -c '...'`
fn operand<'a>(cmd: &'a str, marker: &str) -> Option<&'a str> {
    let start = cmd.find(marker)? + marker.len();
    let rest = &cmd[start..];
    Some(rest.split(['\'', ' ']).next().unwrap_or(rest))
}

fn reply(status: i32, stdout: impl Into<String>) -> CommandResult {
    CommandResult {
        status,
        stdout: stdout.into(),
        stderr: String::new(),
        duration: Duration::from_millis(1),
    }
}

#[async_trait]
impl RemoteExecutor for FakeHost {
    async fn run(&self, cmd: &str) -> Result<CommandResult, ExecError> {
        self.calls.lock().unwrap().push(cmd.to_string());

        if self.fail_on.iter().any(|f| cmd.contains(f.as_str())) {
            return Ok(reply(1, ""));
        }
        if let Some((_, stdout)) = self.replies.iter().find(|(p, _)| cmd.contains(p.as_str())) {
            return Ok(reply(0, stdout.clone()));
        }

        if let Some(unit) = operand(cmd, "systemctl is-active ") {
            let active = self.active.lock().unwrap().contains(unit);
            return Ok(if active {
                reply(0, "active\n")
            } else {
                reply(3, "inactive\n")
            });
        }
        for action in ["start", "restart"] {
            if let Some(unit) = operand(cmd, &format!("systemctl {action} ")) {
                self.active.lock().unwrap().insert(unit.to_string());
            }
        }
        if let Some(unit) = operand(cmd, "systemctl stop ") {
            self.active.lock().unwrap().remove(unit);
        }

        if let Some(path) = operand(cmd, "test -f ") {
            let present = self.files.lock().unwrap().contains_key(path);
            return Ok(reply(if present { 0 } else { 1 }, ""));
        }
        if !cmd.contains("base64 -d") {
            if let Some(path) = operand(cmd, "base64 ") {
                let content = self.files.lock().unwrap().get(path).cloned();
                return Ok(content.map_or_else(|| reply(1, ""), |c| reply(0, c)));
            }
        }

        Ok(reply(0, ""))
    }

    async fn run_with_timeout(
        &self,
        cmd: &str,
        _timeout: Duration,
    ) -> Result<CommandResult, ExecError> {
        self.run(cmd).await
    }

    fn executor_type(&self) -> &'static str {
        "fake"
    }
}

const UWSGI_INI: &str = "[uwsgi]\nmodule = %(templates_prefix)s.wsgi\nhome = %(virtualenv_dir)s\n";
const UWSGI_RENDERED: &str = "[uwsgi]\nmodule = acme.wsgi\nhome = /data/ve\n";
const UWSGI_REMOTE: &str = "/etc/uwsgi/acme_uwsgi.ini";
const RUN_SH: &str = "#!/bin/sh\n. %(ve_bin)s/activate\n";

fn deploy_root() -> tempfile::TempDir {
    let root = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(root.path().join("templates")).unwrap();
    std::fs::create_dir_all(root.path().join("base")).unwrap();
    std::fs::write(root.path().join("templates/uwsgi.ini"), UWSGI_INI).unwrap();
    std::fs::write(root.path().join("templates/run.sh"), RUN_SH).unwrap();
    root
}

fn deployer(root: &std::path::Path, host: FakeHost) -> (Arc<FakeHost>, Deployer) {
    let env = EnvironmentBuilder::new(root)
        .overrides([
            ("base_dir", "/data"),
            ("project_path", "app/services"),
            ("ve_dir", "ve"),
            ("templates_prefix", "acme"),
            ("git_uri", "git@example.org:acme/app.git"),
            ("git_branch", "main"),
            ("celery_app", "acme"),
            ("celery_worker", "w1"),
            ("db_name", "acme"),
            ("db_user", "acme"),
            ("db_password", "hunter2"),
            ("user", "deploy"),
        ])
        .skip_key_resolution()
        .build()
        .unwrap();

    let host = Arc::new(host);
    let shell = Arc::new(Shell::new("web1", host.clone()));
    (host, Deployer::new(Arc::new(env), shell))
}

/// Deployer over the `deploy/` root shipped with the repo, example host
fn shipped_deployer(host: FakeHost) -> (Arc<FakeHost>, Deployer) {
    let root = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../deploy");
    let env = EnvironmentBuilder::new(&root)
        .rc_file(root.join("hosts/example/fabricrc"))
        .skip_key_resolution()
        .build()
        .unwrap()
        .for_host("staging.example.com");

    let host = Arc::new(host);
    let shell = Arc::new(Shell::new("staging.example.com", host.clone()));
    (host, Deployer::new(Arc::new(env), shell))
}

fn assert_in_order(host: &FakeHost, steps: &[&str]) {
    let positions: Vec<usize> = steps.iter().map(|s| host.position(s)).collect();
    assert!(
        positions.windows(2).all(|w| w[0] < w[1]),
        "out of order: {:?}",
        steps.iter().zip(&positions).collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn test_starting_service_twice_issues_one_start() {
    let root = deploy_root();
    let (host, deployer) = deployer(root.path(), FakeHost::new());

    deployer.services().start("nginx").await.unwrap();
    deployer.services().start("nginx").await.unwrap();

    assert_eq!(host.count("systemctl start nginx"), 1);
    assert_eq!(host.count("systemctl is-active nginx"), 2);
}

#[tokio::test]
async fn test_stop_inactive_service_is_noop() {
    let root = deploy_root();
    let (host, deployer) = deployer(root.path(), FakeHost::new());

    deployer.services().stop("nginx").await.unwrap();

    assert_eq!(host.count("systemctl stop"), 0);
}

#[tokio::test]
async fn test_restart_active_service_issues_restart() {
    let root = deploy_root();
    let (host, deployer) = deployer(root.path(), FakeHost::new().with_active("nginx"));

    deployer.services().restart("nginx").await.unwrap();

    assert_eq!(host.count("systemctl restart nginx"), 1);
    assert_eq!(host.count("systemctl start nginx"), 0);
}

#[tokio::test]
async fn test_restart_inactive_service_issues_start() {
    let root = deploy_root();
    let (host, deployer) = deployer(root.path(), FakeHost::new());

    deployer.services().restart("nginx").await.unwrap();

    assert_eq!(host.count("systemctl start nginx"), 1);
    assert_eq!(host.count("systemctl restart nginx"), 0);
}

#[tokio::test]
async fn test_template_upload_skipped_when_identical() {
    let root = deploy_root();
    let (host, deployer) = deployer(
        root.path(),
        FakeHost::new().with_file(UWSGI_REMOTE, UWSGI_RENDERED),
    );

    let outcome = deployer
        .templates()
        .upload_template_and_reload(deployer.shell(), "uwsgi")
        .await
        .unwrap();

    assert_eq!(outcome, UploadOutcome::Unchanged);
    assert_eq!(host.count("base64 -d"), 0);
}

#[tokio::test]
async fn test_template_uploaded_when_different() {
    let root = deploy_root();
    let (host, deployer) = deployer(
        root.path(),
        FakeHost::new().with_file(UWSGI_REMOTE, "[uwsgi]\nmodule = old.wsgi\n"),
    );

    let outcome = deployer
        .templates()
        .upload_template_and_reload(deployer.shell(), "uwsgi")
        .await
        .unwrap();

    assert_eq!(outcome, UploadOutcome::Uploaded);
    let write = host.calls()[host.position("base64 -d")].clone();
    assert!(write.contains(&STANDARD.encode(UWSGI_RENDERED)));
    assert!(write.starts_with("sudo -n -H sh -c"));
}

#[tokio::test]
async fn test_home_template_written_and_chmodded_as_login_user() {
    let root = deploy_root();
    let (host, deployer) = deployer(root.path(), FakeHost::new());

    let outcome = deployer
        .templates()
        .upload_template_and_reload(deployer.shell(), "run")
        .await
        .unwrap();

    assert_eq!(outcome, UploadOutcome::Uploaded);
    let write = host.calls()[host.position("base64 -d > ~/run.sh")].clone();
    assert!(write.contains(&STANDARD.encode("#!/bin/sh\n. /data/ve/bin/activate\n")));
    // sudo -H would point `~` at root's home
    assert!(host.calls().iter().all(|c| !c.starts_with("sudo")));
    assert!(host.calls().contains(&"chmod 755 ~/run.sh".to_string()));
}

#[tokio::test]
async fn test_unknown_template_rejected_before_any_upload() {
    let root = deploy_root();
    let (host, deployer) = deployer(root.path(), FakeHost::new());

    let err = deployer
        .templates()
        .upload_templates(deployer.shell(), Some(["uwsgi", "apache"].as_slice()))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        CoreError::Template(TemplateError::UnknownTemplate(ref name)) if name == "apache"
    ));
    assert!(host.calls().is_empty());
}

#[tokio::test]
async fn test_deploy_runs_steps_in_order() {
    let root = deploy_root();
    let (host, deployer) = deployer(root.path(), FakeHost::new());

    deployer.deploy(false).await.unwrap();

    let steps = [
        "multi stop acme",
        "find /data/app/services -name",
        "git fetch",
        "git checkout main",
        "git pull origin main",
        "pip freeze",
        "manage.py migrate --noinput",
        "systemctl start nginx",
        "systemctl start acme_uwsgi",
        "multi start w1",
        "manage.py collectstatic -v 0 --noinput",
    ];
    let positions: Vec<usize> = steps.iter().map(|s| host.position(s)).collect();
    assert!(positions.windows(2).all(|w| w[0] < w[1]), "out of order: {positions:?}");
    assert_eq!(host.count("force_migrate"), 0);
}

#[tokio::test]
async fn test_deploy_fast_skips_migrate_and_collectstatic() {
    let root = deploy_root();
    let (host, deployer) = deployer(root.path(), FakeHost::new().with_active("nginx"));

    deployer.deploy_fast().await.unwrap();

    assert_in_order(
        &host,
        &[
            "git pull origin main",
            "systemctl stop nginx",
            "multi stop acme",
            "systemctl start nginx",
            "systemctl start acme_uwsgi",
            "multi start w1",
        ],
    );
    assert_eq!(host.count("migrate"), 0);
    assert_eq!(host.count("collectstatic"), 0);
    assert_eq!(host.count("pip"), 0);
}

#[tokio::test]
async fn test_git_clone_pulls_existing_checkout() {
    let root = deploy_root();
    let (host, deployer) = deployer(root.path(), FakeHost::new());

    deployer.git_clone(false).await.unwrap();

    assert_in_order(
        &host,
        &["test -e /data/app/services", "git fetch", "git pull origin main"],
    );
    assert_eq!(host.count("git clone"), 0);
    assert_eq!(host.count("mv "), 0);
}

#[tokio::test]
async fn test_git_clone_recreate_moves_checkout_aside() {
    let root = deploy_root();
    let (host, deployer) = deployer(root.path(), FakeHost::new());

    deployer.git_clone(true).await.unwrap();

    let mv = host.calls()[host.position("mv /data/app ")].clone();
    let backup = mv.strip_prefix("mv /data/app /data/app.").unwrap();
    assert_eq!(backup.len(), 14);
    assert!(backup.chars().all(|c| c.is_ascii_digit()));

    assert_in_order(
        &host,
        &["mv /data/app ", "cd /data && git clone --branch main git@example.org:acme/app.git"],
    );
    assert_eq!(host.count("git pull"), 0);
}

#[tokio::test]
async fn test_git_clone_fresh_host_clones_without_backup() {
    let root = deploy_root();
    let (host, deployer) = deployer(root.path(), FakeHost::new().failing_on("test -e"));

    deployer.git_clone(false).await.unwrap();

    assert_eq!(host.count("git clone --branch main"), 1);
    assert_eq!(host.count("mv "), 0);
}

#[tokio::test]
async fn test_install_project_files_runs_steps_in_order() {
    let (host, deployer) = shipped_deployer(FakeHost::new());

    deployer.install_project_files().await.unwrap();

    assert_in_order(
        &host,
        &[
            "mv /data/site /data/site.",
            "git clone --branch master",
            "rm -f /etc/nginx/sites-enabled/default",
            "touch /tmp/tika.log",
            "base64 -d > /etc/nginx/sites-enabled/site_nginx.conf",
            "base64 -d > /etc/systemd/system/site_uwsgi.service",
            "base64 -d > /etc/uwsgi/site_uwsgi.ini",
            "base64 -d > /data/site/services/local_settings.py",
            "base64 -d > ~/run.sh",
            "base64 -d > /usr/share/nginx/html/502.html",
            "systemctl daemon-reload",
            "manage.py force_migrate",
            "manage.py create_superuser --username admin",
            "manage.py update_index --remove",
            "manage.py set_site",
            "manage.py collectstatic -v 0 --noinput",
            "nltk.downloader",
            "letsencrypt certonly",
            "systemctl start site_uwsgi",
            "multi start worker1",
        ],
    );
    assert!(host.calls().contains(&"chmod 755 ~/run.sh".to_string()));
    // the nginx reload already brought it up
    assert_eq!(host.count("systemctl start nginx"), 0);
    assert_eq!(host.count("migrate --noinput"), 0);
    assert_eq!(host.count("elasticsearch.yml"), 0);
}

#[tokio::test]
async fn test_setup_new_app_instance_runs_steps_in_order() {
    let (host, deployer) = shipped_deployer(FakeHost::new().failing_on("reboot-required"));

    deployer.setup_new_app_instance(true).await.unwrap();

    assert_in_order(
        &host,
        &[
            "apt-get -y update",
            "apt-get -y -q install",
            "pip install uwsgi==2.0.14",
            "npm -g install yuglify",
            "locale-gen",
            "CREATE USER",
            "stat /proc/1/exe",
            "apt-get -y upgrade",
            "virtualenv -p python3",
            "pip freeze",
            "redis-stable.tar.gz",
            "systemctl start redis_6379",
            "oracle-java8-installer",
            "dpkg -i",
            "base64 -d > /etc/elasticsearch/elasticsearch.yml",
            "systemctl enable elasticsearch",
            "git clone --branch master",
            "manage.py force_migrate",
            "multi start worker1",
        ],
    );
    assert_eq!(host.count("sudo -n -H sh -c reboot"), 0);
}

#[tokio::test]
async fn test_setup_new_app_instance_without_project() {
    let (host, deployer) = shipped_deployer(FakeHost::new().failing_on("reboot-required"));

    deployer.setup_new_app_instance(false).await.unwrap();

    assert_eq!(host.count("systemctl enable elasticsearch"), 1);
    assert_eq!(host.count("git clone"), 0);
    assert_eq!(host.count("force_migrate"), 0);
    assert_eq!(host.count("multi start"), 0);
}

#[tokio::test]
async fn test_deploy_aborts_on_first_failure() {
    let root = deploy_root();
    let (host, deployer) = deployer(root.path(), FakeHost::new().failing_on("git pull"));

    let err = deployer.deploy(false).await.unwrap_err();

    match err {
        CoreError::Exec(ExecError::CommandFailed { command, status, .. }) => {
            assert_eq!(command, "git pull origin main");
            assert_eq!(status, 1);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(host.count("migrate"), 0);
    assert_eq!(host.count("multi start"), 0);
}

#[tokio::test]
async fn test_migration_modes_issue_distinct_commands() {
    let root = deploy_root();
    let (host, deployer) = deployer(root.path(), FakeHost::new());

    deployer.migrate(MigrationMode::Force).await.unwrap();
    deployer.migrate(MigrationMode::Checked).await.unwrap();

    assert_eq!(host.count("manage.py force_migrate"), 1);
    assert_eq!(host.count("manage.py migrate --noinput"), 1);
    assert!(host.calls()[0].contains("cd /data/app/services &&"));
}

#[tokio::test]
async fn test_clean_base_directory_not_implemented() {
    let root = deploy_root();
    let (_host, deployer) = deployer(root.path(), FakeHost::new());

    let err = deployer.create_base_directory(true).await.unwrap_err();

    assert_eq!(err.to_string(), "clean_base_directory() not implemented.");
}

#[tokio::test]
async fn test_postgres_create_only_creates_missing_objects() {
    let root = deploy_root();
    let (host, deployer) = deployer(root.path(), FakeHost::new().failing_on("SELECT 1"));

    deployer.postgres_create().await.unwrap();

    assert_eq!(host.count("CREATE USER"), 1);
    assert_eq!(host.count("createdb --owner acme"), 1);
    assert!(host.calls().iter().all(|c| c.starts_with("sudo -n -H -u postgres")));
}

#[tokio::test]
async fn test_postgres_create_skips_existing_role() {
    let root = deploy_root();
    let (host, deployer) = deployer(
        root.path(),
        FakeHost::new().replying("FROM pg_user", "1\n"),
    );

    deployer.postgres_create().await.unwrap();

    assert_eq!(host.count("CREATE USER"), 0);
    assert_eq!(host.count("createdb"), 0);
}

#[tokio::test]
async fn test_tasks_run_through_registry() {
    let root = deploy_root();
    let (host, deployer) = deployer(root.path(), FakeHost::new().with_active("nginx"));
    let registry = TaskRegistry::builtin();

    let resolved = registry
        .resolve(&["is_active:nginx", "stop_service:name=nginx", "print_git_branch"])
        .unwrap();

    let mut outputs = Vec::new();
    for (task, args) in &resolved {
        outputs.push(task.run(&deployer, args).await.unwrap());
    }

    assert_eq!(
        outputs,
        vec![
            Some("true".to_string()),
            None,
            Some("Git branch: main".to_string())
        ]
    );
    assert_eq!(host.count("systemctl stop nginx"), 1);
}

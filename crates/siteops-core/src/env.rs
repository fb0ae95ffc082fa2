//! Deployment environment: rc files, overrides and derived paths
//!
//! The environment is resolved once at startup and never mutated
//! afterwards. Each host gets a copy with its `host` key filled in.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use siteops_exec::{key_search_dirs, locate_key};
use tracing::{debug, info};

use crate::error::ConfigError;

/// Base rc file, relative to the deploy root
pub const BASE_RC: &str = "base/fabricrc";

/// Hosts that run through the local executor
pub const LOCAL_HOSTS: [&str; 2] = ["localhost", "127.0.0.1"];

/// Resolved configuration values keyed by lowercase name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Environment {
    values: BTreeMap<String, String>,
}

impl Environment {
    /// Value of a required key
    ///
    /// # Errors
    /// `ConfigError::MissingKey` when unset
    pub fn get(&self, key: &str) -> Result<&str, ConfigError> {
        self.get_opt(key)
            .ok_or_else(|| ConfigError::MissingKey(key.to_string()))
    }

    /// Value of an optional key
    #[must_use]
    pub fn get_opt(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Optional key read as a boolean; unset and empty mean false
    #[must_use]
    pub fn flag(&self, key: &str) -> bool {
        self.get_opt(key)
            .and_then(parse_bool)
            .unwrap_or(false)
    }

    /// Whether `key` is set
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// All values, sorted by key
    #[must_use]
    pub fn values(&self) -> &BTreeMap<String, String> {
        &self.values
    }

    /// Configured host strings (`hosts` key, comma separated)
    #[must_use]
    pub fn hosts(&self) -> Vec<String> {
        self.get_opt("hosts")
            .map(|h| {
                h.split(',')
                    .map(str::trim)
                    .filter(|h| !h.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Whether every configured host is the local machine
    #[must_use]
    pub fn local_only(&self) -> bool {
        self.hosts().iter().all(|h| is_local_host(h))
    }

    /// SSH user
    #[must_use]
    pub fn user(&self) -> &str {
        self.get_opt("user").unwrap_or("root")
    }

    /// SSH port
    ///
    /// # Errors
    /// `ConfigError::InvalidValue` if `port` is not a number
    pub fn port(&self) -> Result<u16, ConfigError> {
        match self.get_opt("port") {
            None => Ok(22),
            Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
                key: "port".to_string(),
                value: raw.to_string(),
            }),
        }
    }

    /// Directory holding `base/`, `templates/` and the requirement files
    #[must_use]
    pub fn deploy_root(&self) -> PathBuf {
        PathBuf::from(self.get_opt("deploy_root").unwrap_or("."))
    }

    /// Host-specific configuration directory
    #[must_use]
    pub fn config_dir(&self) -> PathBuf {
        self.get_opt("config_dir")
            .map_or_else(|| self.deploy_root(), PathBuf::from)
    }

    /// Shared base configuration directory
    #[must_use]
    pub fn base_config_dir(&self) -> PathBuf {
        self.get_opt("base_config_dir")
            .map_or_else(|| self.deploy_root().join("base"), PathBuf::from)
    }

    /// Copy of this environment for one host
    #[must_use]
    pub fn for_host(&self, host: &str) -> Self {
        let mut values = self.values.clone();
        let bare = host
            .rsplit_once('@')
            .map_or(host, |(_, h)| h)
            .split(':')
            .next()
            .unwrap_or(host);
        values.insert("host_string".to_string(), host.to_string());
        values.insert("host".to_string(), bare.to_string());
        Self { values }
    }
}

/// Whether `host` (possibly `user@host:port`) is the local machine
#[must_use]
pub fn is_local_host(host: &str) -> bool {
    let bare = host.rsplit_once('@').map_or(host, |(_, h)| h);
    let bare = bare.split(':').next().unwrap_or(bare);
    LOCAL_HOSTS.contains(&bare)
}

/// Parse `true/false/1/0/yes/no/on/off`
#[must_use]
pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "y" | "on" => Some(true),
        "false" | "0" | "no" | "n" | "off" | "" => Some(false),
        _ => None,
    }
}

/// Builds an [`Environment`]: overrides, then the host rc file, then the
/// base rc file, then derived keys
///
/// Keys already set are never overwritten by a later source.
#[derive(Debug, Clone)]
pub struct EnvironmentBuilder {
    deploy_root: PathBuf,
    rc_file: Option<PathBuf>,
    values: BTreeMap<String, String>,
    resolve_key: bool,
}

impl EnvironmentBuilder {
    /// Start from the directory holding `base/` and `templates/`
    pub fn new(deploy_root: impl Into<PathBuf>) -> Self {
        Self {
            deploy_root: deploy_root.into(),
            rc_file: None,
            values: BTreeMap::new(),
            resolve_key: true,
        }
    }

    /// Host rc file (`-c`); its directory becomes `config_dir`
    #[must_use]
    pub fn rc_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.rc_file = Some(path.into());
        self
    }

    /// Command-line overrides; these win over every file
    #[must_use]
    pub fn overrides<I, K, V>(mut self, pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        for (key, value) in pairs {
            self.insert_absent(key.as_ref(), value.into());
        }
        self
    }

    /// Skip SSH key lookup (tests, listing tasks)
    #[must_use]
    pub fn skip_key_resolution(mut self) -> Self {
        self.resolve_key = false;
        self
    }

    fn insert_absent(&mut self, key: &str, value: String) {
        self.values
            .entry(key.trim().to_ascii_lowercase())
            .or_insert(value);
    }

    fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Unreadable {
            path: path.display().to_string(),
            source,
        })?;
        let pairs = parse_rc(&content).map_err(|(line, text)| ConfigError::Malformed {
            path: path.display().to_string(),
            line,
            text,
        })?;
        debug!(path = %path.display(), keys = pairs.len(), "loaded rc file");
        for (key, value) in pairs {
            self.insert_absent(&key, value);
        }
        Ok(())
    }

    /// Resolve everything
    ///
    /// # Errors
    /// Unreadable or malformed rc files, missing keys needed for derived
    /// paths, and an SSH key that cannot be located
    pub fn build(mut self) -> Result<Environment, ConfigError> {
        let deploy_root = absolute(&self.deploy_root);

        let config_dir = match self.rc_file.clone() {
            Some(rc) => {
                self.load_file(&rc)?;
                absolute(&rc)
                    .parent()
                    .map_or_else(|| deploy_root.clone(), Path::to_path_buf)
            }
            None => deploy_root.clone(),
        };

        let base_rc = deploy_root.join(BASE_RC);
        if base_rc.exists() {
            self.load_file(&base_rc)?;
        } else {
            debug!(path = %base_rc.display(), "no base rc file");
        }

        let base_config_dir = deploy_root.join("base");
        self.values.insert("deploy_root".into(), display(&deploy_root));
        self.values.insert("config_dir".into(), display(&config_dir));
        self.values
            .insert("base_config_dir".into(), display(&base_config_dir));

        let user = std::env::var("USER").unwrap_or_else(|_| "root".to_string());
        self.insert_absent("user", user);
        self.insert_absent("port", "22".to_string());

        let mut env = Environment {
            values: self.values,
        };
        derive_paths(&mut env)?;

        if self.resolve_key && !env.hosts().is_empty() && !env.local_only() {
            let key_name = env.get("key_filename")?.to_string();
            let search = key_search_dirs(&[deploy_root, config_dir, base_config_dir]);
            let located = locate_key(&key_name, &search)?;
            info!(key = %located.display(), "using SSH key");
            env.values
                .insert("key_filename".into(), display(&located));
        }

        Ok(env)
    }
}

/// Fill in the project layout derived from `base_dir` and friends
fn derive_paths(env: &mut Environment) -> Result<(), ConfigError> {
    let base_dir = PathBuf::from(env.get("base_dir")?);
    let project_dir = base_dir.join(env.get("project_path")?);
    let virtualenv_dir = base_dir.join(env.get("ve_dir")?);
    let ve_bin = virtualenv_dir.join("bin");
    let uwsgi_name = format!("{}_uwsgi", env.get("templates_prefix")?);

    let derived = [
        ("project_dir", display(&project_dir)),
        ("virtualenv_dir", display(&virtualenv_dir)),
        ("ve_bin", display(&ve_bin)),
        ("python_bin", display(&ve_bin.join("python"))),
        ("pip_bin", display(&ve_bin.join("pip"))),
        ("uwsgi_bin", display(&ve_bin.join("uwsgi"))),
        ("manage_py", display(&project_dir.join("manage.py"))),
        ("uwsgi_name", uwsgi_name),
    ];
    for (key, value) in derived {
        env.values.insert(key.to_string(), value);
    }

    // application settings the templates and scaffolding rely on
    let settings = [
        ("static_root", display(&project_dir.join("staticfiles"))),
        ("media_root", display(&project_dir.join("media"))),
        ("filebrowser_directory", "data/documents/".to_string()),
        ("log_file_name", "log.txt".to_string()),
        ("celery_log_file_name", "celery.log".to_string()),
    ];
    for (key, value) in settings {
        env.values.entry(key.to_string()).or_insert(value);
    }

    Ok(())
}

/// Parse configparser-style `key = value` / `key: value` lines
///
/// Section headers and `#`/`;` comments are ignored; indented lines
/// continue the previous value. On error returns the 1-based line number
/// and its text.
pub fn parse_rc(content: &str) -> Result<Vec<(String, String)>, (usize, String)> {
    let mut pairs: Vec<(String, String)> = Vec::new();

    for (idx, raw) in content.lines().enumerate() {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with(';') {
            continue;
        }
        if trimmed.starts_with('[') && trimmed.ends_with(']') {
            continue;
        }
        if raw.starts_with([' ', '\t']) {
            if let Some((_, value)) = pairs.last_mut() {
                value.push('\n');
                value.push_str(trimmed);
                continue;
            }
        }

        let split = trimmed
            .find(['=', ':'])
            .map(|pos| (&trimmed[..pos], &trimmed[pos + 1..]));
        match split {
            Some((key, value)) if !key.trim().is_empty() => {
                pairs.push((key.trim().to_ascii_lowercase(), value.trim().to_string()));
            }
            _ => return Err((idx + 1, raw.to_string())),
        }
    }

    Ok(pairs)
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}

fn display(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

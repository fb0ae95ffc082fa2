//! Configuration templates: catalog, rendering and idempotent upload

use std::path::PathBuf;
use std::sync::Arc;

use minijinja::{Environment as JinjaEnv, UndefinedBehavior};
use serde::Serialize;
use siteops_exec::{Privilege, Shell, quote_path};
use tracing::{debug, info, instrument};

use crate::env::Environment;
use crate::error::{CoreError, TemplateError};

/// Where a template comes from and where it goes
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TemplateDescriptor {
    /// Catalog name
    pub name: &'static str,
    /// Directory `local_path` is relative to
    pub template_dir: String,
    /// Source file
    pub local_path: String,
    /// Destination on the host
    pub remote_path: String,
    /// Run with sudo after a changed upload
    pub reload_command: Option<String>,
    /// `chown` argument applied after upload
    pub owner: Option<String>,
    /// `chmod` argument applied after upload
    pub mode: Option<String>,
    /// Render through minijinja before placeholder substitution
    pub use_jinja: bool,
}

struct CatalogEntry {
    name: &'static str,
    template_dir: &'static str,
    local_path: &'static str,
    remote_path: &'static str,
    reload_command: Option<&'static str>,
    owner: Option<&'static str>,
    mode: Option<&'static str>,
    use_jinja: bool,
}

const fn entry(name: &'static str, local_path: &'static str, remote_path: &'static str) -> CatalogEntry {
    CatalogEntry {
        name,
        template_dir: ".",
        local_path,
        remote_path,
        reload_command: None,
        owner: None,
        mode: None,
        use_jinja: false,
    }
}

const CATALOG: [CatalogEntry; 7] = [
    CatalogEntry {
        reload_command: Some("systemctl restart nginx"),
        use_jinja: true,
        ..entry(
            "nginx",
            "templates/nginx.conf",
            "/etc/nginx/sites-enabled/%(templates_prefix)s_nginx.conf",
        )
    },
    entry(
        "uwsgi-init",
        "templates/uwsgi.service",
        "/etc/systemd/system/%(uwsgi_name)s.service",
    ),
    entry("uwsgi", "templates/uwsgi.ini", "/etc/uwsgi/%(uwsgi_name)s.ini"),
    CatalogEntry {
        template_dir: "%(config_dir)s",
        ..entry(
            "settings",
            "local_settings.py",
            "%(project_dir)s/local_settings.py",
        )
    },
    CatalogEntry {
        mode: Some("755"),
        ..entry("run", "templates/run.sh", "~/run.sh")
    },
    CatalogEntry {
        use_jinja: true,
        ..entry("502", "templates/502.html", "/usr/share/nginx/html/502.html")
    },
    entry(
        "elasticsearch",
        "templates/elasticsearch.yml",
        "/etc/elasticsearch/elasticsearch.yml",
    ),
];

/// Template names in catalog order
#[must_use]
pub fn template_names() -> Vec<&'static str> {
    CATALOG.iter().map(|e| e.name).collect()
}

/// Every catalog entry with its path fields resolved against `env`
///
/// # Errors
/// `TemplateError::UnknownPlaceholder` for a path field naming an unset key
pub fn catalog(env: &Environment) -> Result<Vec<TemplateDescriptor>, TemplateError> {
    CATALOG.iter().map(|e| resolve_entry(e, env)).collect()
}

/// One catalog entry resolved against `env`
///
/// # Errors
/// `TemplateError::UnknownTemplate` for a name outside the catalog
pub fn lookup(name: &str, env: &Environment) -> Result<TemplateDescriptor, TemplateError> {
    let entry = CATALOG
        .iter()
        .find(|e| e.name == name)
        .ok_or_else(|| TemplateError::UnknownTemplate(name.to_string()))?;
    resolve_entry(entry, env)
}

fn resolve_entry(e: &CatalogEntry, env: &Environment) -> Result<TemplateDescriptor, TemplateError> {
    let field = |value: &str| substitute(value, env, e.name);
    let optional = |value: Option<&str>| value.map(field).transpose();

    Ok(TemplateDescriptor {
        name: e.name,
        template_dir: field(e.template_dir)?,
        local_path: field(e.local_path)?,
        remote_path: field(e.remote_path)?,
        reload_command: optional(e.reload_command)?,
        owner: optional(e.owner)?,
        mode: optional(e.mode)?,
        use_jinja: e.use_jinja,
    })
}

/// Replace every `%(key)s` in `text` with its environment value
///
/// `%%` yields a literal `%`; any other `%` is kept as is.
///
/// # Errors
/// `TemplateError::UnknownPlaceholder` for a key that is not set
pub fn substitute(text: &str, env: &Environment, template: &str) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(pos) = rest.find('%') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];

        if tail.starts_with("%%") {
            out.push('%');
            rest = &tail[2..];
            continue;
        }

        let placeholder = tail
            .strip_prefix("%(")
            .and_then(|t| t.find(")s").map(|end| &t[..end]))
            .filter(|key| !key.contains(['\n', '(', '%']));

        match placeholder {
            Some(key) => {
                let value = env.get_opt(key).ok_or_else(|| TemplateError::UnknownPlaceholder {
                    template: template.to_string(),
                    key: key.to_string(),
                })?;
                out.push_str(value);
                rest = &tail[key.len() + 4..];
            }
            None => {
                out.push('%');
                rest = &tail[1..];
            }
        }
    }

    out.push_str(rest);
    Ok(out)
}

/// What an upload did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    /// Remote content already matched; nothing was written
    Unchanged,
    /// Content written (and owner/mode/reload applied)
    Uploaded,
}

impl std::fmt::Display for UploadOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UploadOutcome::Unchanged => write!(f, "unchanged"),
            UploadOutcome::Uploaded => write!(f, "uploaded"),
        }
    }
}

/// Renders catalog templates from the deploy root
#[derive(Debug, Clone)]
pub struct TemplateRenderer {
    env: Arc<Environment>,
}

impl TemplateRenderer {
    /// Create a renderer over `env`
    pub fn new(env: Arc<Environment>) -> Self {
        Self { env }
    }

    /// Local source file of `descriptor`
    #[must_use]
    pub fn source_path(&self, descriptor: &TemplateDescriptor) -> PathBuf {
        self.env
            .deploy_root()
            .join(&descriptor.template_dir)
            .join(&descriptor.local_path)
    }

    /// Render `descriptor`'s source into the bytes to upload
    ///
    /// # Errors
    /// Unreadable source, minijinja errors, unknown placeholders
    pub fn render(&self, descriptor: &TemplateDescriptor) -> Result<String, TemplateError> {
        let path = self.source_path(descriptor);
        let source = std::fs::read_to_string(&path).map_err(|source| TemplateError::Unreadable {
            path: path.display().to_string(),
            source,
        })?;
        self.render_str(descriptor.name, &source, descriptor.use_jinja)
    }

    /// Render template text; `use_jinja` adds the minijinja pass
    ///
    /// # Errors
    /// minijinja errors, unknown placeholders
    pub fn render_str(
        &self,
        name: &str,
        source: &str,
        use_jinja: bool,
    ) -> Result<String, TemplateError> {
        let text = if use_jinja {
            let jinja_err = |e: minijinja::Error| TemplateError::Jinja {
                template: name.to_string(),
                message: e.to_string(),
            };
            let mut jinja = JinjaEnv::new();
            jinja.set_undefined_behavior(UndefinedBehavior::Strict);
            jinja.set_keep_trailing_newline(true);
            jinja.add_template(name, source).map_err(jinja_err)?;
            jinja
                .get_template(name)
                .and_then(|t| t.render(self.env.values()))
                .map_err(jinja_err)?
        } else {
            source.to_string()
        };

        substitute(&text, &self.env, name)
    }

    /// Upload template `name` if its rendered content differs from the
    /// remote file, then apply owner, mode and reload command
    ///
    /// # Errors
    /// Template errors before anything is written; remote failures after
    #[instrument(skip(self, shell), fields(host = %shell.host()))]
    pub async fn upload_template_and_reload(
        &self,
        shell: &Shell,
        name: &str,
    ) -> Result<UploadOutcome, CoreError> {
        let descriptor = lookup(name, &self.env)?;
        let content = self.render(&descriptor)?;
        let remote = &descriptor.remote_path;

        // files in the login user's home are written as that user
        let use_sudo = !remote.starts_with('~');

        let current = shell.read_file(remote, use_sudo).await?;
        if current.as_deref() == Some(content.as_bytes()) {
            debug!(template = name, remote = %remote, "template unchanged, skipping upload");
            return Ok(UploadOutcome::Unchanged);
        }

        info!(template = name, remote = %remote, "uploading template");
        shell.write_file(remote, content.as_bytes(), use_sudo).await?;

        // sudo -H would resolve `~` against root's home
        let privilege = Privilege::sudo_if(use_sudo);
        let target = quote_path(remote);
        if let Some(owner) = &descriptor.owner {
            shell
                .exec_check(&format!("chown {owner} {target}"), privilege.clone())
                .await?;
        }
        if let Some(mode) = &descriptor.mode {
            shell
                .exec_check(&format!("chmod {mode} {target}"), privilege)
                .await?;
        }
        if let Some(reload) = &descriptor.reload_command {
            shell.sudo_check(reload).await?;
        }

        Ok(UploadOutcome::Uploaded)
    }

    /// Upload `names` (the whole catalog when `None`), then reload systemd
    ///
    /// # Errors
    /// The first failing upload aborts the rest
    pub async fn upload_templates(
        &self,
        shell: &Shell,
        names: Option<&[&str]>,
    ) -> Result<Vec<(String, UploadOutcome)>, CoreError> {
        let names: Vec<&str> = match names {
            Some(names) => names.to_vec(),
            None => template_names(),
        };

        // validate every name before touching the host
        for name in &names {
            lookup(name, &self.env)?;
        }

        let mut outcomes = Vec::with_capacity(names.len());
        for name in names {
            let outcome = self.upload_template_and_reload(shell, name).await?;
            outcomes.push((name.to_string(), outcome));
        }
        shell.sudo_check("systemctl daemon-reload").await?;
        Ok(outcomes)
    }
}

//! SSH key management and resolution

use std::env;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

/// SSH key resolution strategy
#[derive(Debug, Clone)]
pub enum KeySource {
    /// Explicit path to key file
    Path(PathBuf),
    /// Base64-encoded key from environment
    Env(String),
}

impl KeySource {
    /// Resolve key source to a path on disk
    ///
    /// For `Env`, decodes base64 and writes to temp file
    ///
    /// # Errors
    /// Returns `KeyError` if key resolution fails (file missing, env not set, invalid base64)
    pub fn resolve(&self) -> Result<ResolvedKey, KeyError> {
        match self {
            KeySource::Path(path) => {
                if !path.exists() {
                    return Err(KeyError::NotFound(path.display().to_string()));
                }
                check_key_permissions(path)?;
                Ok(ResolvedKey::Path(path.clone()))
            }
            KeySource::Env(var_name) => {
                let base64_key =
                    env::var(var_name).map_err(|_| KeyError::EnvNotSet(var_name.clone()))?;
                let key_data = base64_decode(&base64_key).map_err(|_| KeyError::InvalidBase64)?;

                let temp_path = write_temp_key(&key_data)?;
                Ok(ResolvedKey::Temp(temp_path))
            }
        }
    }
}

/// Resolved key location
#[derive(Debug)]
pub enum ResolvedKey {
    /// Path to key file
    Path(PathBuf),
    /// Temporary file (will be deleted on drop)
    Temp(PathBuf),
}

impl ResolvedKey {
    /// Get path for SSH library
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            ResolvedKey::Path(p) | ResolvedKey::Temp(p) => p,
        }
    }
}

/// Key resolution errors
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("environment variable {0} not set")]
    EnvNotSet(String),

    #[error("invalid base64 encoding")]
    InvalidBase64,

    #[error("key file not found: {0}")]
    NotFound(String),

    #[error("Unable to locate SSH key file from key_filename value \"{name}\" (searched {searched})")]
    NotLocated {
        /// Configured key file name
        name: String,
        /// Directories searched, in order
        searched: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Default key search directories, highest priority first
///
/// `~/.ssh`, then each of `extra` in the given order.
#[must_use]
pub fn key_search_dirs(extra: &[PathBuf]) -> Vec<PathBuf> {
    let mut dirs_list = Vec::with_capacity(extra.len() + 1);
    if let Some(home) = dirs::home_dir() {
        dirs_list.push(home.join(".ssh"));
    }
    dirs_list.extend(extra.iter().cloned());
    dirs_list
}

/// Locate `key_filename` in `search_dirs`; the first existing candidate wins
///
/// An absolute `key_filename` is accepted as-is when it exists.
///
/// # Errors
/// Returns `KeyError::NotLocated` when no candidate exists
pub fn locate_key(key_filename: &str, search_dirs: &[PathBuf]) -> Result<PathBuf, KeyError> {
    let direct = Path::new(key_filename);
    if direct.is_absolute() && direct.exists() {
        return Ok(direct.to_path_buf());
    }

    for dir in search_dirs {
        let candidate = dir.join(key_filename);
        debug!(candidate = %candidate.display(), "probing SSH key location");
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    Err(KeyError::NotLocated {
        name: key_filename.to_string(),
        searched: search_dirs
            .iter()
            .map(|d| d.display().to_string())
            .collect::<Vec<_>>()
            .join(", "),
    })
}

fn base64_decode(input: &str) -> Result<Vec<u8>, base64::DecodeError> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.decode(input.trim())
}

fn check_key_permissions(path: &Path) -> Result<(), KeyError> {
    use std::os::unix::fs::PermissionsExt;

    let mode = std::fs::metadata(path)?.permissions().mode();

    // group/other bits set
    if mode & 0o77 != 0 {
        warn!(
            path = %path.display(),
            mode = format!("{:o}", mode & 0o777),
            "key file permissions are too open (should be 600)"
        );
    }

    Ok(())
}

fn write_temp_key(key_data: &[u8]) -> Result<PathBuf, KeyError> {
    use std::fs::File;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    let temp_path = std::env::temp_dir().join(format!("siteops_ssh_key_{}", std::process::id()));

    let mut file = File::create(&temp_path)?;
    file.write_all(key_data)?;

    let mut permissions = file.metadata()?.permissions();
    permissions.set_mode(0o600);
    std::fs::set_permissions(&temp_path, permissions)?;

    debug!(path = %temp_path.display(), "wrote temporary SSH key");

    Ok(temp_path)
}

impl Drop for ResolvedKey {
    fn drop(&mut self) {
        if let ResolvedKey::Temp(path) = self
            && let Err(e) = std::fs::remove_file(&*path)
        {
            warn!(path = %path.display(), error = %e, "failed to remove temp key");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locate_key_first_match_wins() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        std::fs::write(first.path().join("deploy.pem"), "a").unwrap();
        std::fs::write(second.path().join("deploy.pem"), "b").unwrap();

        let dirs_list = vec![first.path().to_path_buf(), second.path().to_path_buf()];
        let found = locate_key("deploy.pem", &dirs_list).unwrap();

        assert_eq!(found, first.path().join("deploy.pem"));
    }

    #[test]
    fn test_locate_key_skips_missing_dirs() {
        let missing = PathBuf::from("/nonexistent/siteops");
        let present = tempfile::tempdir().unwrap();
        std::fs::write(present.path().join("id_ed25519"), "k").unwrap();

        let found = locate_key("id_ed25519", &[missing, present.path().to_path_buf()]).unwrap();
        assert_eq!(found, present.path().join("id_ed25519"));
    }

    #[test]
    fn test_locate_key_not_found() {
        let empty = tempfile::tempdir().unwrap();
        let err = locate_key("nope.pem", &[empty.path().to_path_buf()]).unwrap_err();

        assert!(matches!(err, KeyError::NotLocated { .. }));
        assert!(err.to_string().contains("nope.pem"));
    }

    #[test]
    fn test_resolve_missing_path() {
        let source = KeySource::Path(PathBuf::from("/nonexistent/key"));
        assert!(matches!(source.resolve(), Err(KeyError::NotFound(_))));
    }
}

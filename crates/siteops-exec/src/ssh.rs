//! SSH command execution using russh crate

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use russh::keys::ssh_key;
use russh::keys::{PrivateKeyWithHashAlg, load_secret_key};
use russh::{ChannelMsg, Disconnect, client};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use crate::error::ExecError;
use crate::keys::{KeySource, ResolvedKey};
use crate::result::{CommandResult, ConnectionInfo};
use crate::traits::RemoteExecutor;

/// SSH client handler for russh
#[derive(Debug)]
struct SshClientHandler {
    host: String,
}

impl client::Handler for SshClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        // No known_hosts verification, same as StrictHostKeyChecking=no
        debug!(
            host = %self.host,
            fingerprint = %server_public_key.fingerprint(ssh_key::HashAlg::Sha256),
            "accepting server key"
        );
        Ok(true)
    }
}

/// SSH command executor
///
/// Holds one SSH session per host, established on first use and
/// re-established after [`RemoteExecutor::reset`].
pub struct SshExecutor {
    conn_info: ConnectionInfo,
    key: ResolvedKey,
    session: Mutex<Option<client::Handle<SshClientHandler>>>,
}

impl std::fmt::Debug for SshExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshExecutor")
            .field("conn_info", &self.conn_info)
            .field("key", &self.key)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl SshExecutor {
    /// Create a new SSH executor
    ///
    /// # Errors
    /// Returns `ExecError::SshKeyError` if key resolution fails
    pub fn new(conn_info: ConnectionInfo, key_source: &KeySource) -> Result<Self, ExecError> {
        let key = key_source
            .resolve()
            .map_err(|e| ExecError::SshKeyError(e.to_string()))?;

        Ok(Self {
            conn_info,
            key,
            session: Mutex::new(None),
        })
    }

    /// Get connection info
    pub fn connection_info(&self) -> &ConnectionInfo {
        &self.conn_info
    }

    #[instrument(skip(self), fields(host = %self.conn_info.host))]
    async fn connect(&self) -> Result<(), ExecError> {
        let mut session_lock = self.session.lock().await;

        if session_lock.is_some() {
            return Ok(());
        }

        info!(
            port = self.conn_info.port,
            user = %self.conn_info.user,
            "connecting to SSH"
        );

        let config = Arc::new(client::Config::default());
        let handler = SshClientHandler {
            host: self.conn_info.host.clone(),
        };

        let mut session = client::connect(
            config,
            (&self.conn_info.host[..], self.conn_info.port),
            handler,
        )
        .await
        .map_err(|e| ExecError::ConnectionFailed(e.to_string()))?;

        let key_pair = load_secret_key(self.key.path(), None)
            .map_err(|e| ExecError::SshKeyError(e.to_string()))?;

        let hash_alg = session
            .best_supported_rsa_hash()
            .await
            .ok()
            .flatten()
            .flatten();
        let auth_res = session
            .authenticate_publickey(
                &self.conn_info.user,
                PrivateKeyWithHashAlg::new(Arc::new(key_pair), hash_alg),
            )
            .await
            .map_err(|e| ExecError::AuthenticationFailed(e.to_string()))?;

        if !auth_res.success() {
            return Err(ExecError::AuthenticationFailed(format!(
                "public key rejected for {}@{}",
                self.conn_info.user, self.conn_info.host
            )));
        }

        info!("SSH connected and authenticated");

        *session_lock = Some(session);
        Ok(())
    }

    #[instrument(skip(self, cmd), fields(host = %self.conn_info.host))]
    async fn execute_remote(&self, cmd: &str) -> Result<CommandResult, ExecError> {
        let mut session_lock = self.session.lock().await;

        let session = session_lock.as_mut().ok_or(ExecError::NotConnected)?;

        let start = Instant::now();

        let mut channel = session
            .channel_open_session()
            .await
            .map_err(|e| ExecError::IoError(e.to_string()))?;

        channel
            .exec(true, cmd)
            .await
            .map_err(|e| ExecError::IoError(e.to_string()))?;

        let mut status = -1;
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        // ExitStatus may arrive after Eof, so drain until the channel closes
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { data } => stdout.extend_from_slice(&data),
                ChannelMsg::ExtendedData { data, ext: 1 } => stderr.extend_from_slice(&data),
                ChannelMsg::ExitStatus { exit_status } => {
                    status = exit_status.cast_signed();
                }
                _ => {}
            }
        }

        let result = CommandResult {
            status,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            duration: start.elapsed(),
        };

        debug!(
            status = result.status,
            duration = ?result.duration,
            "remote command completed"
        );

        Ok(result)
    }

    /// Disconnect from remote host
    ///
    /// # Errors
    /// Returns `ExecError::IoError` if disconnection fails
    pub async fn disconnect(&self) -> Result<(), ExecError> {
        let mut session_lock = self.session.lock().await;

        if let Some(session) = session_lock.take() {
            session
                .disconnect(Disconnect::ByApplication, "", "English")
                .await
                .map_err(|e| ExecError::IoError(e.to_string()))?;
            info!(host = %self.conn_info.host, "SSH disconnected");
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn run(&self, cmd: &str) -> Result<CommandResult, ExecError> {
        self.connect().await?;
        self.execute_remote(cmd).await
    }

    async fn run_with_timeout(
        &self,
        cmd: &str,
        timeout_duration: Duration,
    ) -> Result<CommandResult, ExecError> {
        // connecting is not part of the command budget
        self.connect().await?;

        match timeout(timeout_duration, self.execute_remote(cmd)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    host = %self.conn_info.host,
                    command = %cmd,
                    timeout = ?timeout_duration,
                    "remote command timed out"
                );
                Err(ExecError::Timeout {
                    timeout: timeout_duration,
                })
            }
        }
    }

    async fn reset(&self) {
        if let Err(e) = self.disconnect().await {
            // the peer is usually already gone (reboot)
            debug!(host = %self.conn_info.host, error = %e, "ignoring disconnect error");
        }
    }

    fn is_connected(&self) -> bool {
        self.session
            .try_lock()
            .map(|s| s.is_some())
            .unwrap_or(false)
    }

    fn executor_type(&self) -> &'static str {
        "ssh"
    }
}

/// Builder for `SshExecutor`
pub struct SshExecutorBuilder {
    conn_info: ConnectionInfo,
    key_source: Option<KeySource>,
}

impl SshExecutorBuilder {
    /// Create builder with required fields
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            conn_info: ConnectionInfo::new(host, user),
            key_source: None,
        }
    }

    /// Start from an already parsed connection
    #[must_use]
    pub fn from_connection(conn_info: ConnectionInfo) -> Self {
        Self {
            conn_info,
            key_source: None,
        }
    }

    /// Set SSH key path
    #[must_use]
    pub fn with_key_path(mut self, path: impl Into<std::path::PathBuf>) -> Self {
        self.key_source = Some(KeySource::Path(path.into()));
        self
    }

    /// Set key from environment variable (base64)
    #[must_use]
    pub fn with_env_key(mut self, var_name: impl Into<String>) -> Self {
        self.key_source = Some(KeySource::Env(var_name.into()));
        self
    }

    /// Set custom port
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.conn_info.port = port;
        self
    }

    /// Build the executor
    ///
    /// # Errors
    /// Returns `ExecError::SshKeyError` if no key was given or it cannot be resolved
    pub fn build(self) -> Result<SshExecutor, ExecError> {
        let key_source = self
            .key_source
            .ok_or_else(|| ExecError::SshKeyError("no SSH key configured".to_string()))?;
        SshExecutor::new(self.conn_info, &key_source)
    }
}

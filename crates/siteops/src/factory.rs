//! Executor construction for a host string

use std::path::PathBuf;
use std::sync::Arc;

use eyre::{Result, WrapErr};
use siteops_core::{Environment, is_local_host};
use siteops_exec::{ConnectionInfo, KeySource, LocalExecutor, RemoteExecutor, SshExecutor};

/// Local executor for `localhost`, SSH with the resolved key otherwise
pub fn executor_for(host: &str, env: &Environment) -> Result<Arc<dyn RemoteExecutor>> {
    if is_local_host(host) {
        return Ok(Arc::new(LocalExecutor::new()));
    }

    let mut conn_info = ConnectionInfo::parse(host, env.user());
    if !host_has_port(host) {
        conn_info = conn_info.with_port(env.port()?);
    }

    let key_path = env.get("key_filename")?;
    let key_source = KeySource::Path(PathBuf::from(key_path));

    let executor = SshExecutor::new(conn_info, &key_source)
        .wrap_err_with(|| format!("failed to create SSH executor for {host}"))?;
    Ok(Arc::new(executor))
}

fn host_has_port(host: &str) -> bool {
    host.rsplit_once(':')
        .is_some_and(|(_, port)| port.parse::<u16>().is_ok())
}

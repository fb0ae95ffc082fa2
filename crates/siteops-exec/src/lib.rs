//! siteops-exec: Remote execution abstraction
//!
//! Runs shell commands on provisioning targets over SSH (or locally for
//! `localhost`) and layers sudo, checked execution, scoped directories and
//! file transfer on top through [`Shell`].

pub mod error;
pub mod keys;
pub mod local;
pub mod result;
pub mod shell;
pub mod ssh;
pub mod traits;

pub use error::ExecError;
pub use keys::{KeyError, KeySource, key_search_dirs, locate_key};
pub use local::LocalExecutor;
pub use result::{CommandResult, ConnectionInfo};
pub use shell::{DirGuard, PrefixGuard, Privilege, Shell, quote, quote_path};
pub use ssh::{SshExecutor, SshExecutorBuilder};
pub use traits::RemoteExecutor;

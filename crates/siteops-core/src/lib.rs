//! siteops-core: environment resolution and deployment procedures
//!
//! Resolves the rc-file environment, renders configuration templates and
//! drives the provisioning and deployment procedures over a
//! [`siteops_exec::Shell`]. Also holds the command table the CLI exposes.

pub mod deploy;
pub mod env;
pub mod error;
pub mod ops;
pub mod postgres;
pub mod provision;
pub mod service;
pub mod tasks;
pub mod template;
pub mod workers;

pub use deploy::{DEPLOY_TEMPLATES, Deployer, INSTALL_TEMPLATES, MigrationMode};
pub use env::{BASE_RC, Environment, EnvironmentBuilder, is_local_host, parse_bool};
pub use error::{ConfigError, CoreError, TemplateError};
pub use provision::REBOOT_TIME;
pub use service::{REDIS_SERVICE, ServiceController};
pub use tasks::{Handler, Task, TaskArgs, TaskInvocation, TaskRegistry, TaskResult};
pub use template::{TemplateDescriptor, TemplateRenderer, UploadOutcome, substitute, template_names};
pub use workers::CeleryWorkers;

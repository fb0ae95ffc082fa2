//! Core error types for siteops-core

use siteops_exec::{ExecError, KeyError};
use siteops_pkg::PackageError;
use thiserror::Error;

/// Configuration problems; always raised before any remote command
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A required key is not set
    #[error("missing configuration key: {0}")]
    MissingKey(String),

    /// A config file could not be read
    #[error("cannot read config file {path}: {source}")]
    Unreadable {
        /// File path
        path: String,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// A config line is neither `key = value` nor a section header
    #[error("{path}:{line}: expected `key = value`, found {text:?}")]
    Malformed {
        /// File path
        path: String,
        /// 1-based line number
        line: usize,
        /// Offending line
        text: String,
    },

    /// A value has the wrong shape (port, boolean, ...)
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue {
        /// Key name
        key: String,
        /// Raw value
        value: String,
    },

    /// SSH key could not be located
    #[error(transparent)]
    Key(#[from] KeyError),
}

/// Template lookup and rendering problems
#[derive(Error, Debug)]
pub enum TemplateError {
    /// Name not in the fixed catalog
    #[error("unknown template: {0}")]
    UnknownTemplate(String),

    /// `%(key)s` placeholder without a configuration value
    #[error("template {template}: unknown placeholder %({key})s")]
    UnknownPlaceholder {
        /// Template or field being rendered
        template: String,
        /// Placeholder key
        key: String,
    },

    /// Template source could not be read
    #[error("cannot read template {path}: {source}")]
    Unreadable {
        /// Local path
        path: String,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// minijinja failed to parse or render
    #[error("template {template}: {message}")]
    Jinja {
        /// Template name
        template: String,
        /// Engine message
        message: String,
    },
}

/// Errors surfaced by procedures and tasks
#[derive(Error, Debug)]
pub enum CoreError {
    /// Configuration error
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Template error
    #[error(transparent)]
    Template(#[from] TemplateError),

    /// Remote command or transport failure
    #[error(transparent)]
    Exec(#[from] ExecError),

    /// Package installation failure
    #[error(transparent)]
    Package(#[from] PackageError),

    /// A post-condition of a setup step does not hold
    #[error("{0}")]
    SetupFailed(String),

    /// Code path that exists but is deliberately unsupported
    #[error("{0}() not implemented.")]
    NotImplemented(&'static str),

    /// Task name not in the command table
    #[error("unknown task: {0}")]
    UnknownTask(String),

    /// Task argument missing or malformed
    #[error("task {task}: {message}")]
    BadArgument {
        /// Task name
        task: String,
        /// What is wrong
        message: String,
    },

    /// Local I/O failure outside config and templates
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

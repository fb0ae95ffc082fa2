//! Command-line arguments

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "siteops")]
#[command(about = "Provision and deploy a Django site over SSH", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Host rc file; its directory becomes config_dir
    #[arg(short = 'c', long = "config", value_name = "RC")]
    pub config: Option<PathBuf>,

    /// Directory holding base/ and templates/
    #[arg(short = 'r', long = "root", value_name = "DIR", default_value = ".")]
    pub root: PathBuf,

    /// Comma-separated hosts, overriding the rc files
    #[arg(short = 'H', long = "hosts", value_name = "HOSTS")]
    pub hosts: Option<String>,

    /// Override a configuration value (repeatable)
    #[arg(long = "set", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    pub set: Vec<(String, String)>,

    /// Run against localhost without SSH
    #[arg(long)]
    pub local: bool,

    /// Debug logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Print the available tasks and exit
    #[arg(short, long)]
    pub list: bool,

    /// Tasks to run, `name[:arg,...,key=value]`
    #[arg(value_name = "TASK")]
    pub tasks: Vec<String>,
}

impl Cli {
    /// Overrides in priority order
    pub fn overrides(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        if self.local {
            pairs.push(("hosts".to_string(), "localhost".to_string()));
        }
        if let Some(hosts) = &self.hosts {
            pairs.push(("hosts".to_string(), hosts.clone()));
        }
        pairs.extend(self.set.iter().cloned());
        pairs
    }
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got `{raw}`")),
    }
}

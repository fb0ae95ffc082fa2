//! siteops CLI
//!
//! Resolves the rc-file environment and runs the requested tasks against
//! each configured host in turn.

use std::sync::Arc;

use clap::Parser;
use color_eyre::Result;
use eyre::{WrapErr, bail};
use siteops_core::{Deployer, Environment, EnvironmentBuilder, Task, TaskArgs, TaskRegistry};
use siteops_exec::Shell;
use tracing::{debug, info};

mod cli;
mod factory;

use cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let registry = TaskRegistry::builtin();
    if cli.list {
        println!("Available commands:\n\n{}", registry.listing());
        return Ok(());
    }
    if cli.tasks.is_empty() {
        bail!("no task given; run with --list to see the available tasks");
    }

    // reject unknown names before anything is resolved or contacted
    let tasks = registry.resolve(cli.tasks.as_slice())?;

    let env = build_environment(&cli).wrap_err("failed to resolve configuration")?;
    let hosts = env.hosts();

    if hosts.is_empty() {
        if tasks.iter().all(|(task, _)| task.is_local()) {
            for (task, args) in &tasks {
                print_output(task.run_local(&env, args)?);
            }
            return Ok(());
        }
        bail!("no hosts configured; set `hosts`, pass --hosts or use --local");
    }

    for host in &hosts {
        run_on_host(&env, host, &tasks)
            .await
            .wrap_err_with(|| format!("[{host}] aborted"))?;
    }

    Ok(())
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default.into()),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn build_environment(cli: &Cli) -> Result<Environment> {
    let mut builder = EnvironmentBuilder::new(&cli.root).overrides(cli.overrides());
    if let Some(rc) = &cli.config {
        builder = builder.rc_file(rc);
    }
    let env = builder.build()?;
    debug!(keys = env.values().len(), "environment resolved");
    Ok(env)
}

async fn run_on_host(env: &Environment, host: &str, tasks: &[(&Task, TaskArgs)]) -> Result<()> {
    let env = Arc::new(env.for_host(host));
    let executor = factory::executor_for(host, &env)?;
    let shell = Shell::new(host, executor)
        .with_sudo_password(env.get_opt("sudo_password").map(str::to_string));
    let deployer = Deployer::new(env, Arc::new(shell));

    for (task, args) in tasks {
        info!(host = %host, task = task.name, "running task");
        let output = task
            .run(&deployer, args)
            .await
            .wrap_err_with(|| format!("task {} failed", task.name))?;
        print_output(output);
    }

    deployer.shell().executor().reset().await;
    info!(host = %host, "done");
    Ok(())
}

fn print_output(output: Option<String>) {
    if let Some(text) = output {
        let text = text.trim_end();
        if !text.is_empty() {
            println!("{text}");
        }
    }
}

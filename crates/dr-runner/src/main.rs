//! devrun
//!
//! Deploys to a remote device over SSH, mounts local directories there and
//! runs the configured executable, relaying its output and exit code.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::AsyncWriteExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dr_core::config::{self, RunConfig};
use dr_core::traits::MaddeToolchain;
use dr_runner::{DeploymentRunner, RunnerEvent};
use dr_ssh::SshConnector;

/// Exit code used when the run could not complete
const FAILURE_EXIT_CODE: i32 = 1;

/// Exit code after Ctrl+C, as a shell would report SIGINT
const INTERRUPTED_EXIT_CODE: i32 = 130;

#[derive(Parser)]
#[command(name = "devrun")]
#[command(about = "Deploy and run an executable on a remote device")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Device host (overrides config)
    #[arg(long)]
    host: Option<String>,

    /// Additional process name to kill on the device before running
    #[arg(long = "kill", value_name = "NAME")]
    kill: Vec<String>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Arguments for the remote executable (override configured arguments)
    #[arg(last = true)]
    args: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr; stdout carries the remote process output.
    let log_level = if args.verbose { "debug" } else { &args.log_level };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(config::default_config_path);
    let mut run_config: RunConfig = config::load_config(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    if let Some(host) = &args.host {
        run_config.device.host = host.clone();
    }
    run_config.validate().context("Invalid configuration")?;

    let command_line = remote_command_line(&run_config, &args.args);
    let toolchain = MaddeToolchain::new(run_config.toolchain_root.clone());

    let (runner, mut events) = DeploymentRunner::new(
        run_config,
        Arc::new(SshConnector::new()),
        Arc::new(toolchain),
    );
    let (handle, task) = runner.spawn();

    if !args.kill.is_empty() {
        handle.add_procs_to_kill(args.kill.clone()).await?;
    }
    handle.start().await?;

    let mut stdout = tokio::io::stdout();
    let mut stderr = tokio::io::stderr();
    let exit_code = loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(RunnerEvent::ReadyForExecution) => {
                    handle.start_execution(command_line.clone()).await?;
                }
                Some(RunnerEvent::RemoteProcessStarted) => {
                    tracing::info!("Remote process started: {}", command_line);
                }
                Some(RunnerEvent::RemoteOutput(data)) => {
                    stdout.write_all(&data).await?;
                    stdout.flush().await?;
                }
                Some(RunnerEvent::RemoteErrorOutput(data)) => {
                    stderr.write_all(&data).await?;
                    stderr.flush().await?;
                }
                Some(RunnerEvent::RemoteProcessFinished(code)) => {
                    tracing::info!("Remote process finished with exit code {}", code);
                    break code;
                }
                Some(RunnerEvent::Error(message)) => {
                    eprintln!("devrun: {}", message);
                    break FAILURE_EXIT_CODE;
                }
                None => break FAILURE_EXIT_CODE,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received Ctrl+C, stopping...");
                break INTERRUPTED_EXIT_CODE;
            }
        }
    };

    // Nobody reads events from here on; a full channel must not hold up shutdown.
    drop(events);
    handle.shutdown().await.ok();
    if let Err(e) = task.await {
        tracing::warn!("Runner task failed: {}", e);
    }

    std::process::exit(exit_code);
}

/// Command line for the remote process: the remote executable followed by
/// the CLI arguments, or the configured ones when none were given
fn remote_command_line(config: &RunConfig, cli_args: &[String]) -> String {
    let arguments: &[String] = if cli_args.is_empty() {
        &config.arguments
    } else {
        cli_args
    };
    std::iter::once(config.remote_executable.as_str())
        .chain(arguments.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ")
}

//! Process entry: tracing initialization and CLI dispatch.

use agent_device_config::{default_state_dir, DaemonConfig};
use anyhow::{Context, Result};
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::commands::{Cli, DaemonCliCommand, DaemonCommand, StatusCommand, StopCommand};

/// Install the tracing subscribers. With a log file, events go both to
/// stderr and, as JSON lines, to the file (`daemon.log`, truncated on
/// every launch). Safe to call more than once.
pub fn init_tracing(log_file: Option<&Path>) -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            let file = std::fs::File::create(path)
                .with_context(|| format!("failed to open daemon log {}", path.display()))?;
            let file_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_target(false)
                .with_ansi(false)
                .with_writer(Arc::new(file));
            if tracing_subscriber::registry()
                .with(env_filter)
                .with(stderr_layer)
                .with(file_layer)
                .try_init()
                .is_err()
            {
                warn!("tracing already initialised, skipping duplicate subscriber");
            }
        }
        None => {
            if tracing_subscriber::registry()
                .with(env_filter)
                .with(stderr_layer)
                .try_init()
                .is_err()
            {
                warn!("tracing already initialised, skipping duplicate subscriber");
            }
        }
    }
    Ok(())
}

/// Entry point invoked by `main.rs`.
pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        DaemonCliCommand::Run {
            state_dir,
            server_mode,
            config: config_path,
        } => {
            let mut config = match config_path {
                Some(path) => DaemonConfig::load(&path)?,
                None => DaemonConfig::from_env()?,
            };
            if let Some(dir) = state_dir {
                config.state_dir = dir;
            }
            if let Some(mode) = server_mode {
                config.server_mode = mode.parse()?;
            }
            config.validate()?;

            init_tracing(Some(&config.daemon_log_path()))?;
            DaemonCommand::execute(config).await
        }
        DaemonCliCommand::Status { state_dir } => {
            init_tracing(None)?;
            StatusCommand::execute(&state_dir.unwrap_or_else(default_state_dir))
        }
        DaemonCliCommand::Stop { state_dir } => {
            init_tracing(None)?;
            StopCommand::execute(&state_dir.unwrap_or_else(default_state_dir))
        }
    }
}

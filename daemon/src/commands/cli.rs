use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// CLI definition for the agent-device daemon binary.
#[derive(Parser, Debug)]
#[command(author, version, about = "agent-device control-plane daemon", name = "agent-deviced")]
pub struct Cli {
    #[command(subcommand)]
    pub command: DaemonCliCommand,
}

#[derive(Subcommand, Debug)]
pub enum DaemonCliCommand {
    /// Run the daemon in the foreground
    Run {
        /// State directory (default ~/.agent-device, or AGENT_DEVICE_STATE_DIR)
        #[arg(long)]
        state_dir: Option<PathBuf>,
        /// Transport servers to start: socket, http, or dual
        #[arg(long)]
        server_mode: Option<String>,
        /// Optional TOML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Report the running daemon's metadata
    Status {
        #[arg(long)]
        state_dir: Option<PathBuf>,
    },
    /// Stop the running daemon
    Stop {
        #[arg(long)]
        state_dir: Option<PathBuf>,
    },
}

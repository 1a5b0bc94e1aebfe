//! The `run`, `status`, and `stop` command implementations.

use agent_device_config::DaemonConfig;
use agent_device_protocol::DaemonMetadata;
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::cancel::CancelRegistry;
use crate::dispatch::Dispatcher;
use crate::identity;
use crate::leases::LeaseRegistry;
use crate::lifecycle::{self, LockOutcome};
use crate::pipeline::Pipeline;
use crate::sessions::SessionStore;
use crate::supervisor::{ProcessArena, RunnerSessions};
use crate::transport::{auth_hook::AuthHook, http, socket};
use crate::util;

pub struct DaemonCommand;

impl DaemonCommand {
    /// Bring the daemon up and serve until a termination signal arrives.
    pub async fn execute(config: DaemonConfig) -> Result<()> {
        let version = env!("CARGO_PKG_VERSION");

        lifecycle::ensure_state_dirs(&config)?;
        let lock = match lifecycle::acquire_lock(&config, version)? {
            LockOutcome::Acquired(lock) => lock,
            LockOutcome::Held { pid } => {
                eprintln!("agent-device daemon already running (pid {pid}); yielding");
                return Ok(());
            }
        };

        let arena = Arc::new(ProcessArena::new());
        let runners = Arc::new(RunnerSessions::new());
        let sessions = Arc::new(SessionStore::new(
            config.state_dir.clone(),
            config.app_log.clone(),
            arena.clone(),
        ));
        // Terminate log streamers a crashed predecessor left behind.
        sessions.sweep_orphans();

        let token = util::random_hex(16);
        let pipeline = Arc::new(Pipeline {
            token: token.clone(),
            sessions: sessions.clone(),
            leases: Arc::new(LeaseRegistry::new(config.lease.clone())),
            dispatcher: Arc::new(Dispatcher::new(arena.clone(), runners.clone())),
            cancel: Arc::new(CancelRegistry::new()),
            runners: runners.clone(),
            config: config.clone(),
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let socket_port = if config.server_mode.wants_socket() {
            Some(socket::start(pipeline.clone(), shutdown_rx.clone()).await?)
        } else {
            None
        };
        let http_port = if config.server_mode.wants_http() {
            let hook = AuthHook::from_env();
            if hook.is_some() {
                info!("HTTP auth hook enabled");
            }
            Some(http::start(pipeline.clone(), hook, shutdown_rx.clone()).await?)
        } else {
            None
        };

        lifecycle::write_metadata(&config, &token, socket_port, http_port, version)?;
        // A foreground launcher scrapes these lines for the ports.
        if let Some(port) = socket_port {
            println!("AGENT_DEVICE_DAEMON_PORT={port}");
        }
        if let Some(port) = http_port {
            println!("AGENT_DEVICE_DAEMON_HTTP_PORT={port}");
        }
        info!(
            mode = config.server_mode.as_str(),
            socket_port, http_port, "daemon ready"
        );

        Self::wait_for_shutdown_signal().await;

        // Single-shot drain.
        info!("draining daemon");
        let _ = shutdown_tx.send(true);
        sessions.persist_all();
        runners.signal_abort_all();
        arena.reap_all().await;
        lifecycle::remove_metadata(&config);
        lock.release();
        info!("daemon shut down cleanly");
        Ok(())
    }

    async fn wait_for_shutdown_signal() {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint =
            signal(SignalKind::interrupt()).expect("failed to register SIGINT handler");
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
        let mut sighup = signal(SignalKind::hangup()).expect("failed to register SIGHUP handler");

        tokio::select! {
            _ = sigint.recv() => info!("received SIGINT"),
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sighup.recv() => info!("received SIGHUP"),
        }
    }
}

pub struct StatusCommand;

impl StatusCommand {
    pub fn execute(state_dir: &Path) -> Result<()> {
        let path = state_dir.join("daemon.json");
        let metadata = match DaemonMetadata::read(&path) {
            Ok(metadata) => metadata,
            Err(_) => {
                println!("daemon: not running (no metadata at {})", path.display());
                return Ok(());
            }
        };
        let alive = identity::is_live_daemon_process(
            metadata.pid,
            metadata.process_start_time.as_deref(),
        );
        if !alive {
            println!("daemon: stale metadata (pid {} is gone)", metadata.pid);
            return Ok(());
        }
        println!(
            "{}",
            serde_json::to_string_pretty(&metadata).context("failed to render metadata")?
        );
        Ok(())
    }
}

pub struct StopCommand;

impl StopCommand {
    pub fn execute(state_dir: &Path) -> Result<()> {
        let metadata_path = state_dir.join("daemon.json");
        let lock_path = state_dir.join("daemon.lock");
        match DaemonMetadata::read(&metadata_path) {
            Ok(metadata) => {
                identity::stop_process(
                    metadata.pid,
                    3_000,
                    2_000,
                    metadata.process_start_time.as_deref(),
                );
                println!("stopped daemon (pid {})", metadata.pid);
            }
            Err(_) => {
                println!("daemon: not running");
            }
        }
        // A cleanly-exiting daemon removes these itself; sweep whatever
        // is left so the next launch starts fresh.
        for path in [metadata_path, lock_path] {
            if let Err(err) = std::fs::remove_file(&path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(error = %err, path = %path.display(), "failed to remove rendezvous file");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_status_without_metadata() {
        let dir = TempDir::new().unwrap();
        StatusCommand::execute(dir.path()).unwrap();
    }

    #[test]
    fn test_stop_without_metadata() {
        let dir = TempDir::new().unwrap();
        StopCommand::execute(dir.path()).unwrap();
    }

    #[test]
    fn test_stop_cleans_stale_files() {
        let dir = TempDir::new().unwrap();
        let metadata = DaemonMetadata {
            port: Some(1),
            http_port: None,
            transport: "socket".to_string(),
            token: "tok".to_string(),
            pid: u32::MAX - 41,
            process_start_time: Some("0".to_string()),
            version: "0.4.2".to_string(),
            code_signature: "x:0:0".to_string(),
            state_dir: dir.path().to_path_buf(),
        };
        metadata.write(&dir.path().join("daemon.json")).unwrap();
        std::fs::write(dir.path().join("daemon.lock"), "{}").unwrap();

        StopCommand::execute(dir.path()).unwrap();
        assert!(!dir.path().join("daemon.json").exists());
        assert!(!dir.path().join("daemon.lock").exists());
    }
}

//! Singleton election and the daemon rendezvous files.
//!
//! Exactly one daemon owns a state directory. Ownership is a lock file
//! created with `O_EXCL`; a stale lock (dead PID, or a PID that is no
//! longer a daemon of this codebase) is deleted and the acquisition
//! retried once. The metadata file is written only after the servers are
//! up, so clients never observe ports that are not yet listening.

use agent_device_config::DaemonConfig;
use agent_device_protocol::{DaemonMetadata, LockFile};
use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::identity;

/// Held for the daemon's lifetime; releasing removes the lock file.
#[derive(Debug)]
pub struct SingletonLock {
    path: PathBuf,
}

impl SingletonLock {
    pub fn release(self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            warn!(error = %err, path = %self.path.display(), "failed to remove lock file");
        }
    }
}

/// Outcome of a lock attempt.
#[derive(Debug)]
pub enum LockOutcome {
    Acquired(SingletonLock),
    /// Another live daemon of this codebase owns the lock.
    Held { pid: u32 },
}

fn try_create_lock(path: &Path, version: &str) -> std::io::Result<()> {
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)?;
    let lock = LockFile {
        pid: std::process::id(),
        start_time: identity::read_start_time(std::process::id()),
        started_at: chrono::Utc::now().to_rfc3339(),
        version: version.to_string(),
    };
    let content = serde_json::to_string_pretty(&lock).map_err(std::io::Error::other)?;
    file.write_all(content.as_bytes())?;
    Ok(())
}

/// Acquire the singleton lock, taking over a stale predecessor's lock
/// file if its recorded PID no longer identifies a live daemon.
pub fn acquire_lock(config: &DaemonConfig, version: &str) -> Result<LockOutcome> {
    let path = config.lock_path();
    std::fs::create_dir_all(&config.state_dir)
        .with_context(|| format!("failed to create {}", config.state_dir.display()))?;

    for attempt in 0..2 {
        match try_create_lock(&path, version) {
            Ok(()) => {
                info!(path = %path.display(), "singleton lock acquired");
                return Ok(LockOutcome::Acquired(SingletonLock { path }));
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                match LockFile::read(&path) {
                    Ok(lock)
                        if identity::is_live_daemon_process(
                            lock.pid,
                            lock.start_time.as_deref(),
                        ) =>
                    {
                        return Ok(LockOutcome::Held { pid: lock.pid });
                    }
                    Ok(lock) => {
                        warn!(
                            pid = lock.pid,
                            "stale lock from a dead daemon; removing and retrying"
                        );
                        let _ = std::fs::remove_file(&path);
                    }
                    Err(parse_err) => {
                        warn!(error = %parse_err, "unparseable lock file; removing and retrying");
                        let _ = std::fs::remove_file(&path);
                    }
                }
                if attempt == 1 {
                    bail!("failed to acquire singleton lock after takeover retry");
                }
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to create lock file {}", path.display()));
            }
        }
    }
    unreachable!("lock loop returns on every path");
}

/// Create the state-directory tree, warning when permissions are looser
/// than expected.
pub fn ensure_state_dirs(config: &DaemonConfig) -> Result<()> {
    for dir in [
        config.state_dir.clone(),
        config.sessions_dir(),
        config.logs_dir(),
    ] {
        if !dir.exists() {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&dir)?.permissions().mode() & 0o777;
            if mode & 0o077 != 0 && dir == config.state_dir {
                warn!(
                    dir = %dir.display(),
                    mode = format!("{mode:o}"),
                    "state directory is accessible to other users"
                );
            }
        }
    }
    Ok(())
}

/// Assemble and atomically write `daemon.json` once the servers are up.
#[allow(clippy::too_many_arguments)]
pub fn write_metadata(
    config: &DaemonConfig,
    token: &str,
    socket_port: Option<u16>,
    http_port: Option<u16>,
    version: &str,
) -> Result<DaemonMetadata> {
    let entry_path = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("agent-deviced"));
    let project_root = entry_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let metadata = DaemonMetadata {
        port: socket_port,
        http_port,
        transport: config.server_mode.as_str().to_string(),
        token: token.to_string(),
        pid: std::process::id(),
        process_start_time: identity::read_start_time(std::process::id()),
        version: version.to_string(),
        code_signature: identity::code_signature(&entry_path, &project_root),
        state_dir: config.state_dir.clone(),
    };
    metadata.write(&config.metadata_path())?;
    info!(path = %config.metadata_path().display(), "daemon metadata written");
    Ok(metadata)
}

/// Remove the metadata file on shutdown.
pub fn remove_metadata(config: &DaemonConfig) {
    if let Err(err) = std::fs::remove_file(config.metadata_path()) {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!(error = %err, "failed to remove daemon metadata");
        }
    }
}

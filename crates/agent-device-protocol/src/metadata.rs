//! Daemon metadata and lock-file formats.
//!
//! `daemon.json` is the rendezvous point between a running daemon and its
//! clients: transport ports, the per-run secret token, and enough identity
//! (pid, start time, version, code signature) for a client to decide
//! whether the daemon it found is the daemon it wants.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DaemonMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_port: Option<u16>,
    /// `socket`, `http`, or `dual`.
    pub transport: String,
    pub token: String,
    pub pid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_start_time: Option<String>,
    pub version: String,
    /// `<relative-path>:<size>:<mtime-ms>` of the daemon binary.
    pub code_signature: String,
    pub state_dir: PathBuf,
}

impl DaemonMetadata {
    pub fn read(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read daemon metadata {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse daemon metadata {}", path.display()))
    }

    /// Write atomically (temp file + rename) with `0600` permissions.
    pub fn write(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("metadata path has no parent directory")?;
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;

        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&tmp, content)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
        }
        std::fs::rename(&tmp, path)
            .with_context(|| format!("failed to move metadata into place at {}", path.display()))?;
        Ok(())
    }
}

/// Singleton lock file contents.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LockFile {
    pub pid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    /// RFC 3339 timestamp of lock acquisition.
    pub started_at: String,
    pub version: String,
}

impl LockFile {
    pub fn read(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read lock file {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse lock file {}", path.display()))
    }
}

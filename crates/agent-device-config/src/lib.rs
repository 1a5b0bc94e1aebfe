//! Configuration for the agent-device daemon.
//!
//! Settings are resolved in three layers: built-in defaults, an optional
//! TOML file, and `AGENT_DEVICE_*` environment variables (highest
//! precedence). The daemon binary calls [`DaemonConfig::from_env`] once at
//! startup and threads the result through every component.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Which transport servers the daemon brings up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerMode {
    Socket,
    Http,
    Dual,
}

impl Default for ServerMode {
    fn default() -> Self {
        ServerMode::Socket
    }
}

impl FromStr for ServerMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "socket" => Ok(ServerMode::Socket),
            "http" => Ok(ServerMode::Http),
            "dual" => Ok(ServerMode::Dual),
            other => bail!("unknown server mode `{other}` (expected socket, http, or dual)"),
        }
    }
}

impl ServerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerMode::Socket => "socket",
            ServerMode::Http => "http",
            ServerMode::Dual => "dual",
        }
    }

    pub fn wants_socket(&self) -> bool {
        matches!(self, ServerMode::Socket | ServerMode::Dual)
    }

    pub fn wants_http(&self) -> bool {
        matches!(self, ServerMode::Http | ServerMode::Dual)
    }
}

/// Lease TTL bounds and capacity cap for the `ios-simulator` backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseSettings {
    /// TTL applied when the client does not request one.
    pub default_ttl_ms: u64,
    /// Lower clamp for client-requested TTLs.
    pub min_ttl_ms: u64,
    /// Upper clamp for client-requested TTLs.
    pub max_ttl_ms: u64,
    /// Cap on concurrent simulator leases. `None` means unbounded.
    pub max_simulator_leases: Option<usize>,
}

impl Default for LeaseSettings {
    fn default() -> Self {
        Self {
            default_ttl_ms: 60_000,
            min_ttl_ms: 5_000,
            max_ttl_ms: 600_000,
            max_simulator_leases: None,
        }
    }
}

/// App-log rotation limits for per-session `app.log` files.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppLogSettings {
    pub max_bytes: u64,
    pub max_files: usize,
}

impl Default for AppLogSettings {
    fn default() -> Self {
        Self {
            max_bytes: 10 * 1024 * 1024,
            max_files: 3,
        }
    }
}

/// Deep-link templates for `trigger-app-event`. Placeholders `{event}`,
/// `{payload}`, and `{platform}` are substituted at dispatch time. The
/// platform-specific template wins over the generic one when both are set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppEventSettings {
    pub url_template: Option<String>,
    pub ios_url_template: Option<String>,
    pub android_url_template: Option<String>,
}

impl AppEventSettings {
    /// Template to use for the given platform name (`ios` or `android`).
    pub fn template_for(&self, platform: &str) -> Option<&str> {
        let specific = match platform {
            "ios" => self.ios_url_template.as_deref(),
            "android" => self.android_url_template.as_deref(),
            _ => None,
        };
        specific.or(self.url_template.as_deref())
    }
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Per-user root for metadata, session artifacts, and diagnostics.
    pub state_dir: PathBuf,
    pub server_mode: ServerMode,
    pub lease: LeaseSettings,
    pub app_log: AppLogSettings,
    pub app_event: AppEventSettings,
    /// Upper bound on steps accepted by a single `batch` request.
    pub batch_max_steps: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            server_mode: ServerMode::default(),
            lease: LeaseSettings::default(),
            app_log: AppLogSettings::default(),
            app_event: AppEventSettings::default(),
            batch_max_steps: 50,
        }
    }
}

/// `~/.agent-device`, or a path under the system temp directory when no
/// home directory is resolvable (CI containers).
pub fn default_state_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("AGENT_DEVICE_STATE_DIR") {
        return PathBuf::from(dir);
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".agent-device");
    }
    std::env::temp_dir().join("agent-device")
}

impl DaemonConfig {
    /// Load from a TOML file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let mut config: DaemonConfig = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var("AGENT_DEVICE_STATE_DIR") {
            if !dir.is_empty() {
                self.state_dir = PathBuf::from(dir);
            }
        }
        if let Ok(mode) = std::env::var("AGENT_DEVICE_DAEMON_SERVER_MODE") {
            if let Ok(parsed) = mode.parse() {
                self.server_mode = parsed;
            }
        }
        if let Some(ttl) = env_u64("AGENT_DEVICE_LEASE_TTL_MS") {
            self.lease.default_ttl_ms = ttl;
        }
        if let Some(min) = env_u64("AGENT_DEVICE_LEASE_MIN_TTL_MS") {
            self.lease.min_ttl_ms = min;
        }
        if let Some(max) = env_u64("AGENT_DEVICE_LEASE_MAX_TTL_MS") {
            self.lease.max_ttl_ms = max;
        }
        if let Some(cap) = env_u64("AGENT_DEVICE_MAX_SIMULATOR_LEASES") {
            // Zero or negative values disable the cap rather than deny all
            // allocations.
            self.lease.max_simulator_leases = if cap > 0 { Some(cap as usize) } else { None };
        }
        if let Some(bytes) = env_u64("AGENT_DEVICE_APP_LOG_MAX_BYTES") {
            self.app_log.max_bytes = bytes;
        }
        if let Some(files) = env_u64("AGENT_DEVICE_APP_LOG_MAX_FILES") {
            self.app_log.max_files = files as usize;
        }
        if let Ok(tpl) = std::env::var("AGENT_DEVICE_APP_EVENT_URL_TEMPLATE") {
            self.app_event.url_template = Some(tpl);
        }
        if let Ok(tpl) = std::env::var("AGENT_DEVICE_APP_EVENT_IOS_URL_TEMPLATE") {
            self.app_event.ios_url_template = Some(tpl);
        }
        if let Ok(tpl) = std::env::var("AGENT_DEVICE_APP_EVENT_ANDROID_URL_TEMPLATE") {
            self.app_event.android_url_template = Some(tpl);
        }
        if let Some(steps) = env_u64("AGENT_DEVICE_BATCH_MAX_STEPS") {
            if steps > 0 {
                self.batch_max_steps = steps as usize;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.state_dir.as_os_str().is_empty() {
            bail!("state_dir must not be empty");
        }
        if self.lease.min_ttl_ms > self.lease.max_ttl_ms {
            bail!(
                "lease min TTL ({}) exceeds max TTL ({})",
                self.lease.min_ttl_ms,
                self.lease.max_ttl_ms
            );
        }
        if self.app_log.max_files == 0 {
            bail!("app_log.max_files must be at least 1");
        }
        if self.batch_max_steps == 0 {
            bail!("batch_max_steps must be at least 1");
        }
        Ok(())
    }

    /// `<state-dir>/sessions`
    pub fn sessions_dir(&self) -> PathBuf {
        self.state_dir.join("sessions")
    }

    /// `<state-dir>/logs`
    pub fn logs_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }

    /// `<state-dir>/daemon.json`
    pub fn metadata_path(&self) -> PathBuf {
        self.state_dir.join("daemon.json")
    }

    /// `<state-dir>/daemon.lock`
    pub fn lock_path(&self) -> PathBuf {
        self.state_dir.join("daemon.lock")
    }

    /// `<state-dir>/daemon.log`
    pub fn daemon_log_path(&self) -> PathBuf {
        self.state_dir.join("daemon.log")
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

//! Session store: named, device-bound units of work.
//!
//! A session exclusively owns its device binding, app context, recording
//! handle, and app-log handle. Long-running processes behind the handles
//! are owned by the supervisor's arena; sessions carry ids only, and the
//! store reaps them LIFO when a session closes.

pub mod journal;

use agent_device_config::AppLogSettings;
use agent_device_protocol::DaemonError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::devices::DeviceDescriptor;
use crate::identity;
use crate::supervisor::{ArenaId, ProcessArena};
use crate::util;

/// Journal high-water mark; oldest entries drop past this.
const JOURNAL_CAP: usize = 2_000;
/// Startup-sample ring for `perf`.
const STARTUP_SAMPLE_CAP: usize = 50;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppContext {
    /// Bundle id (iOS) or package id (Android).
    pub bundle_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingHandle {
    /// Platform kind of the recorder (`ios-simulator`, `android`).
    pub kind: String,
    #[serde(skip)]
    pub handle_id: ArenaId,
    pub output: PathBuf,
    /// On-device path for recorders that write remotely first.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_path: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppLogHandle {
    pub backend: String,
    #[serde(skip)]
    pub handle_id: ArenaId,
    pub output: PathBuf,
    pub state: String,
}

/// One journaled action.
#[derive(Debug, Clone)]
pub struct ActionRecord {
    pub command: String,
    pub args: Vec<String>,
    pub flags: Map<String, Value>,
    pub ok: bool,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub name: String,
    pub device: DeviceDescriptor,
    pub app: Option<AppContext>,
    pub recording: Option<RecordingHandle>,
    pub app_log: Option<AppLogHandle>,
    pub journal: VecDeque<ActionRecord>,
    pub startup_samples: VecDeque<u64>,
    /// Active trace log, when `trace start` is running.
    pub trace_log: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

impl Session {
    pub fn new(name: &str, device: DeviceDescriptor) -> Self {
        let now = Utc::now();
        Self {
            name: name.to_string(),
            device,
            app: None,
            recording: None,
            app_log: None,
            journal: VecDeque::new(),
            startup_samples: VecDeque::new(),
            trace_log: None,
            created_at: now,
            last_used_at: now,
        }
    }

    /// Wire summary for `session list`.
    pub fn summary(&self) -> Value {
        json!({
            "name": self.name,
            "device": self.device,
            "app": self.app,
            "recording": self.recording.is_some(),
            "appLog": self.app_log.is_some(),
            "actions": self.journal.len(),
            "createdAt": self.created_at.to_rfc3339(),
            "lastUsedAt": self.last_used_at.to_rfc3339(),
        })
    }
}

pub struct SessionStore {
    state_dir: PathBuf,
    app_log: AppLogSettings,
    arena: Arc<ProcessArena>,
    sessions: Mutex<HashMap<String, Session>>,
}

impl SessionStore {
    pub fn new(state_dir: PathBuf, app_log: AppLogSettings, arena: Arc<ProcessArena>) -> Self {
        Self {
            state_dir,
            app_log,
            arena,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn arena(&self) -> &Arc<ProcessArena> {
        &self.arena
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Session>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn list(&self) -> Vec<Value> {
        let sessions = self.lock();
        let mut summaries: Vec<Value> = sessions.values().map(Session::summary).collect();
        summaries.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));
        summaries
    }

    pub fn names(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    pub fn get(&self, name: &str) -> Option<Session> {
        self.lock().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lock().contains_key(name)
    }

    /// Insert a new session. Enforces the invariant that a device id is
    /// bound to at most one session at any moment.
    pub fn insert(&self, session: Session) -> Result<(), DaemonError> {
        let mut sessions = self.lock();
        if let Some(existing) = sessions
            .values()
            .find(|s| s.device.identifier == session.device.identifier && s.name != session.name)
        {
            return Err(DaemonError::device_in_use(format!(
                "device `{}` is already bound to session `{}`",
                session.device.identifier, existing.name
            )));
        }
        sessions.insert(session.name.clone(), session);
        Ok(())
    }

    /// Read-modify-write under the store mutex.
    pub fn update<F>(&self, name: &str, mutate: F) -> Result<(), DaemonError>
    where
        F: FnOnce(&mut Session),
    {
        let mut sessions = self.lock();
        let Some(session) = sessions.get_mut(name) else {
            return Err(DaemonError::session_not_found(format!(
                "no active session `{name}`"
            )));
        };
        mutate(session);
        session.last_used_at = Utc::now();
        Ok(())
    }

    pub fn remove(&self, name: &str) -> Option<Session> {
        self.lock().remove(name)
    }

    /// Append to the session's bounded journal. `open` results carrying a
    /// `startup.durationMs` sample feed the perf ring too.
    pub fn record_action(
        &self,
        name: &str,
        command: &str,
        args: &[String],
        flags: &Map<String, Value>,
        result: &Value,
    ) {
        let mut sessions = self.lock();
        let Some(session) = sessions.get_mut(name) else {
            return;
        };
        if session.journal.len() >= JOURNAL_CAP {
            session.journal.pop_front();
        }
        session.journal.push_back(ActionRecord {
            command: command.to_string(),
            args: args.to_vec(),
            flags: flags.clone(),
            ok: true,
        });
        session.last_used_at = Utc::now();

        if command == "open" {
            if let Some(duration) = result
                .pointer("/startup/durationMs")
                .and_then(Value::as_u64)
            {
                if session.startup_samples.len() >= STARTUP_SAMPLE_CAP {
                    session.startup_samples.pop_front();
                }
                session.startup_samples.push_back(duration);
            }
        }
    }

    /// `perf` summary over the journaled startup samples.
    pub fn perf_summary(&self, name: &str) -> Result<Value, DaemonError> {
        let sessions = self.lock();
        let Some(session) = sessions.get(name) else {
            return Err(DaemonError::session_not_found(format!(
                "no active session `{name}`"
            )));
        };
        let samples: Vec<u64> = session.startup_samples.iter().copied().collect();
        if samples.is_empty() {
            return Ok(json!({"startup": {"samples": 0}}));
        }
        let min = *samples.iter().min().expect("non-empty");
        let max = *samples.iter().max().expect("non-empty");
        let mean = samples.iter().sum::<u64>() / samples.len() as u64;
        Ok(json!({
            "startup": {
                "samples": samples.len(),
                "minMs": min,
                "maxMs": max,
                "meanMs": mean,
            }
        }))
    }

    // ===== Paths =====

    pub fn sessions_dir(&self) -> PathBuf {
        self.state_dir.join("sessions")
    }

    fn sanitize(name: &str) -> String {
        name.chars()
            .map(|c| match c {
                '/' | '\\' | ':' => '_',
                other => other,
            })
            .collect()
    }

    /// Per-session artifact directory: `<sessions>/<name>`.
    pub fn session_dir(&self, name: &str) -> PathBuf {
        self.sessions_dir().join(Self::sanitize(name))
    }

    /// Stable app-log path: `<sessions>/<name>/app.log`.
    pub fn resolve_app_log_path(&self, name: &str) -> PathBuf {
        self.session_dir(name).join("app.log")
    }

    /// Rotate `app.log` → `app.log.1` → … bounded by the configured file
    /// count, dropping the oldest. Called before a new stream starts and
    /// when the active file crosses the byte cap.
    pub fn rotate_app_log(&self, name: &str) {
        let base = self.resolve_app_log_path(name);
        if !base.exists() {
            return;
        }
        if let Ok(meta) = std::fs::metadata(&base) {
            if meta.len() < self.app_log.max_bytes {
                return;
            }
        }
        let oldest = base.with_extension(format!("log.{}", self.app_log.max_files));
        let _ = std::fs::remove_file(oldest);
        for index in (1..self.app_log.max_files).rev() {
            let from = base.with_extension(format!("log.{index}"));
            let to = base.with_extension(format!("log.{}", index + 1));
            if from.exists() {
                let _ = std::fs::rename(from, to);
            }
        }
        let _ = std::fs::rename(&base, base.with_extension("log.1"));
    }

    // ===== Journal persistence =====

    /// Serialize the journal to a replay script. Defaults to
    /// `<sessions>/<name>-<ts>.ad`; an explicit target has its parents
    /// created.
    pub fn write_session_log(
        &self,
        session: &Session,
        target: Option<&Path>,
    ) -> Result<PathBuf, DaemonError> {
        let path = match target {
            Some(path) => path.to_path_buf(),
            None => self.sessions_dir().join(format!(
                "{}-{}.ad",
                Self::sanitize(&session.name),
                util::filename_timestamp()
            )),
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| {
                DaemonError::command_failed(format!(
                    "failed to create {}: {err}",
                    parent.display()
                ))
            })?;
        }

        let mut file = std::fs::File::create(&path).map_err(|err| {
            DaemonError::command_failed(format!("failed to write {}: {err}", path.display()))
        })?;
        for record in &session.journal {
            let line = journal::encode_line(&record.command, &record.args, &record.flags);
            writeln!(file, "{line}").map_err(|err| {
                DaemonError::command_failed(format!("failed to write {}: {err}", path.display()))
            })?;
        }
        debug!(session = %session.name, path = %path.display(), "session journal written");
        Ok(path)
    }

    /// Close a session: stop the recording, then the log stream (in that
    /// order), write the journal, and drop the entry. Returns the journal
    /// path.
    pub async fn close_session(
        &self,
        name: &str,
        save_script: Option<&Path>,
    ) -> Result<(Session, PathBuf), DaemonError> {
        let session = {
            let mut sessions = self.lock();
            sessions.remove(name).ok_or_else(|| {
                DaemonError::session_not_found(format!("no active session `{name}`"))
            })?
        };

        if let Some(recording) = &session.recording {
            self.arena.reap(recording.handle_id).await;
        }
        if let Some(app_log) = &session.app_log {
            self.arena.reap(app_log.handle_id).await;
        }
        // Anything else the session spawned goes LIFO.
        self.arena.reap_session(name).await;

        let path = self.write_session_log(&session, save_script)?;
        info!(session = name, journal = %path.display(), "session closed");
        Ok((session, path))
    }

    /// Persist every open session's journal. Shutdown drain path.
    pub fn persist_all(&self) {
        let sessions = self.lock();
        for session in sessions.values() {
            if let Err(err) = self.write_session_log(session, None) {
                warn!(session = %session.name, error = %err, "failed to persist session journal");
            }
        }
    }

    /// Startup sweep: terminate log streamers stashed in pid files by a
    /// previous daemon whose sessions no longer exist.
    pub fn sweep_orphans(&self) {
        let sessions_dir = self.sessions_dir();
        let Ok(entries) = std::fs::read_dir(&sessions_dir) else {
            return;
        };
        for entry in entries.flatten() {
            let dir = entry.path();
            if !dir.is_dir() {
                continue;
            }
            let Ok(files) = std::fs::read_dir(&dir) else {
                continue;
            };
            for file in files.flatten() {
                let path = file.path();
                let is_pid_file = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.ends_with(".pid"))
                    .unwrap_or(false);
                if !is_pid_file {
                    continue;
                }
                if let Ok(content) = std::fs::read_to_string(&path) {
                    if let Ok(pid) = content.trim().parse::<u32>() {
                        warn!(pid, path = %path.display(), "terminating orphaned session process");
                        identity::stop_process(pid, 1_000, 1_000, None);
                    }
                }
                let _ = std::fs::remove_file(&path);
            }
        }
    }
}

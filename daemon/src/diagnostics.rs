//! Per-request diagnostics.
//!
//! Every request runs inside a [`RequestScope`] that buffers structured
//! events. On success the buffer is dropped (unless the request asked for
//! debug); on failure it is flushed to a per-session ndjson file whose id
//! and path are stamped onto the normalized error so clients can point
//! users at the evidence.

use agent_device_protocol::redact_value;
use serde::Serialize;
use serde_json::Value;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;

use crate::util;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticEvent {
    pub level: String,
    pub phase: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub data: Value,
}

/// Buffered diagnostics for one request.
pub struct RequestScope {
    pub session: String,
    pub command: String,
    pub request_id: String,
    pub debug: bool,
    started: Instant,
    events: Mutex<Vec<DiagnosticEvent>>,
}

impl RequestScope {
    pub fn new(session: &str, command: &str, request_id: &str, debug: bool) -> Self {
        Self {
            session: session.to_string(),
            command: command.to_string(),
            request_id: request_id.to_string(),
            debug,
            started: Instant::now(),
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn event(&self, level: &str, phase: &str, data: Value) {
        let event = DiagnosticEvent {
            level: level.to_string(),
            phase: phase.to_string(),
            timestamp: util::current_timestamp_ms(),
            data,
        };
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Wrap an async block with `<phase>:start` / `<phase>:end` events,
    /// recording the duration on the end event.
    pub async fn time<T, F>(&self, phase: &str, fut: F) -> T
    where
        F: std::future::Future<Output = T>,
    {
        let started = Instant::now();
        self.event("debug", &format!("{phase}:start"), Value::Null);
        let out = fut.await;
        self.event(
            "debug",
            &format!("{phase}:end"),
            serde_json::json!({"durationMs": started.elapsed().as_millis() as u64}),
        );
        out
    }

    pub fn event_count(&self) -> usize {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Flush the buffer to
    /// `<state-dir>/logs/<session>/<YYYY-MM-DD>/<ts>-<diag_id>.ndjson`,
    /// redacting every event first. Returns the diagnostic id and file
    /// path, or `None` when nothing could be written; diagnostics must
    /// never fail a request.
    pub fn flush(&self, state_dir: &Path) -> Option<(String, PathBuf)> {
        let diag_id = uuid::Uuid::new_v4().simple().to_string()[..12].to_string();
        let dir = state_dir
            .join("logs")
            .join(sanitize_path_component(&self.session))
            .join(util::log_date());
        if let Err(err) = std::fs::create_dir_all(&dir) {
            tracing::warn!(error = %err, "failed to create diagnostics directory");
            return None;
        }

        let path = dir.join(format!("{}-{}.ndjson", util::filename_timestamp(), diag_id));
        let mut file = match std::fs::File::create(&path) {
            Ok(f) => f,
            Err(err) => {
                tracing::warn!(error = %err, "failed to create diagnostics file");
                return None;
            }
        };

        let events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        let header = serde_json::json!({
            "level": "info",
            "phase": "scope",
            "timestamp": util::current_timestamp_ms(),
            "data": {
                "session": self.session,
                "command": self.command,
                "requestId": self.request_id,
                "elapsedMs": self.elapsed_ms(),
            }
        });
        if writeln!(file, "{header}").is_err() {
            return None;
        }
        for event in events.iter() {
            let mut value = match serde_json::to_value(event) {
                Ok(v) => v,
                Err(_) => continue,
            };
            redact_value(&mut value);
            if writeln!(file, "{value}").is_err() {
                return None;
            }
        }

        Some((diag_id, path))
    }
}

/// Session names may carry a `tenant:` prefix; keep the separator readable
/// but filesystem-safe.
fn sanitize_path_component(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '_',
            other => other,
        })
        .collect()
}

//! Handler groups tried in order by the pipeline: lease, session,
//! snapshot, record/trace, find, interaction. A handler returns `None`
//! when the command is not its to claim.

use agent_device_protocol::{DaemonError, Request};
use serde_json::{json, Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use super::Pipeline;
use crate::cancel::CancelHandle;
use crate::capability::Selector;
use crate::devices::{DeviceKind, Platform};
use crate::diagnostics::RequestScope;
use crate::sessions::{AppContext, AppLogHandle, RecordingHandle, Session};
use crate::util;

type HandlerResult = Option<Result<Value, DaemonError>>;

fn backend_label(platform: Platform, kind: DeviceKind) -> &'static str {
    match (platform, kind) {
        (Platform::Ios, DeviceKind::Simulator) => "ios-simulator",
        (Platform::Ios, _) => "ios-device",
        (Platform::Android, _) => "android",
    }
}

/// Minimal percent-encoding for deep-link template substitution.
fn percent_encode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

impl Pipeline {
    // ===== Lease operations =====

    pub(crate) async fn handle_lease_ops(self: &Arc<Self>, req: &Request) -> HandlerResult {
        let result = match req.command.as_str() {
            "lease_allocate" => {
                let Some(tenant) = req.tenant_id() else {
                    return Some(Err(DaemonError::invalid_args(
                        "lease_allocate requires a tenantId",
                    )));
                };
                let Some(run) = req.run_id() else {
                    return Some(Err(DaemonError::invalid_args(
                        "lease_allocate requires a runId",
                    )));
                };
                self.leases
                    .allocate(tenant, run, req.flag_str("backend"), req.flag_u64("ttlMs"))
                    .map(|lease| json!({"lease": lease}))
            }
            "lease_heartbeat" => {
                let Some(lease_id) = req.lease_id() else {
                    return Some(Err(DaemonError::invalid_args(
                        "lease_heartbeat requires a leaseId",
                    )));
                };
                self.leases
                    .heartbeat(lease_id, req.tenant_id(), req.run_id(), req.flag_u64("ttlMs"))
                    .map(|lease| json!({"lease": lease}))
            }
            "lease_release" => {
                let Some(lease_id) = req.lease_id() else {
                    return Some(Err(DaemonError::invalid_args(
                        "lease_release requires a leaseId",
                    )));
                };
                self.leases
                    .release(lease_id, req.tenant_id(), req.run_id())
                    .map(|released| json!({"released": released}))
            }
            _ => return None,
        };
        Some(result)
    }

    // ===== Session operations =====

    pub(crate) async fn handle_session_ops(
        self: &Arc<Self>,
        req: &Request,
        selector: &Selector,
        scope: &RequestScope,
        cancel: &CancelHandle,
    ) -> HandlerResult {
        match req.command.as_str() {
            "session_list" => Some(Ok(self.session_list(req))),
            "session" if req.args.first().map(String::as_str) == Some("list") => {
                Some(Ok(self.session_list(req)))
            }
            "devices" => Some(
                self.dispatcher
                    .discover(selector)
                    .await
                    .map(|devices| json!({"devices": devices})),
            ),
            "open" => Some(self.open_session(req, selector, scope, cancel).await),
            "close" => Some(self.close_session(req, cancel).await),
            "boot" => Some(self.boot_device(req, selector, cancel).await),
            "batch" => Some(super::batch::run(self, req, scope).await),
            "replay" => Some(super::replay::run(self, req).await),
            "logs" => Some(self.app_logs(req, cancel).await),
            "perf" => Some(self.sessions.perf_summary(&req.session)),
            "trigger-app-event" => Some(self.trigger_app_event(req, scope, cancel).await),
            _ => None,
        }
    }

    fn session_list(&self, req: &Request) -> Value {
        let mut sessions = self.sessions.list();
        if req.tenant_isolated() {
            if let Some(tenant) = req.tenant_id() {
                let prefix = format!("{tenant}:");
                sessions.retain(|s| {
                    s["name"]
                        .as_str()
                        .map(|name| name.starts_with(&prefix))
                        .unwrap_or(false)
                });
            }
        }
        json!({"sessions": sessions})
    }

    async fn open_session(
        self: &Arc<Self>,
        req: &Request,
        selector: &Selector,
        scope: &RequestScope,
        cancel: &CancelHandle,
    ) -> Result<Value, DaemonError> {
        let existing = self.sessions.get(&req.session);
        let (device, created) = match &existing {
            Some(session) => (session.device.clone(), false),
            None => (self.dispatcher.select_device(selector).await?, true),
        };

        if created {
            self.sessions
                .insert(Session::new(&req.session, device.clone()))?;
            scope.event(
                "info",
                "session_bound",
                json!({"session": req.session, "device": device.identifier}),
            );
        }

        let ctx = self.execution_context(req, existing.as_ref(), cancel);
        let started = Instant::now();
        let dispatched = scope
            .time(
                "open",
                self.dispatcher
                    .dispatch(&device, "open", &req.args, &req.flags, &ctx),
            )
            .await;
        let mut value = match dispatched {
            Ok(value) => value,
            Err(err) => {
                if created {
                    self.sessions.remove(&req.session);
                }
                return Err(err);
            }
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        let bundle_id = value
            .get("bundleId")
            .or_else(|| value.get("packageId"))
            .and_then(Value::as_str)
            .map(str::to_string);
        if let Some(bundle_id) = &bundle_id {
            let app = AppContext {
                bundle_id: bundle_id.clone(),
                name: req.args.first().cloned(),
            };
            self.sessions.update(&req.session, |s| s.app = Some(app))?;
        }

        if let Value::Object(map) = &mut value {
            map.insert("session".to_string(), json!(req.session));
            map.insert("startup".to_string(), json!({"durationMs": duration_ms}));
        }
        Ok(value)
    }

    async fn close_session(
        self: &Arc<Self>,
        req: &Request,
        cancel: &CancelHandle,
    ) -> Result<Value, DaemonError> {
        let session = self.require_session(&req.session)?;

        // Best-effort app terminate before the handles go away.
        if session.app.is_some() {
            let ctx = self.execution_context(req, Some(&session), cancel);
            let _ = self
                .dispatcher
                .dispatch(&session.device, "close", &[], &req.flags, &ctx)
                .await;
        }

        // Recording stops before the log stream; a remote recording is
        // pulled once its recorder has exited.
        if let Some(recording) = session.recording.clone() {
            self.sessions.arena().reap(recording.handle_id).await;
            if let Some(remote) = &recording.remote_path {
                let mut flags = Map::new();
                flags.insert("remotePath".to_string(), json!(remote));
                let mut ctx = self.execution_context(req, Some(&session), cancel);
                ctx.out_path = Some(recording.output.clone());
                let _ = self
                    .dispatcher
                    .dispatch(&session.device, "record-finish", &[], &flags, &ctx)
                    .await;
            }
        }

        let save_script = req
            .flag_str("save-script")
            .map(PathBuf::from)
            .map(|path| match (&req.meta.cwd, path.is_absolute()) {
                (Some(cwd), false) => PathBuf::from(cwd).join(path),
                _ => path,
            });
        let (closed, journal) = self
            .sessions
            .close_session(&req.session, save_script.as_deref())
            .await?;

        Ok(json!({
            "session": closed.name,
            "device": closed.device.identifier,
            "journal": journal,
            "actions": closed.journal.len(),
        }))
    }

    async fn boot_device(
        self: &Arc<Self>,
        req: &Request,
        selector: &Selector,
        cancel: &CancelHandle,
    ) -> Result<Value, DaemonError> {
        let session = self.sessions.get(&req.session);
        let device = match &session {
            Some(session) => session.device.clone(),
            None => self.dispatcher.select_device(selector).await?,
        };
        let ctx = self.execution_context(req, session.as_ref(), cancel);
        self.dispatcher
            .dispatch(&device, "boot", &req.args, &req.flags, &ctx)
            .await
    }

    async fn app_logs(
        self: &Arc<Self>,
        req: &Request,
        cancel: &CancelHandle,
    ) -> Result<Value, DaemonError> {
        let session = self.require_session(&req.session)?;
        let action = req.args.first().map(String::as_str).unwrap_or("start");
        match action {
            "start" => {
                if session.app_log.is_some() {
                    return Err(DaemonError::invalid_args(format!(
                        "session `{}` already streams app logs",
                        req.session
                    )));
                }
                self.check_capability("logs", &session)?;
                self.sessions.rotate_app_log(&req.session);
                let output = self.sessions.resolve_app_log_path(&req.session);

                let mut flags = req.flags.clone();
                flags.insert("sessionName".to_string(), json!(req.session));
                let mut ctx = self.execution_context(req, Some(&session), cancel);
                ctx.out_path = Some(output.clone());

                let result = self
                    .dispatcher
                    .dispatch(&session.device, "logs-start", &[], &flags, &ctx)
                    .await?;
                let handle_id = result
                    .get("handleId")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| {
                        DaemonError::command_failed("log backend returned no process handle")
                    })?;

                let handle = AppLogHandle {
                    backend: backend_label(session.device.platform, session.device.kind)
                        .to_string(),
                    handle_id,
                    output: output.clone(),
                    state: "streaming".to_string(),
                };
                self.sessions
                    .update(&req.session, |s| s.app_log = Some(handle))?;
                Ok(json!({"path": output, "state": "streaming"}))
            }
            "stop" => {
                let Some(handle) = session.app_log.clone() else {
                    return Err(DaemonError::invalid_args(format!(
                        "session `{}` has no active app-log stream",
                        req.session
                    )));
                };
                self.sessions.arena().reap(handle.handle_id).await;
                self.sessions.update(&req.session, |s| s.app_log = None)?;
                Ok(json!({"path": handle.output, "state": "stopped"}))
            }
            "path" => Ok(json!({"path": self.sessions.resolve_app_log_path(&req.session)})),
            other => Err(DaemonError::invalid_args(format!(
                "unknown logs action `{other}` (expected start, stop, or path)"
            ))),
        }
    }

    async fn trigger_app_event(
        self: &Arc<Self>,
        req: &Request,
        scope: &RequestScope,
        cancel: &CancelHandle,
    ) -> Result<Value, DaemonError> {
        let Some(event) = req.args.first() else {
            return Err(DaemonError::invalid_args(
                "trigger-app-event requires an event name",
            ));
        };
        let session = self.require_session(&req.session)?;
        self.check_capability("trigger-app-event", &session)?;

        let platform = session.device.platform.as_str();
        let template = self
            .config
            .app_event
            .template_for(platform)
            .ok_or_else(|| {
                DaemonError::invalid_args(
                    "no app-event URL template configured (AGENT_DEVICE_APP_EVENT_URL_TEMPLATE)",
                )
            })?;
        let payload = req.flag_str("payload").unwrap_or("{}");
        let url = template
            .replace("{event}", &percent_encode(event))
            .replace("{payload}", &percent_encode(payload))
            .replace("{platform}", platform);
        scope.event("debug", "app_event_url", json!({"url": url}));

        let mut flags = req.flags.clone();
        flags.insert("url".to_string(), json!(url));
        let ctx = self.execution_context(req, Some(&session), cancel);
        self.dispatcher
            .dispatch(&session.device, "trigger-app-event", &req.args, &flags, &ctx)
            .await
    }

    // ===== Snapshot operations =====

    pub(crate) async fn handle_snapshot_ops(
        self: &Arc<Self>,
        req: &Request,
        scope: &RequestScope,
        cancel: &CancelHandle,
    ) -> HandlerResult {
        match req.command.as_str() {
            "snapshot" | "diff" => Some(self.dispatch_with_session(req, scope, cancel).await),
            _ => None,
        }
    }

    // ===== Record / trace operations =====

    pub(crate) async fn handle_record_ops(
        self: &Arc<Self>,
        req: &Request,
        scope: &RequestScope,
        cancel: &CancelHandle,
    ) -> HandlerResult {
        match req.command.as_str() {
            "record" => Some(self.record(req, scope, cancel).await),
            "trace" => Some(self.trace(req)),
            _ => None,
        }
    }

    async fn record(
        self: &Arc<Self>,
        req: &Request,
        scope: &RequestScope,
        cancel: &CancelHandle,
    ) -> Result<Value, DaemonError> {
        let session = self.require_session(&req.session)?;
        match req.args.first().map(String::as_str) {
            Some("start") => {
                if session.recording.is_some() {
                    return Err(DaemonError::invalid_args(format!(
                        "session `{}` is already recording",
                        req.session
                    )));
                }
                self.check_capability("record", &session)?;

                let output = self.resolve_out_path(req).unwrap_or_else(|| {
                    self.sessions
                        .session_dir(&req.session)
                        .join(format!("recording-{}.mp4", util::filename_timestamp()))
                });
                let mut flags = req.flags.clone();
                flags.insert("sessionName".to_string(), json!(req.session));
                let mut ctx = self.execution_context(req, Some(&session), cancel);
                ctx.out_path = Some(output.clone());

                let result = scope
                    .time(
                        "record-start",
                        self.dispatcher
                            .dispatch(&session.device, "record-start", &[], &flags, &ctx),
                    )
                    .await?;
                let handle_id = result
                    .get("handleId")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| {
                        DaemonError::command_failed("recorder returned no process handle")
                    })?;
                let remote_path = result
                    .get("remotePath")
                    .and_then(Value::as_str)
                    .map(str::to_string);

                let handle = RecordingHandle {
                    kind: backend_label(session.device.platform, session.device.kind).to_string(),
                    handle_id,
                    output: output.clone(),
                    remote_path: remote_path.clone(),
                };
                self.sessions
                    .update(&req.session, |s| s.recording = Some(handle))?;
                Ok(json!({"path": output, "remotePath": remote_path, "state": "recording"}))
            }
            Some("stop") => {
                let Some(recording) = session.recording.clone() else {
                    return Err(DaemonError::invalid_args(format!(
                        "session `{}` has no active recording",
                        req.session
                    )));
                };
                self.sessions.arena().reap(recording.handle_id).await;
                if let Some(remote) = &recording.remote_path {
                    let mut flags = Map::new();
                    flags.insert("remotePath".to_string(), json!(remote));
                    let mut ctx = self.execution_context(req, Some(&session), cancel);
                    ctx.out_path = Some(recording.output.clone());
                    self.dispatcher
                        .dispatch(&session.device, "record-finish", &[], &flags, &ctx)
                        .await?;
                }
                self.sessions.update(&req.session, |s| s.recording = None)?;
                Ok(json!({"path": recording.output, "state": "stopped"}))
            }
            other => Err(DaemonError::invalid_args(format!(
                "record requires start or stop, got {other:?}"
            ))),
        }
    }

    fn trace(self: &Arc<Self>, req: &Request) -> Result<Value, DaemonError> {
        let session = self.require_session(&req.session)?;
        match req.args.first().map(String::as_str) {
            Some("start") => {
                if session.trace_log.is_some() {
                    return Err(DaemonError::invalid_args(format!(
                        "session `{}` is already tracing",
                        req.session
                    )));
                }
                let path = self
                    .sessions
                    .session_dir(&req.session)
                    .join(format!("trace-{}.ndjson", util::filename_timestamp()));
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).map_err(|err| {
                        DaemonError::command_failed(format!(
                            "failed to create trace directory: {err}"
                        ))
                    })?;
                }
                self.sessions
                    .update(&req.session, |s| s.trace_log = Some(path.clone()))?;
                Ok(json!({"path": path, "state": "tracing"}))
            }
            Some("stop") => {
                let Some(path) = session.trace_log.clone() else {
                    return Err(DaemonError::invalid_args(format!(
                        "session `{}` has no active trace",
                        req.session
                    )));
                };
                self.sessions.update(&req.session, |s| s.trace_log = None)?;
                Ok(json!({"path": path, "state": "stopped"}))
            }
            other => Err(DaemonError::invalid_args(format!(
                "trace requires start or stop, got {other:?}"
            ))),
        }
    }

    // ===== Find operations =====

    pub(crate) async fn handle_find_ops(
        self: &Arc<Self>,
        req: &Request,
        scope: &RequestScope,
        cancel: &CancelHandle,
    ) -> HandlerResult {
        let min_args = match req.command.as_str() {
            "find" | "is" => 1,
            "get" => 2,
            _ => return None,
        };
        if req.args.len() < min_args {
            return Some(Err(DaemonError::invalid_args(format!(
                "`{}` requires at least {min_args} argument(s)",
                req.command
            ))));
        }
        Some(self.dispatch_with_session(req, scope, cancel).await)
    }

    // ===== Interaction operations =====

    pub(crate) async fn handle_interaction_ops(
        self: &Arc<Self>,
        req: &Request,
        scope: &RequestScope,
        cancel: &CancelHandle,
    ) -> HandlerResult {
        let min_args = match req.command.as_str() {
            "press" | "longpress" | "focus" | "type" | "swipe" | "scrollintoview"
            | "settings" | "keyboard" => 1,
            "fill" => 2,
            "scroll" | "pinch" | "back" | "home" | "app-switcher" | "wait" | "alert" => 0,
            _ => return None,
        };
        if req.args.len() < min_args {
            return Some(Err(DaemonError::invalid_args(format!(
                "`{}` requires at least {min_args} argument(s)",
                req.command
            ))));
        }
        Some(self.dispatch_with_session(req, scope, cancel).await)
    }
}

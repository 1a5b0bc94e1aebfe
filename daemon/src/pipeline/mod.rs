//! Request pipeline: the ordered admission stages every request passes
//! through, shared by both transports.
//!
//! Stage order is fixed: token check, alias normalization, tenant
//! scoping, lease admission, selector compatibility, handler
//! demultiplexing, default dispatch, journaling, finalization. Handler
//! groups are tried in order; the first one that claims the command wins.

pub mod batch;
pub mod handlers;
pub mod replay;

use agent_device_config::DaemonConfig;
use agent_device_protocol::{normalize, DaemonError, Request, Response};
use futures::future::BoxFuture;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cancel::{CancelHandle, CancelRegistry};
use crate::capability::{self, Selector};
use crate::diagnostics::RequestScope;
use crate::dispatch::{Dispatcher, ExecutionContext};
use crate::leases::{self, LeaseRegistry, SIMULATOR_BACKEND};
use crate::sessions::{Session, SessionStore};
use crate::supervisor::RunnerSessions;
use crate::util;

/// Command aliases, applied once and never recursively.
const ALIASES: &[(&str, &str)] = &[
    ("click", "press"),
    ("session-list", "session_list"),
    ("lease-allocate", "lease_allocate"),
    ("lease-heartbeat", "lease_heartbeat"),
    ("lease-release", "lease_release"),
];

/// Commands exempt from lease admission under tenant isolation.
const LEASE_EXEMPT: &[&str] = &[
    "session_list",
    "devices",
    "lease_allocate",
    "lease_heartbeat",
    "lease_release",
];

/// Commands exempt from the selector-compatibility check.
const SELECTOR_EXEMPT: &[&str] = &["session_list", "devices"];

/// Commands that never land in a session journal.
const NO_JOURNAL: &[&str] = &[
    "session_list",
    "session",
    "devices",
    "lease_allocate",
    "lease_heartbeat",
    "lease_release",
    "batch",
    "replay",
    "perf",
    "close",
];

pub struct Pipeline {
    pub config: DaemonConfig,
    /// Per-run secret from the daemon metadata file.
    pub token: String,
    pub sessions: Arc<SessionStore>,
    pub leases: Arc<LeaseRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub cancel: Arc<CancelRegistry>,
    pub runners: Arc<RunnerSessions>,
}

fn alias_of(command: &str) -> Option<&'static str> {
    ALIASES
        .iter()
        .find(|(from, _)| *from == command)
        .map(|(_, to)| *to)
}

fn should_journal(command: &str) -> bool {
    !NO_JOURNAL.contains(&command)
}

impl Pipeline {
    /// Entry point for both transports. Boxed so `batch` and `replay` can
    /// re-enter it recursively.
    pub fn handle_request(self: &Arc<Self>, req: Request) -> BoxFuture<'static, Response> {
        let this = Arc::clone(self);
        Box::pin(async move { this.handle_request_inner(req).await })
    }

    async fn handle_request_inner(self: Arc<Self>, mut req: Request) -> Response {
        let request_id = req
            .meta
            .request_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        req.meta.request_id = Some(request_id.clone());

        let scope = RequestScope::new(&req.session, &req.command, &request_id, req.meta.debug);
        let cancel = self.cancel.register(&request_id);

        debug!(
            request_id = %request_id,
            session = %req.session,
            command = %req.command,
            "request accepted"
        );

        let outcome = self.run_stages(&mut req, &scope, &cancel).await;
        self.cancel.unregister(&request_id);

        match outcome {
            Ok(data) => {
                scope.event(
                    "info",
                    "request_success",
                    json!({"command": req.command, "durationMs": scope.elapsed_ms()}),
                );
                if scope.debug {
                    scope.flush(&self.config.state_dir);
                }
                info!(
                    request_id = %request_id,
                    command = %req.command,
                    duration_ms = scope.elapsed_ms(),
                    "request completed"
                );
                Response::success(data)
            }
            Err(err) => {
                scope.event(
                    "error",
                    "request_failed",
                    json!({
                        "command": req.command,
                        "code": err.code.as_str(),
                        "message": err.message,
                        "durationMs": scope.elapsed_ms(),
                    }),
                );
                warn!(
                    request_id = %request_id,
                    command = %req.command,
                    code = err.code.as_str(),
                    error = %err.message,
                    "request failed"
                );
                let flushed = scope.flush(&self.config.state_dir);
                let mut error = normalize(err);
                if let Some((diag_id, path)) = flushed {
                    error.diagnostic_id = Some(diag_id);
                    error.log_path = Some(path.to_string_lossy().to_string());
                }
                Response::failure(error)
            }
        }
    }

    async fn run_stages(
        self: &Arc<Self>,
        req: &mut Request,
        scope: &RequestScope,
        cancel: &CancelHandle,
    ) -> Result<Value, DaemonError> {
        // 1. Token check. No details on mismatch.
        let provided = req.token.as_deref().unwrap_or("");
        if !util::constant_time_eq(provided, &self.token) {
            return Err(DaemonError::unauthorized("invalid daemon token"));
        }

        // 2. Alias normalization, applied once.
        if let Some(canonical) = alias_of(&req.command) {
            scope.event(
                "debug",
                "alias",
                json!({"from": req.command, "to": canonical}),
            );
            req.command = canonical.to_string();
        }

        // 3. Tenant scoping. The rewrite is idempotent so re-entrant
        // handlers (batch, replay) pass through unchanged.
        if req.tenant_isolated() {
            let tenant = req
                .tenant_id()
                .ok_or_else(|| {
                    DaemonError::invalid_args("tenant isolation requires a tenant id")
                })?
                .to_string();
            if !leases::valid_scope_id(&tenant) {
                return Err(DaemonError::invalid_args(format!(
                    "invalid tenant id `{tenant}`"
                )));
            }
            let prefix = format!("{tenant}:");
            if !req.session.starts_with(&prefix) {
                req.session = format!("{prefix}{}", req.session);
            }

            // 4. Lease admission.
            if !LEASE_EXEMPT.contains(&req.command.as_str()) {
                self.leases.assert_admission(
                    Some(&tenant),
                    req.run_id(),
                    req.lease_id(),
                    SIMULATOR_BACKEND,
                )?;
                scope.event("debug", "lease_admitted", json!({"tenant": tenant}));
            }
        }

        // 5. Selector compatibility against an existing session's device.
        let selector = Selector::from_request(req)?;
        if !SELECTOR_EXEMPT.contains(&req.command.as_str()) {
            if let Some(session) = self.sessions.get(&req.session) {
                if let Some(err) = selector.incompatibility_error(&req.session, &session.device) {
                    return Err(err);
                }
            }
        }

        // 6. Handler demultiplexing; first non-None wins.
        let outcome = 'demux: {
            if let Some(result) = self.handle_lease_ops(req).await {
                break 'demux result;
            }
            if let Some(result) = self.handle_session_ops(req, &selector, scope, cancel).await {
                break 'demux result;
            }
            if let Some(result) = self.handle_snapshot_ops(req, scope, cancel).await {
                break 'demux result;
            }
            if let Some(result) = self.handle_record_ops(req, scope, cancel).await {
                break 'demux result;
            }
            if let Some(result) = self.handle_find_ops(req, scope, cancel).await {
                break 'demux result;
            }
            if let Some(result) = self.handle_interaction_ops(req, scope, cancel).await {
                break 'demux result;
            }
            // 7. Default dispatch.
            self.dispatch_with_session(req, scope, cancel).await
        };
        let value = outcome?;

        // 8. Journaling.
        if should_journal(&req.command) {
            self.sessions
                .record_action(&req.session, &req.command, &req.args, &req.flags, &value);
        }
        Ok(value)
    }

    /// Default dispatch path, also used by the snapshot/find/interaction
    /// groups after their per-command validation: require a session,
    /// consult the capability matrix, call the dispatcher.
    pub(crate) async fn dispatch_with_session(
        self: &Arc<Self>,
        req: &Request,
        scope: &RequestScope,
        cancel: &CancelHandle,
    ) -> Result<Value, DaemonError> {
        let session = self.require_session(&req.session)?;
        self.check_capability(&req.command, &session)?;
        let ctx = self.execution_context(req, Some(&session), cancel);
        scope
            .time(
                "dispatch",
                self.dispatcher
                    .dispatch(&session.device, &req.command, &req.args, &req.flags, &ctx),
            )
            .await
    }

    pub(crate) fn require_session(&self, name: &str) -> Result<Session, DaemonError> {
        self.sessions.get(name).ok_or_else(|| {
            DaemonError::session_not_found(format!("no active session `{name}`"))
        })
    }

    pub(crate) fn check_capability(
        &self,
        command: &str,
        session: &Session,
    ) -> Result<(), DaemonError> {
        if !capability::supported_on(command, &session.device) {
            return Err(DaemonError::unsupported_operation(format!(
                "`{command}` is not supported on {} {}",
                session.device.platform.as_str(),
                session.device.kind.as_str()
            )));
        }
        Ok(())
    }

    /// Output path from the `out` flag, resolved against the caller's
    /// working directory when relative.
    pub(crate) fn resolve_out_path(&self, req: &Request) -> Option<PathBuf> {
        let out = PathBuf::from(req.flag_str("out")?);
        if out.is_absolute() {
            return Some(out);
        }
        match &req.meta.cwd {
            Some(cwd) => Some(PathBuf::from(cwd).join(out)),
            None => Some(out),
        }
    }

    pub(crate) fn execution_context(
        &self,
        req: &Request,
        session: Option<&Session>,
        cancel: &CancelHandle,
    ) -> ExecutionContext {
        ExecutionContext {
            request_id: req
                .meta
                .request_id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            debug: req.meta.debug,
            out_path: self.resolve_out_path(req),
            bundle_id: session
                .and_then(|s| s.app.as_ref())
                .map(|app| app.bundle_id.clone()),
            trace_log: session.and_then(|s| s.trace_log.clone()),
            daemon_log_path: self.config.daemon_log_path(),
            cancel: cancel.clone(),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::devices::{
        BackendOp, DeviceBackend, DeviceDescriptor, DeviceKind, Platform, TargetClass,
    };
    use crate::supervisor::ProcessArena;
    use agent_device_config::DaemonConfig;
    use async_trait::async_trait;
    use std::path::Path;

    pub const TEST_TOKEN: &str = "cafebabe00112233";

    /// A scriptable backend: commands listed in `failing` (or whose first
    /// argument matches `failing_first_arg`) error with `COMMAND_FAILED`;
    /// everything else echoes the command. `slow_ms` makes every call
    /// take that long, checking cancellation on the way out, so
    /// disconnect tests have something in flight.
    #[derive(Default)]
    pub struct ScriptedBackend {
        pub devices: Vec<DeviceDescriptor>,
        pub failing: Vec<String>,
        pub failing_first_arg: Option<String>,
        pub slow_ms: u64,
    }

    #[async_trait]
    impl DeviceBackend for ScriptedBackend {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn handles(&self, platform: Platform, kind: DeviceKind) -> bool {
            platform == Platform::Ios && kind == DeviceKind::Simulator
        }

        async fn discover(&self) -> Result<Vec<DeviceDescriptor>, DaemonError> {
            Ok(self.devices.clone())
        }

        async fn run(&self, op: BackendOp<'_>) -> Result<Value, DaemonError> {
            if self.slow_ms > 0 && op.command != "open" {
                let deadline =
                    std::time::Instant::now() + std::time::Duration::from_millis(self.slow_ms);
                while std::time::Instant::now() < deadline {
                    op.ctx.check_canceled()?;
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                }
                op.ctx.check_canceled()?;
            }
            let arg_failure = self
                .failing_first_arg
                .as_deref()
                .is_some_and(|arg| op.first_arg() == Some(arg));
            if arg_failure || self.failing.iter().any(|c| c == op.command) {
                return Err(DaemonError::command_failed(format!(
                    "scripted failure for `{}`",
                    op.command
                )));
            }
            match op.command {
                "open" => Ok(json!({
                    "bundleId": format!("com.example.{}", op.first_arg().unwrap_or("app")),
                })),
                "snapshot" => Ok(json!({
                    "nodes": [
                        {"id": "e1", "label": "Sign In", "role": "button"},
                        {"id": "e2", "label": "Username", "role": "textField"},
                    ]
                })),
                other => Ok(json!({"command": other, "args": op.args})),
            }
        }
    }

    pub fn simulator_device(identifier: &str) -> DeviceDescriptor {
        DeviceDescriptor {
            platform: Platform::Ios,
            identifier: identifier.to_string(),
            name: format!("iPhone {identifier}"),
            kind: DeviceKind::Simulator,
            target: TargetClass::Mobile,
            booted: true,
            simulator_set: None,
        }
    }

    pub fn test_pipeline_with(state_dir: &Path, backend: ScriptedBackend) -> Arc<Pipeline> {
        let mut config = DaemonConfig::default();
        config.state_dir = state_dir.to_path_buf();
        config.lease.min_ttl_ms = 10;

        let arena = Arc::new(ProcessArena::new());
        Arc::new(Pipeline {
            token: TEST_TOKEN.to_string(),
            sessions: Arc::new(SessionStore::new(
                state_dir.to_path_buf(),
                config.app_log.clone(),
                arena,
            )),
            leases: Arc::new(LeaseRegistry::new(config.lease.clone())),
            dispatcher: Arc::new(Dispatcher::with_backends(vec![Arc::new(backend)])),
            cancel: Arc::new(CancelRegistry::new()),
            runners: Arc::new(RunnerSessions::new()),
            config,
        })
    }

    pub fn test_pipeline(state_dir: &Path) -> Arc<Pipeline> {
        test_pipeline_with(
            state_dir,
            ScriptedBackend {
                devices: vec![simulator_device("A"), simulator_device("B")],
                ..Default::default()
            },
        )
    }

    pub fn request(command: &str, args: &[&str]) -> Request {
        let mut req = Request::new(command);
        req.token = Some(TEST_TOKEN.to_string());
        req.args = args.iter().map(|s| s.to_string()).collect();
        req
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use agent_device_protocol::ErrorCode;
    use serde_json::json;
    use tempfile::TempDir;

    // ===== Stage 1: Token Tests =====

    #[tokio::test]
    async fn test_bad_token_rejected_without_details() {
        let dir = TempDir::new().unwrap();
        let pipeline = test_pipeline(dir.path());

        let mut req = request("session_list", &[]);
        req.token = Some("wrong".to_string());
        let resp = pipeline.handle_request(req).await;
        assert!(!resp.ok);
        let error = resp.error.unwrap();
        assert_eq!(error.code, ErrorCode::Unauthorized);
        assert!(error.details.is_none());
    }

    #[tokio::test]
    async fn test_missing_token_rejected() {
        let dir = TempDir::new().unwrap();
        let pipeline = test_pipeline(dir.path());
        let mut req = request("session_list", &[]);
        req.token = None;
        let resp = pipeline.handle_request(req).await;
        assert_eq!(resp.error_code(), Some(ErrorCode::Unauthorized));
    }

    // ===== Stage 2: Alias Tests =====

    #[tokio::test]
    async fn test_click_aliases_to_press() {
        let dir = TempDir::new().unwrap();
        let pipeline = test_pipeline(dir.path());
        pipeline
            .handle_request(request("open", &["Settings"]))
            .await;

        let resp = pipeline.handle_request(request("click", &["@e1"])).await;
        assert!(resp.ok, "{:?}", resp.error);
        assert_eq!(resp.data.unwrap()["command"], json!("press"));
    }

    // ===== Stage 3/4: Tenant Scoping & Lease Admission Tests =====

    #[tokio::test]
    async fn test_tenant_isolation_requires_tenant_id() {
        let dir = TempDir::new().unwrap();
        let pipeline = test_pipeline(dir.path());

        let mut req = request("session_list", &[]);
        req.flags
            .insert("sessionIsolation".to_string(), json!("tenant"));
        let resp = pipeline.handle_request(req).await;
        assert_eq!(resp.error_code(), Some(ErrorCode::InvalidArgs));
    }

    #[tokio::test]
    async fn test_tenant_isolated_command_requires_lease() {
        let dir = TempDir::new().unwrap();
        let pipeline = test_pipeline(dir.path());

        let mut req = request("close", &[]);
        req.meta.session_isolation = Some("tenant".to_string());
        req.meta.tenant_id = Some("acme".to_string());
        req.meta.run_id = Some("run-1".to_string());
        let resp = pipeline.handle_request(req).await;
        // No lease id at all: INVALID_ARGS per the admission contract.
        assert_eq!(resp.error_code(), Some(ErrorCode::InvalidArgs));
    }

    #[tokio::test]
    async fn test_lease_admission_passes_then_session_not_found() {
        let dir = TempDir::new().unwrap();
        let pipeline = test_pipeline(dir.path());

        let mut alloc = request("lease_allocate", &[]);
        alloc.meta.tenant_id = Some("acme".to_string());
        alloc.meta.run_id = Some("run-1".to_string());
        let resp = pipeline.handle_request(alloc).await;
        assert!(resp.ok);
        let lease_id = resp.data.unwrap()["lease"]["leaseId"]
            .as_str()
            .unwrap()
            .to_string();

        let mut req = request("close", &[]);
        req.meta.session_isolation = Some("tenant".to_string());
        req.meta.tenant_id = Some("acme".to_string());
        req.meta.run_id = Some("run-1".to_string());
        req.meta.lease_id = Some(lease_id);
        let resp = pipeline.handle_request(req).await;
        // Admission passed; the failure is the missing session.
        assert_eq!(resp.error_code(), Some(ErrorCode::SessionNotFound));
    }

    #[tokio::test]
    async fn test_tenant_session_name_rewrite() {
        let dir = TempDir::new().unwrap();
        let pipeline = test_pipeline(dir.path());

        let mut alloc = request("lease_allocate", &[]);
        alloc.meta.tenant_id = Some("acme".to_string());
        alloc.meta.run_id = Some("run-1".to_string());
        let lease_id = pipeline.handle_request(alloc).await.data.unwrap()["lease"]["leaseId"]
            .as_str()
            .unwrap()
            .to_string();

        let mut open = request("open", &["Settings"]);
        open.meta.session_isolation = Some("tenant".to_string());
        open.meta.tenant_id = Some("acme".to_string());
        open.meta.run_id = Some("run-1".to_string());
        open.meta.lease_id = Some(lease_id);
        let resp = pipeline.handle_request(open).await;
        assert!(resp.ok, "{:?}", resp.error);

        // The session landed under the tenant-scoped name.
        assert!(pipeline.sessions.contains("acme:default"));
        assert!(!pipeline.sessions.contains("default"));
    }

    #[tokio::test]
    async fn test_session_list_filters_by_tenant() {
        let dir = TempDir::new().unwrap();
        let pipeline = test_pipeline(dir.path());

        // Unscoped session on device A.
        pipeline
            .handle_request(request("open", &["Settings"]))
            .await;

        let mut alloc = request("lease_allocate", &[]);
        alloc.meta.tenant_id = Some("acme".to_string());
        alloc.meta.run_id = Some("run-1".to_string());
        pipeline.handle_request(alloc).await;

        let mut list = request("session_list", &[]);
        list.meta.session_isolation = Some("tenant".to_string());
        list.meta.tenant_id = Some("acme".to_string());
        let resp = pipeline.handle_request(list).await;
        assert!(resp.ok);
        assert_eq!(resp.data.unwrap()["sessions"], json!([]));
    }

    // ===== Stage 5: Selector Compatibility Tests =====

    #[tokio::test]
    async fn test_selector_mismatch_never_reaches_dispatch() {
        let dir = TempDir::new().unwrap();
        let pipeline = test_pipeline(dir.path());
        pipeline
            .handle_request(request("open", &["Settings"]))
            .await;

        let mut req = request("press", &["@e1"]);
        req.flags.insert("platform".to_string(), json!("android"));
        let resp = pipeline.handle_request(req).await;
        assert_eq!(resp.error_code(), Some(ErrorCode::InvalidArgs));
        let error = resp.error.unwrap();
        assert!(error.message.contains("platform"));
    }

    #[tokio::test]
    async fn test_selector_check_skipped_for_devices() {
        let dir = TempDir::new().unwrap();
        let pipeline = test_pipeline(dir.path());
        pipeline
            .handle_request(request("open", &["Settings"]))
            .await;

        // `devices` with an incompatible selector still answers; it just
        // filters discovery.
        let mut req = request("devices", &[]);
        req.flags.insert("platform".to_string(), json!("android"));
        let resp = pipeline.handle_request(req).await;
        assert!(resp.ok);
        assert_eq!(resp.data.unwrap()["devices"], json!([]));
    }

    // ===== Default Dispatch Tests =====

    #[tokio::test]
    async fn test_command_without_session_is_session_not_found() {
        let dir = TempDir::new().unwrap();
        let pipeline = test_pipeline(dir.path());
        let resp = pipeline.handle_request(request("snapshot", &[])).await;
        assert_eq!(resp.error_code(), Some(ErrorCode::SessionNotFound));
    }

    #[tokio::test]
    async fn test_unsupported_operation_blocked_before_dispatch() {
        let dir = TempDir::new().unwrap();
        let pipeline = test_pipeline(dir.path());
        pipeline
            .handle_request(request("open", &["Settings"]))
            .await;

        // keyboard is Android-only; the bound device is an iOS simulator.
        let resp = pipeline.handle_request(request("keyboard", &["hi"])).await;
        assert_eq!(resp.error_code(), Some(ErrorCode::UnsupportedOperation));
    }

    // ===== Journaling Tests =====

    #[tokio::test]
    async fn test_success_journaled_with_startup_sample() {
        let dir = TempDir::new().unwrap();
        let pipeline = test_pipeline(dir.path());
        let resp = pipeline
            .handle_request(request("open", &["Settings"]))
            .await;
        assert!(resp.ok);
        // The open handler stamps a startup duration before journaling.
        assert!(resp.data.unwrap()["startup"]["durationMs"].is_u64());

        pipeline.handle_request(request("press", &["@e1"])).await;

        let session = pipeline.sessions.get("default").unwrap();
        assert_eq!(session.journal.len(), 2);
        assert_eq!(session.journal[0].command, "open");
        assert_eq!(session.journal[1].command, "press");
        assert_eq!(session.startup_samples.len(), 1);
    }

    #[tokio::test]
    async fn test_failure_not_journaled() {
        let dir = TempDir::new().unwrap();
        let pipeline = test_pipeline_with(
            dir.path(),
            ScriptedBackend {
                devices: vec![simulator_device("A")],
                failing: vec!["press".to_string()],
                ..Default::default()
            },
        );
        pipeline
            .handle_request(request("open", &["Settings"]))
            .await;
        let resp = pipeline.handle_request(request("press", &["@e1"])).await;
        assert!(!resp.ok);

        let session = pipeline.sessions.get("default").unwrap();
        assert_eq!(session.journal.len(), 1);
    }

    // ===== Finalization Tests =====

    #[tokio::test]
    async fn test_failure_carries_diagnostics() {
        let dir = TempDir::new().unwrap();
        let pipeline = test_pipeline_with(
            dir.path(),
            ScriptedBackend {
                devices: vec![simulator_device("A")],
                failing: vec!["snapshot".to_string()],
                ..Default::default()
            },
        );
        pipeline
            .handle_request(request("open", &["Settings"]))
            .await;

        let resp = pipeline.handle_request(request("snapshot", &[])).await;
        let error = resp.error.unwrap();
        assert_eq!(error.code, ErrorCode::CommandFailed);
        let log_path = error.log_path.unwrap();
        assert!(std::path::Path::new(&log_path).exists());
        assert!(error.diagnostic_id.is_some());
        assert!(error.hint.is_some());
    }

    #[tokio::test]
    async fn test_request_id_assigned_and_unregistered() {
        let dir = TempDir::new().unwrap();
        let pipeline = test_pipeline(dir.path());
        let resp = pipeline.handle_request(request("session_list", &[])).await;
        assert!(resp.ok);
        assert_eq!(pipeline.cancel.in_flight(), 0);
    }
}

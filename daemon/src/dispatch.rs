//! Command dispatcher: backend resolution, device selection, and the
//! execution context handed to backends.

use agent_device_protocol::DaemonError;
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

use crate::cancel::CancelHandle;
use crate::capability::Selector;
use crate::devices::{
    android::AndroidBackend, ios::IosDeviceBackend, ios::IosSimulatorBackend, BackendOp,
    DeviceBackend, DeviceDescriptor, DeviceKind, Platform,
};
use crate::supervisor::{ProcessArena, RunnerSessions};

/// Everything a backend needs beyond the command itself.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub request_id: String,
    pub debug: bool,
    /// Output path for artifact-producing commands, already resolved
    /// against the caller's working directory.
    pub out_path: Option<PathBuf>,
    /// Bundle/package id of the active session's app context.
    pub bundle_id: Option<String>,
    /// Active trace log, when `trace start` is running.
    pub trace_log: Option<PathBuf>,
    pub daemon_log_path: PathBuf,
    pub cancel: CancelHandle,
}

impl ExecutionContext {
    pub fn check_canceled(&self) -> Result<(), DaemonError> {
        if self.cancel.is_canceled() {
            Err(DaemonError::command_failed("request canceled"))
        } else {
            Ok(())
        }
    }
}

/// Routes devices to backends and commands to backend executions.
pub struct Dispatcher {
    backends: Vec<Arc<dyn DeviceBackend>>,
}

impl Dispatcher {
    pub fn new(arena: Arc<ProcessArena>, runners: Arc<RunnerSessions>) -> Self {
        Self {
            backends: vec![
                Arc::new(IosSimulatorBackend::new(arena.clone(), runners)),
                Arc::new(IosDeviceBackend::new()),
                Arc::new(AndroidBackend::new(arena)),
            ],
        }
    }

    /// Test seam: a dispatcher over caller-supplied backends.
    pub fn with_backends(backends: Vec<Arc<dyn DeviceBackend>>) -> Self {
        Self { backends }
    }

    pub fn backend_for(
        &self,
        platform: Platform,
        kind: DeviceKind,
    ) -> Result<Arc<dyn DeviceBackend>, DaemonError> {
        self.backends
            .iter()
            .find(|b| b.handles(platform, kind))
            .cloned()
            .ok_or_else(|| {
                DaemonError::unsupported_platform(format!(
                    "no backend drives {} {}",
                    platform.as_str(),
                    kind.as_str()
                ))
            })
    }

    /// Union of all backends' devices, filtered by the selector. Backends
    /// whose tooling is absent are skipped, not fatal: a host with only
    /// adb installed can still drive Android.
    pub async fn discover(&self, selector: &Selector) -> Result<Vec<DeviceDescriptor>, DaemonError> {
        let mut devices = Vec::new();
        let mut last_error = None;
        for backend in &self.backends {
            if let Some(platform) = selector.platform {
                if !backend.handles(platform, DeviceKind::Simulator)
                    && !backend.handles(platform, DeviceKind::Emulator)
                    && !backend.handles(platform, DeviceKind::Device)
                {
                    continue;
                }
            }
            match backend.discover().await {
                Ok(found) => devices.extend(found),
                Err(err) => {
                    debug!(backend = backend.name(), error = %err, "discovery skipped backend");
                    last_error = Some(err);
                }
            }
        }
        if devices.is_empty() {
            if let Some(err) = last_error {
                // Nothing discovered anywhere and at least one backend
                // failed outright; surface that instead of an empty list.
                if self.backends.len() == 1 {
                    return Err(err);
                }
            }
        }
        Ok(devices
            .into_iter()
            .filter(|d| selector.matches(d))
            .collect())
    }

    /// Pick the device for a new session. Booted devices win; otherwise
    /// discovery order decides. An empty result is `DEVICE_NOT_FOUND`;
    /// selection never falls back outside the selector's scope.
    pub async fn select_device(&self, selector: &Selector) -> Result<DeviceDescriptor, DaemonError> {
        let candidates = self.discover(selector).await?;
        if candidates.is_empty() {
            return Err(DaemonError::device_not_found(
                "no device matches the given selector",
            )
            .with_details(selector_summary(selector)));
        }
        let chosen = candidates
            .iter()
            .find(|d| d.booted)
            .or_else(|| candidates.first())
            .cloned()
            .expect("non-empty candidates");
        Ok(chosen)
    }

    /// Execute one command against a device.
    pub async fn dispatch(
        &self,
        device: &DeviceDescriptor,
        command: &str,
        args: &[String],
        flags: &Map<String, Value>,
        ctx: &ExecutionContext,
    ) -> Result<Value, DaemonError> {
        ctx.check_canceled()?;
        let backend = self.backend_for(device.platform, device.kind)?;
        debug!(
            backend = backend.name(),
            command,
            device = %device.identifier,
            request_id = %ctx.request_id,
            "dispatching command"
        );
        backend
            .run(BackendOp {
                command,
                device,
                args,
                flags,
                ctx,
            })
            .await
    }
}

fn selector_summary(selector: &Selector) -> Value {
    serde_json::json!({
        "platform": selector.platform.map(|p| p.as_str()),
        "target": selector.target.map(|t| t.as_str()),
        "device": selector.device_name,
        "udid": selector.udid,
        "serial": selector.serial,
        "simulatorSet": selector.simulator_set,
        "serials": selector.serial_allowlist,
    })
}

//! iOS backends: simulators through `xcrun simctl`, physical hardware
//! through `xcrun devicectl`. UI-level commands (snapshot, interactions,
//! queries) go through the XCTest runner harness; everything else maps to
//! a direct tool invocation.

use agent_device_protocol::DaemonError;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;

use super::{BackendOp, DeviceBackend, DeviceDescriptor, DeviceKind, Platform, TargetClass};
use crate::supervisor::{self, CmdOptions, ProcessArena, RunnerSessions};

/// Commands that require the on-device XCTest runner rather than a direct
/// tool invocation.
const RUNNER_COMMANDS: &[&str] = &[
    "snapshot",
    "find",
    "is",
    "get",
    "press",
    "longpress",
    "swipe",
    "scroll",
    "scrollintoview",
    "focus",
    "type",
    "fill",
    "pinch",
    "back",
    "home",
    "app-switcher",
    "wait",
    "alert",
    "diff",
];

pub struct IosSimulatorBackend {
    arena: Arc<ProcessArena>,
    runners: Arc<RunnerSessions>,
}

impl IosSimulatorBackend {
    pub fn new(arena: Arc<ProcessArena>, runners: Arc<RunnerSessions>) -> Self {
        Self { arena, runners }
    }

    fn parse_device_list(raw: &str) -> Result<Vec<DeviceDescriptor>, DaemonError> {
        let parsed: Value = serde_json::from_str(raw)
            .map_err(|err| DaemonError::command_failed(format!("unparseable simctl output: {err}")))?;
        let mut devices = Vec::new();
        let Some(runtimes) = parsed.get("devices").and_then(Value::as_object) else {
            return Ok(devices);
        };
        for (runtime, entries) in runtimes {
            let target = if runtime.contains("tvOS") {
                TargetClass::Tv
            } else {
                TargetClass::Mobile
            };
            let Some(entries) = entries.as_array() else {
                continue;
            };
            for entry in entries {
                let available = entry
                    .get("isAvailable")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                if !available {
                    continue;
                }
                let (Some(udid), Some(name)) = (
                    entry.get("udid").and_then(Value::as_str),
                    entry.get("name").and_then(Value::as_str),
                ) else {
                    continue;
                };
                devices.push(DeviceDescriptor {
                    platform: Platform::Ios,
                    identifier: udid.to_string(),
                    name: name.to_string(),
                    kind: DeviceKind::Simulator,
                    target,
                    booted: entry.get("state").and_then(Value::as_str) == Some("Booted"),
                    simulator_set: None,
                });
            }
        }
        Ok(devices)
    }

    /// Resolve an app query to a bundle id. A dotted identifier is taken
    /// verbatim; anything else is matched against `simctl listapps`.
    async fn resolve_bundle_id(&self, udid: &str, query: &str) -> Result<String, DaemonError> {
        if query.contains('.') {
            return Ok(query.to_string());
        }
        let out = supervisor::run_cmd(
            "xcrun",
            &["simctl", "listapps", udid],
            &CmdOptions::default(),
        )
        .await?;
        // listapps prints a plist; a display-name match is enough to pull
        // the adjacent CFBundleIdentifier line.
        let mut last_bundle: Option<&str> = None;
        for line in out.stdout.lines() {
            let trimmed = line.trim();
            if let Some(rest) = trimmed.strip_prefix("CFBundleIdentifier = ") {
                last_bundle = Some(rest.trim_matches(|c| c == '"' || c == ';'));
            }
            if trimmed.contains("CFBundleDisplayName") && trimmed.contains(query) {
                if let Some(bundle) = last_bundle {
                    return Ok(bundle.to_string());
                }
            }
        }
        Err(DaemonError::app_not_installed(format!(
            "no installed app matches `{query}`"
        )))
    }

    /// Run one UI-level operation through the XCTest runner. The op is
    /// passed to `xcodebuild` via environment and the runner writes its
    /// result as JSON to a scratch file.
    async fn run_runner_op(&self, op: &BackendOp<'_>) -> Result<Value, DaemonError> {
        op.ctx.check_canceled()?;
        let runner = self.runners.register(&op.ctx.request_id, None);

        let scratch = std::env::temp_dir().join(format!(
            "agent-device-runner-{}.json",
            crate::util::random_hex(8)
        ));
        let op_payload = json!({
            "command": op.command,
            "args": op.args,
            "flags": op.flags,
            "bundleId": op.ctx.bundle_id,
            "out": scratch,
        })
        .to_string();

        let xctestrun = std::env::var("AGENT_DEVICE_RUNNER_XCTESTRUN")
            .unwrap_or_else(|_| "AgentDeviceRunner.xctestrun".to_string());
        let destination = format!("id={}", op.device.identifier);
        let result = supervisor::run_cmd(
            "xcrun",
            &[
                "xcodebuild",
                "test-without-building",
                "-xctestrun",
                &xctestrun,
                "-destination",
                &destination,
            ],
            &CmdOptions {
                env: vec![("AGENT_DEVICE_RUNNER_OP".to_string(), op_payload)],
                timeout_ms: Some(supervisor::timeout_for_profile("ios_runner")),
                ..Default::default()
            },
        )
        .await;
        self.runners.remove(&runner.id);
        op.ctx.check_canceled()?;
        result?;

        let payload = std::fs::read_to_string(&scratch).map_err(|err| {
            DaemonError::command_failed(format!("runner produced no result file: {err}"))
        })?;
        let _ = std::fs::remove_file(&scratch);
        serde_json::from_str(&payload)
            .map_err(|err| DaemonError::command_failed(format!("unparseable runner result: {err}")))
    }

    async fn simctl(&self, args: &[&str], opts: &CmdOptions) -> Result<supervisor::CmdOutput, DaemonError> {
        let mut full = vec!["simctl"];
        full.extend_from_slice(args);
        supervisor::run_cmd("xcrun", &full, opts).await
    }
}

#[async_trait]
impl DeviceBackend for IosSimulatorBackend {
    fn name(&self) -> &'static str {
        "ios-simulator"
    }

    fn handles(&self, platform: Platform, kind: DeviceKind) -> bool {
        platform == Platform::Ios && kind == DeviceKind::Simulator
    }

    async fn discover(&self) -> Result<Vec<DeviceDescriptor>, DaemonError> {
        let out = self
            .simctl(
                &["list", "devices", "--json"],
                &CmdOptions {
                    timeout_ms: Some(supervisor::timeout_for_profile("device_list")),
                    ..Default::default()
                },
            )
            .await?;
        Self::parse_device_list(&out.stdout)
    }

    async fn run(&self, op: BackendOp<'_>) -> Result<Value, DaemonError> {
        let udid = op.device.identifier.as_str();

        if RUNNER_COMMANDS.contains(&op.command) {
            return self.run_runner_op(&op).await;
        }

        match op.command {
            "open" => {
                let query = op.first_arg().ok_or_else(|| {
                    DaemonError::invalid_args("open requires an app name or bundle id")
                })?;
                let bundle_id = self.resolve_bundle_id(udid, query).await?;
                let out = self
                    .simctl(
                        &["launch", udid, &bundle_id],
                        &CmdOptions {
                            timeout_ms: Some(supervisor::timeout_for_profile("ios_app_launch")),
                            ..Default::default()
                        },
                    )
                    .await?;
                // `simctl launch` prints `<bundle>: <pid>`.
                let pid = out
                    .stdout
                    .rsplit(':')
                    .next()
                    .and_then(|s| s.trim().parse::<u32>().ok());
                Ok(json!({"bundleId": bundle_id, "pid": pid}))
            }
            "close" => {
                let bundle_id = op
                    .first_arg()
                    .map(str::to_string)
                    .or_else(|| op.ctx.bundle_id.clone())
                    .ok_or_else(|| {
                        DaemonError::invalid_args("close requires an app context or bundle id")
                    })?;
                self.simctl(
                    &["terminate", udid, &bundle_id],
                    &CmdOptions {
                        allow_failure: true,
                        ..Default::default()
                    },
                )
                .await?;
                Ok(json!({"bundleId": bundle_id}))
            }
            "boot" => {
                let out = self
                    .simctl(
                        &["boot", udid],
                        &CmdOptions {
                            allow_failure: true,
                            timeout_ms: Some(supervisor::timeout_for_profile("ios_boot")),
                            ..Default::default()
                        },
                    )
                    .await?;
                if !out.success() && !out.stderr.contains("current state: Booted") {
                    return Err(DaemonError::command_failed("failed to boot simulator")
                        .with_details(json!({"stderr": out.stderr, "exitCode": out.exit_code})));
                }
                Ok(json!({"booted": true}))
            }
            "screenshot" => {
                let path = op
                    .ctx
                    .out_path
                    .clone()
                    .unwrap_or_else(|| default_artifact_path("screenshot", "png"));
                if let Some(parent) = path.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                self.simctl(
                    &["io", udid, "screenshot", &path.to_string_lossy()],
                    &CmdOptions::default(),
                )
                .await?;
                Ok(json!({"path": path}))
            }
            "record-start" => {
                let path = op
                    .ctx
                    .out_path
                    .clone()
                    .unwrap_or_else(|| default_artifact_path("recording", "mp4"));
                let path_str = path.to_string_lossy().to_string();
                let id = self.arena.spawn(
                    op.flag_str("sessionName").unwrap_or("default"),
                    "simulator recorder",
                    "xcrun",
                    &["simctl", "io", udid, "recordVideo", "--force", &path_str],
                    None,
                    None,
                )?;
                Ok(json!({"handleId": id, "path": path}))
            }
            "record-finish" => {
                // The recorder writes straight to the local path; nothing
                // to collect beyond confirming the file landed.
                let path = op
                    .flag_str("path")
                    .ok_or_else(|| DaemonError::invalid_args("record-finish requires path"))?;
                Ok(json!({"path": path, "exists": std::path::Path::new(path).exists()}))
            }
            "logs-start" => {
                let output = op
                    .ctx
                    .out_path
                    .clone()
                    .ok_or_else(|| DaemonError::invalid_args("logs-start requires an output path"))?;
                let predicate = match &op.ctx.bundle_id {
                    Some(bundle) => format!("subsystem == \"{bundle}\""),
                    None => "eventType == logEvent".to_string(),
                };
                let pid_file = output.with_extension("log.pid");
                let id = self.arena.spawn(
                    op.flag_str("sessionName").unwrap_or("default"),
                    "simulator log stream",
                    "xcrun",
                    &[
                        "simctl",
                        "spawn",
                        udid,
                        "log",
                        "stream",
                        "--style",
                        "compact",
                        "--predicate",
                        &predicate,
                    ],
                    Some(&output),
                    Some(pid_file),
                )?;
                Ok(json!({"handleId": id, "path": output}))
            }
            "apps" => {
                let out = self.simctl(&["listapps", udid], &CmdOptions::default()).await?;
                Ok(json!({"raw": out.stdout}))
            }
            "appstate" => {
                let bundle = op
                    .first_arg()
                    .map(str::to_string)
                    .or_else(|| op.ctx.bundle_id.clone())
                    .ok_or_else(|| DaemonError::invalid_args("appstate requires a bundle id"))?;
                let out = self
                    .simctl(
                        &["spawn", udid, "launchctl", "list"],
                        &CmdOptions {
                            allow_failure: true,
                            ..Default::default()
                        },
                    )
                    .await?;
                let running = out.stdout.contains(&bundle);
                Ok(json!({"bundleId": bundle, "running": running}))
            }
            "reinstall" => {
                let app_path = op
                    .flag_str("app")
                    .ok_or_else(|| DaemonError::invalid_args("reinstall requires --app <path>"))?;
                let bundle_id = op
                    .first_arg()
                    .map(str::to_string)
                    .or_else(|| op.ctx.bundle_id.clone())
                    .ok_or_else(|| DaemonError::invalid_args("reinstall requires a bundle id"))?;
                self.simctl(
                    &["uninstall", udid, &bundle_id],
                    &CmdOptions {
                        allow_failure: true,
                        ..Default::default()
                    },
                )
                .await?;
                self.simctl(&["install", udid, app_path], &CmdOptions::default())
                    .await?;
                Ok(json!({"bundleId": bundle_id, "app": app_path}))
            }
            "push" => {
                let bundle_id = op
                    .first_arg()
                    .map(str::to_string)
                    .or_else(|| op.ctx.bundle_id.clone())
                    .ok_or_else(|| DaemonError::invalid_args("push requires a bundle id"))?;
                let payload = op
                    .flag_str("payload")
                    .ok_or_else(|| DaemonError::invalid_args("push requires --payload <json>"))?;
                self.simctl(
                    &["push", udid, &bundle_id, "-"],
                    &CmdOptions {
                        stdin: Some(payload.to_string()),
                        ..Default::default()
                    },
                )
                .await?;
                Ok(json!({"bundleId": bundle_id, "delivered": true}))
            }
            "settings" => {
                // `settings appearance dark`, `settings privacy grant photos`.
                match op.args.first().map(String::as_str) {
                    Some("appearance") => {
                        let value = op.args.get(1).map(String::as_str).ok_or_else(|| {
                            DaemonError::invalid_args("settings appearance requires a value")
                        })?;
                        self.simctl(&["ui", udid, "appearance", value], &CmdOptions::default())
                            .await?;
                        Ok(json!({"appearance": value}))
                    }
                    Some("privacy") => {
                        let action = op.args.get(1).map(String::as_str).ok_or_else(|| {
                            DaemonError::invalid_args("settings privacy requires an action")
                        })?;
                        let service = op.args.get(2).map(String::as_str).ok_or_else(|| {
                            DaemonError::invalid_args("settings privacy requires a service")
                        })?;
                        let bundle = op
                            .args
                            .get(3)
                            .map(String::as_str)
                            .map(str::to_string)
                            .or_else(|| op.ctx.bundle_id.clone());
                        let mut args = vec!["privacy", udid, action, service];
                        if let Some(bundle) = bundle.as_deref() {
                            args.push(bundle);
                        }
                        self.simctl(&args, &CmdOptions::default()).await?;
                        Ok(json!({"action": action, "service": service, "bundleId": bundle}))
                    }
                    other => Err(DaemonError::invalid_args(format!(
                        "unknown settings group {other:?}"
                    ))),
                }
            }
            "clipboard" => match op.args.first().map(String::as_str) {
                Some("get") | None => {
                    let out = self.simctl(&["pbpaste", udid], &CmdOptions::default()).await?;
                    Ok(json!({"text": out.stdout}))
                }
                Some("set") => {
                    let text = op
                        .args
                        .get(1)
                        .cloned()
                        .ok_or_else(|| DaemonError::invalid_args("clipboard set requires text"))?;
                    self.simctl(
                        &["pbcopy", udid],
                        &CmdOptions {
                            stdin: Some(text.clone()),
                            ..Default::default()
                        },
                    )
                    .await?;
                    Ok(json!({"text": text}))
                }
                Some(other) => Err(DaemonError::invalid_args(format!(
                    "unknown clipboard action `{other}`"
                ))),
            },
            "trigger-app-event" => {
                let url = op
                    .flag_str("url")
                    .ok_or_else(|| DaemonError::invalid_args("trigger-app-event requires a url"))?;
                self.simctl(&["openurl", udid, url], &CmdOptions::default())
                    .await?;
                Ok(json!({"url": url}))
            }
            other => Err(DaemonError::command_failed(format!(
                "the ios-simulator backend has no handler for `{other}`"
            ))),
        }
    }
}

/// Physical iOS hardware through `xcrun devicectl`. UI-level commands are
/// rejected here with a pointer at the runner requirement; the runner path
/// for hardware is wired the same way as simulators once a runner build is
/// available for the connected device.
pub struct IosDeviceBackend;

impl IosDeviceBackend {
    pub fn new() -> Self {
        Self
    }

    fn parse_device_list(raw: &str) -> Result<Vec<DeviceDescriptor>, DaemonError> {
        let parsed: Value = serde_json::from_str(raw).map_err(|err| {
            DaemonError::command_failed(format!("unparseable devicectl output: {err}"))
        })?;
        let mut devices = Vec::new();
        let entries = parsed
            .pointer("/result/devices")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for entry in entries {
            let Some(identifier) = entry
                .pointer("/hardwareProperties/udid")
                .and_then(Value::as_str)
            else {
                continue;
            };
            let name = entry
                .pointer("/deviceProperties/name")
                .and_then(Value::as_str)
                .unwrap_or("iOS Device");
            let connected = entry
                .pointer("/connectionProperties/tunnelState")
                .and_then(Value::as_str)
                .map(|s| s != "unavailable")
                .unwrap_or(true);
            devices.push(DeviceDescriptor {
                platform: Platform::Ios,
                identifier: identifier.to_string(),
                name: name.to_string(),
                kind: DeviceKind::Device,
                target: TargetClass::Mobile,
                booted: connected,
                simulator_set: None,
            });
        }
        Ok(devices)
    }
}

impl Default for IosDeviceBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceBackend for IosDeviceBackend {
    fn name(&self) -> &'static str {
        "ios-device"
    }

    fn handles(&self, platform: Platform, kind: DeviceKind) -> bool {
        platform == Platform::Ios && kind == DeviceKind::Device
    }

    async fn discover(&self) -> Result<Vec<DeviceDescriptor>, DaemonError> {
        let scratch = std::env::temp_dir().join(format!(
            "agent-device-devicectl-{}.json",
            crate::util::random_hex(8)
        ));
        let result = supervisor::run_cmd(
            "xcrun",
            &[
                "devicectl",
                "list",
                "devices",
                "--json-output",
                &scratch.to_string_lossy(),
            ],
            &CmdOptions {
                timeout_ms: Some(supervisor::timeout_for_profile("ios_devicectl")),
                ..Default::default()
            },
        )
        .await;
        let raw = std::fs::read_to_string(&scratch).unwrap_or_default();
        let _ = std::fs::remove_file(&scratch);
        result?;
        Self::parse_device_list(&raw)
    }

    async fn run(&self, op: BackendOp<'_>) -> Result<Value, DaemonError> {
        let udid = op.device.identifier.as_str();
        match op.command {
            "open" => {
                let bundle_id = op.first_arg().ok_or_else(|| {
                    DaemonError::invalid_args("open requires a bundle id on physical devices")
                })?;
                supervisor::run_cmd(
                    "xcrun",
                    &[
                        "devicectl",
                        "device",
                        "process",
                        "launch",
                        "--device",
                        udid,
                        bundle_id,
                    ],
                    &CmdOptions {
                        timeout_ms: Some(supervisor::timeout_for_profile("ios_devicectl")),
                        ..Default::default()
                    },
                )
                .await?;
                Ok(json!({"bundleId": bundle_id}))
            }
            "close" => {
                let bundle_id = op
                    .first_arg()
                    .map(str::to_string)
                    .or_else(|| op.ctx.bundle_id.clone())
                    .ok_or_else(|| {
                        DaemonError::invalid_args("close requires an app context or bundle id")
                    })?;
                supervisor::run_cmd(
                    "xcrun",
                    &[
                        "devicectl",
                        "device",
                        "process",
                        "terminate",
                        "--device",
                        udid,
                        &bundle_id,
                    ],
                    &CmdOptions {
                        allow_failure: true,
                        timeout_ms: Some(supervisor::timeout_for_profile("ios_devicectl")),
                        ..Default::default()
                    },
                )
                .await?;
                Ok(json!({"bundleId": bundle_id}))
            }
            "apps" => {
                let out = supervisor::run_cmd(
                    "xcrun",
                    &["devicectl", "device", "info", "apps", "--device", udid],
                    &CmdOptions {
                        timeout_ms: Some(supervisor::timeout_for_profile("ios_devicectl")),
                        ..Default::default()
                    },
                )
                .await?;
                Ok(json!({"raw": out.stdout}))
            }
            other => Err(DaemonError::command_failed(format!(
                "`{other}` on physical iOS hardware requires a runner build for the device"
            ))
            .with_hint("Build the runner for this device and re-run.")),
        }
    }
}

fn default_artifact_path(prefix: &str, ext: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "agent-device-{prefix}-{}.{ext}",
        crate::util::filename_timestamp()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    // ===== simctl Parsing Tests =====

    #[test]
    fn test_parse_simctl_device_list() {
        let raw = r#"{
            "devices": {
                "com.apple.CoreSimulator.SimRuntime.iOS-17-0": [
                    {"udid": "AAA", "name": "iPhone 15", "state": "Booted", "isAvailable": true},
                    {"udid": "BBB", "name": "iPhone 15 Pro", "state": "Shutdown", "isAvailable": true},
                    {"udid": "CCC", "name": "Broken", "state": "Shutdown", "isAvailable": false}
                ],
                "com.apple.CoreSimulator.SimRuntime.tvOS-17-0": [
                    {"udid": "DDD", "name": "Apple TV", "state": "Shutdown", "isAvailable": true}
                ]
            }
        }"#;

        let devices = IosSimulatorBackend::parse_device_list(raw).unwrap();
        assert_eq!(devices.len(), 3);

        let booted = devices.iter().find(|d| d.identifier == "AAA").unwrap();
        assert!(booted.booted);
        assert_eq!(booted.kind, DeviceKind::Simulator);
        assert_eq!(booted.target, TargetClass::Mobile);

        let tv = devices.iter().find(|d| d.identifier == "DDD").unwrap();
        assert_eq!(tv.target, TargetClass::Tv);

        assert!(devices.iter().all(|d| d.identifier != "CCC"));
    }

    #[test]
    fn test_parse_simctl_empty() {
        let devices = IosSimulatorBackend::parse_device_list(r#"{"devices": {}}"#).unwrap();
        assert!(devices.is_empty());
    }

    #[test]
    fn test_parse_simctl_garbage() {
        assert!(IosSimulatorBackend::parse_device_list("not json").is_err());
    }

    // ===== devicectl Parsing Tests =====

    #[test]
    fn test_parse_devicectl_list() {
        let raw = r#"{
            "result": {
                "devices": [
                    {
                        "hardwareProperties": {"udid": "00008120-X"},
                        "deviceProperties": {"name": "Field iPhone"},
                        "connectionProperties": {"tunnelState": "connected"}
                    },
                    {
                        "hardwareProperties": {"udid": "00008120-Y"},
                        "deviceProperties": {"name": "Drawer iPhone"},
                        "connectionProperties": {"tunnelState": "unavailable"}
                    }
                ]
            }
        }"#;
        let devices = IosDeviceBackend::parse_device_list(raw).unwrap();
        assert_eq!(devices.len(), 2);
        assert!(devices[0].booted);
        assert!(!devices[1].booted);
        assert_eq!(devices[0].kind, DeviceKind::Device);
    }

    #[test]
    fn test_parse_devicectl_empty() {
        let devices = IosDeviceBackend::parse_device_list(r#"{"result": {}}"#).unwrap();
        assert!(devices.is_empty());
    }

    // ===== Capability Surface Tests =====

    #[test]
    fn test_backend_handles() {
        let arena = Arc::new(ProcessArena::new());
        let runners = Arc::new(RunnerSessions::new());
        let sim = IosSimulatorBackend::new(arena, runners);
        assert!(sim.handles(Platform::Ios, DeviceKind::Simulator));
        assert!(!sim.handles(Platform::Ios, DeviceKind::Device));
        assert!(!sim.handles(Platform::Android, DeviceKind::Emulator));

        let device = IosDeviceBackend::new();
        assert!(device.handles(Platform::Ios, DeviceKind::Device));
        assert!(!device.handles(Platform::Ios, DeviceKind::Simulator));
    }

    #[test]
    fn test_runner_command_set_covers_interactions() {
        for cmd in ["snapshot", "press", "fill", "pinch", "alert", "wait"] {
            assert!(RUNNER_COMMANDS.contains(&cmd));
        }
        assert!(!RUNNER_COMMANDS.contains(&"open"));
        assert!(!RUNNER_COMMANDS.contains(&"screenshot"));
    }
}

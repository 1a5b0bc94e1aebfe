//! Android backend: emulators and physical hardware through `adb`.
//!
//! Interactions map to `input` keyevents/taps; UI queries go through
//! `uiautomator dump`. Recordings run on-device (`screenrecord`) and are
//! pulled to the local output path when the recording stops, which is why
//! the recording handle carries a remote path.

use agent_device_protocol::DaemonError;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;

use super::{BackendOp, DeviceBackend, DeviceDescriptor, DeviceKind, Platform, TargetClass};
use crate::supervisor::{self, CmdOptions, ProcessArena};

const REMOTE_ARTIFACT_DIR: &str = "/sdcard/agent-device";

pub struct AndroidBackend {
    arena: Arc<ProcessArena>,
}

impl AndroidBackend {
    pub fn new(arena: Arc<ProcessArena>) -> Self {
        Self { arena }
    }

    fn parse_device_list(raw: &str) -> Vec<DeviceDescriptor> {
        let mut devices = Vec::new();
        for line in raw.lines().skip(1) {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut parts = line.split_whitespace();
            let (Some(serial), Some(state)) = (parts.next(), parts.next()) else {
                continue;
            };
            if state == "unauthorized" {
                continue;
            }
            let rest: Vec<&str> = parts.collect();
            let model = rest
                .iter()
                .find_map(|p| p.strip_prefix("model:"))
                .unwrap_or(serial);
            let kind = if serial.starts_with("emulator-") {
                DeviceKind::Emulator
            } else {
                DeviceKind::Device
            };
            let target = if model.to_ascii_lowercase().contains("tv") {
                TargetClass::Tv
            } else {
                TargetClass::Mobile
            };
            devices.push(DeviceDescriptor {
                platform: Platform::Android,
                identifier: serial.to_string(),
                name: model.replace('_', " "),
                kind,
                target,
                booted: state == "device",
                simulator_set: None,
            });
        }
        devices
    }

    async fn adb(&self, serial: &str, args: &[&str], opts: &CmdOptions) -> Result<supervisor::CmdOutput, DaemonError> {
        let mut full = vec!["-s", serial];
        full.extend_from_slice(args);
        supervisor::run_cmd("adb", &full, opts).await
    }

    async fn shell(&self, serial: &str, args: &[&str]) -> Result<supervisor::CmdOutput, DaemonError> {
        let mut full = vec!["shell"];
        full.extend_from_slice(args);
        self.adb(serial, &full, &CmdOptions::default()).await
    }

    async fn keyevent(&self, serial: &str, code: &str) -> Result<Value, DaemonError> {
        self.shell(serial, &["input", "keyevent", code]).await?;
        Ok(json!({"keyevent": code}))
    }

    /// Targets for tap-style interactions: either explicit `x,y`
    /// coordinates or an element reference resolved from the most recent
    /// UI dump by the client.
    fn parse_coordinates(target: &str) -> Option<(i64, i64)> {
        let (x, y) = target.split_once(',')?;
        Some((x.trim().parse().ok()?, y.trim().parse().ok()?))
    }

    fn require_coordinates(target: &str) -> Result<(i64, i64), DaemonError> {
        Self::parse_coordinates(target).ok_or_else(|| {
            DaemonError::invalid_args(format!(
                "target `{target}` is not a coordinate pair; resolve elements via `find` first"
            ))
        })
    }
}

#[async_trait]
impl DeviceBackend for AndroidBackend {
    fn name(&self) -> &'static str {
        "android"
    }

    fn handles(&self, platform: Platform, kind: DeviceKind) -> bool {
        platform == Platform::Android
            && matches!(kind, DeviceKind::Emulator | DeviceKind::Device)
    }

    async fn discover(&self) -> Result<Vec<DeviceDescriptor>, DaemonError> {
        let out = supervisor::run_cmd(
            "adb",
            &["devices", "-l"],
            &CmdOptions {
                timeout_ms: Some(supervisor::timeout_for_profile("device_list")),
                ..Default::default()
            },
        )
        .await?;
        Ok(Self::parse_device_list(&out.stdout))
    }

    async fn run(&self, op: BackendOp<'_>) -> Result<Value, DaemonError> {
        let serial = op.device.identifier.as_str();
        match op.command {
            "open" => {
                let package = op.first_arg().ok_or_else(|| {
                    DaemonError::invalid_args("open requires a package id on Android")
                })?;
                let out = self
                    .shell(
                        serial,
                        &[
                            "monkey",
                            "-p",
                            package,
                            "-c",
                            "android.intent.category.LAUNCHER",
                            "1",
                        ],
                    )
                    .await?;
                if out.stdout.contains("No activities found") {
                    return Err(DaemonError::app_not_installed(format!(
                        "no launchable activity for `{package}`"
                    )));
                }
                Ok(json!({"packageId": package}))
            }
            "close" => {
                let package = op
                    .first_arg()
                    .map(str::to_string)
                    .or_else(|| op.ctx.bundle_id.clone())
                    .ok_or_else(|| {
                        DaemonError::invalid_args("close requires an app context or package id")
                    })?;
                self.shell(serial, &["am", "force-stop", &package]).await?;
                Ok(json!({"packageId": package}))
            }
            "boot" => {
                let avd = op.flag_str("avd").ok_or_else(|| {
                    DaemonError::invalid_args("boot requires --avd <name> for Android")
                })?;
                supervisor::run_cmd_detached("emulator", &["-avd", avd], &[])?;
                self.adb(
                    serial,
                    &["wait-for-device"],
                    &CmdOptions {
                        timeout_ms: Some(supervisor::timeout_for_profile("android_boot")),
                        ..Default::default()
                    },
                )
                .await?;
                Ok(json!({"avd": avd, "booted": true}))
            }
            "screenshot" => {
                let path = op
                    .ctx
                    .out_path
                    .clone()
                    .unwrap_or_else(|| default_artifact_path("screenshot", "png"));
                let remote = format!("{REMOTE_ARTIFACT_DIR}/screen.png");
                self.shell(serial, &["mkdir", "-p", REMOTE_ARTIFACT_DIR])
                    .await?;
                self.shell(serial, &["screencap", "-p", &remote]).await?;
                if let Some(parent) = path.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                self.adb(
                    serial,
                    &["pull", &remote, &path.to_string_lossy()],
                    &CmdOptions::default(),
                )
                .await?;
                self.shell(serial, &["rm", "-f", &remote]).await?;
                Ok(json!({"path": path}))
            }
            "record-start" => {
                let remote = format!(
                    "{REMOTE_ARTIFACT_DIR}/recording-{}.mp4",
                    crate::util::filename_timestamp()
                );
                self.shell(serial, &["mkdir", "-p", REMOTE_ARTIFACT_DIR])
                    .await?;
                let id = self.arena.spawn(
                    op.flag_str("sessionName").unwrap_or("default"),
                    "android recorder",
                    "adb",
                    &["-s", serial, "shell", "screenrecord", &remote],
                    None,
                    None,
                )?;
                Ok(json!({"handleId": id, "remotePath": remote}))
            }
            "record-finish" => {
                let remote = op.flag_str("remotePath").ok_or_else(|| {
                    DaemonError::invalid_args("record-finish requires remotePath")
                })?;
                let path = op
                    .ctx
                    .out_path
                    .clone()
                    .unwrap_or_else(|| default_artifact_path("recording", "mp4"));
                if let Some(parent) = path.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                self.adb(
                    serial,
                    &["pull", remote, &path.to_string_lossy()],
                    &CmdOptions::default(),
                )
                .await?;
                self.shell(serial, &["rm", "-f", remote]).await?;
                Ok(json!({"path": path}))
            }
            "logs-start" => {
                let output = op
                    .ctx
                    .out_path
                    .clone()
                    .ok_or_else(|| DaemonError::invalid_args("logs-start requires an output path"))?;
                let pid_file = output.with_extension("log.pid");
                let id = self.arena.spawn(
                    op.flag_str("sessionName").unwrap_or("default"),
                    "logcat stream",
                    "adb",
                    &["-s", serial, "logcat"],
                    Some(&output),
                    Some(pid_file),
                )?;
                Ok(json!({"handleId": id, "path": output}))
            }
            "snapshot" | "find" | "is" | "get" | "diff" => {
                op.ctx.check_canceled()?;
                let remote = format!("{REMOTE_ARTIFACT_DIR}/ui.xml");
                self.shell(serial, &["mkdir", "-p", REMOTE_ARTIFACT_DIR])
                    .await?;
                self.shell(serial, &["uiautomator", "dump", &remote]).await?;
                let out = self.shell(serial, &["cat", &remote]).await?;
                self.shell(serial, &["rm", "-f", &remote]).await?;
                Ok(json!({"format": "uiautomator-xml", "dump": out.stdout}))
            }
            "press" | "longpress" => {
                let target = op
                    .first_arg()
                    .ok_or_else(|| DaemonError::invalid_args("press requires a target"))?;
                let (x, y) = Self::require_coordinates(target)?;
                if op.command == "longpress" {
                    let (xs, ys) = (x.to_string(), y.to_string());
                    self.shell(serial, &["input", "swipe", &xs, &ys, &xs, &ys, "800"])
                        .await?;
                } else {
                    self.shell(serial, &["input", "tap", &x.to_string(), &y.to_string()])
                        .await?;
                }
                Ok(json!({"x": x, "y": y}))
            }
            "swipe" | "scroll" | "scrollintoview" => {
                let from = op
                    .first_arg()
                    .ok_or_else(|| DaemonError::invalid_args("swipe requires a start point"))?;
                let to = op
                    .args
                    .get(1)
                    .map(String::as_str)
                    .ok_or_else(|| DaemonError::invalid_args("swipe requires an end point"))?;
                let (x1, y1) = Self::require_coordinates(from)?;
                let (x2, y2) = Self::require_coordinates(to)?;
                self.shell(
                    serial,
                    &[
                        "input",
                        "swipe",
                        &x1.to_string(),
                        &y1.to_string(),
                        &x2.to_string(),
                        &y2.to_string(),
                    ],
                )
                .await?;
                Ok(json!({"from": [x1, y1], "to": [x2, y2]}))
            }
            "type" | "keyboard" => {
                let text = op
                    .first_arg()
                    .ok_or_else(|| DaemonError::invalid_args("type requires text"))?;
                let escaped = text.replace(' ', "%s");
                self.shell(serial, &["input", "text", &escaped]).await?;
                Ok(json!({"text": text}))
            }
            "fill" | "focus" => {
                let target = op
                    .first_arg()
                    .ok_or_else(|| DaemonError::invalid_args("fill requires a target"))?;
                let (x, y) = Self::require_coordinates(target)?;
                self.shell(serial, &["input", "tap", &x.to_string(), &y.to_string()])
                    .await?;
                if op.command == "fill" {
                    let text = op
                        .args
                        .get(1)
                        .map(String::as_str)
                        .ok_or_else(|| DaemonError::invalid_args("fill requires text"))?;
                    let escaped = text.replace(' ', "%s");
                    self.shell(serial, &["input", "text", &escaped]).await?;
                }
                Ok(json!({"x": x, "y": y}))
            }
            "back" => self.keyevent(serial, "KEYCODE_BACK").await,
            "home" => self.keyevent(serial, "KEYCODE_HOME").await,
            "app-switcher" => self.keyevent(serial, "KEYCODE_APP_SWITCH").await,
            "wait" => {
                let ms = op
                    .flags
                    .get("timeout")
                    .and_then(Value::as_u64)
                    .unwrap_or(1_000);
                op.ctx.check_canceled()?;
                tokio::time::sleep(std::time::Duration::from_millis(ms.min(60_000))).await;
                op.ctx.check_canceled()?;
                Ok(json!({"waitedMs": ms}))
            }
            "apps" => {
                let out = self
                    .shell(serial, &["pm", "list", "packages", "-3"])
                    .await?;
                let packages: Vec<&str> = out
                    .stdout
                    .lines()
                    .filter_map(|l| l.strip_prefix("package:"))
                    .collect();
                Ok(json!({"packages": packages}))
            }
            "appstate" => {
                let package = op
                    .first_arg()
                    .map(str::to_string)
                    .or_else(|| op.ctx.bundle_id.clone())
                    .ok_or_else(|| DaemonError::invalid_args("appstate requires a package id"))?;
                let out = self
                    .adb(
                        serial,
                        &["shell", "pidof", &package],
                        &CmdOptions {
                            allow_failure: true,
                            ..Default::default()
                        },
                    )
                    .await?;
                Ok(json!({
                    "packageId": package,
                    "running": !out.stdout.trim().is_empty(),
                }))
            }
            "reinstall" => {
                let apk = op
                    .flag_str("app")
                    .ok_or_else(|| DaemonError::invalid_args("reinstall requires --app <apk>"))?;
                self.adb(serial, &["install", "-r", apk], &CmdOptions::default())
                    .await?;
                Ok(json!({"app": apk}))
            }
            "settings" => {
                let namespace = op
                    .first_arg()
                    .ok_or_else(|| DaemonError::invalid_args("settings requires a namespace"))?;
                let key = op
                    .args
                    .get(1)
                    .map(String::as_str)
                    .ok_or_else(|| DaemonError::invalid_args("settings requires a key"))?;
                match op.args.get(2) {
                    Some(value) => {
                        self.shell(serial, &["settings", "put", namespace, key, value])
                            .await?;
                        Ok(json!({"namespace": namespace, "key": key, "value": value}))
                    }
                    None => {
                        let out = self
                            .shell(serial, &["settings", "get", namespace, key])
                            .await?;
                        Ok(json!({
                            "namespace": namespace,
                            "key": key,
                            "value": out.stdout.trim(),
                        }))
                    }
                }
            }
            "clipboard" => match op.args.first().map(String::as_str) {
                Some("set") => {
                    let text = op
                        .args
                        .get(1)
                        .ok_or_else(|| DaemonError::invalid_args("clipboard set requires text"))?;
                    self.shell(serial, &["cmd", "clipboard", "set-primary-clip", text])
                        .await?;
                    Ok(json!({"text": text}))
                }
                _ => {
                    let out = self
                        .shell(serial, &["cmd", "clipboard", "get-primary-clip"])
                        .await?;
                    Ok(json!({"text": out.stdout.trim()}))
                }
            },
            "push" => {
                let payload = op
                    .flag_str("payload")
                    .ok_or_else(|| DaemonError::invalid_args("push requires --payload <json>"))?;
                let package = op
                    .first_arg()
                    .map(str::to_string)
                    .or_else(|| op.ctx.bundle_id.clone())
                    .ok_or_else(|| DaemonError::invalid_args("push requires a package id"))?;
                self.shell(
                    serial,
                    &[
                        "am",
                        "broadcast",
                        "-a",
                        "com.google.android.c2dm.intent.RECEIVE",
                        "-p",
                        &package,
                        "--es",
                        "payload",
                        payload,
                    ],
                )
                .await?;
                Ok(json!({"packageId": package, "delivered": true}))
            }
            "network" => {
                let service = op
                    .first_arg()
                    .ok_or_else(|| DaemonError::invalid_args("network requires wifi or data"))?;
                if !matches!(service, "wifi" | "data") {
                    return Err(DaemonError::invalid_args(format!(
                        "unknown network service `{service}`"
                    )));
                }
                let action = match op.args.get(1).map(String::as_str) {
                    Some("on") => "enable",
                    Some("off") => "disable",
                    other => {
                        return Err(DaemonError::invalid_args(format!(
                            "network requires on or off, got {other:?}"
                        )));
                    }
                };
                self.shell(serial, &["svc", service, action]).await?;
                Ok(json!({"service": service, "enabled": action == "enable"}))
            }
            "trigger-app-event" => {
                let url = op
                    .flag_str("url")
                    .ok_or_else(|| DaemonError::invalid_args("trigger-app-event requires a url"))?;
                self.shell(
                    serial,
                    &["am", "start", "-a", "android.intent.action.VIEW", "-d", url],
                )
                .await?;
                Ok(json!({"url": url}))
            }
            other => Err(DaemonError::command_failed(format!(
                "the android backend has no handler for `{other}`"
            ))),
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

    // ===== adb Parsing Tests =====

    #[test]
    fn test_parse_adb_devices() {
        let raw = "List of devices attached\n\
                   emulator-5554\tdevice product:sdk model:sdk_gphone64 device:emu64 transport_id:1\n\
                   R5CT10XYZ\tdevice product:beyond model:SM_G973F device:beyond transport_id:2\n\
                   0A1B2C\tunauthorized transport_id:3\n";
        let devices = AndroidBackend::parse_device_list(raw);
        assert_eq!(devices.len(), 2);

        let emulator = &devices[0];
        assert_eq!(emulator.identifier, "emulator-5554");
        assert_eq!(emulator.kind, DeviceKind::Emulator);
        assert!(emulator.booted);
        assert_eq!(emulator.name, "sdk gphone64");

        let phone = &devices[1];
        assert_eq!(phone.kind, DeviceKind::Device);
        assert_eq!(phone.target, TargetClass::Mobile);
    }

    #[test]
    fn test_parse_adb_devices_tv() {
        let raw = "List of devices attached\n\
                   adb-XYZ\tdevice product:atv model:Chromecast_TV device:tv transport_id:4\n";
        let devices = AndroidBackend::parse_device_list(raw);
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].target, TargetClass::Tv);
    }

    #[test]
    fn test_parse_adb_devices_offline_state() {
        let raw = "List of devices attached\nSERIAL1\toffline transport_id:1\n";
        let devices = AndroidBackend::parse_device_list(raw);
        assert_eq!(devices.len(), 1);
        assert!(!devices[0].booted);
    }

    #[test]
    fn test_parse_adb_devices_empty() {
        let devices = AndroidBackend::parse_device_list("List of devices attached\n\n");
        assert!(devices.is_empty());
    }

    // ===== Coordinate Parsing Tests =====

    #[test]
    fn test_parse_coordinates() {
        assert_eq!(AndroidBackend::parse_coordinates("100,200"), Some((100, 200)));
        assert_eq!(
            AndroidBackend::parse_coordinates(" 10 , 20 "),
            Some((10, 20))
        );
        assert_eq!(AndroidBackend::parse_coordinates("@e1"), None);
        assert_eq!(AndroidBackend::parse_coordinates("100"), None);
    }

    #[test]
    fn test_require_coordinates_error() {
        let err = AndroidBackend::require_coordinates("@e1").unwrap_err();
        assert_eq!(err.code, agent_device_protocol::ErrorCode::InvalidArgs);
        assert!(err.message.contains("@e1"));
    }

    // ===== Backend Surface Tests =====

    #[test]
    fn test_backend_handles_both_kinds() {
        let backend = AndroidBackend::new(Arc::new(ProcessArena::new()));
        assert!(backend.handles(Platform::Android, DeviceKind::Emulator));
        assert!(backend.handles(Platform::Android, DeviceKind::Device));
        assert!(!backend.handles(Platform::Android, DeviceKind::Simulator));
        assert!(!backend.handles(Platform::Ios, DeviceKind::Device));
    }
}

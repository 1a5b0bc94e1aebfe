//! Capability matrix and device selectors.
//!
//! The matrix is the authoritative answer to "does this command exist on
//! this device class". The pipeline consults it before dispatch; backends
//! can assume any command they receive has passed it.

use agent_device_protocol::{DaemonError, Request};
use serde_json::json;
use std::path::PathBuf;

use crate::devices::{DeviceDescriptor, DeviceKind, Platform, TargetClass};

/// Commands available on every device class.
const UNIVERSAL_COMMANDS: &[&str] = &[
    "open",
    "close",
    "snapshot",
    "wait",
    "press",
    "fill",
    "type",
    "focus",
    "scroll",
    "scrollintoview",
    "back",
    "home",
    "app-switcher",
    "screenshot",
    "record",
    "reinstall",
    "logs",
    "apps",
    "appstate",
    "boot",
    "trigger-app-event",
    "find",
    "is",
    "get",
    "longpress",
    "diff",
    "perf",
    "swipe",
    "trace",
];

/// Whether `command` is supported on the given device class.
///
/// TV targets inherit their platform's rules: Android TV behaves like
/// Android, tvOS like iOS by kind. Unknown commands are reported as
/// supported so new commands ship without a matrix update; a typo is
/// caught by the dispatcher instead. Pinned by a test below.
pub fn command_supported(command: &str, platform: Platform, kind: DeviceKind) -> bool {
    let ios_simulator = platform == Platform::Ios && kind == DeviceKind::Simulator;
    let ios_device = platform == Platform::Ios && kind == DeviceKind::Device;
    let android = platform == Platform::Android;

    match command {
        "alert" | "pinch" => ios_simulator,
        "settings" | "push" | "clipboard" => ios_simulator || android,
        "keyboard" => android,
        cmd if UNIVERSAL_COMMANDS.contains(&cmd) => ios_simulator || ios_device || android,
        _ => true,
    }
}

pub fn supported_on(command: &str, device: &DeviceDescriptor) -> bool {
    command_supported(command, device.platform, device.kind)
}

/// The selector tuple used to pick a device and to check a request against
/// an existing session's binding.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selector {
    pub platform: Option<Platform>,
    pub target: Option<TargetClass>,
    pub device_name: Option<String>,
    pub udid: Option<String>,
    pub serial: Option<String>,
    pub simulator_set: Option<PathBuf>,
    pub serial_allowlist: Vec<String>,
}

impl Selector {
    /// Extract selector flags from a request. Invalid values (unknown
    /// platform, unknown target) fail here, before any session lookup.
    pub fn from_request(req: &Request) -> Result<Self, DaemonError> {
        let platform = req.flag_str("platform").map(Platform::parse).transpose()?;
        let target = req.flag_str("target").map(TargetClass::parse).transpose()?;
        let serial_allowlist = match req.flag_value("serials") {
            Some(serde_json::Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            Some(serde_json::Value::String(s)) => s
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        };

        Ok(Self {
            platform,
            target,
            device_name: req.flag_str("device").map(str::to_string),
            udid: req.flag_str("udid").map(str::to_string),
            serial: req.flag_str("serial").map(str::to_string),
            simulator_set: req.flag_str("simulator-set").map(PathBuf::from),
            serial_allowlist,
        })
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Flags present in this selector that the given device does not
    /// satisfy. Empty means compatible. Device names compare
    /// case-insensitively.
    pub fn mismatches(&self, device: &DeviceDescriptor) -> Vec<&'static str> {
        let mut offending = Vec::new();
        if let Some(platform) = self.platform {
            if device.platform != platform {
                offending.push("platform");
            }
        }
        if let Some(target) = self.target {
            if device.target != target {
                offending.push("target");
            }
        }
        if let Some(name) = &self.device_name {
            if !device.name.eq_ignore_ascii_case(name) {
                offending.push("device");
            }
        }
        if let Some(udid) = &self.udid {
            if &device.identifier != udid {
                offending.push("udid");
            }
        }
        if let Some(serial) = &self.serial {
            if &device.identifier != serial {
                offending.push("serial");
            }
        }
        if let Some(set) = &self.simulator_set {
            if device.simulator_set.as_deref() != Some(set.as_path()) {
                offending.push("simulator-set");
            }
        }
        if !self.serial_allowlist.is_empty()
            && !self.serial_allowlist.contains(&device.identifier)
        {
            offending.push("serials");
        }
        offending
    }

    pub fn matches(&self, device: &DeviceDescriptor) -> bool {
        self.mismatches(device).is_empty()
    }

    /// `INVALID_ARGS` naming the selector flags an existing session's
    /// device fails to satisfy.
    pub fn incompatibility_error(
        &self,
        session_name: &str,
        device: &DeviceDescriptor,
    ) -> Option<DaemonError> {
        let offending = self.mismatches(device);
        if offending.is_empty() {
            return None;
        }
        Some(
            DaemonError::invalid_args(format!(
                "selector flags [{}] are incompatible with the device bound to session `{session_name}`",
                offending.join(", ")
            ))
            .with_details(json!({
                "flags": offending,
                "boundDevice": {
                    "identifier": device.identifier,
                    "name": device.name,
                    "platform": device.platform.as_str(),
                    "kind": device.kind.as_str(),
                }
            })),
        )
    }
}

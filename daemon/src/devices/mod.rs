//! Device model and platform backends.
//!
//! A [`DeviceDescriptor`] is immutable once discovery returns it; a
//! session pins one for its lifetime. Backends are opaque executors: the
//! dispatcher hands them a command name plus arguments and they shell out
//! to the vendor tooling (`xcrun simctl`, `xcrun devicectl`, `adb`).

pub mod android;
pub mod ios;

use agent_device_protocol::DaemonError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;

use crate::dispatch::ExecutionContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Ios,
    Android,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Ios => "ios",
            Platform::Android => "android",
        }
    }

    /// Parse a selector value. `apple` is an accepted alias for `ios`.
    pub fn parse(value: &str) -> Result<Self, DaemonError> {
        match value.to_ascii_lowercase().as_str() {
            "ios" | "apple" => Ok(Platform::Ios),
            "android" => Ok(Platform::Android),
            other => Err(DaemonError::invalid_args(format!(
                "unknown platform `{other}` (expected ios or android)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Simulator,
    Emulator,
    Device,
}

impl DeviceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Simulator => "simulator",
            DeviceKind::Emulator => "emulator",
            DeviceKind::Device => "device",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetClass {
    Mobile,
    Tv,
}

impl TargetClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetClass::Mobile => "mobile",
            TargetClass::Tv => "tv",
        }
    }

    pub fn parse(value: &str) -> Result<Self, DaemonError> {
        match value.to_ascii_lowercase().as_str() {
            "mobile" => Ok(TargetClass::Mobile),
            "tv" => Ok(TargetClass::Tv),
            other => Err(DaemonError::invalid_args(format!(
                "unknown target `{other}` (expected mobile or tv)"
            ))),
        }
    }
}

/// One discovered device. Immutable for the duration of any session bound
/// to it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDescriptor {
    pub platform: Platform,
    /// UDID (iOS) or serial (Android).
    pub identifier: String,
    pub name: String,
    pub kind: DeviceKind,
    pub target: TargetClass,
    pub booted: bool,
    /// Simulator-set path for iOS simulators running outside the default
    /// device set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub simulator_set: Option<PathBuf>,
}

/// One backend invocation: command plus everything needed to carry it out.
pub struct BackendOp<'a> {
    pub command: &'a str,
    pub device: &'a DeviceDescriptor,
    pub args: &'a [String],
    pub flags: &'a Map<String, Value>,
    pub ctx: &'a ExecutionContext,
}

impl BackendOp<'_> {
    pub fn flag_str(&self, key: &str) -> Option<&str> {
        self.flags.get(key).and_then(Value::as_str)
    }

    pub fn first_arg(&self) -> Option<&str> {
        self.args.first().map(String::as_str)
    }
}

/// A platform executor. Discovery lists its devices; `run` carries out one
/// command against one of them.
#[async_trait]
pub trait DeviceBackend: Send + Sync {
    /// Stable backend name for logs and capability errors.
    fn name(&self) -> &'static str;

    /// Whether this backend drives the given device class.
    fn handles(&self, platform: Platform, kind: DeviceKind) -> bool;

    /// List devices visible to this backend. A missing tool surfaces as
    /// `TOOL_MISSING`; callers aggregating discovery may downgrade that.
    async fn discover(&self) -> Result<Vec<DeviceDescriptor>, DaemonError>;

    /// Execute one command. The command has already passed the capability
    /// matrix for this device class.
    async fn run(&self, op: BackendOp<'_>) -> Result<Value, DaemonError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn simulator(identifier: &str, name: &str) -> DeviceDescriptor {
        DeviceDescriptor {
            platform: Platform::Ios,
            identifier: identifier.to_string(),
            name: name.to_string(),
            kind: DeviceKind::Simulator,
            target: TargetClass::Mobile,
            booted: true,
            simulator_set: None,
        }
    }

    #[test]
    fn test_platform_parse_alias() {
        assert_eq!(Platform::parse("apple").unwrap(), Platform::Ios);
        assert_eq!(Platform::parse("iOS").unwrap(), Platform::Ios);
        assert_eq!(Platform::parse("android").unwrap(), Platform::Android);
        assert!(Platform::parse("windows").is_err());
    }

    #[test]
    fn test_target_parse() {
        assert_eq!(TargetClass::parse("tv").unwrap(), TargetClass::Tv);
        assert_eq!(TargetClass::parse("Mobile").unwrap(), TargetClass::Mobile);
        assert!(TargetClass::parse("watch").is_err());
    }

    #[test]
    fn test_descriptor_wire_shape() {
        let device = simulator("UDID-1", "iPhone 15");
        let encoded = serde_json::to_value(&device).unwrap();
        assert_eq!(encoded["platform"], serde_json::json!("ios"));
        assert_eq!(encoded["kind"], serde_json::json!("simulator"));
        assert_eq!(encoded["target"], serde_json::json!("mobile"));
        assert!(encoded.get("simulatorSet").is_none());
    }

    #[test]
    fn test_descriptor_roundtrip() {
        let mut device = simulator("UDID-1", "iPhone 15");
        device.simulator_set = Some(PathBuf::from("/tmp/sets/ci"));
        let encoded = serde_json::to_string(&device).unwrap();
        let decoded: DeviceDescriptor = serde_json::from_str(&encoded).unwrap();
        assert_eq!(device, decoded);
    }
}

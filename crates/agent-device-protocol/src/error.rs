//! Closed error taxonomy and the normalization pass applied to every
//! failure before it leaves the daemon.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Every error the daemon emits carries exactly one of these codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidArgs,
    DeviceNotFound,
    DeviceInUse,
    ToolMissing,
    AppNotInstalled,
    UnsupportedPlatform,
    UnsupportedOperation,
    CommandFailed,
    SessionNotFound,
    Unauthorized,
    Unknown,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidArgs => "INVALID_ARGS",
            ErrorCode::DeviceNotFound => "DEVICE_NOT_FOUND",
            ErrorCode::DeviceInUse => "DEVICE_IN_USE",
            ErrorCode::ToolMissing => "TOOL_MISSING",
            ErrorCode::AppNotInstalled => "APP_NOT_INSTALLED",
            ErrorCode::UnsupportedPlatform => "UNSUPPORTED_PLATFORM",
            ErrorCode::UnsupportedOperation => "UNSUPPORTED_OPERATION",
            ErrorCode::CommandFailed => "COMMAND_FAILED",
            ErrorCode::SessionNotFound => "SESSION_NOT_FOUND",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::Unknown => "UNKNOWN",
        }
    }

    fn default_hint(&self) -> &'static str {
        match self {
            ErrorCode::InvalidArgs => "Check command arguments and run --help.",
            ErrorCode::DeviceNotFound => {
                "List available devices with `devices` and check your selector flags."
            }
            ErrorCode::DeviceInUse => "Close the session holding this device or pick another one.",
            ErrorCode::ToolMissing => {
                "Install the platform tooling (Xcode command line tools or the Android SDK)."
            }
            ErrorCode::AppNotInstalled => {
                "List installed apps with `apps` and check the bundle or package id."
            }
            ErrorCode::UnsupportedPlatform => {
                "This platform/kind combination has no backend on this host."
            }
            ErrorCode::UnsupportedOperation => "This command is not available on this device class.",
            ErrorCode::CommandFailed => "Re-run with --debug for a diagnostic log.",
            ErrorCode::SessionNotFound => "Open a session first with `open`.",
            ErrorCode::Unauthorized => "Check the daemon token and lease scoping flags.",
            ErrorCode::Unknown => "Re-run with --debug and inspect the daemon log.",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Internal error type handlers return. Converted to an [`ErrorObject`]
/// (and redacted) by [`normalize`] at the pipeline boundary.
#[derive(Debug, Clone, Error)]
#[error("{code}: {message}")]
pub struct DaemonError {
    pub code: ErrorCode,
    pub message: String,
    pub hint: Option<String>,
    pub details: Option<Value>,
}

impl DaemonError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            hint: None,
            details: None,
        }
    }

    pub fn invalid_args(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidArgs, message)
    }

    pub fn device_not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::DeviceNotFound, message)
    }

    pub fn device_in_use(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::DeviceInUse, message)
    }

    pub fn tool_missing(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ToolMissing, message)
    }

    pub fn app_not_installed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::AppNotInstalled, message)
    }

    pub fn unsupported_platform(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::UnsupportedPlatform, message)
    }

    pub fn unsupported_operation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::UnsupportedOperation, message)
    }

    pub fn command_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::CommandFailed, message)
    }

    pub fn session_not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::SessionNotFound, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthorized, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unknown, message)
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Wire representation of a failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorObject {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// Keys whose values are replaced with `"[REDACTED]"` anywhere in an
/// outbound details map. Matching is a case-insensitive substring test on
/// the key.
const SECRET_KEY_FRAGMENTS: &[&str] = &[
    "token",
    "authorization",
    "password",
    "apikey",
    "secret",
    "passphrase",
    "credential",
];

/// Stderr prefixes that carry no information about the actual failure and
/// are skipped when promoting a subprocess stderr line to the message.
const BOILERPLATE_PREFIXES: &[&str] = &["warning:", "note:", "info:", "* daemon"];

const MAX_PROMOTED_STDERR_LEN: usize = 200;

fn is_secret_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    SECRET_KEY_FRAGMENTS.iter().any(|frag| lower.contains(frag))
}

/// Recursively replace secret-looking values with `"[REDACTED]"`.
pub fn redact_value(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, entry) in map.iter_mut() {
                if is_secret_key(key) {
                    *entry = Value::String("[REDACTED]".to_string());
                } else {
                    redact_value(entry);
                }
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                redact_value(item);
            }
        }
        _ => {}
    }
}

/// First stderr line that is non-empty and not boilerplate, truncated.
fn first_informative_stderr_line(stderr: &str) -> Option<String> {
    for line in stderr.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let lower = trimmed.to_ascii_lowercase();
        if BOILERPLATE_PREFIXES.iter().any(|p| lower.starts_with(p)) {
            continue;
        }
        let mut message: String = trimmed.chars().take(MAX_PROMOTED_STDERR_LEN).collect();
        if trimmed.chars().count() > MAX_PROMOTED_STDERR_LEN {
            message.push('…');
        }
        return Some(message);
    }
    None
}

/// Normalize an internal error into its wire form:
///
/// 1. redact the details map,
/// 2. lift `hint` / `diagnosticId` / `logPath` out of details,
/// 3. drop an empty details map,
/// 4. for `COMMAND_FAILED` with a recorded subprocess stderr, replace a
///    generic message with the first informative stderr line,
/// 5. fill in a per-code default hint when none was provided.
pub fn normalize(err: DaemonError) -> ErrorObject {
    let DaemonError {
        code,
        mut message,
        hint,
        details,
    } = err;

    let mut hint = hint;
    let mut diagnostic_id = None;
    let mut log_path = None;

    let details = details.and_then(|mut value| {
        redact_value(&mut value);

        if let Value::Object(ref mut map) = value {
            if let Some(Value::String(h)) = map.remove("hint") {
                hint.get_or_insert(h);
            }
            if let Some(Value::String(id)) = map.remove("diagnosticId") {
                diagnostic_id = Some(id);
            }
            if let Some(Value::String(path)) = map.remove("logPath") {
                log_path = Some(path);
            }

            if code == ErrorCode::CommandFailed {
                if let Some(Value::String(stderr)) = map.get("stderr") {
                    if let Some(line) = first_informative_stderr_line(stderr) {
                        message = line;
                    }
                }
            }

            if map.is_empty() {
                return None;
            }
        }
        Some(value)
    });

    let hint = hint.unwrap_or_else(|| code.default_hint().to_string());

    ErrorObject {
        code,
        message,
        hint: Some(hint),
        diagnostic_id,
        log_path,
        details,
    }
}

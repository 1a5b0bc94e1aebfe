//! Optional HTTP auth hook.
//!
//! When `AGENT_DEVICE_HTTP_AUTH_HOOK` names an executable, the HTTP
//! server invokes it before a request enters the pipeline. Contract:
//! stdin carries a JSON context `{headers, rpcRequest, daemonRequest}`,
//! stdout carries a JSON decision, and exit code 0 covers every
//! well-formed decision. The export name (`AGENT_DEVICE_HTTP_AUTH_EXPORT`,
//! default `default`) is passed as the first argument so one hook binary
//! can host several policies.
//!
//! Decision shapes:
//! - `true` / empty output: allow.
//! - `false`: reject with `UNAUTHORIZED`.
//! - `{"ok": false, "code"?, "message"?, "details"?}`: reject.
//! - `{"ok": true, "tenantId"?}`: allow; a tenant id is injected into
//!   the daemon request.

use agent_device_protocol::ErrorCode;
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing::warn;

use crate::supervisor::{self, CmdOptions};

const HOOK_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Clone)]
pub struct AuthHook {
    program: PathBuf,
    export: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Allow { tenant_id: Option<String> },
    Reject {
        code: ErrorCode,
        message: String,
        details: Option<Value>,
    },
}

impl Decision {
    fn reject_unauthorized(message: impl Into<String>) -> Self {
        Decision::Reject {
            code: ErrorCode::Unauthorized,
            message: message.into(),
            details: None,
        }
    }
}

fn parse_code(value: Option<&Value>) -> ErrorCode {
    value
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or(ErrorCode::Unauthorized)
}

/// Parse a hook's stdout into a decision. Separated from process
/// plumbing so the contract is testable on its own.
pub fn parse_decision(stdout: &str) -> Decision {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Decision::Allow { tenant_id: None };
    }
    let Ok(value) = serde_json::from_str::<Value>(trimmed) else {
        return Decision::reject_unauthorized("auth hook produced unparseable output");
    };
    match value {
        Value::Bool(true) | Value::Null => Decision::Allow { tenant_id: None },
        Value::Bool(false) => Decision::reject_unauthorized("rejected by auth hook"),
        Value::Object(map) => {
            let ok = map.get("ok").and_then(Value::as_bool);
            match ok {
                Some(true) | None => Decision::Allow {
                    tenant_id: map
                        .get("tenantId")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                },
                Some(false) => Decision::Reject {
                    code: parse_code(map.get("code")),
                    message: map
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("rejected by auth hook")
                        .to_string(),
                    details: map.get("details").cloned(),
                },
            }
        }
        _ => Decision::Allow { tenant_id: None },
    }
}

impl AuthHook {
    pub fn new(program: PathBuf, export: String) -> Self {
        Self { program, export }
    }

    pub fn from_env() -> Option<Self> {
        let program = std::env::var("AGENT_DEVICE_HTTP_AUTH_HOOK").ok()?;
        if program.is_empty() {
            return None;
        }
        let export = std::env::var("AGENT_DEVICE_HTTP_AUTH_EXPORT")
            .unwrap_or_else(|_| "default".to_string());
        Some(Self::new(PathBuf::from(program), export))
    }

    /// Invoke the hook. Anything other than a well-formed allow is a
    /// rejection; a hook that cannot run never fails open.
    pub async fn evaluate(
        &self,
        headers: &Value,
        rpc_request: &Value,
        daemon_request: &Value,
    ) -> Decision {
        let context = json!({
            "headers": headers,
            "rpcRequest": rpc_request,
            "daemonRequest": daemon_request,
        });
        let result = supervisor::run_cmd(
            &self.program.to_string_lossy(),
            &[&self.export],
            &CmdOptions {
                stdin: Some(context.to_string()),
                timeout_ms: Some(HOOK_TIMEOUT_MS),
                ..Default::default()
            },
        )
        .await;

        match result {
            Ok(output) => parse_decision(&output.stdout),
            Err(err) => {
                warn!(error = %err, hook = %self.program.display(), "auth hook invocation failed");
                Decision::reject_unauthorized("auth hook invocation failed")
            }
        }
    }
}

//! Wire protocol shared by the agent-device daemon and its clients.
//!
//! The daemon speaks the same envelope over both transports: newline-
//! delimited JSON on the stream socket, and JSON-RPC 2.0 params/result on
//! HTTP. This crate owns the envelope types, the closed error taxonomy and
//! its normalization rules, the daemon metadata file format, and the
//! client-side bootstrap used to locate or launch a daemon.

pub mod client;
pub mod error;
pub mod jsonrpc;
pub mod metadata;

pub use error::{normalize, redact_value, DaemonError, ErrorCode, ErrorObject};
pub use metadata::{DaemonMetadata, LockFile};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Request metadata carried alongside the command itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RequestMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "is_false")]
    pub debug: bool,
    /// Caller's working directory, used to resolve relative output paths.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_id: Option<String>,
    /// `"tenant"` turns on multi-tenant session scoping for this request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_isolation: Option<String>,
}

fn is_false(v: &bool) -> bool {
    !*v
}

/// A single daemon request: one command against one named session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Request {
    /// Per-run secret from the daemon metadata file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub session: String,
    pub command: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub flags: Map<String, Value>,
    pub meta: RequestMeta,
}

impl Default for Request {
    fn default() -> Self {
        Self {
            token: None,
            session: "default".to_string(),
            command: String::new(),
            args: Vec::new(),
            flags: Map::new(),
            meta: RequestMeta::default(),
        }
    }
}

impl Request {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    /// String flag lookup. Numbers and booleans are not coerced; handlers
    /// that accept both use [`Request::flag_value`].
    pub fn flag_str(&self, key: &str) -> Option<&str> {
        self.flags.get(key).and_then(Value::as_str)
    }

    /// Boolean flag lookup; accepts `true` and the strings `"true"`/`"1"`.
    pub fn flag_bool(&self, key: &str) -> bool {
        match self.flags.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => s == "true" || s == "1",
            _ => false,
        }
    }

    pub fn flag_u64(&self, key: &str) -> Option<u64> {
        match self.flags.get(key) {
            Some(Value::Number(n)) => n.as_u64(),
            Some(Value::String(s)) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn flag_value(&self, key: &str) -> Option<&Value> {
        self.flags.get(key)
    }

    /// Effective tenant id: `meta.tenantId` wins over `flags.tenant`.
    pub fn tenant_id(&self) -> Option<&str> {
        self.meta
            .tenant_id
            .as_deref()
            .or_else(|| self.flag_str("tenant"))
    }

    /// Effective run id: `meta.runId` wins over `flags.runId`.
    pub fn run_id(&self) -> Option<&str> {
        self.meta.run_id.as_deref().or_else(|| self.flag_str("runId"))
    }

    /// Effective lease id: `meta.leaseId` wins over `flags.leaseId`.
    pub fn lease_id(&self) -> Option<&str> {
        self.meta
            .lease_id
            .as_deref()
            .or_else(|| self.flag_str("leaseId"))
    }

    /// Whether this request opted into tenant isolation.
    pub fn tenant_isolated(&self) -> bool {
        self.meta.session_isolation.as_deref() == Some("tenant")
            || self.flag_str("sessionIsolation") == Some("tenant")
    }
}

/// Daemon response envelope: `{ok:true, data}` or `{ok:false, error}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Response {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

impl Response {
    pub fn success(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(error: ErrorObject) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(error),
        }
    }

    /// Error code of a failed response, if any.
    pub fn error_code(&self) -> Option<ErrorCode> {
        self.error.as_ref().map(|e| e.code)
    }
}

impl From<DaemonError> for Response {
    fn from(err: DaemonError) -> Self {
        Response::failure(normalize(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // ===== Request Envelope Tests =====

    #[test]
    fn test_request_default_session() {
        let req = Request::new("snapshot");
        assert_eq!(req.session, "default");
        assert_eq!(req.command, "snapshot");
    }

    #[test]
    fn test_request_deserialize_minimal() {
        let req: Request = serde_json::from_str(r#"{"command":"open"}"#).unwrap();
        assert_eq!(req.command, "open");
        assert_eq!(req.session, "default");
        assert!(req.args.is_empty());
        assert!(req.flags.is_empty());
        assert!(!req.meta.debug);
    }

    #[test]
    fn test_request_roundtrip() {
        let mut req = Request::new("press");
        req.args.push("@e1".to_string());
        req.flags.insert("platform".to_string(), json!("ios"));
        req.meta.request_id = Some("r-1".to_string());
        req.meta.debug = true;

        let encoded = serde_json::to_string(&req).unwrap();
        let decoded: Request = serde_json::from_str(&encoded).unwrap();
        assert_eq!(req, decoded);
    }

    #[test]
    fn test_flag_accessors() {
        let mut req = Request::new("wait");
        req.flags.insert("timeout".to_string(), json!(5000));
        req.flags.insert("verbose".to_string(), json!(true));
        req.flags.insert("device".to_string(), json!("iPhone 15"));
        req.flags.insert("strTimeout".to_string(), json!("250"));

        assert_eq!(req.flag_u64("timeout"), Some(5000));
        assert_eq!(req.flag_u64("strTimeout"), Some(250));
        assert!(req.flag_bool("verbose"));
        assert!(!req.flag_bool("missing"));
        assert_eq!(req.flag_str("device"), Some("iPhone 15"));
        assert_eq!(req.flag_str("timeout"), None);
    }

    #[test]
    fn test_flag_bool_string_forms() {
        let mut req = Request::new("open");
        req.flags.insert("a".to_string(), json!("true"));
        req.flags.insert("b".to_string(), json!("1"));
        req.flags.insert("c".to_string(), json!("yes"));
        assert!(req.flag_bool("a"));
        assert!(req.flag_bool("b"));
        assert!(!req.flag_bool("c"));
    }

    #[test]
    fn test_scoping_accessors_meta_wins() {
        let mut req = Request::new("close");
        req.flags.insert("tenant".to_string(), json!("flag-tenant"));
        req.meta.tenant_id = Some("meta-tenant".to_string());
        assert_eq!(req.tenant_id(), Some("meta-tenant"));

        req.meta.tenant_id = None;
        assert_eq!(req.tenant_id(), Some("flag-tenant"));
    }

    #[test]
    fn test_tenant_isolated_via_flag() {
        let mut req = Request::new("close");
        assert!(!req.tenant_isolated());
        req.flags
            .insert("sessionIsolation".to_string(), json!("tenant"));
        assert!(req.tenant_isolated());
    }

    // ===== Response Envelope Tests =====

    #[test]
    fn test_response_success_shape() {
        let resp = Response::success(json!({"devices": []}));
        let encoded = serde_json::to_value(&resp).unwrap();
        assert_eq!(encoded["ok"], json!(true));
        assert!(encoded.get("error").is_none());
        assert_eq!(encoded["data"]["devices"], json!([]));
    }

    #[test]
    fn test_response_failure_shape() {
        let resp: Response = DaemonError::session_not_found("nope").into();
        let encoded = serde_json::to_value(&resp).unwrap();
        assert_eq!(encoded["ok"], json!(false));
        assert_eq!(encoded["error"]["code"], json!("SESSION_NOT_FOUND"));
        assert!(encoded.get("data").is_none());
    }

    #[test]
    fn test_response_error_code() {
        let resp: Response = DaemonError::unauthorized("bad token").into();
        assert_eq!(resp.error_code(), Some(ErrorCode::Unauthorized));
        assert_eq!(Response::success(json!({})).error_code(), None);
    }
}

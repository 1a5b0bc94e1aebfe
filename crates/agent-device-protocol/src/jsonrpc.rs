//! JSON-RPC 2.0 envelope used by the HTTP transport.

use crate::error::{ErrorCode, ErrorObject};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
/// Downstream daemon failure (carries the normalized error in `data`).
pub const DAEMON_ERROR: i64 = -32000;
/// Reserved for auth-hook rejections.
pub const AUTH_REJECTED: i64 = -32001;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl RpcRequest {
    pub fn is_valid(&self) -> bool {
        self.jsonrpc == "2.0" && !self.method.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn result(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Option<Value>, code: i64, message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
                data,
            }),
        }
    }

    /// Wrap a normalized daemon error, keeping the full object in `data`
    /// so clients can read `data.code`.
    pub fn daemon_error(id: Option<Value>, rpc_code: i64, error: &ErrorObject) -> Self {
        let data = serde_json::to_value(error).unwrap_or(Value::Null);
        Self::error(id, rpc_code, error.message.clone(), Some(data))
    }
}

/// HTTP status for a normalized daemon error surfaced over `/rpc`.
pub fn http_status_for(code: ErrorCode) -> u16 {
    match code {
        ErrorCode::InvalidArgs => 400,
        ErrorCode::Unauthorized => 401,
        ErrorCode::SessionNotFound => 404,
        _ => 500,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_rpc_request_validity() {
        let req: RpcRequest =
            serde_json::from_value(json!({"jsonrpc": "2.0", "id": 1, "method": "agent_device.command"}))
                .unwrap();
        assert!(req.is_valid());

        let req: RpcRequest =
            serde_json::from_value(json!({"jsonrpc": "1.0", "method": "x"})).unwrap();
        assert!(!req.is_valid());
    }

    #[test]
    fn test_rpc_response_result_shape() {
        let resp = RpcResponse::result(Some(json!("1")), json!({"ok": true}));
        let encoded = serde_json::to_value(&resp).unwrap();
        assert_eq!(encoded["jsonrpc"], json!("2.0"));
        assert_eq!(encoded["id"], json!("1"));
        assert_eq!(encoded["result"]["ok"], json!(true));
        assert!(encoded.get("error").is_none());
    }

    #[test]
    fn test_rpc_response_error_shape() {
        let resp = RpcResponse::error(None, PARSE_ERROR, "Parse error", None);
        let encoded = serde_json::to_value(&resp).unwrap();
        assert_eq!(encoded["error"]["code"], json!(-32700));
        assert_eq!(encoded["error"]["message"], json!("Parse error"));
    }

    #[test]
    fn test_daemon_error_keeps_code_in_data() {
        let obj = crate::normalize(crate::DaemonError::unauthorized("denied"));
        let resp = RpcResponse::daemon_error(Some(json!(7)), DAEMON_ERROR, &obj);
        let encoded = serde_json::to_value(&resp).unwrap();
        assert_eq!(encoded["error"]["data"]["code"], json!("UNAUTHORIZED"));
    }

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(http_status_for(ErrorCode::InvalidArgs), 400);
        assert_eq!(http_status_for(ErrorCode::Unauthorized), 401);
        assert_eq!(http_status_for(ErrorCode::SessionNotFound), 404);
        assert_eq!(http_status_for(ErrorCode::CommandFailed), 500);
        assert_eq!(http_status_for(ErrorCode::DeviceNotFound), 500);
    }
}

//! HTTP transport: JSON-RPC 2.0 at `POST /rpc`, liveness at `GET /health`.
//!
//! Methods: `agent_device.command` and
//! `agent_device.lease.{allocate,heartbeat,release}` (dashed aliases
//! accepted). The request token is resolved from the `token` param, the
//! `x-agent-device-token` header, or `Authorization: Bearer`. Bodies are
//! capped at 1 MiB. Downstream daemon failures surface as `-32000` with
//! the normalized error in `data` and an HTTP status derived from its
//! code; `-32001` is reserved for auth-hook rejections.

use agent_device_protocol::jsonrpc::{
    self, RpcRequest, RpcResponse, AUTH_REJECTED, DAEMON_ERROR, INVALID_PARAMS, INVALID_REQUEST,
    METHOD_NOT_FOUND, PARSE_ERROR,
};
use agent_device_protocol::{normalize, DaemonError, Request};
use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::rejection::BytesRejection;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response as AxumResponse};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use super::auth_hook::{AuthHook, Decision};
use crate::leases;
use crate::pipeline::Pipeline;

/// Request body cap. Oversized bodies are a parse error, not a request.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

struct HttpState {
    pipeline: Arc<Pipeline>,
    auth_hook: Option<AuthHook>,
}

/// Bind the HTTP server on an ephemeral loopback port. Returns the port.
pub async fn start(
    pipeline: Arc<Pipeline>,
    auth_hook: Option<AuthHook>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<u16> {
    let state = Arc::new(HttpState {
        pipeline,
        auth_hook,
    });
    let app = Router::new()
        .route("/health", get(health))
        .route("/rpc", post(rpc))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .context("failed to bind HTTP transport")?;
    let port = listener
        .local_addr()
        .context("failed to read HTTP transport address")?
        .port();
    info!(port, "HTTP transport listening");

    tokio::spawn(async move {
        let shutdown_signal = async move {
            let _ = shutdown.changed().await;
        };
        if let Err(err) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
        {
            warn!(error = %err, "HTTP transport exited with error");
        }
    });

    Ok(port)
}

async fn health() -> Json<Value> {
    Json(json!({"ok": true}))
}

fn rpc_error(status: StatusCode, id: Option<Value>, code: i64, message: &str) -> AxumResponse {
    (status, Json(RpcResponse::error(id, code, message, None))).into_response()
}

fn daemon_error_response(id: Option<Value>, rpc_code: i64, err: DaemonError) -> AxumResponse {
    let error = normalize(err);
    let status = StatusCode::from_u16(jsonrpc::http_status_for(error.code))
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(RpcResponse::daemon_error(id, rpc_code, &error))).into_response()
}

fn headers_to_value(headers: &HeaderMap) -> Value {
    let mut map = serde_json::Map::new();
    for (name, value) in headers {
        map.insert(
            name.as_str().to_string(),
            Value::String(value.to_str().unwrap_or_default().to_string()),
        );
    }
    Value::Object(map)
}

fn resolve_token(params_token: Option<String>, headers: &HeaderMap) -> Option<String> {
    if params_token.is_some() {
        return params_token;
    }
    if let Some(value) = headers.get("x-agent-device-token") {
        if let Ok(token) = value.to_str() {
            return Some(token.trim().to_string());
        }
    }
    if let Some(value) = headers.get(header::AUTHORIZATION) {
        if let Ok(value) = value.to_str() {
            for prefix in ["Bearer ", "bearer "] {
                if let Some(rest) = value.strip_prefix(prefix) {
                    return Some(rest.trim().to_string());
                }
            }
        }
    }
    None
}

/// Map a lease method's params onto a daemon lease command.
fn lease_request(op: &str, params: &Value) -> Request {
    let mut req = Request::new(format!("lease_{op}"));
    req.meta.tenant_id = params
        .get("tenantId")
        .and_then(Value::as_str)
        .map(str::to_string);
    req.meta.run_id = params
        .get("runId")
        .and_then(Value::as_str)
        .map(str::to_string);
    req.meta.lease_id = params
        .get("leaseId")
        .and_then(Value::as_str)
        .map(str::to_string);
    if let Some(ttl) = params.get("ttlMs").cloned() {
        req.flags.insert("ttlMs".to_string(), ttl);
    }
    if let Some(backend) = params.get("backend").cloned() {
        req.flags.insert("backend".to_string(), backend);
    }
    req
}

async fn rpc(
    State(state): State<Arc<HttpState>>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> AxumResponse {
    // Oversized or unreadable bodies never become requests.
    let Ok(body) = body else {
        return rpc_error(StatusCode::BAD_REQUEST, None, PARSE_ERROR, "Parse error");
    };
    let Ok(rpc_req) = serde_json::from_slice::<RpcRequest>(&body) else {
        return rpc_error(StatusCode::BAD_REQUEST, None, PARSE_ERROR, "Parse error");
    };
    let id = rpc_req.id.clone();
    if !rpc_req.is_valid() {
        return rpc_error(StatusCode::BAD_REQUEST, id, INVALID_REQUEST, "Invalid Request");
    }

    // Dashed method names are accepted as aliases.
    let method = rpc_req.method.replacen("agent-device", "agent_device", 1);
    let mut daemon_req = match method.as_str() {
        "agent_device.command" => {
            match serde_json::from_value::<Request>(rpc_req.params.clone()) {
                Ok(req) if !req.command.is_empty() => req,
                _ => {
                    return rpc_error(
                        StatusCode::BAD_REQUEST,
                        id,
                        INVALID_PARAMS,
                        "Invalid params",
                    );
                }
            }
        }
        "agent_device.lease.allocate" => lease_request("allocate", &rpc_req.params),
        "agent_device.lease.heartbeat" => lease_request("heartbeat", &rpc_req.params),
        "agent_device.lease.release" => lease_request("release", &rpc_req.params),
        _ => {
            return rpc_error(StatusCode::NOT_FOUND, id, METHOD_NOT_FOUND, "Method not found");
        }
    };

    daemon_req.token = resolve_token(daemon_req.token.take(), &headers);

    // Auth hook runs before the request enters the pipeline.
    if let Some(hook) = &state.auth_hook {
        let rpc_value = serde_json::to_value(&rpc_req).unwrap_or(Value::Null);
        let daemon_value = serde_json::to_value(&daemon_req).unwrap_or(Value::Null);
        match hook
            .evaluate(&headers_to_value(&headers), &rpc_value, &daemon_value)
            .await
        {
            Decision::Allow { tenant_id: None } => {}
            Decision::Allow {
                tenant_id: Some(tenant),
            } => {
                if !leases::valid_scope_id(&tenant) {
                    return (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        Json(RpcResponse::daemon_error(
                            id,
                            DAEMON_ERROR,
                            &normalize(DaemonError::invalid_args(format!(
                                "auth hook injected an invalid tenant id `{tenant}`"
                            ))),
                        )),
                    )
                        .into_response();
                }
                daemon_req.meta.tenant_id = Some(tenant);
                if daemon_req.meta.session_isolation.is_none()
                    && daemon_req.flag_str("sessionIsolation").is_none()
                {
                    daemon_req.meta.session_isolation = Some("tenant".to_string());
                }
            }
            Decision::Reject {
                code,
                message,
                details,
            } => {
                let mut err = DaemonError::new(code, message);
                if let Some(details) = details {
                    err = err.with_details(details);
                }
                return daemon_error_response(id, AUTH_REJECTED, err);
            }
        }
    }

    let response = state.pipeline.handle_request(daemon_req).await;
    if response.ok {
        let result = serde_json::to_value(&response).unwrap_or(Value::Null);
        return (StatusCode::OK, Json(RpcResponse::result(id, result))).into_response();
    }

    let error = response.error.unwrap_or_else(|| {
        normalize(DaemonError::unknown("daemon returned a failure without an error"))
    });
    let status = StatusCode::from_u16(jsonrpc::http_status_for(error.code))
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        Json(RpcResponse::daemon_error(id, DAEMON_ERROR, &error)),
    )
        .into_response()
}

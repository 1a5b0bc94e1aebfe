//! Client-side bootstrap: locate or launch the daemon, pick a transport,
//! and send a single request.
//!
//! This is the collaborator surface of the daemon. The CLI front end calls
//! [`ensure_daemon`] once and then [`send_request`] per command; everything
//! else (argument parsing, output formatting) lives outside this crate.

use crate::jsonrpc::{RpcRequest, RpcResponse, DAEMON_ERROR};
use crate::metadata::DaemonMetadata;
use crate::{DaemonError, ErrorObject, Request, Response};
use anyhow::{anyhow, bail, Context, Result};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessRefreshKind, System};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

/// How long to wait for fresh metadata after launching a daemon.
const STARTUP_WINDOW_MS: u64 = 5_000;
const STARTUP_POLL_MS: u64 = 100;

const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 90_000;

/// Command-line substrings identifying orphaned XCTest runner builds.
const RUNNER_BUILD_PATTERNS: &[&str] = &["xcodebuild", "AgentDeviceRunner"];

/// Transport preference, from `AGENT_DEVICE_DAEMON_TRANSPORT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportPreference {
    Auto,
    Socket,
    Http,
}

impl TransportPreference {
    pub fn from_env() -> Self {
        match std::env::var("AGENT_DEVICE_DAEMON_TRANSPORT")
            .unwrap_or_default()
            .to_ascii_lowercase()
            .as_str()
        {
            "socket" => TransportPreference::Socket,
            "http" => TransportPreference::Http,
            _ => TransportPreference::Auto,
        }
    }
}

/// Knobs for [`ensure_daemon`] and [`send_request`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub state_dir: PathBuf,
    pub transport: TransportPreference,
    pub timeout_ms: u64,
    /// Version the installed codebase expects the daemon to report.
    pub expected_version: Option<String>,
    /// Code signature the installed daemon binary currently has.
    pub expected_signature: Option<String>,
    /// Binary to launch when no (usable) daemon is running. Defaults to
    /// the current executable with a `run` subcommand.
    pub daemon_program: Option<PathBuf>,
}

impl ClientOptions {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            transport: TransportPreference::from_env(),
            timeout_ms: std::env::var("AGENT_DEVICE_DAEMON_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS),
            expected_version: None,
            expected_signature: None,
            daemon_program: None,
        }
    }

    fn metadata_path(&self) -> PathBuf {
        self.state_dir.join("daemon.json")
    }

    fn lock_path(&self) -> PathBuf {
        self.state_dir.join("daemon.lock")
    }
}

fn pid_is_alive(pid: u32) -> bool {
    let mut sys = System::new();
    let sys_pid = Pid::from_u32(pid);
    sys.refresh_process_specifics(sys_pid, ProcessRefreshKind::new());
    sys.process(sys_pid).is_some()
}

/// SIGTERM, poll, SIGKILL, poll. Returns whether the process is gone.
fn stop_pid(pid: u32, term_timeout_ms: u64, kill_timeout_ms: u64) -> bool {
    if !pid_is_alive(pid) {
        return true;
    }
    unsafe {
        libc::kill(pid as i32, libc::SIGTERM);
    }
    let deadline = Instant::now() + Duration::from_millis(term_timeout_ms);
    while Instant::now() < deadline {
        if !pid_is_alive(pid) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    unsafe {
        libc::kill(pid as i32, libc::SIGKILL);
    }
    let deadline = Instant::now() + Duration::from_millis(kill_timeout_ms);
    while Instant::now() < deadline {
        if !pid_is_alive(pid) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    !pid_is_alive(pid)
}

/// Best-effort kill of orphaned XCTest runner builds. Both the client and
/// the daemon run this after a request deadline expires.
pub fn kill_orphan_runner_builds() -> usize {
    let mut sys = System::new_all();
    sys.refresh_processes();
    let mut killed = 0;
    for (pid, process) in sys.processes() {
        let cmdline = process.cmd().join(" ");
        if RUNNER_BUILD_PATTERNS.iter().all(|p| cmdline.contains(p)) {
            if stop_pid(pid.as_u32(), 1_000, 1_000) {
                killed += 1;
            }
        }
    }
    killed
}

/// Whether the metadata on disk describes a daemon this client can use.
fn metadata_usable(meta: &DaemonMetadata, opts: &ClientOptions) -> bool {
    if !pid_is_alive(meta.pid) {
        return false;
    }
    if let Some(expected) = &opts.expected_version {
        if &meta.version != expected {
            return false;
        }
    }
    if let Some(expected) = &opts.expected_signature {
        if &meta.code_signature != expected {
            return false;
        }
    }
    true
}

async fn reachable(meta: &DaemonMetadata) -> bool {
    if let Some(port) = meta.port {
        if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return true;
        }
    }
    if let Some(port) = meta.http_port {
        let url = format!("http://127.0.0.1:{port}/health");
        if let Ok(client) = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()
        {
            if let Ok(resp) = client.get(&url).send().await {
                return resp.status().is_success();
            }
        }
    }
    false
}

fn launch_daemon(opts: &ClientOptions) -> Result<()> {
    let program = match &opts.daemon_program {
        Some(p) => p.clone(),
        None => std::env::current_exe().context("failed to resolve current executable")?,
    };
    std::process::Command::new(program)
        .arg("run")
        .env("AGENT_DEVICE_STATE_DIR", &opts.state_dir)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .context("failed to launch daemon")?;
    Ok(())
}

/// Locate a usable daemon, performing a takeover when the one on disk is
/// stale, unreachable, or no longer matches the installed codebase.
pub async fn ensure_daemon(opts: &ClientOptions) -> Result<DaemonMetadata> {
    let metadata_path = opts.metadata_path();

    if let Ok(meta) = DaemonMetadata::read(&metadata_path) {
        if metadata_usable(&meta, opts) && reachable(&meta).await {
            return Ok(meta);
        }
        // Takeover: stop the recorded pid politely then forcibly, clear
        // the stale rendezvous files, and fall through to a fresh launch.
        stop_pid(meta.pid, 2_000, 2_000);
        let _ = std::fs::remove_file(&metadata_path);
        let _ = std::fs::remove_file(opts.lock_path());
    }

    launch_daemon(opts)?;

    let deadline = Instant::now() + Duration::from_millis(STARTUP_WINDOW_MS);
    while Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(STARTUP_POLL_MS)).await;
        if let Ok(meta) = DaemonMetadata::read(&metadata_path) {
            if metadata_usable(&meta, opts) && reachable(&meta).await {
                return Ok(meta);
            }
        }
    }
    bail!(
        "daemon did not become reachable within {}ms",
        STARTUP_WINDOW_MS
    )
}

async fn send_over_socket(port: u16, req: &Request) -> Result<Response> {
    let stream = TcpStream::connect(("127.0.0.1", port))
        .await
        .context("failed to connect to daemon socket")?;
    let (read_half, mut write_half) = stream.into_split();

    let mut line = serde_json::to_string(req)?;
    line.push('\n');
    write_half
        .write_all(line.as_bytes())
        .await
        .context("failed to write request")?;
    write_half.flush().await.context("failed to flush request")?;

    let mut reader = BufReader::new(read_half);
    let mut response_line = String::new();
    let read = reader
        .read_line(&mut response_line)
        .await
        .context("failed to read response")?;
    if read == 0 {
        bail!("daemon closed the connection before responding");
    }
    serde_json::from_str(&response_line).context("failed to parse daemon response")
}

async fn send_over_http(port: u16, req: &Request) -> Result<Response> {
    let url = format!("http://127.0.0.1:{port}/rpc");
    let rpc = RpcRequest {
        jsonrpc: "2.0".to_string(),
        id: Some(json!(1)),
        method: "agent_device.command".to_string(),
        params: serde_json::to_value(req)?,
    };
    let client = reqwest::Client::new();
    let http_resp = client
        .post(&url)
        .json(&rpc)
        .send()
        .await
        .context("HTTP request to daemon failed")?;
    let rpc_resp: RpcResponse = http_resp
        .json()
        .await
        .context("failed to parse JSON-RPC response")?;

    if let Some(result) = rpc_resp.result {
        return serde_json::from_value(result).context("failed to parse daemon response");
    }
    if let Some(err) = rpc_resp.error {
        // Downstream daemon failures carry the normalized error in data.
        if err.code == DAEMON_ERROR || err.code == crate::jsonrpc::AUTH_REJECTED {
            if let Some(data) = err.data {
                if let Ok(obj) = serde_json::from_value::<ErrorObject>(data) {
                    return Ok(Response::failure(obj));
                }
            }
        }
        return Ok(Response::from(DaemonError::unknown(err.message)));
    }
    bail!("JSON-RPC response carried neither result nor error")
}

/// Send one request to a running daemon, enforcing the client-side
/// timeout. On expiry, orphaned runner builds are killed; with
/// `AGENT_DEVICE_RESET_ON_TIMEOUT=1` the daemon itself is also killed and
/// its rendezvous files removed so the next request relaunches it.
pub async fn send_request(
    opts: &ClientOptions,
    meta: &DaemonMetadata,
    req: &Request,
) -> Result<Response> {
    let mut req = req.clone();
    req.token = Some(meta.token.clone());

    let use_socket = match opts.transport {
        TransportPreference::Socket => true,
        TransportPreference::Http => false,
        TransportPreference::Auto => meta.port.is_some(),
    };

    let send = async {
        if use_socket {
            let port = meta
                .port
                .ok_or_else(|| anyhow!("daemon is not serving the socket transport"))?;
            send_over_socket(port, &req).await
        } else {
            let port = meta
                .http_port
                .ok_or_else(|| anyhow!("daemon is not serving the HTTP transport"))?;
            send_over_http(port, &req).await
        }
    };

    match tokio::time::timeout(Duration::from_millis(opts.timeout_ms), send).await {
        Ok(result) => result,
        Err(_) => {
            kill_orphan_runner_builds();
            if std::env::var("AGENT_DEVICE_RESET_ON_TIMEOUT").as_deref() == Ok("1") {
                unsafe {
                    libc::kill(meta.pid as i32, libc::SIGKILL);
                }
                let _ = std::fs::remove_file(opts.metadata_path());
                let _ = std::fs::remove_file(opts.lock_path());
            }
            bail!("daemon request timed out after {}ms", opts.timeout_ms)
        }
    }
}

/// Synchronous helper for callers without a runtime (early CLI bootstrap).
pub fn send_request_sync(
    opts: &ClientOptions,
    meta: &DaemonMetadata,
    req: &Request,
) -> Result<Response> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build client runtime")?;
    runtime.block_on(send_request(opts, meta, req))
}

/// Read metadata without liveness checks. Used by `daemon status`.
pub fn read_metadata(state_dir: &Path) -> Result<DaemonMetadata> {
    DaemonMetadata::read(&state_dir.join("daemon.json"))
}

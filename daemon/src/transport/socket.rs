//! Loopback stream transport: newline-delimited JSON, one request per
//! line, responses written in request order per connection.
//!
//! A reader task feeds lines to a serial processor so a disconnect is
//! noticed even while a request is executing: all of the connection's
//! in-flight request ids are flagged canceled, and active iOS runner
//! sessions are signaled to abort on a 200 ms cadence for up to 15 s
//! until the connection's requests have drained.

use agent_device_protocol::{DaemonError, Request, Response};
use anyhow::{Context, Result};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::pipeline::Pipeline;

const ABORT_POLL_MS: u64 = 200;
const ABORT_WINDOW_MS: u64 = 15_000;

/// Bind the socket server on an ephemeral loopback port and start the
/// accept loop. Returns the bound port.
pub async fn start(
    pipeline: Arc<Pipeline>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .context("failed to bind socket transport")?;
    let port = listener
        .local_addr()
        .context("failed to read socket transport address")?
        .port();
    info!(port, "socket transport listening");

    tokio::spawn(async move {
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!(%addr, "socket connection accepted");
                        let pipeline = pipeline.clone();
                        tokio::spawn(handle_connection(stream, pipeline));
                    }
                    Err(err) => {
                        warn!(error = %err, "socket accept failed");
                    }
                },
                _ = shutdown.changed() => {
                    info!("socket transport shutting down");
                    break;
                }
            }
        }
    });

    Ok(port)
}

async fn handle_connection(stream: TcpStream, pipeline: Arc<Pipeline>) {
    let (read_half, mut write_half) = stream.into_split();

    // Request ids issued on this connection; flagged wholesale when the
    // reader observes the peer going away.
    let conn_ids: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    let (line_tx, mut line_rx) = mpsc::channel::<String>(16);
    let reader_pipeline = pipeline.clone();
    let reader_ids = conn_ids.clone();
    let reader = tokio::spawn(async move {
        let mut lines = BufReader::new(read_half).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line_tx.send(line).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    debug!(error = %err, "socket read error");
                    break;
                }
            }
        }
        // Peer gone: cancel everything this connection started and lean
        // on the runner registry until the in-flight count drains.
        let ids = reader_ids.lock().unwrap_or_else(|e| e.into_inner()).clone();
        reader_pipeline.cancel.cancel_all(ids.iter());
        let registry = reader_pipeline.cancel.clone();
        let pending = move || ids.iter().filter(|id| registry.contains(id)).count();
        if pending() > 0 {
            debug!("connection dropped with requests in flight; signaling runner aborts");
            reader_pipeline
                .runners
                .abort_until_drained(ABORT_POLL_MS, ABORT_WINDOW_MS, pending)
                .await;
        }
    });

    while let Some(line) = line_rx.recv().await {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<Request>(&line) {
            Ok(mut req) => {
                let request_id = req
                    .meta
                    .request_id
                    .clone()
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                req.meta.request_id = Some(request_id.clone());
                // Register before dispatch so a disconnect during
                // processing can flag this very request.
                pipeline.cancel.register(&request_id);
                conn_ids
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(request_id);
                pipeline.handle_request(req).await
            }
            Err(err) => Response::from(DaemonError::invalid_args(format!(
                "request line is not valid JSON: {err}"
            ))),
        };

        let mut encoded = match serde_json::to_string(&response) {
            Ok(encoded) => encoded,
            Err(err) => {
                warn!(error = %err, "failed to encode response");
                continue;
            }
        };
        encoded.push('\n');
        if write_half.write_all(encoded.as_bytes()).await.is_err() {
            break;
        }
        let _ = write_half.flush().await;
    }

    let _ = reader.await;
    debug!("socket connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::test_support::*;
    use agent_device_protocol::ErrorCode;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    async fn start_server(pipeline: Arc<Pipeline>) -> (u16, watch::Sender<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let port = start(pipeline, shutdown_rx).await.unwrap();
        (port, shutdown_tx)
    }

    async fn send_line(stream: &mut TcpStream, req: &Request) -> Response {
        let mut line = serde_json::to_string(req).unwrap();
        line.push('\n');
        stream.write_all(line.as_bytes()).await.unwrap();
        read_response(stream).await
    }

    async fn read_response(stream: &mut TcpStream) -> Response {
        let mut buffer = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            let read = stream.read(&mut byte).await.unwrap();
            assert!(read > 0, "server closed before responding");
            if byte[0] == b'\n' {
                break;
            }
            buffer.push(byte[0]);
        }
        serde_json::from_slice(&buffer).unwrap()
    }

    // ===== Framing Tests =====

    #[tokio::test]
    async fn test_request_response_roundtrip() {
        let dir = TempDir::new().unwrap();
        let pipeline = test_pipeline(dir.path());
        let (port, _shutdown) = start_server(pipeline).await;

        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let resp = send_line(&mut stream, &request("session_list", &[])).await;
        assert!(resp.ok);
        assert_eq!(resp.data.unwrap()["sessions"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_multiple_requests_in_order() {
        let dir = TempDir::new().unwrap();
        let pipeline = test_pipeline(dir.path());
        let (port, _shutdown) = start_server(pipeline).await;

        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let open = send_line(&mut stream, &request("open", &["Settings"])).await;
        assert!(open.ok, "{:?}", open.error);
        let press = send_line(&mut stream, &request("press", &["@e1"])).await;
        assert!(press.ok);
        let list = send_line(&mut stream, &request("session_list", &[])).await;
        assert_eq!(
            list.data.unwrap()["sessions"].as_array().unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_malformed_line_is_invalid_args() {
        let dir = TempDir::new().unwrap();
        let pipeline = test_pipeline(dir.path());
        let (port, _shutdown) = start_server(pipeline).await;

        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        stream.write_all(b"this is not json\n").await.unwrap();
        let resp = read_response(&mut stream).await;
        assert_eq!(resp.error_code(), Some(ErrorCode::InvalidArgs));
    }

    #[tokio::test]
    async fn test_independent_connections() {
        let dir = TempDir::new().unwrap();
        let pipeline = test_pipeline(dir.path());
        let (port, _shutdown) = start_server(pipeline).await;

        let mut a = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut b = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let resp_a = send_line(&mut a, &request("session_list", &[])).await;
        let resp_b = send_line(&mut b, &request("session_list", &[])).await;
        assert!(resp_a.ok);
        assert!(resp_b.ok);
    }

    // ===== Disconnect Cancellation Tests =====

    #[tokio::test]
    async fn test_disconnect_cancels_in_flight_request() {
        let dir = TempDir::new().unwrap();
        let pipeline = test_pipeline_with(
            dir.path(),
            ScriptedBackend {
                devices: vec![simulator_device("A")],
                slow_ms: 5_000,
                ..Default::default()
            },
        );
        // Session must exist before the slow command.
        let resp = pipeline
            .handle_request(request("open", &["Settings"]))
            .await;
        assert!(resp.ok, "{:?}", resp.error);

        let (port, _shutdown) = start_server(pipeline.clone()).await;
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut req = request("press", &["@e1"]);
        req.meta.request_id = Some("slow-press".to_string());
        let mut line = serde_json::to_string(&req).unwrap();
        line.push('\n');
        stream.write_all(line.as_bytes()).await.unwrap();

        // Let the request enter the backend, then drop the connection.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(pipeline.cancel.contains("slow-press"));
        drop(stream);

        // The canceled handler unwinds well before the scripted 5 s.
        let deadline = std::time::Instant::now() + Duration::from_secs(3);
        while pipeline.cancel.contains("slow-press") {
            assert!(
                std::time::Instant::now() < deadline,
                "request was not canceled after disconnect"
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[tokio::test]
    async fn test_shutdown_stops_accepting() {
        let dir = TempDir::new().unwrap();
        let pipeline = test_pipeline(dir.path());
        let (port, shutdown) = start_server(pipeline).await;
        shutdown.send(true).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // New connections are refused or immediately closed.
        match TcpStream::connect(("127.0.0.1", port)).await {
            Err(_) => {}
            Ok(mut stream) => {
                let mut buf = [0u8; 1];
                // Either the connect raced the close or reads see EOF.
                let _ = tokio::time::timeout(
                    Duration::from_millis(500),
                    stream.read(&mut buf),
                )
                .await;
            }
        }
    }
}

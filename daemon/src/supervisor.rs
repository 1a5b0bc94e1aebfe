//! External-process supervision.
//!
//! All device tooling (`xcrun simctl`, `xcrun devicectl`, `adb`, XCTest
//! runner builds) is driven through this module: run-to-completion with a
//! deadline, fire-and-forget detached launches, managed long-running
//! children (recorders, log streamers) owned by an arena, and the orphan
//! sweep for runner builds left behind by timed-out requests.

use agent_device_protocol::{DaemonError, ErrorCode};
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::time;
use tracing::{debug, warn};

use crate::identity;

pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Per-operation-profile deadlines. Callers name the profile; the table
/// owns the numbers so slow paths (cold simulator boot) are tuned in one
/// place.
pub fn timeout_for_profile(profile: &str) -> u64 {
    match profile {
        "android_boot" | "ios_boot" => 180_000,
        "ios_devicectl" => 60_000,
        "ios_app_launch" | "android_app_launch" => 30_000,
        "device_list" => 15_000,
        _ => DEFAULT_TIMEOUT_MS,
    }
}

#[derive(Debug, Clone, Default)]
pub struct CmdOptions {
    pub env: Vec<(String, String)>,
    pub stdin: Option<String>,
    /// Treat a non-zero exit as a normal outcome instead of an error.
    pub allow_failure: bool,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct CmdOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl CmdOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Run a command to completion with an optional deadline. On timeout the
/// child is killed and `COMMAND_FAILED` is returned; a missing binary maps
/// to `TOOL_MISSING`; a non-zero exit without `allow_failure` maps to
/// `COMMAND_FAILED` carrying the captured stderr.
pub async fn run_cmd(bin: &str, args: &[&str], opts: &CmdOptions) -> Result<CmdOutput, DaemonError> {
    let timeout_ms = opts.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS).max(1);

    let mut command = Command::new(bin);
    command.args(args);
    command.kill_on_drop(true);
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());
    command.stdin(if opts.stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    for (key, value) in &opts.env {
        command.env(key, value);
    }

    debug!(bin, ?args, timeout_ms, "spawning command");
    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(DaemonError::tool_missing(format!(
                "required binary `{bin}` was not found on PATH"
            )));
        }
        Err(err) => {
            return Err(
                DaemonError::command_failed(format!("failed to spawn `{bin}`: {err}"))
                    .with_details(json!({"bin": bin})),
            );
        }
    };
    let child_pid = child.id();

    if let Some(input) = &opts.stdin {
        if let Some(mut stdin) = child.stdin.take() {
            let bytes = input.clone().into_bytes();
            // Writing can block on a full pipe; do it off the wait path.
            tokio::spawn(async move {
                let _ = stdin.write_all(&bytes).await;
                let _ = stdin.shutdown().await;
            });
        }
    }

    let (output_tx, output_rx) = oneshot::channel();
    tokio::spawn(async move {
        let result = child.wait_with_output().await;
        let _ = output_tx.send(result);
    });

    let started = Instant::now();
    let timeout_future = time::sleep(Duration::from_millis(timeout_ms));
    tokio::pin!(timeout_future);
    let mut output_rx = output_rx;

    let output = tokio::select! {
        result = &mut output_rx => match result {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => {
                return Err(DaemonError::command_failed(format!(
                    "failed to collect output of `{bin}`: {err}"
                )));
            }
            Err(_) => {
                return Err(DaemonError::command_failed(format!(
                    "wait task for `{bin}` was dropped before completion"
                )));
            }
        },
        _ = &mut timeout_future => {
            warn!(
                bin,
                child_pid = ?child_pid,
                timeout_ms,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "command deadline exceeded; killing"
            );
            if let Some(pid) = child_pid {
                unsafe { libc::kill(pid as i32, libc::SIGKILL); }
            }
            // Drain whatever the child produced before the kill landed.
            let _ = output_rx.await;
            return Err(DaemonError::command_failed(format!(
                "`{bin}` timed out after {timeout_ms}ms"
            ))
            .with_details(json!({"bin": bin, "timeoutMs": timeout_ms})));
        }
    };

    let result = CmdOutput {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        exit_code: output.status.code(),
    };

    debug!(
        bin,
        exit_code = ?result.exit_code,
        duration_ms = started.elapsed().as_millis() as u64,
        "command completed"
    );

    if !result.success() && !opts.allow_failure {
        return Err(DaemonError::command_failed(format!(
            "`{bin}` exited with status {:?}",
            result.exit_code
        ))
        .with_details(json!({
            "bin": bin,
            "exitCode": result.exit_code,
            "stderr": result.stderr,
        })));
    }

    Ok(result)
}

/// Fire-and-forget launch. Used for the Android emulator binary and for
/// relaunching the daemon during takeover; the child outlives us.
pub fn run_cmd_detached(
    bin: &str,
    args: &[&str],
    env: &[(String, String)],
) -> Result<u32, DaemonError> {
    let mut command = std::process::Command::new(bin);
    command.args(args);
    command.stdin(Stdio::null());
    command.stdout(Stdio::null());
    command.stderr(Stdio::null());
    for (key, value) in env {
        command.env(key, value);
    }
    match command.spawn() {
        Ok(child) => Ok(child.id()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(DaemonError::tool_missing(
            format!("required binary `{bin}` was not found on PATH"),
        )),
        Err(err) => Err(DaemonError::command_failed(format!(
            "failed to launch `{bin}` detached: {err}"
        ))),
    }
}

// ===== Retry =====

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay_ms: 250,
            max_delay_ms: 5_000,
        }
    }
}

/// Bounded retry with exponential backoff and jitter. The predicate keys
/// on the normalized error; non-retryable failures surface immediately.
pub async fn with_retry<T, F, Fut, P>(
    policy: &RetryPolicy,
    should_retry: P,
    mut op: F,
) -> Result<T, DaemonError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, DaemonError>>,
    P: Fn(&DaemonError) -> bool,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if attempt >= policy.attempts || !should_retry(&err) {
                    return Err(err);
                }
                let backoff = policy
                    .base_delay_ms
                    .saturating_mul(1u64 << (attempt - 1).min(16))
                    .min(policy.max_delay_ms);
                let jitter = {
                    use rand::Rng;
                    rand::thread_rng().gen_range(0..=backoff / 4 + 1)
                };
                debug!(attempt, backoff_ms = backoff + jitter, error = %err, "retrying after backoff");
                time::sleep(Duration::from_millis(backoff + jitter)).await;
            }
        }
    }
}

/// Convenience predicate: transient subprocess failures are retryable,
/// contract violations are not.
pub fn transient_error(err: &DaemonError) -> bool {
    matches!(err.code, ErrorCode::CommandFailed | ErrorCode::Unknown)
}

// ===== Managed long-running children =====

pub type ArenaId = u64;

struct ManagedEntry {
    id: ArenaId,
    session: String,
    label: String,
    child: Child,
    pid_file: Option<PathBuf>,
}

/// Owner of long-running children spawned on behalf of sessions
/// (recorders, log streamers). Sessions reference entries by id only; the
/// arena reaps in LIFO order on session close and daemon shutdown.
pub struct ProcessArena {
    entries: Mutex<Vec<ManagedEntry>>,
    next_id: AtomicU64,
}

impl Default for ProcessArena {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessArena {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Spawn a managed child for a session. When `pid_file` is given the
    /// child pid is stashed there so a later daemon can sweep orphans.
    pub fn spawn(
        &self,
        session: &str,
        label: &str,
        bin: &str,
        args: &[&str],
        stdout_path: Option<&PathBuf>,
        pid_file: Option<PathBuf>,
    ) -> Result<ArenaId, DaemonError> {
        let mut command = Command::new(bin);
        command.args(args);
        command.kill_on_drop(true);
        command.stdin(Stdio::null());
        command.stderr(Stdio::null());
        match stdout_path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).map_err(|err| {
                        DaemonError::command_failed(format!(
                            "failed to create output directory for {label}: {err}"
                        ))
                    })?;
                }
                let file = std::fs::File::create(path).map_err(|err| {
                    DaemonError::command_failed(format!(
                        "failed to open {} for {label}: {err}",
                        path.display()
                    ))
                })?;
                command.stdout(Stdio::from(file));
            }
            None => {
                command.stdout(Stdio::null());
            }
        }

        let child = match command.spawn() {
            Ok(child) => child,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(DaemonError::tool_missing(format!(
                    "required binary `{bin}` was not found on PATH"
                )));
            }
            Err(err) => {
                return Err(DaemonError::command_failed(format!(
                    "failed to spawn {label} (`{bin}`): {err}"
                )));
            }
        };

        if let (Some(path), Some(pid)) = (&pid_file, child.id()) {
            if let Some(parent) = path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            let _ = std::fs::write(path, pid.to_string());
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.push(ManagedEntry {
            id,
            session: session.to_string(),
            label: label.to_string(),
            child,
            pid_file,
        });
        Ok(id)
    }

    pub fn pid_of(&self, id: ArenaId) -> Option<u32> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .iter()
            .find(|e| e.id == id)
            .and_then(|e| e.child.id())
    }

    /// Remove and terminate one entry.
    pub async fn reap(&self, id: ArenaId) {
        let entry = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            entries
                .iter()
                .position(|e| e.id == id)
                .map(|idx| entries.remove(idx))
        };
        if let Some(entry) = entry {
            Self::terminate(entry).await;
        }
    }

    /// Remove and terminate every entry for a session, most recent first.
    pub async fn reap_session(&self, session: &str) {
        let removed = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            let mut removed = Vec::new();
            let mut idx = entries.len();
            while idx > 0 {
                idx -= 1;
                if entries[idx].session == session {
                    removed.push(entries.remove(idx));
                }
            }
            removed
        };
        for entry in removed {
            Self::terminate(entry).await;
        }
    }

    /// Terminate everything, most recent first. Used on daemon shutdown.
    pub async fn reap_all(&self) {
        let removed = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            let mut removed: Vec<ManagedEntry> = entries.drain(..).collect();
            removed.reverse();
            removed
        };
        for entry in removed {
            Self::terminate(entry).await;
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn terminate(mut entry: ManagedEntry) {
        if let Some(pid) = entry.child.id() {
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
            // Give it a moment before the hard kill.
            let graceful =
                time::timeout(Duration::from_millis(1_500), entry.child.wait()).await;
            if graceful.is_err() {
                let _ = entry.child.start_kill();
                let _ = time::timeout(Duration::from_millis(1_500), entry.child.wait()).await;
            }
        }
        if let Some(pid_file) = &entry.pid_file {
            let _ = std::fs::remove_file(pid_file);
        }
        debug!(label = %entry.label, session = %entry.session, "managed process reaped");
    }
}

// ===== iOS runner sessions =====

#[derive(Debug, Clone)]
pub struct RunnerSession {
    pub id: String,
    pub session: String,
    pub pid: Option<u32>,
    abort: Arc<AtomicBool>,
}

impl RunnerSession {
    pub fn abort_requested(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }
}

/// Registry of active XCTest runner sessions. Disconnecting clients and
/// daemon shutdown signal these to abort; the iOS backend polls the flag.
#[derive(Default)]
pub struct RunnerSessions {
    inner: Mutex<HashMap<String, RunnerSession>>,
}

impl RunnerSessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, session: &str, pid: Option<u32>) -> RunnerSession {
        let runner = RunnerSession {
            id: uuid::Uuid::new_v4().to_string(),
            session: session.to_string(),
            pid,
            abort: Arc::new(AtomicBool::new(false)),
        };
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(runner.id.clone(), runner.clone());
        runner
    }

    pub fn remove(&self, id: &str) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Signal every active runner session to abort.
    pub fn signal_abort_all(&self) {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        for runner in inner.values() {
            runner.abort.store(true, Ordering::Release);
            if let Some(pid) = runner.pid {
                unsafe {
                    libc::kill(pid as i32, libc::SIGINT);
                }
            }
        }
    }

    /// Repeatedly signal aborts until `in_flight` reaches zero or the
    /// window is exhausted. Poll cadence and window match the disconnect
    /// contract (200 ms, 15 s).
    pub async fn abort_until_drained<F>(&self, poll_ms: u64, window_ms: u64, in_flight: F)
    where
        F: Fn() -> usize,
    {
        let deadline = Instant::now() + Duration::from_millis(window_ms);
        loop {
            if in_flight() == 0 {
                return;
            }
            self.signal_abort_all();
            if Instant::now() >= deadline {
                warn!("abort window exhausted with requests still in flight");
                return;
            }
            time::sleep(Duration::from_millis(poll_ms)).await;
        }
    }
}

/// Command-line substrings identifying orphaned XCTest runner builds.
const RUNNER_BUILD_PATTERNS: &[&str] = &["xcodebuild", "AgentDeviceRunner"];

/// Best-effort sweep of `xcodebuild` processes left behind by runner
/// builds whose request timed out. Narrow pattern match so unrelated
/// builds on the host are never touched.
pub fn kill_orphan_runner_builds() -> usize {
    let mut sys = sysinfo::System::new_all();
    sys.refresh_processes();
    let mut killed = 0;
    for (pid, process) in sys.processes() {
        let cmdline = process.cmd().join(" ");
        if RUNNER_BUILD_PATTERNS.iter().all(|p| cmdline.contains(p)) {
            identity::stop_process(pid.as_u32(), 1_000, 1_000, None);
            killed += 1;
        }
    }
    killed
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    // ===== run_cmd Tests =====

    #[tokio::test]
    async fn test_run_cmd_captures_stdout() {
        let out = run_cmd("echo", &["hello"], &CmdOptions::default())
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "hello");
        assert!(out.success());
    }

    #[tokio::test]
    async fn test_run_cmd_missing_binary_is_tool_missing() {
        let err = run_cmd("definitely-not-a-binary-xyz", &[], &CmdOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ToolMissing);
    }

    #[tokio::test]
    async fn test_run_cmd_nonzero_exit_fails() {
        let err = run_cmd("sh", &["-c", "echo oops >&2; exit 3"], &CmdOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::CommandFailed);
        let details = err.details.unwrap();
        assert_eq!(details["exitCode"], serde_json::json!(3));
        assert!(details["stderr"].as_str().unwrap().contains("oops"));
    }

    #[tokio::test]
    async fn test_run_cmd_allow_failure() {
        let opts = CmdOptions {
            allow_failure: true,
            ..Default::default()
        };
        let out = run_cmd("sh", &["-c", "exit 7"], &opts).await.unwrap();
        assert_eq!(out.exit_code, Some(7));
        assert!(!out.success());
    }

    #[tokio::test]
    async fn test_run_cmd_timeout_kills_child() {
        let opts = CmdOptions {
            timeout_ms: Some(100),
            ..Default::default()
        };
        let started = Instant::now();
        let err = run_cmd("sleep", &["10"], &opts).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::CommandFailed);
        assert!(err.message.contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_run_cmd_stdin() {
        let opts = CmdOptions {
            stdin: Some("ping\n".to_string()),
            ..Default::default()
        };
        let out = run_cmd("cat", &[], &opts).await.unwrap();
        assert_eq!(out.stdout, "ping\n");
    }

    #[tokio::test]
    async fn test_run_cmd_env() {
        let opts = CmdOptions {
            env: vec![("AD_TEST_VAR".to_string(), "42".to_string())],
            ..Default::default()
        };
        let out = run_cmd("sh", &["-c", "echo $AD_TEST_VAR"], &opts)
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "42");
    }

    // ===== Detached Launch Tests =====

    #[test]
    fn test_run_cmd_detached_returns_pid() {
        let pid = run_cmd_detached("sleep", &["0.1"], &[]).unwrap();
        assert!(pid > 0);
    }

    #[test]
    fn test_run_cmd_detached_missing_binary() {
        let err = run_cmd_detached("definitely-not-a-binary-xyz", &[], &[]).unwrap_err();
        assert_eq!(err.code, ErrorCode::ToolMissing);
    }

    // ===== Timeout Profile Tests =====

    #[test]
    fn test_timeout_profiles() {
        assert_eq!(timeout_for_profile("android_boot"), 180_000);
        assert_eq!(timeout_for_profile("ios_devicectl"), 60_000);
        assert_eq!(timeout_for_profile("ios_app_launch"), 30_000);
        assert_eq!(timeout_for_profile("anything-else"), DEFAULT_TIMEOUT_MS);
    }

    // ===== Retry Tests =====

    #[tokio::test]
    async fn test_with_retry_eventually_succeeds() {
        let counter = Arc::new(AtomicU64::new(0));
        let policy = RetryPolicy {
            attempts: 5,
            base_delay_ms: 1,
            max_delay_ms: 5,
        };
        let counter_clone = counter.clone();
        let result = with_retry(&policy, transient_error, move || {
            let counter = counter_clone.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(DaemonError::command_failed("flaky"))
                } else {
                    Ok(99)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 99);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retry_gives_up_after_attempts() {
        let policy = RetryPolicy {
            attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 2,
        };
        let counter = Arc::new(AtomicU64::new(0));
        let counter_clone = counter.clone();
        let result: Result<(), _> = with_retry(&policy, transient_error, move || {
            let counter = counter_clone.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(DaemonError::command_failed("always"))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retry_respects_predicate() {
        let policy = RetryPolicy::default();
        let counter = Arc::new(AtomicU64::new(0));
        let counter_clone = counter.clone();
        let result: Result<(), _> = with_retry(&policy, transient_error, move || {
            let counter = counter_clone.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(DaemonError::invalid_args("not transient"))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    // ===== ProcessArena Tests =====

    #[tokio::test]
    async fn test_arena_spawn_and_reap() {
        let arena = ProcessArena::new();
        let id = arena
            .spawn("default", "sleeper", "sleep", &["30"], None, None)
            .unwrap();
        assert_eq!(arena.len(), 1);
        assert!(arena.pid_of(id).is_some());

        arena.reap(id).await;
        assert!(arena.is_empty());
    }

    #[tokio::test]
    async fn test_arena_reap_session_lifo() {
        let arena = ProcessArena::new();
        arena
            .spawn("s1", "a", "sleep", &["30"], None, None)
            .unwrap();
        arena
            .spawn("s1", "b", "sleep", &["30"], None, None)
            .unwrap();
        let other = arena
            .spawn("s2", "c", "sleep", &["30"], None, None)
            .unwrap();

        arena.reap_session("s1").await;
        assert_eq!(arena.len(), 1);
        assert!(arena.pid_of(other).is_some());

        arena.reap_all().await;
        assert!(arena.is_empty());
    }

    #[tokio::test]
    async fn test_arena_writes_pid_file() {
        let dir = TempDir::new().unwrap();
        let pid_file = dir.path().join("app.log.pid");
        let arena = ProcessArena::new();
        let id = arena
            .spawn(
                "default",
                "streamer",
                "sleep",
                &["30"],
                None,
                Some(pid_file.clone()),
            )
            .unwrap();

        let recorded: u32 = std::fs::read_to_string(&pid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert_eq!(Some(recorded), arena.pid_of(id));

        arena.reap(id).await;
        assert!(!pid_file.exists());
    }

    #[tokio::test]
    async fn test_arena_stdout_redirect() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("out.log");
        let arena = ProcessArena::new();
        let id = arena
            .spawn("default", "echo", "sh", &["-c", "echo captured"], Some(&out), None)
            .unwrap();
        // Give the child a beat to run, then reap.
        time::sleep(Duration::from_millis(200)).await;
        arena.reap(id).await;
        let content = std::fs::read_to_string(&out).unwrap();
        assert!(content.contains("captured"));
    }

    // ===== RunnerSessions Tests =====

    #[tokio::test]
    async fn test_runner_sessions_abort_flag() {
        let runners = RunnerSessions::new();
        let runner = runners.register("default", None);
        assert!(!runner.abort_requested());
        assert_eq!(runners.active_count(), 1);

        runners.signal_abort_all();
        assert!(runner.abort_requested());

        runners.remove(&runner.id);
        assert_eq!(runners.active_count(), 0);
    }

    #[tokio::test]
    async fn test_abort_until_drained_returns_when_drained() {
        let runners = RunnerSessions::new();
        let started = Instant::now();
        runners.abort_until_drained(10, 5_000, || 0).await;
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_abort_until_drained_window_bounds() {
        let runners = RunnerSessions::new();
        let started = Instant::now();
        runners.abort_until_drained(10, 100, || 1).await;
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_secs(5));
    }
}

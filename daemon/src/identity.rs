//! Process identity checks for singleton election and takeover.
//!
//! A PID alone cannot identify "our daemon": PIDs are recycled, and an
//! unrelated process may have inherited one. Identity is established by
//! the command line referencing this codebase plus, when available, the
//! OS-reported start time of the process that wrote the lock.

use std::path::Path;
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessRefreshKind, System};

/// Substrings a daemon process command line must contain to be considered
/// an instance of this codebase.
const DAEMON_CMD_MARKERS: &[&str] = &["agent-device"];

fn refresh_process(sys: &mut System, pid: u32) -> bool {
    sys.refresh_process_specifics(Pid::from_u32(pid), ProcessRefreshKind::new())
}

/// Opaque start-time token for a live process, or `None` when the process
/// does not exist. Equal tokens mean the same live process; no other
/// structure is defined.
pub fn read_start_time(pid: u32) -> Option<String> {
    let mut sys = System::new();
    if !refresh_process(&mut sys, pid) {
        return None;
    }
    sys.process(Pid::from_u32(pid))
        .map(|p| p.start_time().to_string())
}

/// True iff the OS reports a live process with this PID whose command line
/// identifies it as a daemon of this codebase, and whose start time
/// matches the expected token when one is given.
pub fn is_live_daemon_process(pid: u32, expected_start_time: Option<&str>) -> bool {
    let mut sys = System::new();
    if !refresh_process(&mut sys, pid) {
        return false;
    }
    let Some(process) = sys.process(Pid::from_u32(pid)) else {
        return false;
    };

    let cmdline = process.cmd().join(" ");
    let name = process.name();
    let looks_like_daemon = DAEMON_CMD_MARKERS
        .iter()
        .any(|marker| cmdline.contains(marker) || name.contains(marker));
    if !looks_like_daemon {
        return false;
    }

    match expected_start_time {
        Some(expected) => process.start_time().to_string() == expected,
        None => true,
    }
}

fn pid_alive(pid: u32) -> bool {
    let mut sys = System::new();
    refresh_process(&mut sys, pid) && sys.process(Pid::from_u32(pid)).is_some()
}

/// Send polite termination, poll for exit, then kill forcibly; each phase
/// bounded. Returns regardless of whether the target ever existed. When an
/// expected start time is supplied and no longer matches, the PID has been
/// recycled and is left alone.
pub fn stop_process(
    pid: u32,
    term_timeout_ms: u64,
    kill_timeout_ms: u64,
    expected_start_time: Option<&str>,
) {
    if let Some(expected) = expected_start_time {
        match read_start_time(pid) {
            Some(actual) if actual == expected => {}
            _ => return,
        }
    }
    if !pid_alive(pid) {
        return;
    }

    unsafe {
        libc::kill(pid as i32, libc::SIGTERM);
    }
    if wait_for_exit(pid, term_timeout_ms) {
        return;
    }

    tracing::warn!(pid, "process ignored SIGTERM; escalating to SIGKILL");
    unsafe {
        libc::kill(pid as i32, libc::SIGKILL);
    }
    wait_for_exit(pid, kill_timeout_ms);
}

fn wait_for_exit(pid: u32, timeout_ms: u64) -> bool {
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        if !pid_alive(pid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

/// Stable fingerprint of the daemon binary: `<relative-path>:<size>:<mtime-ms>`.
/// Changes whenever the installed binary is rebuilt or replaced, which is
/// the signal for clients to perform a takeover.
pub fn code_signature(entry_path: &Path, project_root: &Path) -> String {
    let relative = entry_path
        .strip_prefix(project_root)
        .unwrap_or(entry_path)
        .to_string_lossy()
        .to_string();

    let (size, mtime_ms) = match std::fs::metadata(entry_path) {
        Ok(meta) => {
            let mtime = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0);
            (meta.len(), mtime)
        }
        Err(_) => (0, 0),
    };

    format!("{relative}:{size}:{mtime_ms}")
}

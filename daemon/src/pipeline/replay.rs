//! `replay`: evaluate an `.ad` script line by line against the current
//! session.
//!
//! With `--update`, a failing step triggers selector healing: a fresh
//! snapshot is captured, a replacement element reference is resolved for
//! the stale target, the script is rewritten atomically (write-to-temp
//! plus rename), and the step is retried once with the healed target.

use agent_device_protocol::{DaemonError, Request};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::Pipeline;
use crate::sessions::journal;

/// Commands whose first positional is an element target eligible for
/// healing.
const HEALABLE_COMMANDS: &[&str] = &[
    "press",
    "longpress",
    "fill",
    "focus",
    "scrollintoview",
    "is",
    "get",
];

fn script_path(req: &Request) -> Result<PathBuf, DaemonError> {
    let raw = req
        .args
        .first()
        .ok_or_else(|| DaemonError::invalid_args("replay requires a script path"))?;
    let path = PathBuf::from(raw);
    if path.is_absolute() {
        return Ok(path);
    }
    match &req.meta.cwd {
        Some(cwd) => Ok(PathBuf::from(cwd).join(path)),
        None => Ok(path),
    }
}

/// Find a replacement element reference in a snapshot for a stale target:
/// the first node whose label/text/title contains the target string and
/// that carries an id.
pub(crate) fn resolve_replacement(snapshot: &Value, stale_target: &str) -> Option<String> {
    let needle = stale_target.trim_start_matches('@');
    if needle.is_empty() {
        return None;
    }

    fn walk(value: &Value, needle: &str) -> Option<String> {
        match value {
            Value::Object(map) => {
                let labeled = ["label", "text", "title"].iter().any(|key| {
                    map.get(*key)
                        .and_then(Value::as_str)
                        .map(|s| s.contains(needle))
                        .unwrap_or(false)
                });
                if labeled {
                    if let Some(id) = map.get("id").and_then(Value::as_str) {
                        return Some(format!("@{id}"));
                    }
                }
                map.values().find_map(|v| walk(v, needle))
            }
            Value::Array(items) => items.iter().find_map(|v| walk(v, needle)),
            _ => None,
        }
    }
    walk(snapshot, needle)
}

/// Rewrite the script atomically with `lines`.
fn rewrite_script(path: &Path, lines: &[String]) -> Result<(), DaemonError> {
    let tmp = path.with_extension("ad.tmp");
    let mut content = lines.join("\n");
    content.push('\n');
    std::fs::write(&tmp, content).map_err(|err| {
        DaemonError::command_failed(format!("failed to write {}: {err}", tmp.display()))
    })?;
    std::fs::rename(&tmp, path).map_err(|err| {
        DaemonError::command_failed(format!(
            "failed to move updated script into place at {}: {err}",
            path.display()
        ))
    })?;
    Ok(())
}

async fn capture_snapshot(pipeline: &Arc<Pipeline>, parent: &Request) -> Option<Value> {
    let mut snap = Request::new("snapshot");
    snap.token = parent.token.clone();
    snap.session = parent.session.clone();
    snap.meta = parent.meta.clone();
    snap.meta.request_id = None;
    let resp = pipeline.handle_request(snap).await;
    if resp.ok {
        resp.data
    } else {
        None
    }
}

pub(crate) async fn run(pipeline: &Arc<Pipeline>, req: &Request) -> Result<Value, DaemonError> {
    let path = script_path(req)?;
    let content = std::fs::read_to_string(&path).map_err(|err| {
        DaemonError::invalid_args(format!("failed to read script {}: {err}", path.display()))
    })?;
    let update_mode = req.flag_bool("update");

    let mut lines: Vec<String> = content.lines().map(str::to_string).collect();
    let mut results: Vec<Value> = Vec::new();
    let mut step = 0usize;
    let mut healed = 0usize;

    for line_no in 0..lines.len() {
        let Some((command, args, flags)) = journal::parse_line(&lines[line_no])? else {
            continue;
        };
        step += 1;

        if command == "batch" || command == "replay" {
            return Err(DaemonError::invalid_args(format!(
                "script step {step} may not be `{command}`"
            )));
        }

        let mut meta = req.meta.clone();
        meta.request_id = None;
        let step_req = Request {
            token: req.token.clone(),
            session: req.session.clone(),
            command: command.clone(),
            args: args.clone(),
            flags: flags.clone(),
            meta,
        };

        let resp = pipeline.handle_request(step_req).await;
        if resp.ok {
            results.push(resp.data.unwrap_or(Value::Null));
            continue;
        }
        let error = resp.error.expect("failed response carries an error");

        // Selector healing in update mode.
        if update_mode && HEALABLE_COMMANDS.contains(&command.as_str()) {
            if let Some(stale) = args.first() {
                if let Some(snapshot) = capture_snapshot(pipeline, req).await {
                    if let Some(replacement) = resolve_replacement(&snapshot, stale) {
                        let mut healed_args = args.clone();
                        healed_args[0] = replacement.clone();
                        lines[line_no] = journal::encode_line(&command, &healed_args, &flags);
                        rewrite_script(&path, &lines)?;
                        healed += 1;
                        tracing::info!(
                            step,
                            stale = %stale,
                            replacement = %replacement,
                            script = %path.display(),
                            "replay step healed; script rewritten"
                        );

                        let mut meta = req.meta.clone();
                        meta.request_id = None;
                        let retry_req = Request {
                            token: req.token.clone(),
                            session: req.session.clone(),
                            command: command.clone(),
                            args: healed_args,
                            flags: flags.clone(),
                            meta,
                        };
                        let retry = pipeline.handle_request(retry_req).await;
                        if retry.ok {
                            results.push(retry.data.unwrap_or(Value::Null));
                            continue;
                        }
                    }
                }
            }
        }

        let mut err = DaemonError::new(error.code, error.message).with_details(json!({
            "step": step,
            "executed": results.len(),
            "partialResults": results,
            "script": path,
        }));
        err.hint = error.hint;
        return Err(err);
    }

    Ok(json!({
        "total": step,
        "executed": results.len(),
        "results": results,
        "script": path,
        "healed": healed,
    }))
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use agent_device_protocol::ErrorCode;
    use serde_json::json;
    use tempfile::TempDir;

    fn write_script(dir: &Path, content: &str) -> PathBuf {
        let path = dir.join("session.ad");
        std::fs::write(&path, content).unwrap();
        path
    }

    fn replay_request(path: &Path) -> Request {
        request("replay", &[&path.to_string_lossy()])
    }

    // ===== Replacement Resolution Tests =====

    #[test]
    fn test_resolve_replacement_by_label() {
        let snapshot = json!({
            "nodes": [
                {"id": "e1", "label": "Sign In", "role": "button"},
                {"id": "e2", "label": "Username"},
            ]
        });
        assert_eq!(
            resolve_replacement(&snapshot, "Sign In"),
            Some("@e1".to_string())
        );
        assert_eq!(
            resolve_replacement(&snapshot, "Username"),
            Some("@e2".to_string())
        );
        assert_eq!(resolve_replacement(&snapshot, "Missing"), None);
    }

    #[test]
    fn test_resolve_replacement_nested() {
        let snapshot = json!({
            "root": {"children": [{"id": "deep", "text": "Submit Order"}]}
        });
        assert_eq!(
            resolve_replacement(&snapshot, "Submit"),
            Some("@deep".to_string())
        );
    }

    #[test]
    fn test_resolve_replacement_ignores_unlabeled() {
        let snapshot = json!({"nodes": [{"id": "e1"}]});
        assert_eq!(resolve_replacement(&snapshot, "e1"), None);
    }

    // ===== Replay Execution Tests =====

    #[tokio::test]
    async fn test_replay_happy_path() {
        let dir = TempDir::new().unwrap();
        let pipeline = test_pipeline(dir.path());
        let script = write_script(
            dir.path(),
            "# recorded session\nopen Settings\npress @e1\nfill @e2 hello\n",
        );

        let resp = pipeline.handle_request(replay_request(&script)).await;
        assert!(resp.ok, "{:?}", resp.error);
        let data = resp.data.unwrap();
        assert_eq!(data["total"], json!(3));
        assert_eq!(data["executed"], json!(3));
        assert_eq!(data["healed"], json!(0));
    }

    #[tokio::test]
    async fn test_replay_missing_script() {
        let dir = TempDir::new().unwrap();
        let pipeline = test_pipeline(dir.path());
        let resp = pipeline
            .handle_request(request("replay", &["/nonexistent/script.ad"]))
            .await;
        assert_eq!(resp.error_code(), Some(ErrorCode::InvalidArgs));
    }

    #[tokio::test]
    async fn test_replay_requires_path() {
        let dir = TempDir::new().unwrap();
        let pipeline = test_pipeline(dir.path());
        let resp = pipeline.handle_request(request("replay", &[])).await;
        assert_eq!(resp.error_code(), Some(ErrorCode::InvalidArgs));
    }

    #[tokio::test]
    async fn test_replay_rejects_nested_replay() {
        let dir = TempDir::new().unwrap();
        let pipeline = test_pipeline(dir.path());
        let script = write_script(dir.path(), "open Settings\nreplay other.ad\n");
        let resp = pipeline.handle_request(replay_request(&script)).await;
        assert_eq!(resp.error_code(), Some(ErrorCode::InvalidArgs));
    }

    #[tokio::test]
    async fn test_replay_failure_carries_step_details() {
        let dir = TempDir::new().unwrap();
        let pipeline = test_pipeline_with(
            dir.path(),
            ScriptedBackend {
                devices: vec![simulator_device("A")],
                failing: vec!["type".to_string()],
                ..Default::default()
            },
        );
        let script = write_script(dir.path(), "open Settings\ntype hello\n");

        let resp = pipeline.handle_request(replay_request(&script)).await;
        assert!(!resp.ok);
        let error = resp.error.unwrap();
        assert_eq!(error.code, ErrorCode::CommandFailed);
        let details = error.details.unwrap();
        assert_eq!(details["step"], json!(2));
        assert_eq!(details["executed"], json!(1));
    }

    #[tokio::test]
    async fn test_replay_update_heals_and_rewrites_script() {
        let dir = TempDir::new().unwrap();
        // Pressing the stale text target fails; the healed `@e1`
        // reference succeeds. The ScriptedBackend snapshot lists a node
        // labeled "Sign In" with id e1.
        let pipeline = test_pipeline_with(
            dir.path(),
            ScriptedBackend {
                devices: vec![simulator_device("A")],
                failing_first_arg: Some("Sign In".to_string()),
                ..Default::default()
            },
        );
        let script = write_script(dir.path(), "open Settings\npress \"Sign In\"\n");

        let mut req = replay_request(&script);
        req.flags.insert("update".to_string(), json!(true));
        let resp = pipeline.handle_request(req).await;
        assert!(resp.ok, "{:?}", resp.error);
        let data = resp.data.unwrap();
        assert_eq!(data["executed"], json!(2));
        assert_eq!(data["healed"], json!(1));

        let rewritten = std::fs::read_to_string(&script).unwrap();
        assert!(rewritten.contains("press @e1"));
        assert!(!rewritten.contains("Sign In"));
        // Atomic rewrite leaves no temp file behind.
        assert!(!script.with_extension("ad.tmp").exists());
    }

    #[tokio::test]
    async fn test_journal_then_replay_roundtrip() {
        let dir = TempDir::new().unwrap();
        let pipeline = test_pipeline(dir.path());

        // Record a session, close it to a script.
        pipeline
            .handle_request(request("open", &["Settings"]))
            .await;
        pipeline.handle_request(request("press", &["@e1"])).await;
        pipeline
            .handle_request(request("fill", &["@e2", "hello world"]))
            .await;
        let target = dir.path().join("roundtrip.ad");
        let mut close = request("close", &[]);
        close
            .flags
            .insert("save-script".to_string(), json!(target.to_string_lossy()));
        assert!(pipeline.handle_request(close).await.ok);

        // Replaying the script rebuilds an equivalent journal.
        let resp = pipeline.handle_request(replay_request(&target)).await;
        assert!(resp.ok, "{:?}", resp.error);
        let session = pipeline.sessions.get("default").unwrap();
        let replayed: Vec<(String, Vec<String>)> = session
            .journal
            .iter()
            .map(|r| (r.command.clone(), r.args.clone()))
            .collect();
        assert_eq!(
            replayed,
            vec![
                ("open".to_string(), vec!["Settings".to_string()]),
                ("press".to_string(), vec!["@e1".to_string()]),
                (
                    "fill".to_string(),
                    vec!["@e2".to_string(), "hello world".to_string()]
                ),
            ]
        );
    }

    #[tokio::test]
    async fn test_replay_without_update_does_not_touch_script() {
        let dir = TempDir::new().unwrap();
        let pipeline = test_pipeline_with(
            dir.path(),
            ScriptedBackend {
                devices: vec![simulator_device("A")],
                failing_first_arg: Some("Sign In".to_string()),
                ..Default::default()
            },
        );
        let content = "open Settings\npress \"Sign In\"\n";
        let script = write_script(dir.path(), content);

        let resp = pipeline.handle_request(replay_request(&script)).await;
        assert!(!resp.ok);
        assert_eq!(std::fs::read_to_string(&script).unwrap(), content);
    }
}

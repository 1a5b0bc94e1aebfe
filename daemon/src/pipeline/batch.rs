//! `batch`: run a sequence of steps under one session, fail-fast.
//!
//! Steps re-enter the request pipeline one at a time, inheriting the
//! parent's selector flags unless a step overrides them. The first
//! failing step aborts the batch; its error carries the step number and
//! the partial results collected so far.

use agent_device_protocol::{DaemonError, Request};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Instant;

use super::Pipeline;
use crate::diagnostics::RequestScope;
use crate::sessions::journal;

/// Selector flags a step inherits from the batch request when it does not
/// set them itself.
pub(crate) const INHERITED_SELECTOR_FLAGS: &[&str] = &[
    "platform",
    "target",
    "device",
    "udid",
    "serial",
    "simulator-set",
    "serials",
];

/// One parsed batch step.
pub(crate) struct Step {
    pub command: String,
    pub args: Vec<String>,
    pub flags: Map<String, Value>,
}

/// Steps are accepted either as script lines (`"press @e1"`) or as
/// structured objects (`{"command": "press", "args": ["@e1"]}`).
pub(crate) fn parse_step(raw: &Value, index: usize) -> Result<Step, DaemonError> {
    match raw {
        Value::String(line) => {
            let parsed = journal::parse_line(line)?.ok_or_else(|| {
                DaemonError::invalid_args(format!("batch step {} is empty", index + 1))
            })?;
            Ok(Step {
                command: parsed.0,
                args: parsed.1,
                flags: parsed.2,
            })
        }
        Value::Object(map) => {
            let command = map
                .get("command")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    DaemonError::invalid_args(format!(
                        "batch step {} is missing a command",
                        index + 1
                    ))
                })?
                .to_string();
            let args = map
                .get("args")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default();
            let flags = map
                .get("flags")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            Ok(Step { command, args, flags })
        }
        _ => Err(DaemonError::invalid_args(format!(
            "batch step {} must be a script line or an object",
            index + 1
        ))),
    }
}

/// Build the step's request: parent token, session, and meta, with the
/// parent's selector flags filled in underneath the step's own.
pub(crate) fn step_request(parent: &Request, step: Step) -> Request {
    let mut flags = step.flags;
    for key in INHERITED_SELECTOR_FLAGS {
        if !flags.contains_key(*key) {
            if let Some(value) = parent.flags.get(*key) {
                flags.insert((*key).to_string(), value.clone());
            }
        }
    }
    let mut meta = parent.meta.clone();
    meta.request_id = None;

    Request {
        token: parent.token.clone(),
        session: parent.session.clone(),
        command: step.command,
        args: step.args,
        flags,
        meta,
    }
}

pub(crate) async fn run(
    pipeline: &Arc<Pipeline>,
    req: &Request,
    scope: &RequestScope,
) -> Result<Value, DaemonError> {
    let steps_value = req
        .flag_value("steps")
        .ok_or_else(|| DaemonError::invalid_args("batch requires a `steps` array"))?;
    let Value::Array(raw_steps) = steps_value else {
        return Err(DaemonError::invalid_args("batch `steps` must be an array"));
    };

    let max_steps = pipeline.config.batch_max_steps;
    if raw_steps.len() > max_steps {
        return Err(DaemonError::invalid_args(format!(
            "batch accepts at most {max_steps} steps, got {}",
            raw_steps.len()
        )));
    }

    // Parse everything up front so a malformed or nested step fails the
    // whole batch before any step has run.
    let mut steps = Vec::with_capacity(raw_steps.len());
    for (index, raw) in raw_steps.iter().enumerate() {
        let step = parse_step(raw, index)?;
        if step.command == "batch" || step.command == "replay" {
            return Err(DaemonError::invalid_args(format!(
                "batch step {} may not be `{}`",
                index + 1,
                step.command
            )));
        }
        steps.push(step);
    }

    let total = steps.len();
    let started = Instant::now();
    let mut results: Vec<Value> = Vec::with_capacity(total);

    for (index, step) in steps.into_iter().enumerate() {
        let step_req = step_request(req, step);
        scope.event(
            "info",
            "batch_step",
            json!({"step": index + 1, "command": step_req.command}),
        );
        let resp = pipeline.handle_request(step_req).await;
        match resp.error {
            None => results.push(resp.data.unwrap_or(Value::Null)),
            Some(error) => {
                let mut err = DaemonError::new(error.code, error.message).with_details(json!({
                    "step": index + 1,
                    "executed": results.len(),
                    "partialResults": results,
                }));
                err.hint = error.hint;
                return Err(err);
            }
        }
    }

    Ok(json!({
        "total": total,
        "executed": results.len(),
        "totalDurationMs": started.elapsed().as_millis() as u64,
        "results": results,
    }))
}

//! Replay-script (`.ad`) encoding.
//!
//! One line per recorded action: `<command> <positionals...> <flags...>`,
//! flags sorted by key for stable output, shell-style quoting for tokens
//! containing whitespace or quotes. The same grammar is parsed back by
//! `replay`.

use agent_device_protocol::DaemonError;
use serde_json::{Map, Value};

/// Quote a token when it contains characters the tokenizer would split on.
pub fn quote(token: &str) -> String {
    let needs_quoting = token.is_empty()
        || token
            .chars()
            .any(|c| c.is_whitespace() || c == '"' || c == '\\');
    if !needs_quoting {
        return token.to_string();
    }
    let mut out = String::with_capacity(token.len() + 2);
    out.push('"');
    for c in token.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

fn flag_token(value: &Value) -> Option<String> {
    match value {
        Value::Bool(true) => None,
        Value::Bool(false) => Some("false".to_string()),
        Value::String(s) => Some(quote(s)),
        Value::Number(n) => Some(n.to_string()),
        other => Some(quote(&other.to_string())),
    }
}

/// Encode one action as a script line.
pub fn encode_line(command: &str, args: &[String], flags: &Map<String, Value>) -> String {
    let mut parts = vec![command.to_string()];
    parts.extend(args.iter().map(|a| quote(a)));

    let mut keys: Vec<&String> = flags.keys().collect();
    keys.sort();
    for key in keys {
        let value = &flags[key];
        if value.is_null() {
            continue;
        }
        match flag_token(value) {
            None => parts.push(format!("--{key}")),
            Some(token) => {
                parts.push(format!("--{key}"));
                parts.push(token);
            }
        }
    }
    parts.join(" ")
}

/// Tokenize a script line, honoring double quotes and backslash escapes.
fn tokenize(line: &str) -> Result<Vec<String>, DaemonError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut escaped = false;
    let mut has_token = false;

    for c in line.chars() {
        if escaped {
            current.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quotes => escaped = true,
            '"' => {
                in_quotes = !in_quotes;
                has_token = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if has_token || !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => {
                current.push(c);
                has_token = true;
            }
        }
    }
    if in_quotes {
        return Err(DaemonError::invalid_args("unterminated quote in script line"));
    }
    if has_token || !current.is_empty() {
        tokens.push(current);
    }
    Ok(tokens)
}

/// Parse one script line back into `(command, positionals, flags)`.
/// `--flag` followed by a non-flag token consumes it as the value;
/// a bare `--flag` is boolean `true`.
pub fn parse_line(
    line: &str,
) -> Result<Option<(String, Vec<String>, Map<String, Value>)>, DaemonError> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }

    let tokens = tokenize(trimmed)?;
    let mut iter = tokens.into_iter().peekable();
    let command = iter
        .next()
        .ok_or_else(|| DaemonError::invalid_args("empty script line"))?;

    let mut args = Vec::new();
    let mut flags = Map::new();
    while let Some(token) = iter.next() {
        if let Some(key) = token.strip_prefix("--") {
            if key.is_empty() {
                return Err(DaemonError::invalid_args("bare `--` in script line"));
            }
            let value = match iter.peek() {
                Some(next) if !next.starts_with("--") => {
                    let raw = iter.next().expect("peeked");
                    Value::String(raw)
                }
                _ => Value::Bool(true),
            };
            flags.insert(key.to_string(), value);
        } else {
            args.push(token);
        }
    }
    Ok(Some((command, args, flags)))
}

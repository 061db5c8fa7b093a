//! Assistant code-block protocol and REPL result echo wire format (see
//! the external-interfaces section of the design): extracting the single
//! executable code block from an assistant turn, recognizing terminal
//! markers, and rendering an `execute_code` result back into the transcript.

use regex::Regex;
use serde_json::Value;

use crate::llm::Message;
use crate::repl::ReplResult;

#[derive(Clone, Debug)]
pub enum ContextInput {
    Json(Value),
    Text(String),
    Messages(Vec<Message>),
    Strings(Vec<String>),
}

impl From<String> for ContextInput {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for ContextInput {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<Vec<String>> for ContextInput {
    fn from(value: Vec<String>) -> Self {
        Self::Strings(value)
    }
}

impl From<Vec<Message>> for ContextInput {
    fn from(value: Vec<Message>) -> Self {
        Self::Messages(value)
    }
}

impl From<Value> for ContextInput {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

#[derive(Clone, Debug)]
pub struct ContextData {
    pub json: Option<Value>,
    pub text: Option<String>,
}

pub fn context_from_value(value: Option<Value>) -> ContextInput {
    match value {
        None => ContextInput::Text(String::new()),
        Some(Value::String(text)) => ContextInput::Text(text),
        Some(Value::Array(items)) => {
            if let Some(strings) = array_to_strings(&items) {
                return ContextInput::Strings(strings);
            }
            if let Some(messages) = array_to_messages(&items) {
                return ContextInput::Messages(messages);
            }
            ContextInput::Json(Value::Array(items))
        }
        Some(other) => ContextInput::Json(other),
    }
}

pub fn convert_context_for_repl(context: ContextInput) -> ContextData {
    match context {
        ContextInput::Json(value) => ContextData {
            json: Some(normalize_context_json(value)),
            text: None,
        },
        ContextInput::Text(value) => ContextData {
            json: None,
            text: Some(value),
        },
        ContextInput::Messages(messages) => {
            let items: Vec<String> = messages.into_iter().map(|msg| msg.content).collect();
            ContextData {
                json: Some(Value::Array(items.into_iter().map(Value::String).collect())),
                text: None,
            }
        }
        ContextInput::Strings(items) => ContextData {
            json: Some(Value::Array(items.into_iter().map(Value::String).collect())),
            text: None,
        },
    }
}

fn array_to_strings(items: &[Value]) -> Option<Vec<String>> {
    let mut strings = Vec::with_capacity(items.len());
    for item in items {
        match item {
            Value::String(text) => strings.push(text.clone()),
            _ => return None,
        }
    }
    Some(strings)
}

fn array_to_messages(items: &[Value]) -> Option<Vec<Message>> {
    let mut messages = Vec::with_capacity(items.len());
    for item in items {
        let map = match item {
            Value::Object(map) => map,
            _ => return None,
        };
        let content_value = map.get("content")?;
        let content = match content_value {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        let role = map
            .get("role")
            .and_then(|value| value.as_str())
            .unwrap_or("user")
            .to_owned();
        messages.push(Message { role, content });
    }
    Some(messages)
}

fn normalize_context_json(value: Value) -> Value {
    match value {
        Value::Array(items) => {
            let use_content = items
                .first()
                .and_then(|item| match item {
                    Value::Object(map) => map.get("content"),
                    _ => None,
                })
                .is_some();
            if use_content {
                let mapped = items
                    .into_iter()
                    .map(|item| {
                        if let Value::Object(mut map) = item {
                            map.remove("content")
                                .and_then(|value| value.as_str().map(|text| text.to_owned()))
                                .unwrap_or_default()
                        } else {
                            String::new()
                        }
                    })
                    .map(Value::String)
                    .collect();
                Value::Array(mapped)
            } else {
                Value::Array(items)
            }
        }
        other => other,
    }
}

/// Extracts only the **first** ` ```repl ` block from an assistant turn.
/// Returns the code plus the count of additional blocks that were present
/// but ignored, so the caller can warn about them in the transcript.
pub fn find_code_blocks(text: &str) -> (Option<String>, usize) {
    let pattern = Regex::new(r"```repl\s*\n(?s:(.*?))\n```").expect("regex");
    let mut matches = pattern
        .captures_iter(text)
        .filter_map(|cap| cap.get(1).map(|m| m.as_str().trim().to_owned()));
    let first = matches.next();
    let extra = matches.count();
    (first, extra)
}

pub enum FinalAnswerKind {
    Final,
    FinalVar,
}

pub fn find_final_answer(text: &str) -> Option<(FinalAnswerKind, String)> {
    let final_var_re = Regex::new(r"(?ms)^\s*FINAL_VAR\((.*?)\)").expect("regex");
    if let Some(cap) = final_var_re.captures(text) {
        return Some((FinalAnswerKind::FinalVar, cap[1].trim().to_owned()));
    }
    let final_re = Regex::new(r"(?ms)^\s*FINAL\((.*?)\)").expect("regex");
    if let Some(cap) = final_re.captures(text) {
        return Some((FinalAnswerKind::Final, cap[1].trim().to_owned()));
    }
    None
}

/// The REPL result echo's terminal tag, see `format_repl_echo`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FinishReason {
    Ok,
    Final,
    ErrorUser,
    ErrorFatal,
    Truncated,
}

impl FinishReason {
    fn as_str(self) -> &'static str {
        match self {
            FinishReason::Ok => "ok",
            FinishReason::Final => "final",
            FinishReason::ErrorUser => "error_user",
            FinishReason::ErrorFatal => "error_fatal",
            FinishReason::Truncated => "truncated",
        }
    }
}

/// Renders an `execute_code` result into the four-region wire format the
/// root model is taught to parse: stdout, stderr, an optional value, and a
/// terminal FINISH_REASON tag.
pub fn format_repl_echo(result: &ReplResult, finish_reason: FinishReason) -> String {
    let mut out = String::new();
    out.push_str("-- stdout --\n");
    out.push_str(if result.stdout.is_empty() {
        "(empty)"
    } else {
        result.stdout.trim_end()
    });
    out.push_str("\n-- stderr --\n");
    out.push_str(if result.stderr.is_empty() {
        "(empty)"
    } else {
        result.stderr.trim_end()
    });
    if result.value.is_some() || !result.locals.is_empty() || !result.locals_map.is_empty() {
        out.push_str("\n-- value --\n");
        out.push_str(&format_locals(result));
    }
    out.push_str(&format!("\n-- FINISH_REASON: {} --", finish_reason.as_str()));
    out
}

fn format_locals(result: &ReplResult) -> String {
    if let Some(value) = &result.value {
        return value.clone();
    }
    let mut vars = Vec::new();
    for local in &result.locals {
        if should_skip_var_name(&local.name) || !local.is_simple {
            continue;
        }
        let display = if let Some(value) = &local.string_value {
            let (truncated, did_truncate) = truncate_string(value, 100);
            if did_truncate {
                format!("'{}...'", escape_string(&truncated))
            } else {
                local.repr.clone()
            }
        } else {
            local.repr.clone()
        };
        vars.push(format!("{}={}", local.name, display));
    }
    if vars.is_empty() {
        for (name, repr) in &result.locals_map {
            if should_skip_var_name(name) {
                continue;
            }
            vars.push(format!("{name}={repr}"));
        }
    }
    if vars.is_empty() {
        "(no bindings)".to_owned()
    } else {
        vars.join(", ")
    }
}

fn should_skip_var_name(name: &str) -> bool {
    name.starts_with('_') || matches!(name, "__builtins__" | "__name__" | "__doc__")
}

fn truncate_string(value: &str, max_len: usize) -> (String, bool) {
    if value.len() <= max_len {
        return (value.to_owned(), false);
    }
    let mut end = max_len.min(value.len());
    while !value.is_char_boundary(end) {
        end = end.saturating_sub(1);
    }
    (value[..end].to_owned(), true)
}

fn escape_string(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

/// Appends the rendered echo (capped at `max_character_length` bytes, with an
/// explicit truncation marker) as the next user turn in the transcript.
pub fn add_execution_result_to_messages(
    messages: &mut Vec<Message>,
    code: &str,
    echo: &str,
    max_character_length: usize,
) {
    let mut output = echo.to_owned();
    if output.len() > max_character_length {
        output.truncate(max_character_length);
        output.push_str("\n... [TRUNCATED]");
    }
    messages.push(Message::user(format!(
        "Code executed:\n```python\n{code}\n```\n\n{output}"
    )));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repl::LocalValue;

    #[test]
    fn first_code_block_only() {
        let text = "```repl\nprint(1)\n```\nsome text\n```repl\nprint(2)\n```";
        let (first, extra) = find_code_blocks(text);
        assert_eq!(first.unwrap(), "print(1)");
        assert_eq!(extra, 1);
    }

    #[test]
    fn no_code_block() {
        let (first, extra) = find_code_blocks("just talking, no code here");
        assert!(first.is_none());
        assert_eq!(extra, 0);
    }

    #[test]
    fn final_var_detected() {
        let (kind, name) = find_final_answer("done.\nFINAL_VAR(\"answer\")").unwrap();
        assert!(matches!(kind, FinalAnswerKind::FinalVar));
        assert_eq!(name, "\"answer\"");
    }

    #[test]
    fn final_wins_over_code_presence() {
        // A terminal marker can appear in the same turn as a code fence;
        // the controller is responsible for checking the marker first.
        let text = "```repl\nx = 1\n```\nFINAL(42)";
        let (kind, content) = find_final_answer(text).unwrap();
        assert!(matches!(kind, FinalAnswerKind::Final));
        assert_eq!(content, "42");
    }

    #[test]
    fn echo_format_has_four_regions() {
        let result = ReplResult {
            stdout: "hi".to_owned(),
            stderr: String::new(),
            locals: vec![LocalValue {
                name: "n".to_owned(),
                repr: "3".to_owned(),
                is_simple: true,
                string_value: None,
            }],
            locals_map: vec![],
            execution_time: 0.01,
            value: None,
            error: None,
        };
        let echo = format_repl_echo(&result, FinishReason::Ok);
        assert!(echo.contains("-- stdout --"));
        assert!(echo.contains("-- stderr --"));
        assert!(echo.contains("-- value --"));
        assert!(echo.contains("FINISH_REASON: ok"));
    }

    #[test]
    fn explicit_value_wins_over_locals_rendering() {
        let result = ReplResult {
            stdout: String::new(),
            stderr: String::new(),
            locals: vec![LocalValue {
                name: "n".to_owned(),
                repr: "3".to_owned(),
                is_simple: true,
                string_value: None,
            }],
            locals_map: vec![],
            execution_time: 0.0,
            value: Some("42".to_owned()),
            error: None,
        };
        let echo = format_repl_echo(&result, FinishReason::Ok);
        assert!(echo.contains("-- value --\n42"));
        assert!(!echo.contains("n=3"));
    }
}

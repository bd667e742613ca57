//! Directive parsing for model replies: locate a JSON payload in free-form
//! text (code fences, surrounding prose, mild syntax damage) and map it to
//! an engine directive.

use conductor_core::llm::LlmToolCall;

#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    Final {
        thought: String,
        output: serde_json::Value,
    },
    ToolCall {
        thought: String,
        call: LlmToolCall,
    },
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty reply")]
    EmptyInput,

    #[error("no json candidates")]
    NoCandidates,

    #[error("unrecognized directive shape: {reason}")]
    UnrecognizedShape { reason: String },
}

/// Locate the first candidate in `text` that parses as JSON. Candidates are
/// tried in order: the raw text, fenced code blocks, brace-balanced
/// snippets; each candidate is retried after stripping non-JSON lines and
/// after a repair pass.
pub fn find_json_payload(text: &str) -> Result<serde_json::Value, ParseError> {
    let raw = text.trim();
    if raw.is_empty() {
        return Err(ParseError::EmptyInput);
    }

    for candidate in collect_candidates(raw) {
        for variant in candidate_variants(&candidate) {
            if variant.trim().is_empty() {
                continue;
            }
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(&variant) {
                return Ok(value);
            }
        }
    }
    Err(ParseError::NoCandidates)
}

/// Parse a model reply into an engine directive.
pub fn parse_directive(text: &str) -> Result<Directive, ParseError> {
    let payload = find_json_payload(text)?;
    let object = payload
        .as_object()
        .ok_or_else(|| ParseError::UnrecognizedShape {
            reason: "payload is not an object".to_string(),
        })?;

    let kind = object
        .get("type")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ParseError::UnrecognizedShape {
            reason: "missing type field".to_string(),
        })?;

    match kind {
        "final" => {
            let body = object
                .get("final")
                .and_then(|v| v.as_object())
                .ok_or_else(|| ParseError::UnrecognizedShape {
                    reason: "final directive without final object".to_string(),
                })?;
            let thought = body
                .get("thought")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let output = body.get("output").cloned().unwrap_or(serde_json::Value::Null);
            Ok(Directive::Final { thought, output })
        }
        "tool_call" => {
            let body = object
                .get("tool_call")
                .and_then(|v| v.as_object())
                .ok_or_else(|| ParseError::UnrecognizedShape {
                    reason: "tool_call directive without tool_call object".to_string(),
                })?;
            let thought = body
                .get("thought")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let tool_name = body
                .get("tool_name")
                .and_then(|v| v.as_str())
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .ok_or_else(|| ParseError::UnrecognizedShape {
                    reason: "tool_call without tool_name".to_string(),
                })?;
            let tool_params = body
                .get("tool_params")
                .and_then(|v| v.as_object())
                .cloned()
                .unwrap_or_default();
            Ok(Directive::ToolCall {
                thought,
                call: LlmToolCall {
                    id: String::new(),
                    name: tool_name.to_string(),
                    arguments: tool_params,
                },
            })
        }
        other => Err(ParseError::UnrecognizedShape {
            reason: format!("unknown type '{other}'"),
        }),
    }
}

fn collect_candidates(raw: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut push = |candidate: &str| {
        let candidate = candidate.trim();
        if !candidate.is_empty() && !out.iter().any(|seen| seen == candidate) {
            out.push(candidate.to_string());
        }
    };

    push(raw);
    for block in fenced_blocks(raw) {
        push(&block);
    }
    for snippet in balanced_snippets(raw) {
        push(&snippet);
    }
    out
}

fn candidate_variants(candidate: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut push = |variant: String| {
        let trimmed = variant.trim().to_string();
        if !trimmed.is_empty() && !out.iter().any(|seen| *seen == trimmed) {
            out.push(trimmed);
        }
    };

    push(candidate.to_string());
    let stripped = strip_non_json_lines(candidate);
    push(stripped.clone());
    push(attempt_repair(candidate));
    if stripped.trim() != candidate.trim() {
        push(attempt_repair(&stripped));
    }
    out
}

/// Contents of ``` fenced blocks, with an optional language tag on the
/// opening fence.
fn fenced_blocks(text: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find("```") {
        let after_fence = &rest[start + 3..];
        let body_start = after_fence.find('\n').map(|i| i + 1).unwrap_or(0);
        let body = &after_fence[body_start..];
        match body.find("```") {
            Some(end) => {
                blocks.push(body[..end].to_string());
                rest = &body[end + 3..];
            }
            None => {
                blocks.push(body.to_string());
                break;
            }
        }
    }
    blocks
}

/// Brace-balanced object snippets found anywhere in the text. An
/// unterminated trailing object is returned as-is for the repair pass.
fn balanced_snippets(text: &str) -> Vec<String> {
    let mut snippets = Vec::new();
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'{' {
            i += 1;
            continue;
        }
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;
        let mut end = None;
        for (offset, b) in bytes[i..].iter().enumerate() {
            match (*b, in_string, escaped) {
                (_, true, true) => escaped = false,
                (b'\\', true, false) => escaped = true,
                (b'"', _, false) => in_string = !in_string,
                (b'{', false, _) => depth += 1,
                (b'}', false, _) => {
                    depth -= 1;
                    if depth == 0 {
                        end = Some(i + offset + 1);
                        break;
                    }
                }
                _ => {}
            }
        }
        match end {
            Some(end) => {
                snippets.push(text[i..end].to_string());
                i = end;
            }
            None => {
                snippets.push(text[i..].to_string());
                break;
            }
        }
    }
    snippets
}

/// Keep the lines from the first one opening a JSON value to the last one
/// closing it; drops surrounding prose lines.
fn strip_non_json_lines(text: &str) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let first = lines
        .iter()
        .position(|line| matches!(line.trim_start().as_bytes().first(), Some(&b'{') | Some(&b'[')));
    let last = lines
        .iter()
        .rposition(|line| matches!(line.trim_end().as_bytes().last(), Some(&b'}') | Some(&b']')));
    match (first, last) {
        (Some(first), Some(last)) if first <= last => lines[first..=last].join("\n"),
        _ => String::new(),
    }
}

/// Best-effort JSON repair: cut leading prose, drop trailing commas,
/// discard text after the final balanced close, and append missing
/// closers for unterminated structures.
fn attempt_repair(text: &str) -> String {
    let Some(start) = text.find(['{', '[']) else {
        return String::new();
    };
    let source = &text[start..];

    let mut out = String::with_capacity(source.len());
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    let mut balanced_end = None;

    for c in source.chars() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '{' => {
                stack.push('}');
                out.push(c);
            }
            '[' => {
                stack.push(']');
                out.push(c);
            }
            '}' | ']' => {
                // Drop a trailing comma left before the closer.
                while out.ends_with([',', ' ', '\n', '\t', '\r']) {
                    out.pop();
                }
                if stack.last() == Some(&c) {
                    stack.pop();
                }
                out.push(c);
                if stack.is_empty() {
                    balanced_end = Some(out.len());
                    break;
                }
            }
            _ => out.push(c),
        }
    }

    if let Some(end) = balanced_end {
        out.truncate(end);
        return out;
    }

    if in_string {
        out.push('"');
    }
    while out.ends_with([',', ' ', '\n', '\t', '\r']) {
        out.pop();
    }
    while let Some(closer) = stack.pop() {
        out.push(closer);
    }
    out
}

use conductor_core::llm::{LlmToolCall, Message};
use conductor_core::tool::ToolParams;
use conductor_core::truncate::truncate_utf8;

/// The observation byte ceiling no configuration can raise.
pub const OBSERVATION_HARD_CAP_BYTES: usize = 200_000;

pub(super) const MAX_INJECTED_META_BYTES: usize = 4096;

/// Build the metadata message injected right before the task. The payload
/// is wrapped under a `conductor_meta` key; when the serialized form blows
/// the 4 KB budget it is replaced by a `truncated: true` marker carrying a
/// short prefix of the original.
pub(super) fn meta_message(meta: &serde_json::Value) -> Message {
    let wrapper = serde_json::json!({ "conductor_meta": meta });
    let content = wrapper.to_string();
    if content.len() <= MAX_INJECTED_META_BYTES {
        return Message::user(content);
    }

    let prefix = truncate_utf8(&content, 1800).to_string();
    let marker = serde_json::json!({
        "conductor_meta": { "truncated": true, "prefix": prefix },
    });
    Message::user(marker.to_string())
}

/// Tool-result message appended to the history after an execution. The
/// observation is capped so the full message content never exceeds the
/// hard limit, and always lands on a UTF-8 boundary.
pub(super) fn tool_result_message(
    call: &LlmToolCall,
    observation: &str,
    max_observation_bytes: usize,
) -> (Message, String) {
    let prefix = format!("Tool Result ({}): ", call.name);
    let budget = max_observation_bytes
        .min(OBSERVATION_HARD_CAP_BYTES.saturating_sub(prefix.len()));
    let truncated = truncate_utf8(observation, budget).to_string();

    let mut message = Message::user(format!("{prefix}{truncated}"));
    if !call.id.trim().is_empty() {
        message.tool_call_id = Some(call.id.trim().to_string());
    }
    (message, truncated)
}

/// A key is redacted when its lowercase form with `-`/`_` stripped
/// contains any configured marker under the same normalization.
pub fn should_redact_key(key: &str, redact_keys: &[String]) -> bool {
    let normalized = normalize_key(key);
    if normalized.is_empty() {
        return false;
    }
    redact_keys
        .iter()
        .map(|k| normalize_key(k))
        .filter(|k| !k.is_empty())
        .any(|marker| normalized.contains(&marker))
}

fn normalize_key(key: &str) -> String {
    key.trim().to_lowercase().replace(['-', '_'], "")
}

/// Copy of tool params safe to log: sensitive values replaced, nested
/// structure preserved.
pub(super) fn params_for_log(params: &ToolParams, redact_keys: &[String]) -> serde_json::Value {
    fn walk(value: &serde_json::Value, redact_keys: &[String]) -> serde_json::Value {
        match value {
            serde_json::Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (key, val) in map {
                    if should_redact_key(key, redact_keys) {
                        out.insert(key.clone(), serde_json::json!("[redacted]"));
                    } else {
                        out.insert(key.clone(), walk(val, redact_keys));
                    }
                }
                serde_json::Value::Object(out)
            }
            serde_json::Value::Array(items) => serde_json::Value::Array(
                items.iter().map(|item| walk(item, redact_keys)).collect(),
            ),
            other => other.clone(),
        }
    }
    walk(&serde_json::Value::Object(params.clone()), redact_keys)
}

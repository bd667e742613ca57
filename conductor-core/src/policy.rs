use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::tool::ToolParams;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

/// Decision ordering doubles as severity: a layered evaluation keeps the
/// most severe non-deny decision, and any deny wins outright.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum GuardDecision {
    Allow,
    AllowWithRedaction,
    RequireApproval,
    Deny,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ActionType {
    ToolCallPre,
    ToolCallPost,
    OutputPublish,
    SkillInstall,
}

impl ActionType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ToolCallPre => "ToolCallPre",
            Self::ToolCallPost => "ToolCallPost",
            Self::OutputPublish => "OutputPublish",
            Self::SkillInstall => "SkillInstall",
        }
    }
}

/// A guard-inspectable operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardAction {
    pub action_type: ActionType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tool_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_params: Option<ToolParams>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub method: String,
}

impl GuardAction {
    pub fn tool_call_pre(tool_name: impl Into<String>, tool_params: ToolParams) -> Self {
        Self {
            action_type: ActionType::ToolCallPre,
            tool_name: tool_name.into(),
            tool_params: Some(tool_params),
            content: String::new(),
            url: String::new(),
            method: String::new(),
        }
    }

    pub fn output_publish(content: impl Into<String>) -> Self {
        Self {
            action_type: ActionType::OutputPublish,
            tool_name: String::new(),
            tool_params: None,
            content: content.into(),
            url: String::new(),
            method: String::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ActionMeta {
    pub run_id: String,
    pub step: u32,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardVerdict {
    pub risk_level: RiskLevel,
    pub decision: GuardDecision,
    pub reasons: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redacted_content: Option<String>,
}

impl GuardVerdict {
    pub fn allow(risk_level: RiskLevel) -> Self {
        Self {
            risk_level,
            decision: GuardDecision::Allow,
            reasons: Vec::new(),
            redacted_content: None,
        }
    }
}

/// Deterministic SHA-256 of the canonical action payload. The canonical
/// form sorts map keys recursively by flattening every map into a
/// `[k1, v1, k2, v2, ...]` array; plain arrays keep their order and
/// scalars pass through untouched. Only non-empty fields participate.
pub fn action_hash(action: &GuardAction) -> String {
    let mut payload = serde_json::Map::new();
    payload.insert(
        "type".to_string(),
        serde_json::Value::String(action.action_type.as_str().to_string()),
    );
    if !action.tool_name.trim().is_empty() {
        payload.insert(
            "tool_name".to_string(),
            serde_json::Value::String(action.tool_name.clone()),
        );
    }
    if let Some(params) = &action.tool_params {
        payload.insert(
            "tool_params".to_string(),
            serde_json::Value::Object(params.clone()),
        );
    }
    if !action.content.trim().is_empty() {
        payload.insert(
            "content".to_string(),
            serde_json::Value::String(action.content.clone()),
        );
    }
    if !action.url.trim().is_empty() {
        payload.insert(
            "url".to_string(),
            serde_json::Value::String(action.url.clone()),
        );
    }
    if !action.method.trim().is_empty() {
        payload.insert(
            "method".to_string(),
            serde_json::Value::String(action.method.clone()),
        );
    }

    let canonical = canonicalize(&serde_json::Value::Object(payload));
    let encoded = serde_json::to_vec(&canonical).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&encoded);
    hex_lower(&hasher.finalize())
}

fn canonicalize(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut flat = Vec::with_capacity(keys.len() * 2);
            for key in keys {
                flat.push(serde_json::Value::String(key.clone()));
                flat.push(canonicalize(&map[key]));
            }
            serde_json::Value::Array(flat)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(canonicalize).collect())
        }
        other => other.clone(),
    }
}

pub fn hex_lower(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(json: serde_json::Value) -> ToolParams {
        json.as_object().expect("object").clone()
    }

    #[test]
    fn hash_is_invariant_under_key_reordering() {
        let a = GuardAction::tool_call_pre(
            "bash",
            params(serde_json::json!({
                "command": "ls",
                "env": {"b": 1, "a": {"y": 2, "x": 3}},
            })),
        );
        let b = GuardAction::tool_call_pre(
            "bash",
            params(serde_json::json!({
                "env": {"a": {"x": 3, "y": 2}, "b": 1},
                "command": "ls",
            })),
        );
        assert_eq!(action_hash(&a), action_hash(&b));
    }

    #[test]
    fn hash_preserves_array_order() {
        let a = GuardAction::tool_call_pre(
            "bash",
            params(serde_json::json!({"args": ["x", "y"]})),
        );
        let b = GuardAction::tool_call_pre(
            "bash",
            params(serde_json::json!({"args": ["y", "x"]})),
        );
        assert_ne!(action_hash(&a), action_hash(&b));
    }

    #[test]
    fn hash_changes_when_params_change() {
        let a = GuardAction::tool_call_pre("bash", params(serde_json::json!({"command": "ls"})));
        let b = GuardAction::tool_call_pre("bash", params(serde_json::json!({"command": "rm"})));
        assert_ne!(action_hash(&a), action_hash(&b));
    }

    #[test]
    fn hash_skips_empty_fields() {
        let with_empty = GuardAction {
            action_type: ActionType::ToolCallPre,
            tool_name: "search".to_string(),
            tool_params: None,
            content: String::new(),
            url: String::new(),
            method: String::new(),
        };
        let mut with_whitespace = with_empty.clone();
        with_whitespace.content = "   ".to_string();
        assert_eq!(action_hash(&with_empty), action_hash(&with_whitespace));
    }

    #[test]
    fn hash_is_hex_sha256_shaped() {
        let hash = action_hash(&GuardAction::output_publish("hello"));
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn decision_severity_ordering() {
        assert!(GuardDecision::Deny > GuardDecision::RequireApproval);
        assert!(GuardDecision::RequireApproval > GuardDecision::AllowWithRedaction);
        assert!(GuardDecision::AllowWithRedaction > GuardDecision::Allow);
    }
}

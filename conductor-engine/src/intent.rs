//! Task intent inference: one cheap force-JSON LLM call that distills what
//! the user actually wants before the main loop starts spending steps.

use serde::{Deserialize, Serialize};

use conductor_core::error::{ConductorError, LlmError};
use conductor_core::llm::{ChatRequest, LlmClient, Message};

use crate::parser;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Intent {
    #[serde(default)]
    pub goal: String,
    #[serde(default)]
    pub deliverable: String,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default)]
    pub ambiguities: Vec<String>,
    #[serde(default)]
    pub ask: bool,
}

impl Intent {
    pub fn is_empty(&self) -> bool {
        self.goal.trim().is_empty()
            && self.deliverable.trim().is_empty()
            && self.constraints.is_empty()
            && self.ambiguities.is_empty()
            && !self.ask
    }
}

const INTENT_SYSTEM: &str = concat!(
    "You infer user intent. Return ONLY JSON with keys: goal (string), ",
    "deliverable (string), constraints (array of strings), ambiguities ",
    "(array of strings), ask (boolean).",
);

pub async fn infer_intent(
    client: &dyn LlmClient,
    model: &str,
    task: &str,
    history: &[Message],
    max_history: usize,
) -> Result<Intent, ConductorError> {
    let task = task.trim();
    if task.is_empty() {
        return Err(conductor_core::error::EngineError::EmptyTask.into());
    }

    let payload = serde_json::json!({
        "task": task,
        "history": trim_history(history, max_history),
        "rules": [
            "Return a compact, structured intent summary.",
            "Use the same language as the user for values.",
            "goal: the user's true objective, not the literal request.",
            "deliverable: the minimum acceptable output form.",
            "constraints: explicit constraints like time range, quantity, sources, format, language.",
            "ambiguities: only material uncertainties that block a good answer.",
            "ask: default false; set true only if proceeding without clarification risks irreversible harm.",
            "Prefer proceeding with stated assumptions over asking questions.",
            "Do not invent constraints or facts.",
        ],
    });

    let result = client
        .chat(ChatRequest {
            model: model.to_string(),
            messages: vec![
                Message::system(INTENT_SYSTEM),
                Message::user(payload.to_string()),
            ],
            tools: Vec::new(),
            force_json: true,
            parameters: [
                ("max_tokens".to_string(), serde_json::json!(300)),
                ("temperature".to_string(), serde_json::json!(0)),
            ]
            .into_iter()
            .collect(),
        })
        .await?;

    let raw = result.text.trim();
    if raw.is_empty() {
        return Err(LlmError::InvalidResponse {
            reason: "empty intent response".to_string(),
        }
        .into());
    }
    let payload = parser::find_json_payload(raw).map_err(|_| LlmError::InvalidResponse {
        reason: "intent reply is not json".to_string(),
    })?;
    let intent: Intent =
        serde_json::from_value(payload).map_err(|err| LlmError::InvalidResponse {
            reason: format!("invalid intent json: {err}"),
        })?;
    Ok(normalize(intent))
}

/// Intent rendered as a system-visible message for the main loop.
pub fn intent_system_message(intent: &Intent) -> String {
    let payload = serde_json::to_string_pretty(intent).unwrap_or_default();
    format!("Intent Inference (JSON):\n{payload}\nUse this to decide deliverable and constraints.")
}

fn trim_history(history: &[Message], max: usize) -> Vec<Message> {
    if max == 0 {
        return Vec::new();
    }
    let filtered: Vec<Message> = history
        .iter()
        .filter(|m| {
            let role = m.role.trim().to_lowercase();
            role != "system" && !role.is_empty() && !m.content.trim().is_empty()
        })
        .map(|m| Message {
            role: m.role.clone(),
            content: m.content.clone(),
            tool_call_id: None,
            tool_calls: Vec::new(),
        })
        .collect();
    if filtered.len() <= max {
        return filtered;
    }
    filtered[filtered.len() - max..].to_vec()
}

fn normalize(mut intent: Intent) -> Intent {
    intent.goal = intent.goal.trim().to_string();
    intent.deliverable = intent.deliverable.trim().to_string();
    intent.constraints = normalize_list(intent.constraints);
    intent.ambiguities = normalize_list(intent.ambiguities);
    intent
}

fn normalize_list(items: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(items.len());
    for raw in items {
        let item = raw.trim();
        if item.is_empty() {
            continue;
        }
        if out.iter().any(|seen| seen.eq_ignore_ascii_case(item)) {
            continue;
        }
        out.push(item.to_string());
    }
    out
}

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::LlmError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<LlmToolCall>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain("assistant", content)
    }

    fn plain(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
            tool_call_id: None,
            tool_calls: Vec::new(),
        }
    }
}

/// Tool descriptor sent to the model over the tools channel. The schema is
/// a JSON-schema string and never appears in the system prompt text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub parameters_json: String,
}

/// A tool call as emitted by a backend's native tool-call channel.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LlmToolCall {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Map<String, serde_json::Value>,
}

/// Usage as reported by a backend. Missing fields decode as zero; the
/// engine applies the input+output fallback when `total_tokens` is zero.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default)]
    pub cost: f64,
}

#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDescriptor>,
    pub force_json: bool,
    pub parameters: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default)]
pub struct ChatResult {
    pub text: String,
    pub json: Option<serde_json::Value>,
    pub tool_calls: Vec<LlmToolCall>,
    pub usage: Usage,
    pub duration: Duration,
}

/// Pluggable chat backend. Implementations must cap response body reads
/// (the reference cap is 8 MB), parse usage defensively, and never retry
/// internally; the engine issues exactly one call per step.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResult, LlmError>;
}

/// Scripted client for tests: returns canned results in order and records
/// every request it receives.
pub struct MockLlmClient {
    responses: std::sync::Mutex<Vec<Result<ChatResult, LlmError>>>,
    calls: std::sync::Mutex<Vec<ChatRequest>>,
}

impl MockLlmClient {
    pub fn new(responses: Vec<ChatResult>) -> Self {
        Self {
            responses: std::sync::Mutex::new(responses.into_iter().map(Ok).collect()),
            calls: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn with_outcomes(outcomes: Vec<Result<ChatResult, LlmError>>) -> Self {
        Self {
            responses: std::sync::Mutex::new(outcomes),
            calls: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().expect("calls lock").len()
    }

    pub fn calls(&self) -> Vec<ChatRequest> {
        self.calls.lock().expect("calls lock").clone()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResult, LlmError> {
        self.calls.lock().expect("calls lock").push(request);
        let mut responses = self.responses.lock().expect("responses lock");
        if responses.is_empty() {
            return Ok(ChatResult {
                text: "no more scripted responses".to_string(),
                ..Default::default()
            });
        }
        responses.remove(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_decodes_missing_fields_as_zero() {
        let usage: Usage = serde_json::from_str("{\"input_tokens\": 10}").expect("decode");
        assert_eq!(usage.input_tokens, 10);
        assert_eq!(usage.output_tokens, 0);
        assert_eq!(usage.total_tokens, 0);
        assert_eq!(usage.cost, 0.0);
    }

    #[test]
    fn message_roundtrip_omits_empty_tool_fields() {
        let msg = Message::user("hello");
        let value = serde_json::to_value(&msg).expect("to value");
        assert!(value.get("tool_call_id").is_none());
        assert!(value.get("tool_calls").is_none());

        let decoded: Message = serde_json::from_value(value).expect("decode");
        assert_eq!(decoded, msg);
    }

    #[tokio::test]
    async fn mock_client_replays_in_order_and_records_calls() {
        let client = MockLlmClient::new(vec![
            ChatResult {
                text: "first".to_string(),
                ..Default::default()
            },
            ChatResult {
                text: "second".to_string(),
                ..Default::default()
            },
        ]);

        let a = client.chat(ChatRequest::default()).await.expect("a");
        let b = client.chat(ChatRequest::default()).await.expect("b");
        assert_eq!(a.text, "first");
        assert_eq!(b.text, "second");
        assert_eq!(client.call_count(), 2);
    }
}

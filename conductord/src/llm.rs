//! LLM backend wiring for the daemon: an OpenAI-compatible chat client
//! plus an echo fallback for smoke runs without credentials.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;

use conductor_core::error::LlmError;
use conductor_core::llm::{ChatRequest, ChatResult, LlmClient, LlmToolCall, Usage};

use crate::config::LlmSection;

const DEFAULT_MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

pub fn build_llm_client(config: &LlmSection) -> Result<Arc<dyn LlmClient>> {
    match config.provider.as_str() {
        "echo" => Ok(Arc::new(EchoLlmClient)),
        provider => {
            let env_var = if config.api_key_env.trim().is_empty() {
                format!("{}_API_KEY", provider.to_ascii_uppercase())
            } else {
                config.api_key_env.clone()
            };
            let api_key = std::env::var(&env_var).map_err(|_| {
                anyhow::anyhow!("{env_var} is required when using provider='{provider}'")
            })?;
            let base_url = match (config.base_url.as_deref(), provider) {
                (Some(url), _) => url.to_string(),
                (None, "openai") => "https://api.openai.com/v1".to_string(),
                (None, other) => {
                    anyhow::bail!("provider '{other}' requires llm.base_url in config")
                }
            };
            Ok(Arc::new(OpenAiChatClient::new(
                base_url,
                api_key,
                Duration::from_secs(config.request_timeout_secs.max(1)),
                config.max_body_bytes,
            )?))
        }
    }
}

/// Chat client for OpenAI-compatible completion endpoints. One request per
/// call, no internal retries; response bodies are capped to keep a
/// misbehaving backend from ballooning memory.
pub struct OpenAiChatClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    max_body_bytes: usize,
}

impl OpenAiChatClient {
    pub fn new(
        base_url: String,
        api_key: String,
        timeout: Duration,
        max_body_bytes: usize,
    ) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        let endpoint = format!("{}/chat/completions", base_url.trim_end_matches('/'));
        Ok(Self {
            http,
            endpoint,
            api_key,
            max_body_bytes: if max_body_bytes == 0 {
                DEFAULT_MAX_BODY_BYTES
            } else {
                max_body_bytes
            },
        })
    }

    fn encode_request(&self, request: &ChatRequest) -> serde_json::Value {
        let messages: Vec<serde_json::Value> = request
            .messages
            .iter()
            .map(|m| {
                let mut msg = serde_json::json!({
                    "role": m.role,
                    "content": m.content,
                });
                if let Some(id) = &m.tool_call_id {
                    msg["tool_call_id"] = serde_json::json!(id);
                }
                msg
            })
            .collect();

        let mut body = serde_json::json!({
            "model": request.model,
            "messages": messages,
        });
        if !request.tools.is_empty() {
            let tools: Vec<serde_json::Value> = request
                .tools
                .iter()
                .map(|t| {
                    let parameters: serde_json::Value =
                        serde_json::from_str(&t.parameters_json)
                            .unwrap_or_else(|_| serde_json::json!({"type": "object"}));
                    serde_json::json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": parameters,
                        },
                    })
                })
                .collect();
            body["tools"] = serde_json::json!(tools);
        }
        if request.force_json {
            body["response_format"] = serde_json::json!({"type": "json_object"});
        }
        for (key, value) in &request.parameters {
            body[key.as_str()] = value.clone();
        }
        body
    }
}

#[async_trait]
impl LlmClient for OpenAiChatClient {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResult, LlmError> {
        let started = Instant::now();
        let body = self.encode_request(&request);

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| LlmError::Transport {
                reason: err.to_string(),
            })?;

        let status = response.status();
        if let Some(length) = response.content_length() {
            if length as usize > self.max_body_bytes {
                return Err(LlmError::InvalidResponse {
                    reason: format!("response body of {length} bytes exceeds the read cap"),
                });
            }
        }
        let bytes = response.bytes().await.map_err(|err| LlmError::Transport {
            reason: err.to_string(),
        })?;
        if bytes.len() > self.max_body_bytes {
            return Err(LlmError::InvalidResponse {
                reason: format!("response body of {} bytes exceeds the read cap", bytes.len()),
            });
        }
        if !status.is_success() {
            return Err(LlmError::Transport {
                reason: format!(
                    "backend returned {status}: {}",
                    String::from_utf8_lossy(&bytes[..bytes.len().min(512)])
                ),
            });
        }

        let payload: serde_json::Value =
            serde_json::from_slice(&bytes).map_err(|err| LlmError::InvalidResponse {
                reason: format!("body is not json: {err}"),
            })?;
        Ok(decode_chat_result(&payload, started.elapsed()))
    }
}

/// Decode defensively: missing usage fields read as zero, tool-call
/// argument strings that fail to parse become empty maps.
fn decode_chat_result(payload: &serde_json::Value, duration: Duration) -> ChatResult {
    let message = &payload["choices"][0]["message"];
    let text = message["content"].as_str().unwrap_or_default().to_string();

    let tool_calls = message["tool_calls"]
        .as_array()
        .map(|calls| {
            calls
                .iter()
                .filter_map(|call| {
                    let name = call["function"]["name"].as_str()?.trim();
                    if name.is_empty() {
                        return None;
                    }
                    let arguments = call["function"]["arguments"]
                        .as_str()
                        .and_then(|raw| serde_json::from_str::<serde_json::Value>(raw).ok())
                        .and_then(|v| v.as_object().cloned())
                        .unwrap_or_default();
                    Some(LlmToolCall {
                        id: call["id"].as_str().unwrap_or_default().to_string(),
                        name: name.to_string(),
                        arguments,
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let usage = Usage {
        input_tokens: payload["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
        output_tokens: payload["usage"]["completion_tokens"].as_u64().unwrap_or(0),
        total_tokens: payload["usage"]["total_tokens"].as_u64().unwrap_or(0),
        cost: 0.0,
    };

    ChatResult {
        text,
        json: None,
        tool_calls,
        usage,
        duration,
    }
}

/// Loopback client used when no provider is configured: replies with the
/// last user message as a final answer.
struct EchoLlmClient;

#[async_trait]
impl LlmClient for EchoLlmClient {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResult, LlmError> {
        let fallback = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.clone())
            .unwrap_or_else(|| "No message provided.".to_string());

        Ok(ChatResult {
            text: serde_json::json!({
                "type": "final",
                "final": {"thought": "echo", "output": format!("Echo: {fallback}")},
            })
            .to_string(),
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_handles_text_replies_and_missing_usage() {
        let payload = serde_json::json!({
            "choices": [{"message": {"content": "{\"type\":\"final\"}"}}],
        });
        let result = decode_chat_result(&payload, Duration::from_millis(5));
        assert_eq!(result.text, "{\"type\":\"final\"}");
        assert!(result.tool_calls.is_empty());
        assert_eq!(result.usage.total_tokens, 0);
    }

    #[test]
    fn decode_parses_native_tool_calls() {
        let payload = serde_json::json!({
            "choices": [{"message": {
                "content": null,
                "tool_calls": [{
                    "id": "call_1",
                    "function": {"name": "search", "arguments": "{\"q\":\"x\"}"},
                }],
            }}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3, "total_tokens": 15},
        });
        let result = decode_chat_result(&payload, Duration::ZERO);
        assert_eq!(result.tool_calls.len(), 1);
        assert_eq!(result.tool_calls[0].name, "search");
        assert_eq!(
            result.tool_calls[0].arguments.get("q"),
            Some(&serde_json::json!("x"))
        );
        assert_eq!(result.usage.input_tokens, 12);
        assert_eq!(result.usage.total_tokens, 15);
    }

    #[test]
    fn decode_tolerates_malformed_tool_arguments() {
        let payload = serde_json::json!({
            "choices": [{"message": {
                "tool_calls": [{"function": {"name": "search", "arguments": "not json"}}],
            }}],
        });
        let result = decode_chat_result(&payload, Duration::ZERO);
        assert_eq!(result.tool_calls.len(), 1);
        assert!(result.tool_calls[0].arguments.is_empty());
    }

    #[test]
    fn request_encoding_carries_tools_and_response_format() {
        let client = OpenAiChatClient::new(
            "https://api.example.test/v1".to_string(),
            "key".to_string(),
            Duration::from_secs(5),
            0,
        )
        .expect("client");

        let request = ChatRequest {
            model: "m".to_string(),
            messages: vec![conductor_core::llm::Message::user("hi")],
            tools: vec![conductor_core::llm::ToolDescriptor {
                name: "search".to_string(),
                description: "find things".to_string(),
                parameters_json: "{\"type\":\"object\"}".to_string(),
            }],
            force_json: true,
            parameters: [("temperature".to_string(), serde_json::json!(0))]
                .into_iter()
                .collect(),
        };
        let body = client.encode_request(&request);
        assert_eq!(body["model"], "m");
        assert_eq!(body["tools"][0]["function"]["name"], "search");
        assert_eq!(body["response_format"]["type"], "json_object");
        assert_eq!(body["temperature"], 0);
    }

    #[tokio::test]
    async fn echo_client_returns_a_final_directive() {
        let client = EchoLlmClient;
        let result = client
            .chat(ChatRequest {
                messages: vec![conductor_core::llm::Message::user("ping")],
                ..Default::default()
            })
            .await
            .expect("chat");
        assert!(result.text.contains("\"final\""));
        assert!(result.text.contains("Echo: ping"));
    }
}

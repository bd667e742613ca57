use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::ToolError;
use crate::llm::ToolDescriptor;

pub type ToolParams = serde_json::Map<String, serde_json::Value>;

/// A locally executable tool. The engine serializes `(name, description,
/// parameter_schema)` to the LLM tools channel and only the name into the
/// system prompt. Implementations must return promptly once `cancel` fires.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema for the tool parameters, as a string.
    fn parameter_schema(&self) -> &str;

    async fn execute(
        &self,
        cancel: &CancellationToken,
        params: &ToolParams,
    ) -> Result<String, ToolError>;
}

#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().trim().to_string();
        if name.is_empty() {
            return;
        }
        self.tools.insert(name, tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name.trim()).cloned()
    }

    pub fn all(&self) -> impl Iterator<Item = &Arc<dyn Tool>> {
        self.tools.values()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Descriptors for the LLM tools channel.
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.tools
            .values()
            .map(|tool| ToolDescriptor {
                name: tool.name().trim().to_string(),
                description: tool.description().trim().to_string(),
                parameters_json: tool.parameter_schema().trim().to_string(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echo the input back"
        }
        fn parameter_schema(&self) -> &str {
            r#"{"type":"object","properties":{"text":{"type":"string"}}}"#
        }
        async fn execute(
            &self,
            _cancel: &CancellationToken,
            params: &ToolParams,
        ) -> Result<String, ToolError> {
            Ok(params
                .get("text")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string())
        }
    }

    #[tokio::test]
    async fn registry_lookup_and_execute() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));

        let tool = registry.get("echo").expect("registered");
        let mut params = ToolParams::new();
        params.insert("text".to_string(), serde_json::json!("hi"));
        let out = tool
            .execute(&CancellationToken::new(), &params)
            .await
            .expect("execute");
        assert_eq!(out, "hi");
    }

    #[test]
    fn descriptors_carry_schema_strings() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));

        let descriptors = registry.descriptors();
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].name, "echo");
        assert!(descriptors[0].parameters_json.contains("\"type\""));
    }
}

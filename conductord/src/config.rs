use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use conductor_guard::config::GuardConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub daemon: DaemonSection,
    pub engine: EngineSection,
    pub llm: LlmSection,
    pub guard: GuardConfig,
    pub otel: OtelSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonSection {
    pub bind_addr: String,
    pub default_model: String,
    pub queue_capacity: usize,
    pub task_timeout_secs: u64,
    pub completed_ttl_secs: u64,
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8642".to_string(),
            default_model: "default".to_string(),
            queue_capacity: 100,
            task_timeout_secs: 10 * 60,
            completed_ttl_secs: 30 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    pub max_steps: u32,
    pub parse_failure_budget: u32,
    pub max_observation_bytes: usize,
    pub tool_timeout_secs: u64,
    pub plan_required: bool,
    pub include_thoughts: bool,
    pub redact_keys: Vec<String>,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            max_steps: 12,
            parse_failure_budget: 3,
            max_observation_bytes: 128 * 1024,
            tool_timeout_secs: 120,
            plan_required: false,
            include_thoughts: false,
            redact_keys: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// "echo" for credential-less smoke runs, otherwise a provider name
    /// served over an OpenAI-compatible endpoint.
    pub provider: String,
    pub base_url: Option<String>,
    /// Environment variable holding the API key; defaults to
    /// `<PROVIDER>_API_KEY`.
    pub api_key_env: String,
    pub request_timeout_secs: u64,
    pub max_body_bytes: usize,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "echo".to_string(),
            base_url: None,
            api_key_env: String::new(),
            request_timeout_secs: 120,
            max_body_bytes: 8 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OtelSection {
    pub otlp_endpoint: Option<String>,
    pub service_name: Option<String>,
}

/// Load and deserialize config from a TOML file.
pub fn load_config(path: &Path) -> Result<DaemonConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading config: {}", path.display()))?;
    let config: DaemonConfig =
        toml::from_str(&content).with_context(|| format!("parsing config: {}", path.display()))?;
    Ok(config)
}

/// Validate config for internal consistency:
/// - addresses and budgets are usable
/// - guard allowlist prefixes parse as URLs or bare scheme prefixes
/// - redaction patterns compile
pub fn validate_config(config: &DaemonConfig) -> Result<()> {
    if config.daemon.bind_addr.trim().is_empty() {
        anyhow::bail!("daemon.bind_addr must not be empty");
    }
    if config.daemon.queue_capacity == 0 {
        anyhow::bail!("daemon.queue_capacity must be positive");
    }
    if config.daemon.task_timeout_secs == 0 {
        anyhow::bail!("daemon.task_timeout_secs must be positive");
    }
    if config.engine.max_steps == 0 {
        anyhow::bail!("engine.max_steps must be positive");
    }
    if config.engine.parse_failure_budget == 0 {
        anyhow::bail!("engine.parse_failure_budget must be positive");
    }

    for prefix in &config.guard.network.url_fetch.allowed_url_prefixes {
        let prefix = prefix.trim();
        if prefix.is_empty() {
            anyhow::bail!("guard.network.url_fetch has an empty allowed prefix");
        }
        let bare_scheme = prefix
            .strip_suffix("://")
            .map(|scheme| !scheme.is_empty() && !scheme.contains('/'))
            .unwrap_or(false);
        if !bare_scheme && url::Url::parse(prefix).is_err() {
            anyhow::bail!("guard allowlist prefix '{prefix}' is not a valid URL prefix");
        }
    }

    for pattern in &config.guard.redaction.patterns {
        regex::Regex::new(&pattern.re).with_context(|| {
            format!(
                "guard redaction pattern '{}' does not compile",
                if pattern.name.is_empty() {
                    &pattern.re
                } else {
                    &pattern.name
                }
            )
        })?;
    }

    if config.guard.enabled
        && config.guard.approvals.enabled
        && config.guard.approvals.db_path.trim().is_empty()
    {
        anyhow::bail!("guard.approvals.enabled requires guard.approvals.db_path");
    }

    Ok(())
}

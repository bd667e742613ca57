use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    pub enabled: bool,
    pub network: NetworkConfig,
    pub redaction: RedactionConfig,
    pub bash: BashConfig,
    pub audit: AuditConfig,
    pub approvals: ApprovalsConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub url_fetch: UrlFetchPolicy,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UrlFetchPolicy {
    pub allowed_url_prefixes: Vec<String>,
    pub deny_private_ips: bool,
    /// When true, resolve hostnames and deny any private answer.
    pub resolve_dns: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RedactionConfig {
    pub enabled: bool,
    pub patterns: Vec<RegexPattern>,
    /// Extra key names treated as sensitive alongside the built-in
    /// heuristic, compared after lowercasing and stripping `-`/`_`.
    pub redact_keys: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegexPattern {
    #[serde(default)]
    pub name: String,
    pub re: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BashConfig {
    pub require_approval: bool,
    pub deny_tokens: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub jsonl_path: String,
    pub rotate_max_bytes: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalsConfig {
    pub enabled: bool,
    pub db_path: String,
}

//! Policy guard: deterministic, fail-closed evaluation of proposed agent
//! actions, durable approval records and an append-only audit trail.

pub mod approvals;
pub mod approvals_sqlite;
pub mod audit;
pub mod bash;
pub mod config;
pub mod net;
pub mod redact;

use std::sync::Arc;

use chrono::Utc;

use conductor_core::error::GuardError;
use conductor_core::policy::{
    action_hash, ActionMeta, ActionType, GuardAction, GuardDecision, GuardVerdict, RiskLevel,
};
use conductor_core::truncate::truncate_utf8;

use crate::approvals::{ApprovalRecord, ApprovalStatus, ApprovalStore};
use crate::audit::{new_event_id, AuditEvent, AuditSink};
use crate::config::GuardConfig;
use crate::net::{HostResolver, TokioResolver};
use crate::redact::Redactor;

const ACTION_SUMMARY_MAX_BYTES: usize = 512;

pub struct Guard {
    config: GuardConfig,
    approvals: Option<Arc<dyn ApprovalStore>>,
    audit: Option<Arc<dyn AuditSink>>,
    redactor: Redactor,
    resolver: Arc<dyn HostResolver>,
}

impl Guard {
    pub fn new(
        config: GuardConfig,
        approvals: Option<Arc<dyn ApprovalStore>>,
        audit: Option<Arc<dyn AuditSink>>,
    ) -> Self {
        let redactor = Redactor::new(&config.redaction);
        Self {
            config,
            approvals,
            audit,
            redactor,
            resolver: Arc::new(TokioResolver),
        }
    }

    /// Swap the DNS seam, used by tests to avoid real lookups.
    pub fn set_resolver(&mut self, resolver: Arc<dyn HostResolver>) {
        self.resolver = resolver;
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn has_approval_store(&self) -> bool {
        self.approvals.is_some()
    }

    pub fn redactor(&self) -> &Redactor {
        &self.redactor
    }

    /// Evaluate one action through the policy layers. The first deny wins;
    /// otherwise the highest-severity decision survives. Every evaluation
    /// emits an audit event; sink failures are logged, never fatal.
    pub async fn evaluate(
        &self,
        meta: &ActionMeta,
        action: &GuardAction,
    ) -> Result<GuardVerdict, GuardError> {
        let mut verdict = GuardVerdict::allow(RiskLevel::Low);

        if let Some(network) = self.evaluate_network(action).await {
            merge(&mut verdict, network);
        }
        if verdict.decision != GuardDecision::Deny {
            if let Some(bash) = self.evaluate_bash(action) {
                merge(&mut verdict, bash);
            }
        }
        if verdict.decision != GuardDecision::Deny {
            if let Some(redacted) = self.evaluate_content(action) {
                merge(&mut verdict, redacted);
            }
        }

        self.emit_audit(meta, action, &verdict, "", "");
        Ok(verdict)
    }

    async fn evaluate_network(&self, action: &GuardAction) -> Option<GuardVerdict> {
        if action.action_type != ActionType::ToolCallPre {
            return None;
        }
        let direct = action.url.trim();
        let url = if !direct.is_empty() {
            direct.to_string()
        } else {
            action
                .tool_params
                .as_ref()
                .and_then(|p| p.get("url"))
                .and_then(|v| v.as_str())
                .map(str::to_string)?
        };

        let policy = &self.config.network.url_fetch;
        if !net::url_allowed_by_prefixes(&url, &policy.allowed_url_prefixes) {
            return Some(deny(
                RiskLevel::High,
                format!("url is not covered by any allowed prefix: {url}"),
            ));
        }

        if policy.deny_private_ips {
            let host = url::Url::parse(&url)
                .ok()
                .and_then(|u| u.host_str().map(str::to_string))
                .unwrap_or_default();
            if let Err(reason) =
                net::check_host(&host, policy.resolve_dns, self.resolver.as_ref()).await
            {
                return Some(deny(RiskLevel::High, reason));
            }
        }

        Some(GuardVerdict::allow(RiskLevel::Low))
    }

    fn evaluate_bash(&self, action: &GuardAction) -> Option<GuardVerdict> {
        if action.action_type != ActionType::ToolCallPre || action.tool_name != "bash" {
            return None;
        }
        let command = action
            .tool_params
            .as_ref()
            .and_then(|p| p.get("command"))
            .and_then(|v| v.as_str())
            .unwrap_or_default();

        if let Some(token) = bash::first_denied_token(command, &self.config.bash.deny_tokens) {
            return Some(deny(
                RiskLevel::Critical,
                format!("bash command touches denied token '{token}'"),
            ));
        }

        if self.config.bash.require_approval {
            return Some(GuardVerdict {
                risk_level: RiskLevel::High,
                decision: GuardDecision::RequireApproval,
                reasons: vec!["bash execution requires approval".to_string()],
                redacted_content: None,
            });
        }
        Some(GuardVerdict::allow(RiskLevel::Medium))
    }

    fn evaluate_content(&self, action: &GuardAction) -> Option<GuardVerdict> {
        if action.action_type != ActionType::OutputPublish || action.content.is_empty() {
            return None;
        }
        let (redacted, changed) = self.redactor.redact(&action.content);
        if !changed {
            return Some(GuardVerdict::allow(RiskLevel::Low));
        }
        Some(GuardVerdict {
            risk_level: RiskLevel::Medium,
            decision: GuardDecision::AllowWithRedaction,
            reasons: vec!["outbound content was redacted".to_string()],
            redacted_content: Some(redacted),
        })
    }

    /// Create a durable approval record for an action the evaluation
    /// flagged `require_approval`. Returns the approval id.
    pub async fn create_approval(
        &self,
        meta: &ActionMeta,
        action: &GuardAction,
        verdict: &GuardVerdict,
        resume_state: Vec<u8>,
    ) -> Result<String, GuardError> {
        let store = self.approvals.as_ref().ok_or(GuardError::StoreMissing)?;

        let record = ApprovalRecord {
            id: String::new(),
            run_id: meta.run_id.clone(),
            created_at: meta.time,
            expires_at: meta.time,
            resolved_at: None,
            status: ApprovalStatus::Pending,
            actor: String::new(),
            comment: String::new(),
            action_type: action.action_type,
            tool_name: action.tool_name.clone(),
            action_hash: action_hash(action),
            risk_level: verdict.risk_level,
            decision: verdict.decision,
            reasons: verdict.reasons.clone(),
            action_summary_redacted: self.action_summary(action),
            resume_state,
        };
        let id = store.create(record).await?;
        self.emit_audit(meta, action, verdict, &id, ApprovalStatus::Pending.as_str());
        Ok(id)
    }

    pub async fn approval(&self, id: &str) -> Result<Option<ApprovalRecord>, GuardError> {
        let store = self.approvals.as_ref().ok_or(GuardError::StoreMissing)?;
        store.get(id).await
    }

    pub async fn resolve_approval(
        &self,
        id: &str,
        status: ApprovalStatus,
        actor: &str,
        comment: &str,
    ) -> Result<(), GuardError> {
        let store = self.approvals.as_ref().ok_or(GuardError::StoreMissing)?;
        store.resolve(id, status, actor, comment).await?;

        if let Ok(Some(record)) = store.get(id).await {
            let meta = ActionMeta {
                run_id: record.run_id.clone(),
                step: 0,
                time: Utc::now(),
            };
            let event = AuditEvent {
                event_id: new_event_id(&meta),
                run_id: record.run_id,
                ts: meta.time,
                step: 0,
                action_type: record.action_type,
                tool_name: record.tool_name,
                action_summary_redacted: record.action_summary_redacted,
                action_hash: record.action_hash,
                risk_level: record.risk_level,
                decision: record.decision,
                reasons: record.reasons,
                approval_request_id: record.id,
                approval_status: status.as_str().to_string(),
                actor: actor.trim().to_string(),
            };
            self.write_audit(event);
        }
        Ok(())
    }

    fn action_summary(&self, action: &GuardAction) -> String {
        let raw = match action.action_type {
            ActionType::OutputPublish => action.content.clone(),
            _ => {
                let params = action
                    .tool_params
                    .as_ref()
                    .map(|p| {
                        serde_json::to_string(&serde_json::Value::Object(p.clone()))
                            .unwrap_or_default()
                    })
                    .unwrap_or_default();
                format!("{}: {}", action.tool_name, params)
            }
        };
        let (redacted, _) = self.redactor.redact(&raw);
        truncate_utf8(&redacted, ACTION_SUMMARY_MAX_BYTES).to_string()
    }

    fn emit_audit(
        &self,
        meta: &ActionMeta,
        action: &GuardAction,
        verdict: &GuardVerdict,
        approval_request_id: &str,
        approval_status: &str,
    ) {
        let event = AuditEvent {
            event_id: new_event_id(meta),
            run_id: meta.run_id.clone(),
            ts: meta.time,
            step: meta.step,
            action_type: action.action_type,
            tool_name: action.tool_name.clone(),
            action_summary_redacted: self.action_summary(action),
            action_hash: action_hash(action),
            risk_level: verdict.risk_level,
            decision: verdict.decision,
            reasons: verdict.reasons.clone(),
            approval_request_id: approval_request_id.to_string(),
            approval_status: approval_status.to_string(),
            actor: String::new(),
        };
        self.write_audit(event);
    }

    fn write_audit(&self, event: AuditEvent) {
        if let Some(sink) = &self.audit {
            if let Err(err) = sink.emit(&event) {
                tracing::warn!(error = %err, "audit emit failed");
            }
        }
    }
}

fn deny(risk_level: RiskLevel, reason: String) -> GuardVerdict {
    GuardVerdict {
        risk_level,
        decision: GuardDecision::Deny,
        reasons: vec![reason],
        redacted_content: None,
    }
}

fn merge(into: &mut GuardVerdict, layer: GuardVerdict) {
    if layer.decision > into.decision {
        into.decision = layer.decision;
    }
    if risk_rank(layer.risk_level) > risk_rank(into.risk_level) {
        into.risk_level = layer.risk_level;
    }
    into.reasons.extend(layer.reasons);
    if layer.redacted_content.is_some() {
        into.redacted_content = layer.redacted_content;
    }
}

fn risk_rank(risk: RiskLevel) -> u8 {
    match risk {
        RiskLevel::Low => 0,
        RiskLevel::Medium => 1,
        RiskLevel::High => 2,
        RiskLevel::Critical => 3,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    use async_trait::async_trait;

    use crate::config::{BashConfig, NetworkConfig, UrlFetchPolicy};
    use conductor_core::tool::ToolParams;

    struct FixedResolver(Vec<IpAddr>);

    #[async_trait]
    impl HostResolver for FixedResolver {
        async fn lookup(&self, _host: &str) -> std::io::Result<Vec<IpAddr>> {
            Ok(self.0.clone())
        }
    }

    fn params(json: serde_json::Value) -> ToolParams {
        json.as_object().expect("object").clone()
    }

    fn meta() -> ActionMeta {
        ActionMeta {
            run_id: "run-test".to_string(),
            step: 1,
            time: Utc::now(),
        }
    }

    fn network_guard(prefixes: &[&str]) -> Guard {
        let mut guard = Guard::new(
            GuardConfig {
                enabled: true,
                network: NetworkConfig {
                    url_fetch: UrlFetchPolicy {
                        allowed_url_prefixes: prefixes.iter().map(|s| s.to_string()).collect(),
                        deny_private_ips: true,
                        resolve_dns: true,
                    },
                },
                ..Default::default()
            },
            None,
            None,
        );
        guard.set_resolver(Arc::new(FixedResolver(vec!["93.184.216.34"
            .parse()
            .expect("ip")])));
        guard
    }

    #[tokio::test]
    async fn metadata_address_is_denied() {
        let guard = network_guard(&["http://", "https://"]);
        let action = GuardAction::tool_call_pre(
            "url_fetch",
            params(serde_json::json!({"url": "http://169.254.169.254/latest/meta-data/"})),
        );
        let verdict = guard.evaluate(&meta(), &action).await.expect("evaluate");
        assert_eq!(verdict.decision, GuardDecision::Deny);
        assert!(verdict
            .reasons
            .iter()
            .any(|r| r.contains("private or local address")));
    }

    #[tokio::test]
    async fn hostname_resolving_private_is_denied() {
        let mut guard = network_guard(&["https://"]);
        guard.set_resolver(Arc::new(FixedResolver(vec!["127.0.0.1"
            .parse()
            .expect("ip")])));
        let action = GuardAction::tool_call_pre(
            "url_fetch",
            params(serde_json::json!({"url": "https://evil.test/metadata"})),
        );
        let verdict = guard.evaluate(&meta(), &action).await.expect("evaluate");
        assert_eq!(verdict.decision, GuardDecision::Deny);
    }

    #[tokio::test]
    async fn public_url_inside_allowlist_is_allowed() {
        let guard = network_guard(&["https://"]);
        let action = GuardAction::tool_call_pre(
            "url_fetch",
            params(serde_json::json!({"url": "https://public.example.com/api"})),
        );
        let verdict = guard.evaluate(&meta(), &action).await.expect("evaluate");
        assert_eq!(verdict.decision, GuardDecision::Allow);
    }

    #[tokio::test]
    async fn url_outside_allowlist_is_denied() {
        let guard = network_guard(&["https://api.example.com/"]);
        let action = GuardAction::tool_call_pre(
            "url_fetch",
            params(serde_json::json!({"url": "https://elsewhere.test/exfil"})),
        );
        let verdict = guard.evaluate(&meta(), &action).await.expect("evaluate");
        assert_eq!(verdict.decision, GuardDecision::Deny);
    }

    #[tokio::test]
    async fn bash_requires_approval_when_bound() {
        let guard = Guard::new(
            GuardConfig {
                enabled: true,
                bash: BashConfig {
                    require_approval: true,
                    deny_tokens: Vec::new(),
                },
                ..Default::default()
            },
            None,
            None,
        );
        let action =
            GuardAction::tool_call_pre("bash", params(serde_json::json!({"command": "ls"})));
        let verdict = guard.evaluate(&meta(), &action).await.expect("evaluate");
        assert_eq!(verdict.decision, GuardDecision::RequireApproval);
        assert_eq!(verdict.risk_level, RiskLevel::High);
    }

    #[tokio::test]
    async fn bash_deny_token_beats_require_approval() {
        let guard = Guard::new(
            GuardConfig {
                enabled: true,
                bash: BashConfig {
                    require_approval: true,
                    deny_tokens: vec!["config.yaml".to_string()],
                },
                ..Default::default()
            },
            None,
            None,
        );
        let action = GuardAction::tool_call_pre(
            "bash",
            params(serde_json::json!({"command": "cat ./config.yaml"})),
        );
        let verdict = guard.evaluate(&meta(), &action).await.expect("evaluate");
        assert_eq!(verdict.decision, GuardDecision::Deny);
        assert_eq!(verdict.risk_level, RiskLevel::Critical);
    }

    #[tokio::test]
    async fn output_publish_redacts_and_reports() {
        let guard = Guard::new(
            GuardConfig {
                enabled: true,
                ..Default::default()
            },
            None,
            None,
        );
        let action = GuardAction::output_publish("Authorization: Bearer abcdef1234567890");
        let verdict = guard.evaluate(&meta(), &action).await.expect("evaluate");
        assert_eq!(verdict.decision, GuardDecision::AllowWithRedaction);
        let redacted = verdict.redacted_content.expect("redacted content");
        assert!(redacted.contains("Bearer [redacted]"));
    }

    #[tokio::test]
    async fn unhandled_actions_default_to_allow_low() {
        let guard = Guard::new(
            GuardConfig {
                enabled: true,
                ..Default::default()
            },
            None,
            None,
        );
        let action =
            GuardAction::tool_call_pre("memory_store", params(serde_json::json!({"k": "v"})));
        let verdict = guard.evaluate(&meta(), &action).await.expect("evaluate");
        assert_eq!(verdict.decision, GuardDecision::Allow);
        assert_eq!(verdict.risk_level, RiskLevel::Low);
    }

    #[tokio::test]
    async fn create_approval_without_store_fails() {
        let guard = Guard::new(
            GuardConfig {
                enabled: true,
                ..Default::default()
            },
            None,
            None,
        );
        let action =
            GuardAction::tool_call_pre("bash", params(serde_json::json!({"command": "ls"})));
        let verdict = GuardVerdict {
            risk_level: RiskLevel::High,
            decision: GuardDecision::RequireApproval,
            reasons: vec!["bash execution requires approval".to_string()],
            redacted_content: None,
        };
        let err = guard
            .create_approval(&meta(), &action, &verdict, b"{}".to_vec())
            .await
            .expect_err("no store configured");
        assert!(matches!(err, GuardError::StoreMissing));
    }

    #[tokio::test]
    async fn create_approval_binds_the_action_hash() {
        let store = Arc::new(crate::approvals::MemoryApprovalStore::new());
        let guard = Guard::new(
            GuardConfig {
                enabled: true,
                bash: BashConfig {
                    require_approval: true,
                    deny_tokens: Vec::new(),
                },
                ..Default::default()
            },
            Some(store.clone()),
            None,
        );
        let action = GuardAction::tool_call_pre(
            "bash",
            params(serde_json::json!({"command": "make deploy"})),
        );
        let verdict = guard.evaluate(&meta(), &action).await.expect("evaluate");
        assert_eq!(verdict.decision, GuardDecision::RequireApproval);

        let id = guard
            .create_approval(&meta(), &action, &verdict, b"{\"v\":1}".to_vec())
            .await
            .expect("create");
        let record = guard.approval(&id).await.expect("get").expect("present");
        assert_eq!(record.action_hash, action_hash(&action));
        assert_eq!(record.status, ApprovalStatus::Pending);
        assert!(record.expires_at > record.created_at);
    }
}

//! Versioned resume-state snapshots: the minimal portable state an engine
//! needs to continue a run after an approval pause.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use conductor_core::context::{Metrics, Plan, RunContext, Step};
use conductor_core::error::GuardError;
use conductor_core::llm::{LlmToolCall, Message};

pub const RESUME_STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResumeStateV1 {
    #[serde(rename = "v")]
    pub version: u32,

    pub run_id: String,
    pub model: String,
    pub step: u32,

    #[serde(default)]
    pub plan_required: bool,
    #[serde(default)]
    pub parse_failures: u32,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skill_auth_profiles: Vec<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub enforce_skill_auth: bool,

    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_params: BTreeMap<String, serde_json::Value>,
    pub agent_ctx: ContextSnapshot,

    pub pending_tool: PendingToolSnapshot,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PendingToolSnapshot {
    #[serde(default)]
    pub assistant_text: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub assistant_text_added: bool,
    pub tool_call: LlmToolCall,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remaining_tool_calls: Vec<LlmToolCall>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub task: String,
    pub max_steps: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<Plan>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Metrics>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<StepSnapshot>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepSnapshot {
    #[serde(rename = "step")]
    pub step_number: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub thought: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub action: String,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub action_input: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub observation: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub duration_ms: u64,
}

fn is_zero(n: &u64) -> bool {
    *n == 0
}

pub fn snapshot_from_context(ctx: &RunContext) -> ContextSnapshot {
    ContextSnapshot {
        task: ctx.task.clone(),
        max_steps: ctx.max_steps,
        plan: ctx.plan.clone(),
        metrics: Some(ctx.metrics),
        steps: ctx
            .steps
            .iter()
            .map(|step| StepSnapshot {
                step_number: step.step_number,
                thought: step.thought.clone(),
                action: step.action.clone(),
                action_input: step.action_input.clone(),
                observation: step.observation.clone(),
                error: step.error.clone().unwrap_or_default(),
                duration_ms: step.duration.as_millis() as u64,
            })
            .collect(),
    }
}

/// Rebuild a run context from a snapshot. Errors reify as plain strings:
/// a reconstructed step error carries the original message and nothing
/// more.
pub fn context_from_snapshot(snapshot: &ContextSnapshot) -> RunContext {
    let mut ctx = RunContext::new(snapshot.task.clone(), snapshot.max_steps);
    ctx.plan = snapshot.plan.clone();
    if let Some(metrics) = snapshot.metrics {
        ctx.metrics = metrics;
    }
    for step in &snapshot.steps {
        ctx.steps.push(Step {
            step_number: step.step_number,
            thought: step.thought.clone(),
            action: step.action.clone(),
            action_input: step.action_input.clone(),
            observation: step.observation.clone(),
            error: (!step.error.is_empty()).then(|| step.error.clone()),
            duration: Duration::from_millis(step.duration_ms),
        });
    }
    ctx
}

pub fn encode_resume_state(mut state: ResumeStateV1) -> Result<Vec<u8>, GuardError> {
    state.version = RESUME_STATE_VERSION;
    serde_json::to_vec(&state).map_err(|err| GuardError::Store(err.to_string()))
}

/// Lenient decode: unknown fields are ignored, version 0 reads as v1, any
/// other version is rejected.
pub fn decode_resume_state(bytes: &[u8]) -> Result<ResumeStateV1, GuardError> {
    let state: ResumeStateV1 = serde_json::from_slice(bytes)
        .map_err(|err| GuardError::Store(format!("resume_state decode: {err}")))?;
    if state.version != 0 && state.version != RESUME_STATE_VERSION {
        return Err(GuardError::UnsupportedResumeVersion {
            version: state.version,
        });
    }
    Ok(state)
}

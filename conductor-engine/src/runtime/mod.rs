//! The engine loop: drives one task from the first model call to a final
//! answer, a budget stop, or a durable suspension behind the guard.

mod helpers;

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use conductor_core::context::{Plan, RunContext, Step};
use conductor_core::error::{ConductorError, EngineError, GuardError, ToolError};
use conductor_core::llm::{ChatRequest, ChatResult, LlmClient, LlmToolCall, Message};
use conductor_core::policy::{action_hash, ActionMeta, GuardAction, GuardDecision};
use conductor_core::tool::ToolRegistry;
use conductor_guard::approvals::ApprovalStatus;
use conductor_guard::Guard;

use crate::parser::{self, Directive};
use crate::prompt::{build_system_prompt, PromptSpec};
use crate::resume::{
    context_from_snapshot, decode_resume_state, encode_resume_state, snapshot_from_context,
    PendingToolSnapshot, ResumeStateV1,
};

pub use helpers::{should_redact_key, OBSERVATION_HARD_CAP_BYTES};

const PARSE_REMINDER: &str = concat!(
    "Your last reply could not be parsed. Reply with exactly one JSON object: ",
    "{\"type\":\"tool_call\",\"tool_call\":{\"thought\":\"...\",\"tool_name\":\"...\",",
    "\"tool_params\":{...}}} or {\"type\":\"final\",\"final\":{\"thought\":\"...\",",
    "\"output\":...}}.",
);

const PLAN_SYSTEM: &str = concat!(
    "You plan agent runs. Return ONLY JSON with keys: objective (string) and ",
    "steps (array of strings, at most 6 entries).",
);

#[derive(Debug, Clone)]
pub struct LogOptions {
    pub include_thoughts: bool,
    pub redact_keys: Vec<String>,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            include_thoughts: false,
            redact_keys: [
                "api_key",
                "authorization",
                "token",
                "secret",
                "password",
                "cookie",
                "set-cookie",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub default_model: String,
    pub default_max_steps: u32,
    pub parse_failure_budget: u32,
    pub max_observation_bytes: usize,
    pub tool_timeout: Duration,
    pub plan_required: bool,
    pub log: LogOptions,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_model: "default".to_string(),
            default_max_steps: 12,
            parse_failure_budget: 3,
            max_observation_bytes: 128 * 1024,
            tool_timeout: Duration::from_secs(120),
            plan_required: false,
            log: LogOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub model: Option<String>,
    pub max_steps: Option<u32>,
    /// Arbitrary JSON metadata injected as a user-visible message right
    /// before the task.
    pub meta: Option<serde_json::Value>,
    pub extra_params: BTreeMap<String, serde_json::Value>,
    /// Conversation context from a prior exchange, inserted after the
    /// system prompt.
    pub prior_messages: Vec<Message>,
    /// Replaces the engine's prompt spec for this run only.
    pub prompt_spec: Option<PromptSpec>,
    pub skill_auth_profiles: Vec<String>,
    pub enforce_skill_auth: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Final {
    pub thought: String,
    pub output: serde_json::Value,
}

/// The distinguished value a run returns when it has suspended into an
/// approval rather than finished or failed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingOutput {
    pub status: String,
    pub approval_request_id: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Final(Final),
    Pending(PendingOutput),
}

impl RunOutcome {
    pub fn as_pending(&self) -> Option<&PendingOutput> {
        match self {
            Self::Pending(pending) => Some(pending),
            Self::Final(_) => None,
        }
    }
}

enum Flow {
    Continue,
    Suspend(PendingOutput),
}

struct LoopState {
    run_id: String,
    model: String,
    messages: Vec<Message>,
    extra_params: BTreeMap<String, serde_json::Value>,
    parse_failures: u32,
    plan_required: bool,
    skill_auth_profiles: Vec<String>,
    enforce_skill_auth: bool,
    queued_calls: VecDeque<LlmToolCall>,
    pending: Option<PendingToolSnapshot>,
    next_step: u32,
}

pub struct Engine {
    llm: Arc<dyn LlmClient>,
    tools: Arc<ToolRegistry>,
    guard: Option<Arc<Guard>>,
    config: EngineConfig,
    prompt_spec: PromptSpec,
}

impl Engine {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        tools: Arc<ToolRegistry>,
        config: EngineConfig,
        prompt_spec: PromptSpec,
    ) -> Self {
        Self {
            llm,
            tools,
            guard: None,
            config,
            prompt_spec,
        }
    }

    pub fn with_guard(mut self, guard: Arc<Guard>) -> Self {
        self.guard = Some(guard);
        self
    }

    /// Run one task to completion, failure, or suspension.
    pub async fn run(
        &self,
        cancel: &CancellationToken,
        task: &str,
        options: RunOptions,
    ) -> Result<(RunOutcome, RunContext), ConductorError> {
        let task = task.trim();
        if task.is_empty() {
            return Err(EngineError::EmptyTask.into());
        }
        let max_steps = options.max_steps.unwrap_or(self.config.default_max_steps);
        if max_steps == 0 {
            return Err(EngineError::InvalidMaxSteps.into());
        }

        let run_id = uuid::Uuid::new_v4().to_string();
        let model = options
            .model
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| self.config.default_model.clone());

        let prompt_spec = options.prompt_spec.as_ref().unwrap_or(&self.prompt_spec);
        let mut messages =
            vec![Message::system(build_system_prompt(&self.tools, prompt_spec, task))];
        messages.extend(options.prior_messages);
        if let Some(meta) = &options.meta {
            messages.push(helpers::meta_message(meta));
        }
        messages.push(Message::user(task));

        let mut ctx = RunContext::new(task, max_steps);
        let mut state = LoopState {
            run_id,
            model,
            messages,
            extra_params: options.extra_params,
            parse_failures: 0,
            plan_required: self.config.plan_required,
            skill_auth_profiles: options.skill_auth_profiles,
            enforce_skill_auth: options.enforce_skill_auth,
            queued_calls: VecDeque::new(),
            pending: None,
            next_step: 1,
        };

        tracing::info!(run_id = %state.run_id, model = %state.model, max_steps, "run_start");

        let started = Instant::now();
        if state.plan_required {
            self.build_plan(cancel, &mut state, &mut ctx).await;
        }
        let result = self.run_loop(cancel, &mut state, &mut ctx).await;
        ctx.metrics.wall_time_ms += started.elapsed().as_millis() as u64;
        result.map(|outcome| (outcome, ctx))
    }

    /// Continue a run previously suspended into an approval record. The
    /// pending tool is treated as pre-approved for this single execution.
    pub async fn resume(
        &self,
        cancel: &CancellationToken,
        approval_request_id: &str,
    ) -> Result<(RunOutcome, RunContext), ConductorError> {
        let guard = self
            .guard
            .as_ref()
            .filter(|g| g.enabled())
            .ok_or(GuardError::NotEnabled)?;
        let id = approval_request_id.trim();
        if id.is_empty() {
            return Err(GuardError::MissingApprovalId.into());
        }

        let record = guard
            .approval(id)
            .await?
            .ok_or_else(|| GuardError::ApprovalNotFound { id: id.to_string() })?;
        if record.is_expired_at(Utc::now()) {
            return Err(GuardError::ApprovalExpired { id: id.to_string() }.into());
        }
        match record.status {
            ApprovalStatus::Approved => {}
            ApprovalStatus::Pending => {
                let ctx = decode_resume_state(&record.resume_state)
                    .map(|state| context_from_snapshot(&state.agent_ctx))
                    .unwrap_or_else(|_| RunContext::new(String::new(), 1));
                return Ok((
                    RunOutcome::Pending(PendingOutput {
                        status: "pending".to_string(),
                        approval_request_id: id.to_string(),
                        message: "Approval is not approved yet (status=pending).".to_string(),
                    }),
                    ctx,
                ));
            }
            other => {
                return Err(GuardError::NotApproved {
                    id: id.to_string(),
                    status: other.as_str().to_string(),
                }
                .into());
            }
        }
        if record.resume_state.is_empty() {
            return Err(GuardError::MissingResumeState { id: id.to_string() }.into());
        }

        let resume_state = decode_resume_state(&record.resume_state)?;

        // The approval is bound to one specific action; a pending tool that
        // hashes differently must never execute.
        let pending_action = GuardAction::tool_call_pre(
            resume_state.pending_tool.tool_call.name.clone(),
            resume_state.pending_tool.tool_call.arguments.clone(),
        );
        let expected = record.action_hash.trim();
        if !expected.is_empty() && expected != action_hash(&pending_action) {
            return Err(GuardError::ActionHashMismatch {
                expected: expected.to_string(),
            }
            .into());
        }

        let mut ctx = context_from_snapshot(&resume_state.agent_ctx);
        let mut state = LoopState {
            run_id: resume_state.run_id,
            model: resume_state.model,
            messages: resume_state.messages,
            extra_params: resume_state.extra_params,
            parse_failures: resume_state.parse_failures,
            plan_required: resume_state.plan_required,
            skill_auth_profiles: resume_state.skill_auth_profiles,
            enforce_skill_auth: resume_state.enforce_skill_auth,
            queued_calls: VecDeque::new(),
            pending: Some(resume_state.pending_tool),
            next_step: resume_state.step.max(1),
        };

        tracing::info!(
            run_id = %state.run_id,
            approval_request_id = %id,
            step = state.next_step,
            "run_resume"
        );

        let started = Instant::now();
        let result = self.run_loop(cancel, &mut state, &mut ctx).await;
        ctx.metrics.wall_time_ms += started.elapsed().as_millis() as u64;
        result.map(|outcome| (outcome, ctx))
    }

    async fn run_loop(
        &self,
        cancel: &CancellationToken,
        state: &mut LoopState,
        ctx: &mut RunContext,
    ) -> Result<RunOutcome, ConductorError> {
        loop {
            let step = state.next_step;
            if step > ctx.max_steps {
                tracing::warn!(run_id = %state.run_id, max_steps = ctx.max_steps, "max_steps_reached");
                return Err(EngineError::MaxStepsReached {
                    max_steps: ctx.max_steps,
                }
                .into());
            }

            // Pre-approved pending tool from a resume: executes exactly
            // once, bypassing a second guard evaluation.
            if let Some(pending) = state.pending.take() {
                if !pending.assistant_text_added && !pending.assistant_text.trim().is_empty() {
                    state
                        .messages
                        .push(Message::assistant(pending.assistant_text.clone()));
                }
                state.queued_calls.extend(pending.remaining_tool_calls);
                self.execute_and_record(cancel, state, ctx, step, pending.tool_call, String::new(), false)
                    .await?;
                state.next_step += 1;
                continue;
            }

            // Remainder of an earlier tool batch: one call per iteration,
            // no extra model call.
            if let Some(call) = state.queued_calls.pop_front() {
                match self
                    .dispatch_tool_call(cancel, state, ctx, step, call, String::new(), String::new())
                    .await?
                {
                    Flow::Continue => {
                        state.next_step += 1;
                        continue;
                    }
                    Flow::Suspend(pending) => return Ok(RunOutcome::Pending(pending)),
                }
            }

            let step_started = Instant::now();
            let request = ChatRequest {
                model: state.model.clone(),
                messages: state.messages.clone(),
                tools: self.tools.descriptors(),
                force_json: false,
                parameters: state.extra_params.clone(),
            };
            tracing::debug!(run_id = %state.run_id, step, messages = request.messages.len(), "llm_call");

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(EngineError::Canceled.into()),
                chat = self.llm.chat(request) => chat.map_err(ConductorError::from)?,
            };
            ctx.metrics.add_usage(result.usage);

            match self.interpret(&result) {
                Err(parse_err) => {
                    state.parse_failures += 1;
                    tracing::warn!(
                        run_id = %state.run_id,
                        step,
                        parse_failures = state.parse_failures,
                        error = %parse_err,
                        "parse_failure"
                    );
                    if state.parse_failures >= self.config.parse_failure_budget {
                        return Err(EngineError::ParseBudgetExhausted {
                            failures: state.parse_failures,
                        }
                        .into());
                    }
                    state.messages.push(Message::assistant(result.text.clone()));
                    state.messages.push(Message::user(PARSE_REMINDER));
                    state.next_step += 1;
                }
                Ok(Directive::Final { thought, output }) => {
                    if self.config.log.include_thoughts && !thought.trim().is_empty() {
                        tracing::info!(run_id = %state.run_id, step, thought = %thought, "final");
                    } else {
                        tracing::info!(run_id = %state.run_id, step, "final");
                    }
                    ctx.raw_final_answer = Some(output.clone());
                    ctx.record_step(Step {
                        step_number: step,
                        thought: thought.clone(),
                        action: String::new(),
                        action_input: Default::default(),
                        observation: String::new(),
                        error: None,
                        duration: step_started.elapsed(),
                    });
                    return Ok(RunOutcome::Final(Final { thought, output }));
                }
                Ok(Directive::ToolCall { thought, call }) => {
                    let mut assistant = Message::assistant(result.text.clone());
                    assistant.tool_calls = result.tool_calls.clone();
                    state.messages.push(assistant);

                    let mut batch = if result.tool_calls.is_empty() {
                        vec![call]
                    } else {
                        result.tool_calls.clone()
                    };
                    let focal = batch.remove(0);
                    state.queued_calls.extend(batch);

                    match self
                        .dispatch_tool_call(
                            cancel,
                            state,
                            ctx,
                            step,
                            focal,
                            thought,
                            result.text.clone(),
                        )
                        .await?
                    {
                        Flow::Continue => state.next_step += 1,
                        Flow::Suspend(pending) => return Ok(RunOutcome::Pending(pending)),
                    }
                }
            }
        }
    }

    /// Collapse the native tool-call channel and the JSON-over-text shape
    /// into one directive.
    fn interpret(&self, result: &ChatResult) -> Result<Directive, parser::ParseError> {
        if let Some(first) = result.tool_calls.first() {
            return Ok(Directive::ToolCall {
                thought: String::new(),
                call: first.clone(),
            });
        }
        parser::parse_directive(&result.text)
    }

    /// Guard-check one tool call, then execute or suspend.
    #[allow(clippy::too_many_arguments)]
    async fn dispatch_tool_call(
        &self,
        cancel: &CancellationToken,
        state: &mut LoopState,
        ctx: &mut RunContext,
        step: u32,
        call: LlmToolCall,
        thought: String,
        assistant_text: String,
    ) -> Result<Flow, ConductorError> {
        if self.config.log.include_thoughts && !thought.trim().is_empty() {
            tracing::info!(run_id = %state.run_id, step, thought = %thought, "tool_thought");
        }
        tracing::info!(
            run_id = %state.run_id,
            step,
            tool = %call.name,
            params = %helpers::params_for_log(&call.arguments, &self.config.log.redact_keys),
            "tool_call"
        );

        let mut redact_observation = false;
        if let Some(guard) = self.guard.as_ref().filter(|g| g.enabled()) {
            let action = GuardAction::tool_call_pre(call.name.clone(), call.arguments.clone());
            let meta = ActionMeta {
                run_id: state.run_id.clone(),
                step,
                time: Utc::now(),
            };
            let verdict = guard.evaluate(&meta, &action).await?;
            match verdict.decision {
                GuardDecision::Deny => {
                    let step_started = Instant::now();
                    let observation =
                        format!("Denied by policy: {}", verdict.reasons.join("; "));
                    let (message, observation) = helpers::tool_result_message(
                        &call,
                        &observation,
                        self.config.max_observation_bytes,
                    );
                    state.messages.push(message);
                    ctx.record_step(Step {
                        step_number: step,
                        thought,
                        action: call.name.clone(),
                        action_input: call.arguments.clone(),
                        observation,
                        error: Some("denied by policy".to_string()),
                        duration: step_started.elapsed(),
                    });
                    tracing::info!(run_id = %state.run_id, step, tool = %call.name, "tool_denied");
                    return Ok(Flow::Continue);
                }
                GuardDecision::RequireApproval => {
                    if !guard.has_approval_store() {
                        return Err(GuardError::StoreMissing.into());
                    }
                    let pending_tool = PendingToolSnapshot {
                        assistant_text,
                        assistant_text_added: true,
                        tool_call: call.clone(),
                        remaining_tool_calls: state.queued_calls.drain(..).collect(),
                    };
                    let resume_state = ResumeStateV1 {
                        version: 1,
                        run_id: state.run_id.clone(),
                        model: state.model.clone(),
                        step,
                        plan_required: state.plan_required,
                        parse_failures: state.parse_failures,
                        skill_auth_profiles: state.skill_auth_profiles.clone(),
                        enforce_skill_auth: state.enforce_skill_auth,
                        messages: state.messages.clone(),
                        extra_params: state.extra_params.clone(),
                        agent_ctx: snapshot_from_context(ctx),
                        pending_tool,
                    };
                    let encoded = encode_resume_state(resume_state)?;
                    let approval_request_id =
                        guard.create_approval(&meta, &action, &verdict, encoded).await?;
                    tracing::info!(
                        run_id = %state.run_id,
                        step,
                        tool = %call.name,
                        approval_request_id = %approval_request_id,
                        "run_suspended"
                    );
                    return Ok(Flow::Suspend(PendingOutput {
                        status: "pending".to_string(),
                        approval_request_id,
                        message: format!("Approval required for tool '{}'.", call.name),
                    }));
                }
                GuardDecision::AllowWithRedaction => redact_observation = true,
                GuardDecision::Allow => {}
            }
        }

        self.execute_and_record(cancel, state, ctx, step, call, thought, redact_observation)
            .await?;
        Ok(Flow::Continue)
    }

    /// Execute a tool, truncate the observation, append the tool-result
    /// message and record the step. Tool failures become observations;
    /// they never fail the run.
    #[allow(clippy::too_many_arguments)]
    async fn execute_and_record(
        &self,
        cancel: &CancellationToken,
        state: &mut LoopState,
        ctx: &mut RunContext,
        step: u32,
        call: LlmToolCall,
        thought: String,
        redact_observation: bool,
    ) -> Result<(), ConductorError> {
        let step_started = Instant::now();
        let (raw_observation, error) = self.execute_tool(cancel, &call).await?;

        let raw_observation = if redact_observation {
            match self.guard.as_ref() {
                Some(guard) => guard.redactor().redact(&raw_observation).0,
                None => raw_observation,
            }
        } else {
            raw_observation
        };

        let (message, observation) = helpers::tool_result_message(
            &call,
            &raw_observation,
            self.config.max_observation_bytes,
        );
        state.messages.push(message);

        tracing::debug!(
            run_id = %state.run_id,
            step,
            tool = %call.name,
            bytes = observation.len(),
            error = error.as_deref().unwrap_or(""),
            "tool_result"
        );

        ctx.record_step(Step {
            step_number: step,
            thought,
            action: call.name.clone(),
            action_input: call.arguments.clone(),
            observation,
            error,
            duration: step_started.elapsed(),
        });
        Ok(())
    }

    /// Run the tool with its local timeout under the run's cancellation
    /// token. Returns (observation, step error).
    async fn execute_tool(
        &self,
        cancel: &CancellationToken,
        call: &LlmToolCall,
    ) -> Result<(String, Option<String>), ConductorError> {
        let Some(tool) = self.tools.get(&call.name) else {
            let err = ToolError::NotFound {
                name: call.name.clone(),
            };
            return Ok((format!("Error: {err}"), Some(err.to_string())));
        };

        let execution = tool.execute(cancel, &call.arguments);
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(EngineError::Canceled.into()),
            res = tokio::time::timeout(self.config.tool_timeout, execution) => res,
        };
        match outcome {
            Err(_) => {
                let err = ToolError::Timeout {
                    name: call.name.clone(),
                    elapsed: self.config.tool_timeout,
                };
                Ok((format!("Error: {err}"), Some(err.to_string())))
            }
            Ok(Err(err)) => Ok((format!("Error: {err}"), Some(err.to_string()))),
            Ok(Ok(output)) => Ok((output, None)),
        }
    }

    /// Pre-planning call. Failure to plan never fails the run.
    async fn build_plan(
        &self,
        cancel: &CancellationToken,
        state: &mut LoopState,
        ctx: &mut RunContext,
    ) {
        let request = ChatRequest {
            model: state.model.clone(),
            messages: vec![Message::system(PLAN_SYSTEM), Message::user(ctx.task.clone())],
            tools: Vec::new(),
            force_json: true,
            parameters: [
                ("max_tokens".to_string(), serde_json::json!(400)),
                ("temperature".to_string(), serde_json::json!(0)),
            ]
            .into_iter()
            .collect(),
        };

        let result = tokio::select! {
            _ = cancel.cancelled() => return,
            chat = self.llm.chat(request) => chat,
        };
        let result = match result {
            Ok(result) => result,
            Err(err) => {
                tracing::warn!(run_id = %state.run_id, error = %err, "plan_failed");
                return;
            }
        };
        ctx.metrics.add_usage(result.usage);

        let plan = parser::find_json_payload(&result.text)
            .ok()
            .and_then(|payload| serde_json::from_value::<Plan>(payload).ok());
        match plan {
            Some(plan) => {
                let rendered = serde_json::to_string(&plan).unwrap_or_default();
                state
                    .messages
                    .push(Message::user(format!("Plan (JSON):\n{rendered}")));
                ctx.plan = Some(plan);
            }
            None => {
                tracing::warn!(run_id = %state.run_id, "plan_reply_not_json");
            }
        }
    }
}

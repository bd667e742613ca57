use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::llm::Usage;

/// Plan produced by the optional pre-planning LLM call. Set at most once
/// per run, before the first loop iteration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Plan {
    #[serde(default)]
    pub objective: String,
    #[serde(default)]
    pub steps: Vec<String>,
}

/// One loop iteration: at most one LLM call, at most one tool call, one
/// observation record.
#[derive(Debug, Clone, Default)]
pub struct Step {
    pub step_number: u32,
    pub thought: String,
    /// Tool name, or empty for the final answer.
    pub action: String,
    pub action_input: serde_json::Map<String, serde_json::Value>,
    /// Tool output, already truncated to the observation byte cap.
    pub observation: String,
    pub error: Option<String>,
    pub duration: Duration,
}

/// Aggregated usage across a run.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Metrics {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub total_cost: f64,
    #[serde(default)]
    pub wall_time_ms: u64,
}

impl Metrics {
    /// Fold one call's usage in. Backends may report `total_tokens` as
    /// zero; falling back to input+output keeps the total monotonic.
    pub fn add_usage(&mut self, usage: Usage) {
        self.input_tokens += usage.input_tokens;
        self.output_tokens += usage.output_tokens;
        self.total_tokens += usage
            .total_tokens
            .max(usage.input_tokens + usage.output_tokens);
        if usage.cost > 0.0 {
            self.total_cost += usage.cost;
        }
    }
}

/// Per-run mutable state. Created by the engine at run start, mutated only
/// by the engine, and either discarded at run end or snapshotted into an
/// approval record on suspension.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub task: String,
    pub max_steps: u32,
    pub plan: Option<Plan>,
    pub steps: Vec<Step>,
    pub metrics: Metrics,
    /// The final `output` value exactly as the model returned it.
    pub raw_final_answer: Option<serde_json::Value>,
}

impl RunContext {
    pub fn new(task: impl Into<String>, max_steps: u32) -> Self {
        Self {
            task: task.into(),
            max_steps,
            plan: None,
            steps: Vec::new(),
            metrics: Metrics::default(),
            raw_final_answer: None,
        }
    }

    pub fn record_step(&mut self, step: Step) {
        self.steps.push(step);
    }
}

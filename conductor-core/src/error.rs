use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConductorError {
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("guard error: {0}")]
    Guard(#[from] GuardError),

    #[error("infra error: {0}")]
    Infra(#[from] InfraError),
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("task is empty")]
    EmptyTask,

    #[error("max_steps must be positive")]
    InvalidMaxSteps,

    #[error("max steps reached ({max_steps})")]
    MaxStepsReached { max_steps: u32 },

    #[error("parse failure budget exhausted after {failures} unparseable replies")]
    ParseBudgetExhausted { failures: u32 },

    #[error("run canceled")]
    Canceled,
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("transport failure: {reason}")]
    Transport { reason: String },

    #[error("invalid LLM response: {reason}")]
    InvalidResponse { reason: String },
}

#[derive(Debug, thiserror::Error, serde::Serialize, serde::Deserialize)]
pub enum ToolError {
    #[error("tool not found: {name}")]
    NotFound { name: String },

    #[error("tool {name} execution failed: {message}")]
    ExecutionFailed { name: String, message: String },

    #[error("tool {name} timed out after {elapsed:?}")]
    Timeout { name: String, elapsed: Duration },

    #[error("tool {name} canceled")]
    Canceled { name: String },
}

#[derive(Debug, thiserror::Error)]
pub enum GuardError {
    #[error("guard is not enabled")]
    NotEnabled,

    #[error("missing approval_request_id")]
    MissingApprovalId,

    #[error("approval not found: {id}")]
    ApprovalNotFound { id: String },

    #[error("approval is expired: {id}")]
    ApprovalExpired { id: String },

    #[error("approval {id} has no resume_state")]
    MissingResumeState { id: String },

    #[error("unsupported resume_state version: {version}")]
    UnsupportedResumeVersion { version: u32 },

    #[error("approval action_hash mismatch (expected {expected})")]
    ActionHashMismatch { expected: String },

    #[error("approval {id} is already resolved ({status})")]
    AlreadyResolved { id: String, status: String },

    #[error("approval {id} is not approved (status={status})")]
    NotApproved { id: String, status: String },

    #[error("approval store is not configured")]
    StoreMissing,

    #[error("approval store failure: {0}")]
    Store(String),
}

#[derive(Debug, thiserror::Error)]
pub enum InfraError {
    #[error("database error: {0}")]
    Database(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("queue is full")]
    QueueFull,

    #[error("store is closed")]
    StoreClosed,
}

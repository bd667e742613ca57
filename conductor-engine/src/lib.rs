//! Engine loop for conductor: prompt assembly, directive parsing with
//! repair, guarded tool dispatch, and approval-bound suspend/resume.

pub mod intent;
pub mod parser;
pub mod prompt;
pub mod resume;
pub mod runtime;

pub use prompt::PromptSpec;
pub use runtime::{
    Engine, EngineConfig, Final, LogOptions, PendingOutput, RunOptions, RunOutcome,
};

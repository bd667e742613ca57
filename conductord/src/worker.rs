//! Worker dispatch loop: pulls queued tasks, runs or resumes them through
//! the engine, and records terminal state on the store.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;

use conductor_core::error::{ConductorError, EngineError};
use conductor_core::task::TaskStatus;
use conductor_engine::{Engine, RunOptions, RunOutcome};

use crate::store::{Dispatch, TaskStore};

pub struct Worker {
    store: TaskStore,
    engine: Arc<Engine>,
}

impl Worker {
    pub fn new(store: TaskStore, engine: Arc<Engine>) -> Self {
        Self { store, engine }
    }

    /// Run until the store closes.
    pub async fn run(self) {
        while let Some(dispatch) = self.store.next().await {
            self.process(dispatch).await;
        }
        tracing::info!("worker exiting: store closed");
    }

    async fn process(&self, dispatch: Dispatch) {
        let remaining = dispatch.deadline.saturating_duration_since(Instant::now());

        let result = match &dispatch.resume_approval_id {
            Some(approval_id) => {
                tracing::info!(task_id = %dispatch.id, approval_request_id = %approval_id, "task_resume");
                self.store.update(&dispatch.id, |info| {
                    info.status = TaskStatus::Running;
                    info.resumed_at = Some(Utc::now());
                });
                tokio::time::timeout(
                    remaining,
                    self.engine.resume(&dispatch.cancel, approval_id),
                )
                .await
            }
            None => {
                tracing::info!(task_id = %dispatch.id, model = %dispatch.model, "task_start");
                self.store.update(&dispatch.id, |info| {
                    info.status = TaskStatus::Running;
                    info.started_at = Some(Utc::now());
                });
                let options = RunOptions {
                    model: Some(dispatch.model.clone()),
                    meta: Some(serde_json::json!({
                        "trigger": "daemon",
                        "task_id": dispatch.id,
                    })),
                    ..Default::default()
                };
                tokio::time::timeout(
                    remaining,
                    self.engine.run(&dispatch.cancel, &dispatch.task, options),
                )
                .await
            }
        };

        let now = Utc::now();
        match result {
            Err(_) => {
                dispatch.cancel.cancel();
                tracing::warn!(task_id = %dispatch.id, "task_timeout");
                self.store.update(&dispatch.id, |info| {
                    info.status = TaskStatus::Failed;
                    info.error = Some("task timeout exceeded".to_string());
                    info.finished_at = Some(now);
                });
            }
            Ok(Err(err)) => {
                let canceled = matches!(
                    err,
                    ConductorError::Engine(EngineError::Canceled)
                );
                let status = if canceled {
                    TaskStatus::Canceled
                } else {
                    TaskStatus::Failed
                };
                tracing::warn!(task_id = %dispatch.id, error = %err, canceled, "task_failed");
                self.store.update(&dispatch.id, |info| {
                    info.status = status;
                    info.error = Some(err.to_string());
                    info.finished_at = Some(now);
                });
            }
            Ok(Ok((RunOutcome::Pending(pending), ctx))) => {
                tracing::info!(
                    task_id = %dispatch.id,
                    approval_request_id = %pending.approval_request_id,
                    steps = ctx.steps.len(),
                    "task_pending"
                );
                self.store.update(&dispatch.id, |info| {
                    info.status = TaskStatus::Pending;
                    info.pending_at = Some(now);
                    info.approval_request_id = Some(pending.approval_request_id.clone());
                });
            }
            Ok(Ok((RunOutcome::Final(final_answer), ctx))) => {
                tracing::info!(
                    task_id = %dispatch.id,
                    steps = ctx.steps.len(),
                    total_tokens = ctx.metrics.total_tokens,
                    wall_time_ms = ctx.metrics.wall_time_ms,
                    "task_done"
                );
                self.store.update(&dispatch.id, |info| {
                    info.status = TaskStatus::Done;
                    info.result = Some(final_answer.output.clone());
                    info.finished_at = Some(now);
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use conductor_core::llm::{ChatResult, MockLlmClient};
    use conductor_core::tool::ToolRegistry;
    use conductor_engine::{EngineConfig, PromptSpec};

    fn final_reply(output: &str) -> ChatResult {
        ChatResult {
            text: serde_json::json!({
                "type": "final",
                "final": {"thought": "t", "output": output},
            })
            .to_string(),
            ..Default::default()
        }
    }

    fn test_engine(replies: Vec<ChatResult>) -> Arc<Engine> {
        Arc::new(Engine::new(
            Arc::new(MockLlmClient::new(replies)),
            Arc::new(ToolRegistry::new()),
            EngineConfig::default(),
            PromptSpec::default(),
        ))
    }

    fn test_store() -> TaskStore {
        TaskStore::new(
            8,
            "test-model",
            Duration::from_secs(30),
            Duration::from_secs(1800),
        )
    }

    #[tokio::test]
    async fn worker_runs_a_task_to_done() {
        let store = test_store();
        let engine = test_engine(vec![final_reply("pong")]);
        let info = store.enqueue("ping", None, None).expect("enqueue");

        let worker = Worker::new(store.clone(), engine);
        let dispatch = store.next().await.expect("dispatch");
        worker.process(dispatch).await;

        let done = store.get(&info.id).expect("info");
        assert_eq!(done.status, TaskStatus::Done);
        assert_eq!(done.result, Some(serde_json::json!("pong")));
        assert!(done.started_at.is_some());
        assert!(done.finished_at.is_some());
        assert!(done.error.is_none());
    }

    #[tokio::test]
    async fn worker_records_engine_failure_as_failed() {
        let store = test_store();
        // An unparseable reply for every call exhausts the parse budget.
        let bad = || ChatResult {
            text: "not json".to_string(),
            ..Default::default()
        };
        let engine = test_engine(vec![bad(), bad(), bad()]);
        let info = store.enqueue("task", None, None).expect("enqueue");

        let worker = Worker::new(store.clone(), engine);
        let dispatch = store.next().await.expect("dispatch");
        worker.process(dispatch).await;

        let failed = store.get(&info.id).expect("info");
        assert_eq!(failed.status, TaskStatus::Failed);
        let error = failed.error.expect("error message");
        assert!(error.contains("parse failure budget"), "got: {error}");
        assert!(failed.finished_at.is_some());
        assert!(failed.result.is_none(), "failed tasks carry no partial result");
    }

    #[tokio::test]
    async fn worker_records_cancellation_as_canceled() {
        let store = test_store();
        let engine = test_engine(vec![]);
        let info = store.enqueue("task", None, None).expect("enqueue");

        let dispatch = store.next().await.expect("dispatch");
        dispatch.cancel.cancel();
        Worker::new(store.clone(), engine).process(dispatch).await;

        let canceled = store.get(&info.id).expect("info");
        assert_eq!(canceled.status, TaskStatus::Canceled);
    }
}

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use conductor_core::error::InfraError;
use conductor_core::task::{SubmitTaskRequest, SubmitTaskResponse};
use conductor_guard::approvals::ApprovalStatus;
use conductor_guard::Guard;

use crate::store::TaskStore;

/// Shared application state accessible by all admin API handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: TaskStore,
    pub guard: Arc<Guard>,
    pub start_time: Instant,
}

/// Build the admin API axum router.
pub fn admin_router(state: AppState) -> Router {
    Router::new()
        .route("/admin/health", get(health))
        .route("/admin/tasks", post(submit_task))
        .route("/admin/tasks/{id}", get(get_task))
        .route("/admin/approvals/{id}/resolve", post(resolve_approval))
        .route("/admin/approvals/{id}/resume", post(resume_approval))
        .route("/admin/approvals/{id}/fail", post(fail_approval))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_secs: u64,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

async fn submit_task(
    State(state): State<AppState>,
    Json(req): Json<SubmitTaskRequest>,
) -> impl IntoResponse {
    if req.task.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "task must not be empty" })),
        )
            .into_response();
    }

    let timeout = req.timeout_secs.filter(|t| *t > 0).map(Duration::from_secs);
    match state.store.enqueue(req.task, req.model, timeout) {
        Ok(info) => {
            tracing::info!(task_id = %info.id, "task submitted");
            (
                StatusCode::ACCEPTED,
                Json(SubmitTaskResponse {
                    id: info.id,
                    status: info.status,
                }),
            )
                .into_response()
        }
        Err(err @ InfraError::QueueFull) => (
            StatusCode::TOO_MANY_REQUESTS,
            Json(serde_json::json!({ "error": err.to_string() })),
        )
            .into_response(),
        Err(err) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "error": err.to_string() })),
        )
            .into_response(),
    }
}

async fn get_task(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.store.get(&id) {
        Some(info) => (StatusCode::OK, Json(serde_json::to_value(info).unwrap_or_default()))
            .into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("task '{id}' not found") })),
        )
            .into_response(),
    }
}

// ---------------------------------------------------------------------------
// Approvals
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct ResolveApprovalRequest {
    status: String,
    #[serde(default)]
    actor: String,
    #[serde(default)]
    comment: String,
}

async fn resolve_approval(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ResolveApprovalRequest>,
) -> impl IntoResponse {
    let status = match req.status.as_str() {
        "approved" => ApprovalStatus::Approved,
        "denied" => ApprovalStatus::Denied,
        other => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({
                    "error": format!("status must be 'approved' or 'denied', got '{other}'"),
                })),
            )
                .into_response();
        }
    };

    match state
        .guard
        .resolve_approval(&id, status, &req.actor, &req.comment)
        .await
    {
        Ok(()) => {
            tracing::info!(approval_request_id = %id, status = %req.status, "approval resolved");
            Json(serde_json::json!({ "approval_request_id": id, "status": req.status }))
                .into_response()
        }
        Err(err) => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({ "error": err.to_string() })),
        )
            .into_response(),
    }
}

async fn resume_approval(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.store.enqueue_resume_by_approval_id(&id) {
        Ok(task_id) => {
            tracing::info!(approval_request_id = %id, task_id = %task_id, "resume enqueued");
            (
                StatusCode::ACCEPTED,
                Json(serde_json::json!({ "task_id": task_id })),
            )
                .into_response()
        }
        Err(err @ InfraError::QueueFull) => (
            StatusCode::TOO_MANY_REQUESTS,
            Json(serde_json::json!({ "error": err.to_string() })),
        )
            .into_response(),
        Err(err) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": err.to_string() })),
        )
            .into_response(),
    }
}

#[derive(Deserialize, Default)]
struct FailApprovalRequest {
    #[serde(default)]
    error: String,
}

async fn fail_approval(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<FailApprovalRequest>>,
) -> impl IntoResponse {
    let message = body
        .map(|Json(req)| req.error)
        .filter(|e| !e.trim().is_empty())
        .unwrap_or_else(|| "canceled by operator".to_string());

    match state.store.fail_pending_by_approval_id(&id, &message) {
        Some(task_id) => {
            tracing::info!(approval_request_id = %id, task_id = %task_id, "pending task failed");
            Json(serde_json::json!({ "task_id": task_id, "ok": true })).into_response()
        }
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "task_id": serde_json::Value::Null, "ok": false })),
        )
            .into_response(),
    }
}

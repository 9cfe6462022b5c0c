//! Minimal HTTP contract for driving the state machine.
//!
//! Just enough surface to create tasks, poll or stream status, resume the
//! review gate, cancel, and retry failed content. Handlers return quickly;
//! graph traversal runs in spawned tasks and long-lived observation goes
//! through the SSE stream (history replay + live events).

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;

use crate::dispatch::TaskDispatcher;
use crate::engine::{AdvanceOutcome, EngineError, WorkflowEngine};
use crate::reconcile::StaleTaskReconciler;
use crate::review::{HumanReviewGate, ReviewDecision};
use crate::types::ContentType;

/// Shared handler state.
pub struct AppState {
    pub engine: Arc<WorkflowEngine>,
    pub gate: HumanReviewGate,
    pub dispatcher: Arc<TaskDispatcher>,
    pub reconciler: Arc<StaleTaskReconciler>,
}

/// Build the API router over the orchestration core.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/tasks", post(create_task))
        .route("/tasks/{id}/status", get(task_status))
        .route("/tasks/{id}/status-check", get(status_check))
        .route("/tasks/{id}/approve", post(approve))
        .route("/tasks/{id}/cancel", post(cancel))
        .route("/tasks/{id}/events", get(events))
        .route("/concepts/{concept_id}/retry/{content_type}", post(retry_content))
        .with_state(state)
}

struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        let status = match &err {
            EngineError::TaskNotFound { .. } => StatusCode::NOT_FOUND,
            EngineError::NotAwaitingReview { .. } | EngineError::NotCancellable { .. } => {
                StatusCode::CONFLICT
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

#[derive(Deserialize)]
struct CreateTaskBody {
    goal: String,
    roadmap_id: Option<String>,
}

#[derive(Serialize)]
struct CreateTaskResponse {
    task_id: String,
    roadmap_id: String,
}

async fn create_task(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateTaskBody>,
) -> Result<(StatusCode, Json<CreateTaskResponse>), ApiError> {
    let roadmap_id = body
        .roadmap_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let task = state.engine.create_task(&roadmap_id, &body.goal).await?;

    let engine = state.engine.clone();
    let task_id = task.task_id.clone();
    tokio::spawn(async move {
        if let Err(e) = engine.run_to_suspension(&task_id).await {
            tracing::error!(task = %task_id, error = %e, "background traversal failed");
        }
    });

    Ok((
        StatusCode::CREATED,
        Json(CreateTaskResponse {
            task_id: task.task_id,
            roadmap_id,
        }),
    ))
}

#[derive(Serialize)]
struct StatusResponse {
    status: String,
    current_step: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_message: Option<String>,
}

async fn task_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<StatusResponse>, ApiError> {
    let task = state
        .engine
        .registry()
        .get_task(&id)
        .await
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, format!("task not found: {id}")))?;
    Ok(Json(StatusResponse {
        status: task.status.encode().to_string(),
        current_step: task.current_step,
        error_message: task.error_message,
    }))
}

async fn status_check(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<crate::reconcile::StatusCheckReport>, ApiError> {
    state
        .reconciler
        .check_task(&id)
        .await
        .map(Json)
        .map_err(|e| match e {
            crate::reconcile::ReconcileError::TaskNotFound { task_id } => {
                ApiError::new(StatusCode::NOT_FOUND, format!("task not found: {task_id}"))
            }
            other => ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
        })
}

#[derive(Deserialize)]
struct ApproveBody {
    approved: bool,
    feedback: Option<String>,
}

#[derive(Serialize)]
struct ApproveResponse {
    resumed: bool,
    outcome: String,
}

async fn approve(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<ApproveBody>,
) -> Result<Json<ApproveResponse>, ApiError> {
    let decision = ReviewDecision {
        approved: body.approved,
        feedback: body.feedback,
    };
    let outcome = state.gate.approve(&id, decision).await?;

    let label = match &outcome {
        AdvanceOutcome::Dispatched { units } => format!("dispatched {units} units"),
        AdvanceOutcome::Advanced { next, .. } => {
            // Rejection re-enters the edit loop; drive it in the background.
            let engine = state.engine.clone();
            let task_id = id.clone();
            tokio::spawn(async move {
                if let Err(e) = engine.run_to_suspension(&task_id).await {
                    tracing::error!(task = %task_id, error = %e, "post-review traversal failed");
                }
            });
            format!("resumed at {next}")
        }
        other => format!("{other:?}"),
    };
    Ok(Json(ApproveResponse {
        resumed: true,
        outcome: label,
    }))
}

async fn cancel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.engine.cancel(&id).await?;
    Ok(StatusCode::OK)
}

#[derive(Serialize)]
struct RetryResponse {
    task_id: String,
    unit_id: String,
}

async fn retry_content(
    State(state): State<Arc<AppState>>,
    Path((concept_id, content_type)): Path<(String, String)>,
) -> Result<(StatusCode, Json<RetryResponse>), ApiError> {
    let content_type = ContentType::decode(&content_type).ok_or_else(|| {
        ApiError::new(
            StatusCode::BAD_REQUEST,
            format!("unknown content type: {content_type}"),
        )
    })?;
    let (task, unit) = state
        .dispatcher
        .retry_content(&concept_id, content_type)
        .await
        .map_err(|e| match e {
            crate::dispatch::DispatchError::NothingToRetry { reason } => {
                ApiError::new(StatusCode::CONFLICT, reason)
            }
            other => ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
        })?;
    Ok((
        StatusCode::CREATED,
        Json(RetryResponse {
            task_id: task.task_id,
            unit_id: unit.unit_id,
        }),
    ))
}

async fn events(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Sse<impl futures_util::Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let registry = state.engine.registry().clone();
    let (history, live) = state
        .engine
        .bus()
        .subscribe_with_history(&id, registry.as_ref())
        .await
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    let stream = futures_util::stream::iter(history)
        .chain(live.into_async_stream())
        .map(|event| {
            let sse = SseEvent::default()
                .json_data(&event)
                .unwrap_or_else(|_| SseEvent::default().data("serialization error"));
            Ok(sse)
        });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

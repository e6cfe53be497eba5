//! REST API handlers for the pipeline trigger surface.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};
use tracing::info;

use convoy_pipeline::PipelineError;
use convoy_state::TriggerEvent;

use crate::ApiState;
use crate::handlers::{ApiResponse, error_response};

/// "New revision available" body.
#[derive(Debug, Deserialize)]
pub struct RevisionRequest {
    /// Source repository reference.
    pub repository: String,
    /// Commit sha or tag.
    pub reference: String,
}

#[derive(Debug, Serialize)]
pub struct RunAccepted {
    pub run_id: String,
    pub service_id: String,
}

/// POST /api/v1/services/{id}/revisions
pub async fn new_revision(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<RevisionRequest>,
) -> impl IntoResponse {
    if req.reference.trim().is_empty() {
        return error_response("reference must not be empty", StatusCode::BAD_REQUEST)
            .into_response();
    }
    let trigger = TriggerEvent {
        repository: req.repository,
        reference: req.reference.trim().to_string(),
    };
    match state.orchestrator.submit(&id, trigger).await {
        Ok(ticket) => {
            info!(service = %id, run = %ticket.run_id, "revision trigger accepted");
            (
                StatusCode::ACCEPTED,
                ApiResponse::ok(RunAccepted {
                    run_id: ticket.run_id,
                    service_id: id,
                }),
            )
                .into_response()
        }
        Err(PipelineError::UnknownService(_)) => {
            error_response("service not found", StatusCode::NOT_FOUND).into_response()
        }
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

/// POST /api/v1/services/{id}/abort
pub async fn abort_run(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.store.get_service_spec(&id) {
        Ok(Some(_)) => {}
        Ok(None) => {
            return error_response("service not found", StatusCode::NOT_FOUND).into_response();
        }
        Err(e) => {
            return error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
                .into_response();
        }
    }
    match state.orchestrator.abort(&id).await {
        Some(run_id) => ApiResponse::ok(serde_json::json!({
            "service_id": id,
            "run_id": run_id,
            "status": "abort requested"
        }))
        .into_response(),
        None => error_response("no run in progress", StatusCode::CONFLICT).into_response(),
    }
}

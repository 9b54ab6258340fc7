use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use batchflow_infra::{CompletionError, OrchestratorError, StoreError};

pub fn orchestrator_error_to_response(err: OrchestratorError) -> axum::response::Response {
    match err {
        OrchestratorError::RunAlreadyActive(parameter) => json_error(
            StatusCode::CONFLICT,
            "run_already_active",
            format!("a run is already active for parameter '{parameter}'"),
        ),
        OrchestratorError::NotFound(run_id) => {
            json_error(StatusCode::NOT_FOUND, "not_found", format!("run {run_id} not found"))
        }
        e @ OrchestratorError::AlreadyTerminal { .. } => {
            json_error(StatusCode::CONFLICT, "already_terminal", e.to_string())
        }
        OrchestratorError::Transition(e) => {
            json_error(StatusCode::CONFLICT, "invalid_transition", e.to_string())
        }
        OrchestratorError::Store(e) => store_error_to_response(e),
    }
}

pub fn completion_error_to_response(err: CompletionError) -> axum::response::Response {
    match err {
        CompletionError::Store(e) => store_error_to_response(e),
        CompletionError::QueueClosed => json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "shutting_down",
            "resume queue is closed",
        ),
    }
}

fn store_error_to_response(err: StoreError) -> axum::response::Response {
    match err {
        StoreError::Conflict(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
        StoreError::RunAlreadyActive(parameter) => json_error(
            StatusCode::CONFLICT,
            "run_already_active",
            format!("a run is already active for parameter '{parameter}'"),
        ),
        StoreError::NotFound(msg) => json_error(StatusCode::NOT_FOUND, "not_found", msg),
        StoreError::TokenNotFound => {
            json_error(StatusCode::NOT_FOUND, "not_found", "suspension token not found")
        }
        StoreError::Storage(msg) => {
            tracing::error!(error = %msg, "storage failure");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", msg)
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

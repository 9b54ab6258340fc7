use std::sync::Arc;

use axum::{Json, extract::Extension, http::StatusCode, response::IntoResponse};
use serde_json::json;

use batchflow_infra::CompletionAck;

use crate::app::dto::CompletionRequest;
use crate::app::errors;
use crate::app::services::AppServices;

/// Completion webhook of the inference service.
///
/// Known jobs always answer 200, including redeliveries for finished runs.
/// Ids never recorded (or purged past retention) answer 404 so the sender
/// redelivers; a launch may still be recording its job when a fast
/// completion arrives.
pub async fn notify_completion(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<CompletionRequest>,
) -> axum::response::Response {
    let job_id = match body.job_id() {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let completion = match body.completion() {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    if let Some(records) = body.records {
        tracing::debug!(job_id = %job_id, records, "job reported record count");
    }

    match services.listener.notify_completion(&job_id, completion).await {
        Ok(CompletionAck::Unknown) => errors::json_error(
            StatusCode::NOT_FOUND,
            "unknown_job",
            format!("no job recorded with id '{job_id}'"),
        ),
        Ok(ack) => (StatusCode::OK, Json(json!({ "ack": ack }))).into_response(),
        Err(e) => errors::completion_error_to_response(e),
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use axum::http::StatusCode;
use batchflow_core::{ExternalJobId, OutputRef, Parameter, RunId};
use batchflow_workflow::{Completion, Run};

use batchflow_infra::completion_from_report;

use crate::app::errors;

/// Upper bound for `GET /runs?limit=`.
pub const MAX_LIST_LIMIT: usize = 500;
const DEFAULT_LIST_LIMIT: usize = 50;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct StartRunRequest {
    pub parameter: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListRunsQuery {
    pub parameter: Option<String>,
    pub limit: Option<usize>,
}

impl ListRunsQuery {
    pub fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT)
    }
}

/// Body the inference service posts when a job ends.
#[derive(Debug, Deserialize)]
pub struct CompletionRequest {
    pub job_id: String,
    /// "completed" / "succeeded" / "success", or "failed" / "failure" / "error"
    pub status: String,
    pub output_ref: Option<String>,
    /// Record count reported by the job; informational only.
    pub records: Option<u64>,
    pub error: Option<String>,
}

impl CompletionRequest {
    pub fn job_id(&self) -> Result<ExternalJobId, axum::response::Response> {
        ExternalJobId::new(self.job_id.clone())
            .map_err(|e| errors::json_error(StatusCode::BAD_REQUEST, "invalid_job_id", e.to_string()))
    }

    pub fn completion(&self) -> Result<Completion, axum::response::Response> {
        let succeeded = match self.status.to_lowercase().as_str() {
            "completed" | "succeeded" | "success" => true,
            "failed" | "failure" | "error" => false,
            other => {
                return Err(errors::json_error(
                    StatusCode::BAD_REQUEST,
                    "invalid_status",
                    format!("unknown job status '{other}'"),
                ));
            }
        };
        let output_ref = match self.output_ref.as_deref().filter(|s| !s.trim().is_empty()) {
            Some(raw) => Some(OutputRef::new(raw).map_err(|e| {
                errors::json_error(StatusCode::BAD_REQUEST, "invalid_output_ref", e.to_string())
            })?),
            None => None,
        };
        Ok(completion_from_report(succeeded, output_ref, self.error.clone()))
    }
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct RunView {
    pub run_id: RunId,
    pub parameter: String,
    pub status: &'static str,
    /// e.g. `AwaitingCompletion`, `TimedOut("LaunchingJob")`
    pub state: String,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub record_count: Option<usize>,
    pub record_batch_ref: Option<String>,
    pub job_id: Option<String>,
    pub output_ref: Option<String>,
    pub records_written: Option<u64>,
    pub failure_message: Option<String>,
    pub version: u64,
}

impl From<&Run> for RunView {
    fn from(run: &Run) -> Self {
        Self {
            run_id: run.run_id,
            parameter: run.parameter.to_string(),
            status: run.status().as_str(),
            state: run.state.to_string(),
            started_at: run.started_at,
            updated_at: run.updated_at,
            deadline: run.deadline,
            finished_at: run.finished_at,
            record_count: run.record_count,
            record_batch_ref: run.record_batch_ref.as_ref().map(|r| r.location().to_string()),
            job_id: run.job_id.as_ref().map(|id| id.to_string()),
            output_ref: run.output_ref.as_ref().map(|r| r.location().to_string()),
            records_written: run.records_written,
            failure_message: run.failure_message.clone(),
            version: run.version,
        }
    }
}

// -------------------------
// Parsing helpers
// -------------------------

pub fn parse_run_id(raw: &str) -> Result<RunId, axum::response::Response> {
    raw.parse()
        .map_err(|_| errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid run id"))
}

pub fn parse_parameter(raw: &str) -> Result<Parameter, axum::response::Response> {
    Parameter::new(raw.trim())
        .map_err(|e| errors::json_error(StatusCode::BAD_REQUEST, "invalid_parameter", e.to_string()))
}

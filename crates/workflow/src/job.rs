//! Job bookkeeping for the single suspension point.

use core::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use batchflow_core::{ExternalJobId, OutputRef, Parameter, RecordBatchRef, RunId, SuspensionToken};

/// Outcome of a job submission.
///
/// `Pending` moves to exactly one of the others, once.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    Pending,
    Success,
    Failure,
    /// Token revoked by a timeout or cancellation; never resolvable again.
    Abandoned,
}

impl JobOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobOutcome::Pending => "pending",
            JobOutcome::Success => "success",
            JobOutcome::Failure => "failure",
            JobOutcome::Abandoned => "abandoned",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobOutcome::Pending),
            "success" => Some(JobOutcome::Success),
            "failure" => Some(JobOutcome::Failure),
            "abandoned" => Some(JobOutcome::Abandoned),
            _ => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, JobOutcome::Pending)
    }
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the completion notification said about a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Completion {
    Success { output_ref: OutputRef },
    Failure { message: String },
}

impl Completion {
    pub fn outcome(&self) -> JobOutcome {
        match self {
            Completion::Success { .. } => JobOutcome::Success,
            Completion::Failure { .. } => JobOutcome::Failure,
        }
    }
}

/// Result of applying a completion to a job.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum JobResolution {
    /// First resolution: `Pending` moved to `Success` or `Failure`.
    Resolved,
    /// Already resolved earlier; nothing changed.
    AlreadyResolved,
    /// Token was revoked; nothing changed.
    Abandoned,
}

/// One submission to the external inference service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub run_id: RunId,
    pub parameter: Parameter,
    pub job_id: ExternalJobId,
    pub suspension_token: SuspensionToken,
    pub record_batch_ref: RecordBatchRef,
    pub output_ref: Option<OutputRef>,
    pub outcome: JobOutcome,
    pub submitted_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub failure_message: Option<String>,
}

impl Job {
    pub fn pending(
        run_id: RunId,
        parameter: Parameter,
        job_id: ExternalJobId,
        suspension_token: SuspensionToken,
        record_batch_ref: RecordBatchRef,
        submitted_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            run_id,
            parameter,
            job_id,
            suspension_token,
            record_batch_ref,
            output_ref: None,
            outcome: JobOutcome::Pending,
            submitted_at,
            expires_at,
            resolved_at: None,
            failure_message: None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.outcome.is_pending() && now >= self.expires_at
    }

    /// Apply a completion. Only a `Pending` job changes.
    pub fn resolve(&mut self, completion: &Completion, now: DateTime<Utc>) -> JobResolution {
        match self.outcome {
            JobOutcome::Pending => {}
            JobOutcome::Abandoned => return JobResolution::Abandoned,
            JobOutcome::Success | JobOutcome::Failure => return JobResolution::AlreadyResolved,
        }

        self.outcome = completion.outcome();
        self.resolved_at = Some(now);
        match completion {
            Completion::Success { output_ref } => self.output_ref = Some(output_ref.clone()),
            Completion::Failure { message } => self.failure_message = Some(message.clone()),
        }
        JobResolution::Resolved
    }

    /// Revoke the token. Returns false if the job was no longer pending.
    pub fn abandon(&mut self, now: DateTime<Utc>) -> bool {
        if !self.outcome.is_pending() {
            return false;
        }
        self.outcome = JobOutcome::Abandoned;
        self.resolved_at = Some(now);
        true
    }
}

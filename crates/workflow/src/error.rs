//! Error taxonomy for collaborators and runs.

use core::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use batchflow_core::RunId;

use crate::state::{FailureReason, RunEvent, Step};

/// Failure reported by an external collaborator.
///
/// Only `Transient` failures are retried; `Validation` fails the step at once.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CollaboratorError {
    /// Network blip, throttling, 5xx.
    #[error("transient failure: {0}")]
    Transient(String),
    /// Malformed input or an explicit rejection.
    #[error("rejected: {0}")]
    Validation(String),
}

impl CollaboratorError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, CollaboratorError::Transient(_))
    }
}

/// Error conditions a run can end with.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunErrorKind {
    RecordQueryFailed,
    JobSubmissionFailed,
    JobExecutionFailed,
    ResultCommitFailed,
    StepTimedOut,
}

impl fmt::Display for RunErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunErrorKind::RecordQueryFailed => "RecordQueryFailed",
            RunErrorKind::JobSubmissionFailed => "JobSubmissionFailed",
            RunErrorKind::JobExecutionFailed => "JobExecutionFailed",
            RunErrorKind::ResultCommitFailed => "ResultCommitFailed",
            RunErrorKind::StepTimedOut => "StepTimedOut",
        };
        f.write_str(s)
    }
}

/// A run-level error: which run, in which step, and what went wrong.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} in {step} (run {run_id}): {message}")]
pub struct RunError {
    pub run_id: RunId,
    pub step: Step,
    pub kind: RunErrorKind,
    pub message: String,
}

impl RunError {
    pub fn new(run_id: RunId, step: Step, kind: RunErrorKind, message: impl Into<String>) -> Self {
        Self {
            run_id,
            step,
            kind,
            message: message.into(),
        }
    }

    pub fn timed_out(run_id: RunId, step: Step) -> Self {
        Self::new(
            run_id,
            step,
            RunErrorKind::StepTimedOut,
            format!("{step} exceeded its budget"),
        )
    }

    /// The event this error forces on the run.
    pub fn event(&self) -> RunEvent {
        let reason = match self.kind {
            RunErrorKind::StepTimedOut => return RunEvent::StepTimedOut,
            RunErrorKind::JobExecutionFailed => {
                return RunEvent::JobFailed {
                    message: self.message.clone(),
                };
            }
            RunErrorKind::RecordQueryFailed => FailureReason::RecordQueryFailed,
            RunErrorKind::JobSubmissionFailed => FailureReason::JobSubmissionFailed,
            RunErrorKind::ResultCommitFailed => FailureReason::ResultCommitFailed,
        };
        RunEvent::StepFailed {
            reason,
            message: self.message.clone(),
        }
    }
}

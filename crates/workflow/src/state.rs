//! Run state machine.
//!
//! ```text
//! Start → QueryingRecords → NoRecordsFound
//!                         ↘ LaunchingJob → AwaitingCompletion → WritingResults → Succeeded
//!
//! Failed(reason) and TimedOut(step) are reachable from every non-terminal state.
//! ```
//!
//! `transition` is pure: it only decides the next state. Recording what an event
//! carried (batch refs, job ids, timestamps) is `Run::apply`'s job.

use core::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use batchflow_core::{ExternalJobId, OutputRef, RecordBatchRef};

/// Non-terminal steps of a run.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Step {
    Start,
    QueryingRecords,
    LaunchingJob,
    AwaitingCompletion,
    WritingResults,
}

impl Step {
    pub const ALL: [Step; 5] = [
        Step::Start,
        Step::QueryingRecords,
        Step::LaunchingJob,
        Step::AwaitingCompletion,
        Step::WritingResults,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Start => "Start",
            Step::QueryingRecords => "QueryingRecords",
            Step::LaunchingJob => "LaunchingJob",
            Step::AwaitingCompletion => "AwaitingCompletion",
            Step::WritingResults => "WritingResults",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a run ended `Failed`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureReason {
    RecordQueryFailed,
    JobSubmissionFailed,
    JobExecutionFailed,
    ResultCommitFailed,
    Cancelled,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::RecordQueryFailed => "RecordQueryFailed",
            FailureReason::JobSubmissionFailed => "JobSubmissionFailed",
            FailureReason::JobExecutionFailed => "JobExecutionFailed",
            FailureReason::ResultCommitFailed => "ResultCommitFailed",
            FailureReason::Cancelled => "Cancelled",
        }
    }

    /// The only step a step-specific failure may be raised from.
    ///
    /// `Cancelled` has no origin: it is reachable from every non-terminal step.
    pub fn origin(&self) -> Option<Step> {
        match self {
            FailureReason::RecordQueryFailed => Some(Step::QueryingRecords),
            FailureReason::JobSubmissionFailed => Some(Step::LaunchingJob),
            FailureReason::JobExecutionFailed => Some(Step::AwaitingCompletion),
            FailureReason::ResultCommitFailed => Some(Step::WritingResults),
            FailureReason::Cancelled => None,
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Full state of a run.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail")]
pub enum RunState {
    Active(Step),
    NoRecordsFound,
    Succeeded,
    Failed(FailureReason),
    TimedOut(Step),
}

impl Default for RunState {
    fn default() -> Self {
        RunState::Active(Step::Start)
    }
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunState::Active(_))
    }

    pub fn active_step(&self) -> Option<Step> {
        match self {
            RunState::Active(step) => Some(*step),
            _ => None,
        }
    }

    pub fn status(&self) -> RunStatus {
        match self {
            RunState::Active(_) => RunStatus::Running,
            RunState::NoRecordsFound => RunStatus::NoRecords,
            RunState::Succeeded => RunStatus::Succeeded,
            RunState::Failed(_) => RunStatus::Failed,
            RunState::TimedOut(_) => RunStatus::TimedOut,
        }
    }

    /// Exit surface of the run; `None` while it is still running.
    pub fn outcome(&self) -> Option<RunOutcome> {
        match self {
            RunState::Active(_) => None,
            RunState::NoRecordsFound => Some(RunOutcome::NoRecords),
            RunState::Succeeded => Some(RunOutcome::Succeeded),
            RunState::Failed(reason) => Some(RunOutcome::Failed(*reason)),
            RunState::TimedOut(step) => Some(RunOutcome::TimedOut(*step)),
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Active(step) => write!(f, "{step}"),
            RunState::NoRecordsFound => f.write_str("NoRecordsFound"),
            RunState::Succeeded => f.write_str("Succeeded"),
            RunState::Failed(reason) => write!(f, "Failed(\"{reason}\")"),
            RunState::TimedOut(step) => write!(f, "TimedOut(\"{step}\")"),
        }
    }
}

/// Coarse run status.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
    TimedOut,
    NoRecords,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "Running",
            RunStatus::Succeeded => "Succeeded",
            RunStatus::Failed => "Failed",
            RunStatus::TimedOut => "TimedOut",
            RunStatus::NoRecords => "NoRecords",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal result of a run as reported to operators.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunOutcome {
    Succeeded,
    Failed(FailureReason),
    TimedOut(Step),
    NoRecords,
}

/// Inputs that advance a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    Started,
    RecordsFound {
        record_count: usize,
        batch_ref: RecordBatchRef,
    },
    NoRecords,
    JobSubmitted {
        job_id: ExternalJobId,
    },
    JobSucceeded {
        output_ref: OutputRef,
    },
    JobFailed {
        message: String,
    },
    ResultsCommitted {
        records_written: u64,
    },
    StepFailed {
        reason: FailureReason,
        message: String,
    },
    StepTimedOut,
    Cancelled,
}

impl RunEvent {
    pub fn name(&self) -> &'static str {
        match self {
            RunEvent::Started => "started",
            RunEvent::RecordsFound { .. } => "records_found",
            RunEvent::NoRecords => "no_records",
            RunEvent::JobSubmitted { .. } => "job_submitted",
            RunEvent::JobSucceeded { .. } => "job_succeeded",
            RunEvent::JobFailed { .. } => "job_failed",
            RunEvent::ResultsCommitted { .. } => "results_committed",
            RunEvent::StepFailed { .. } => "step_failed",
            RunEvent::StepTimedOut => "step_timed_out",
            RunEvent::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("run is terminal ({state}); event '{event}' rejected")]
    Terminal { state: RunState, event: &'static str },

    #[error("event '{event}' is not valid in step {step}")]
    InvalidEvent { step: Step, event: &'static str },
}

/// Decide the next state for `event` (explicit state machine transitions).
pub fn transition(state: &RunState, event: &RunEvent) -> Result<RunState, TransitionError> {
    let step = match state {
        RunState::Active(step) => *step,
        terminal => {
            return Err(TransitionError::Terminal {
                state: *terminal,
                event: event.name(),
            });
        }
    };

    let invalid = || TransitionError::InvalidEvent {
        step,
        event: event.name(),
    };

    let next = match (step, event) {
        (Step::Start, RunEvent::Started) => RunState::Active(Step::QueryingRecords),
        (Step::QueryingRecords, RunEvent::NoRecords) => RunState::NoRecordsFound,
        (Step::QueryingRecords, RunEvent::RecordsFound { record_count, .. }) => {
            if *record_count == 0 {
                return Err(invalid());
            }
            RunState::Active(Step::LaunchingJob)
        }
        (Step::LaunchingJob, RunEvent::JobSubmitted { .. }) => {
            RunState::Active(Step::AwaitingCompletion)
        }
        (Step::AwaitingCompletion, RunEvent::JobSucceeded { .. }) => {
            RunState::Active(Step::WritingResults)
        }
        (Step::AwaitingCompletion, RunEvent::JobFailed { .. }) => {
            RunState::Failed(FailureReason::JobExecutionFailed)
        }
        (Step::WritingResults, RunEvent::ResultsCommitted { .. }) => RunState::Succeeded,
        (_, RunEvent::StepFailed { reason, .. }) => match reason.origin() {
            Some(origin) if origin == step => RunState::Failed(*reason),
            _ => return Err(invalid()),
        },
        (_, RunEvent::StepTimedOut) => RunState::TimedOut(step),
        (_, RunEvent::Cancelled) => RunState::Failed(FailureReason::Cancelled),
        _ => return Err(invalid()),
    };

    Ok(next)
}

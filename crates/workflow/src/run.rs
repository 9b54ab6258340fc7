//! The `Run` record: state plus what each step discovered.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use batchflow_core::{ExternalJobId, OutputRef, Parameter, RecordBatchRef, RunId};

use crate::budget::StepBudgets;
use crate::state::{RunEvent, RunOutcome, RunState, RunStatus, Step, TransitionError, transition};

/// One execution of the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: RunId,
    pub parameter: Parameter,
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    /// When the current step was entered.
    pub step_started_at: DateTime<Utc>,
    /// started_at + overall run budget
    pub deadline: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub record_count: Option<usize>,
    pub record_batch_ref: Option<RecordBatchRef>,
    pub job_id: Option<ExternalJobId>,
    pub output_ref: Option<OutputRef>,
    pub records_written: Option<u64>,
    pub failure_message: Option<String>,
    pub version: u64,
}

impl Run {
    pub fn new(parameter: Parameter, budgets: &StepBudgets, now: DateTime<Utc>) -> Self {
        let deadline = chrono::Duration::from_std(budgets.run)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        Self {
            run_id: RunId::new(),
            parameter,
            state: RunState::default(),
            started_at: now,
            step_started_at: now,
            deadline,
            updated_at: now,
            finished_at: None,
            record_count: None,
            record_batch_ref: None,
            job_id: None,
            output_ref: None,
            records_written: None,
            failure_message: None,
            version: 0,
        }
    }

    pub fn status(&self) -> RunStatus {
        self.state.status()
    }

    pub fn outcome(&self) -> Option<RunOutcome> {
        self.state.outcome()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn step(&self) -> Option<Step> {
        self.state.active_step()
    }

    /// Step deadline for the step the run is in; `None` once terminal.
    pub fn step_deadline(&self, budgets: &StepBudgets) -> Option<DateTime<Utc>> {
        self.step()
            .map(|step| budgets.step_deadline(step, self.step_started_at, self.deadline))
    }

    /// Advance the run by one event.
    ///
    /// On success `version` is bumped; persist with `ExpectedVersion::Exact(version - 1)`.
    /// On error the run is left untouched.
    pub fn apply(&mut self, event: &RunEvent, now: DateTime<Utc>) -> Result<(), TransitionError> {
        let next = transition(&self.state, event)?;

        match event {
            RunEvent::RecordsFound {
                record_count,
                batch_ref,
            } => {
                self.record_count = Some(*record_count);
                self.record_batch_ref = Some(batch_ref.clone());
            }
            RunEvent::NoRecords => self.record_count = Some(0),
            RunEvent::JobSubmitted { job_id } => self.job_id = Some(job_id.clone()),
            RunEvent::JobSucceeded { output_ref } => self.output_ref = Some(output_ref.clone()),
            RunEvent::JobFailed { message } | RunEvent::StepFailed { message, .. } => {
                self.failure_message = Some(message.clone());
            }
            RunEvent::ResultsCommitted { records_written } => {
                self.records_written = Some(*records_written);
            }
            RunEvent::StepTimedOut => {
                if let Some(step) = self.step() {
                    self.failure_message = Some(format!("{step} exceeded its budget"));
                }
            }
            RunEvent::Cancelled => self.failure_message = Some("cancelled".to_string()),
            RunEvent::Started => {}
        }

        if next != self.state {
            self.step_started_at = now;
        }
        if next.is_terminal() {
            self.finished_at = Some(now);
        }
        self.state = next;
        self.updated_at = now;
        self.version += 1;
        Ok(())
    }
}

//! Timeout horizons: one overall run budget plus one budget per step.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::Step;

/// Wall-clock budgets for a run.
///
/// A step exceeding its own budget times the run out even if the overall
/// budget still has room; the overall budget caps every step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepBudgets {
    pub run: Duration,
    pub querying_records: Duration,
    pub launching_job: Duration,
    pub awaiting_completion: Duration,
    pub writing_results: Duration,
}

impl Default for StepBudgets {
    fn default() -> Self {
        Self {
            run: Duration::from_secs(2 * 60 * 60),
            querying_records: Duration::from_secs(60 * 60),
            launching_job: Duration::from_secs(15 * 60),
            awaiting_completion: Duration::from_secs(60 * 60),
            writing_results: Duration::from_secs(60 * 60),
        }
    }
}

impl StepBudgets {
    /// Budget of a single step. `Start` is instantaneous and shares the query budget.
    pub fn for_step(&self, step: Step) -> Duration {
        match step {
            Step::Start | Step::QueryingRecords => self.querying_records,
            Step::LaunchingJob => self.launching_job,
            Step::AwaitingCompletion => self.awaiting_completion,
            Step::WritingResults => self.writing_results,
        }
    }

    /// Time a step may still take: its own budget, capped by what is left of the run.
    pub fn effective(&self, step: Step, now: DateTime<Utc>, deadline: DateTime<Utc>) -> Duration {
        let remaining = (deadline - now).to_std().unwrap_or(Duration::ZERO);
        self.for_step(step).min(remaining)
    }

    /// Absolute instant at which `step`, entered at `entered_at`, times out.
    pub fn step_deadline(
        &self,
        step: Step,
        entered_at: DateTime<Utc>,
        run_deadline: DateTime<Utc>,
    ) -> DateTime<Utc> {
        chrono::Duration::from_std(self.for_step(step))
            .ok()
            .and_then(|d| entered_at.checked_add_signed(d))
            .map_or(run_deadline, |step_end| step_end.min(run_deadline))
    }
}

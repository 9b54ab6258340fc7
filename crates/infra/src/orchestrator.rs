//! Orchestrator engine: drives runs through the state machine.
//!
//! ## Lifecycle
//!
//! - `start_run` inserts a run and drives it in-process through
//!   `QueryingRecords` and `LaunchingJob`, returning once the run is suspended
//!   in `AwaitingCompletion` (or terminal). No task is held while suspended.
//! - The completion listener resolves the job's token and queues the run id;
//!   the resume worker calls `resume`, which moves the run to `WritingResults`
//!   and invokes the result writer.
//! - `sweep_timeouts` enforces the overall and per-step deadlines for
//!   everything that is not currently being driven in-process, and purges
//!   settled job entries older than the retention window.
//!
//! ## Concurrency
//!
//! Every transition is saved with `ExpectedVersion::Exact(previous)`. Whoever
//! loses a compare-and-set stops and reloads; races between a completion and
//! an expiry are decided by `MetadataStore::abandon` vs `resolve` on the job.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use batchflow_core::{ExpectedVersion, Parameter, RunId};
use batchflow_workflow::{
    CollaboratorError, JobOutcome, RetryPolicy, Run, RunError, RunErrorKind,
    RunEvent, RunState, Step, StepBudgets, TransitionError,
};

use crate::collaborators::{InferenceService, RecordQuery, ResultWriter};
use crate::error::StoreError;
use crate::launcher::{JobLauncher, LaunchError};
use crate::metadata_store::MetadataStore;
use crate::retrying::with_retry;
use crate::run_store::RunStore;

/// How many times `cancel` reloads after losing a race before giving up.
const CANCEL_ATTEMPTS: usize = 3;

/// How long settled job entries are kept for late redeliveries.
pub const DEFAULT_JOB_RETENTION: Duration = Duration::from_secs(7 * 24 * 3600);

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("a run is already active for parameter '{0}'")]
    RunAlreadyActive(Parameter),

    #[error("run not found: {0}")]
    NotFound(RunId),

    #[error("run {run_id} is already terminal ({state})")]
    AlreadyTerminal { run_id: RunId, state: RunState },

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// External collaborators the engine calls out to.
#[derive(Clone)]
pub struct Collaborators {
    pub records: Arc<dyn RecordQuery>,
    pub inference: Arc<dyn InferenceService>,
    pub writer: Arc<dyn ResultWriter>,
}

/// Summary of one timeout sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub timed_out: Vec<RunId>,
    /// Runs whose job turned out to be resolved and were resumed instead.
    pub resumed: Vec<RunId>,
    /// Settled job entries dropped past retention.
    pub purged: usize,
}

/// Summary of startup recovery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub resumed: Vec<RunId>,
    pub redriven: Vec<RunId>,
}

pub struct Orchestrator {
    runs: Arc<dyn RunStore>,
    metadata: Arc<dyn MetadataStore>,
    records: Arc<dyn RecordQuery>,
    writer: Arc<dyn ResultWriter>,
    launcher: JobLauncher,
    budgets: StepBudgets,
    retry: RetryPolicy,
    job_retention: Duration,
}

impl Orchestrator {
    pub fn new(
        runs: Arc<dyn RunStore>,
        metadata: Arc<dyn MetadataStore>,
        collaborators: Collaborators,
        budgets: StepBudgets,
        retry: RetryPolicy,
    ) -> Self {
        let launcher = JobLauncher::new(collaborators.inference, metadata.clone(), retry.clone());
        Self {
            runs,
            metadata,
            records: collaborators.records,
            writer: collaborators.writer,
            launcher,
            budgets,
            retry,
            job_retention: DEFAULT_JOB_RETENTION,
        }
    }

    pub fn with_job_retention(mut self, retention: Duration) -> Self {
        self.job_retention = retention;
        self
    }

    pub fn budgets(&self) -> &StepBudgets {
        &self.budgets
    }

    // ---------------------------------------------------------------------
    // Inspection
    // ---------------------------------------------------------------------

    pub async fn run(&self, run_id: RunId) -> Result<Run, OrchestratorError> {
        self.runs
            .get(run_id)
            .await?
            .ok_or(OrchestratorError::NotFound(run_id))
    }

    pub async fn runs_for(
        &self,
        parameter: Option<&Parameter>,
        limit: usize,
    ) -> Result<Vec<Run>, OrchestratorError> {
        Ok(self.runs.list_recent(parameter, limit).await?)
    }

    pub async fn active_for(&self, parameter: &Parameter) -> Result<Option<Run>, OrchestratorError> {
        Ok(self.runs.active_for(parameter).await?)
    }

    // ---------------------------------------------------------------------
    // Scheduler → Orchestrator
    // ---------------------------------------------------------------------

    /// Start a run for `parameter` and drive it until it suspends or ends.
    pub async fn start_run(&self, parameter: Parameter) -> Result<RunId, OrchestratorError> {
        let run = self.create_run(parameter).await?;
        let run_id = run.run_id;
        self.drive(run).await?;
        Ok(run_id)
    }

    /// Record a new run in `Start` without driving it.
    ///
    /// Fails with `RunAlreadyActive` if the parameter already has a non-terminal run.
    pub async fn create_run(&self, parameter: Parameter) -> Result<Run, OrchestratorError> {
        let run = Run::new(parameter, &self.budgets, Utc::now());

        self.runs.insert(&run).await.map_err(|e| match e {
            StoreError::RunAlreadyActive(p) => OrchestratorError::RunAlreadyActive(p),
            other => OrchestratorError::Store(other),
        })?;
        info!(
            run_id = %run.run_id,
            parameter = %run.parameter,
            deadline = %run.deadline,
            "run started"
        );
        Ok(run)
    }

    /// Drive the in-process steps from wherever `run` currently is.
    pub async fn drive(&self, mut run: Run) -> Result<Run, OrchestratorError> {
        if run.state == RunState::Active(Step::Start) && !self.advance(&mut run, RunEvent::Started).await? {
            return self.run(run.run_id).await;
        }

        if run.step() == Some(Step::QueryingRecords) {
            let event = self.query_records(&run).await;
            if !self.advance(&mut run, event).await? {
                return self.run(run.run_id).await;
            }
        }

        if run.step() == Some(Step::LaunchingJob) {
            let event = self.launch_job(&run).await?;
            let submitted = matches!(event, RunEvent::JobSubmitted { .. });
            if !self.advance(&mut run, event).await? {
                // Cancelled or timed out while submitting: the job recorded
                // just now must not stay resolvable.
                let current = self.run(run.run_id).await?;
                if submitted && current.is_terminal() {
                    self.revoke_orphaned_job(&current).await?;
                }
                return Ok(current);
            }

            // The completion may have arrived before the run was suspended.
            if run.step() == Some(Step::AwaitingCompletion) {
                if let Some(job) = self.metadata.get(run.run_id).await? {
                    if !job.outcome.is_pending() {
                        return self.resume(run.run_id).await;
                    }
                }
            }
        }

        Ok(run)
    }

    async fn query_records(&self, run: &Run) -> RunEvent {
        let result = self
            .bounded(
                run,
                Step::QueryingRecords,
                with_retry(&self.retry, "query_unprocessed", run.run_id, || {
                    self.records.query_unprocessed(&run.parameter)
                }),
            )
            .await;

        match result {
            Ok(batch) if batch.is_empty() => {
                info!(run_id = %run.run_id, parameter = %run.parameter, "no unprocessed records");
                RunEvent::NoRecords
            }
            Ok(batch) => match batch.batch_ref {
                Some(batch_ref) => {
                    info!(
                        run_id = %run.run_id,
                        record_count = batch.record_ids.len(),
                        batch_ref = %batch_ref,
                        "records found"
                    );
                    RunEvent::RecordsFound {
                        record_count: batch.record_ids.len(),
                        batch_ref,
                    }
                }
                None => self.failed(RunError::new(
                    run.run_id,
                    Step::QueryingRecords,
                    RunErrorKind::RecordQueryFailed,
                    "records returned without a batch reference",
                )),
            },
            Err(failure) => self.failed(failure.into_run_error(run.run_id, RunErrorKind::RecordQueryFailed)),
        }
    }

    async fn launch_job(&self, run: &Run) -> Result<RunEvent, OrchestratorError> {
        let Some(batch_ref) = run.record_batch_ref.clone() else {
            return Ok(self.failed(RunError::new(
                run.run_id,
                Step::LaunchingJob,
                RunErrorKind::JobSubmissionFailed,
                "no record batch to submit",
            )));
        };

        let budget = self.budgets.effective(Step::LaunchingJob, Utc::now(), run.deadline);
        if budget.is_zero() {
            return Ok(self.failed(RunError::timed_out(run.run_id, Step::LaunchingJob)));
        }

        // The token expires when AwaitingCompletion would time out if entered now.
        let expires_at = self.budgets.step_deadline(Step::AwaitingCompletion, Utc::now(), run.deadline);

        match tokio::time::timeout(budget, self.launcher.launch(run, &batch_ref, expires_at)).await {
            Ok(Ok(job)) => Ok(RunEvent::JobSubmitted { job_id: job.job_id }),
            Ok(Err(LaunchError::Submission(err))) => Ok(self.failed(RunError::new(
                run.run_id,
                Step::LaunchingJob,
                RunErrorKind::JobSubmissionFailed,
                err.to_string(),
            ))),
            Ok(Err(LaunchError::Store(err))) => {
                error!(run_id = %run.run_id, error = %err, "failed to record submitted job");
                Err(err.into())
            }
            Err(_) => Ok(self.failed(RunError::timed_out(run.run_id, Step::LaunchingJob))),
        }
    }

    async fn revoke_orphaned_job(&self, run: &Run) -> Result<(), OrchestratorError> {
        if let Some(job) = self.metadata.abandon(run.run_id).await? {
            warn!(
                run_id = %run.run_id,
                job_id = %job.job_id,
                state = %run.state,
                "run ended while its job was being launched; token abandoned"
            );
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Completion Listener → Orchestrator
    // ---------------------------------------------------------------------

    /// Continue a run whose job has been resolved.
    ///
    /// Only the caller that wins the `AwaitingCompletion → WritingResults`
    /// compare-and-set invokes the result writer. Everyone else is a no-op.
    pub async fn resume(&self, run_id: RunId) -> Result<Run, OrchestratorError> {
        let mut run = self.run(run_id).await?;
        if run.step() != Some(Step::AwaitingCompletion) {
            debug!(run_id = %run_id, state = %run.state, "resume ignored; run is not awaiting completion");
            return Ok(run);
        }

        let Some(job) = self.metadata.get(run_id).await? else {
            warn!(run_id = %run_id, "resume ignored; no job recorded for run");
            return Ok(run);
        };

        let event = match job.outcome {
            JobOutcome::Pending | JobOutcome::Abandoned => {
                debug!(run_id = %run_id, outcome = %job.outcome, "resume ignored; job not resolved");
                return Ok(run);
            }
            JobOutcome::Failure => {
                let message = job
                    .failure_message
                    .unwrap_or_else(|| "inference job failed".to_string());
                warn!(run_id = %run_id, job_id = %job.job_id, error = %message, "inference job failed");
                RunEvent::JobFailed { message }
            }
            JobOutcome::Success => match job.output_ref {
                Some(output_ref) => RunEvent::JobSucceeded { output_ref },
                None => RunEvent::JobFailed {
                    message: "job reported success without an output reference".to_string(),
                },
            },
        };

        if !self.advance(&mut run, event).await? {
            debug!(run_id = %run_id, "resume lost the race to another resumer");
            return self.run(run_id).await;
        }

        if run.step() == Some(Step::WritingResults) {
            self.write_results(&mut run).await?;
        }
        Ok(run)
    }

    async fn write_results(&self, run: &mut Run) -> Result<(), OrchestratorError> {
        let event = match run.output_ref.clone() {
            None => self.failed(RunError::new(
                run.run_id,
                Step::WritingResults,
                RunErrorKind::ResultCommitFailed,
                "no output reference to commit",
            )),
            Some(output_ref) => {
                let result = self
                    .bounded(
                        run,
                        Step::WritingResults,
                        with_retry(&self.retry, "commit_results", run.run_id, || {
                            self.writer.commit(&output_ref)
                        }),
                    )
                    .await;
                match result {
                    Ok(ack) => {
                        info!(
                            run_id = %run.run_id,
                            output_ref = %output_ref,
                            records_written = ack.records_written,
                            "results committed"
                        );
                        RunEvent::ResultsCommitted {
                            records_written: ack.records_written,
                        }
                    }
                    Err(failure) => self.failed(
                        failure.into_run_error(run.run_id, RunErrorKind::ResultCommitFailed),
                    ),
                }
            }
        };

        self.advance(run, event).await?;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Cancellation & timeouts
    // ---------------------------------------------------------------------

    /// Operator cancellation: any non-terminal run → `Failed(Cancelled)`.
    pub async fn cancel(&self, run_id: RunId) -> Result<Run, OrchestratorError> {
        for _ in 0..CANCEL_ATTEMPTS {
            let mut run = self.run(run_id).await?;
            if run.is_terminal() {
                return Err(OrchestratorError::AlreadyTerminal {
                    run_id,
                    state: run.state,
                });
            }
            if self.advance(&mut run, RunEvent::Cancelled).await? {
                warn!(run_id = %run_id, "run cancelled");
                return Ok(run);
            }
        }
        Err(StoreError::Conflict(format!("run {run_id} kept changing while cancelling")).into())
    }

    /// Time out everything past its deadline as of `now`.
    pub async fn sweep_timeouts(&self, now: DateTime<Utc>) -> Result<SweepReport, OrchestratorError> {
        let mut report = SweepReport::default();

        // Expired tokens first: the abandon compare-and-set decides the race with a completion.
        for job in self.metadata.list_expired(now).await? {
            let run = self.runs.get(job.run_id).await?;
            match run {
                Some(run) if run.step() == Some(Step::AwaitingCompletion) => {
                    self.expire_awaiting(run, &mut report).await?;
                }
                _ => {
                    // Orphaned entry of a finished or unknown run.
                    self.metadata.abandon(job.run_id).await?;
                }
            }
        }

        for run in self.runs.list_active().await? {
            let Some(step_deadline) = run.step_deadline(&self.budgets) else {
                continue;
            };
            if now < step_deadline {
                continue;
            }
            if report.timed_out.contains(&run.run_id) || report.resumed.contains(&run.run_id) {
                continue;
            }

            if run.step() == Some(Step::AwaitingCompletion) {
                self.expire_awaiting(run, &mut report).await?;
            } else {
                let mut run = run;
                let run_id = run.run_id;
                let step = run.step();
                if self.advance(&mut run, RunEvent::StepTimedOut).await? {
                    warn!(run_id = %run_id, step = ?step, "step exceeded its budget");
                    report.timed_out.push(run_id);
                }
            }
        }

        let horizon = chrono::Duration::from_std(self.job_retention)
            .ok()
            .and_then(|retention| now.checked_sub_signed(retention));
        if let Some(horizon) = horizon {
            report.purged = self.metadata.purge_settled(horizon).await?;
            if report.purged > 0 {
                debug!(purged = report.purged, horizon = %horizon, "purged settled job entries");
            }
        }

        Ok(report)
    }

    async fn expire_awaiting(&self, mut run: Run, report: &mut SweepReport) -> Result<(), OrchestratorError> {
        let run_id = run.run_id;
        let revoked = match self.metadata.abandon(run_id).await? {
            Some(job) => Some(job),
            None => match self.metadata.get(run_id).await? {
                // Resolved before expiry but not resumed yet: the completion wins.
                Some(job) if matches!(job.outcome, JobOutcome::Success | JobOutcome::Failure) => {
                    let run = self.resume(run_id).await?;
                    debug!(run_id = %run_id, state = %run.state, "expired run was already resolved");
                    report.resumed.push(run_id);
                    return Ok(());
                }
                // Token already revoked or gone.
                _ => None,
            },
        };

        if self.advance(&mut run, RunEvent::StepTimedOut).await? {
            warn!(
                run_id = %run_id,
                job_id = ?revoked.map(|job| job.job_id),
                "no completion within budget; token abandoned"
            );
            report.timed_out.push(run_id);
        }
        Ok(())
    }

    /// Pick up runs left mid-flight by a previous process.
    ///
    /// - `AwaitingCompletion` with a resolved job: resumed
    /// - `LaunchingJob` with a recorded job: promoted to `AwaitingCompletion`
    /// - `Start`/`QueryingRecords`/`WritingResults`: re-driven (query is
    ///   read-only, the writer is idempotent per output reference)
    ///
    /// `LaunchingJob` without a recorded job is left to the sweeper, since
    /// re-submitting could start a second external job.
    pub async fn recover(&self) -> Result<RecoveryReport, OrchestratorError> {
        let mut report = RecoveryReport::default();

        for mut run in self.runs.list_active().await? {
            let run_id = run.run_id;
            match run.step() {
                Some(Step::Start) | Some(Step::QueryingRecords) => {
                    self.drive(run).await?;
                    report.redriven.push(run_id);
                }
                Some(Step::LaunchingJob) => {
                    if let Some(job) = self.metadata.get(run_id).await? {
                        let event = RunEvent::JobSubmitted { job_id: job.job_id.clone() };
                        if self.advance(&mut run, event).await? && !job.outcome.is_pending() {
                            self.resume(run_id).await?;
                        }
                        report.redriven.push(run_id);
                    }
                }
                Some(Step::AwaitingCompletion) => {
                    let resolved = self
                        .metadata
                        .get(run_id)
                        .await?
                        .is_some_and(|job| !job.outcome.is_pending());
                    if resolved {
                        self.resume(run_id).await?;
                        report.resumed.push(run_id);
                    }
                }
                Some(Step::WritingResults) => {
                    self.write_results(&mut run).await?;
                    report.redriven.push(run_id);
                }
                None => {}
            }
        }

        if !report.resumed.is_empty() || !report.redriven.is_empty() {
            info!(
                resumed = report.resumed.len(),
                redriven = report.redriven.len(),
                "recovered in-flight runs"
            );
        }
        Ok(report)
    }

    // ---------------------------------------------------------------------
    // Helpers
    // ---------------------------------------------------------------------

    /// Apply `event` and save with compare-and-set.
    ///
    /// Returns `false` if another writer changed the run first; `run` is then stale.
    async fn advance(&self, run: &mut Run, event: RunEvent) -> Result<bool, OrchestratorError> {
        let from = run.state;
        let expected = ExpectedVersion::Exact(run.version);
        let mut next = run.clone();
        next.apply(&event, Utc::now())?;

        match self.runs.save(&next, expected).await {
            Ok(()) => {}
            Err(StoreError::Conflict(msg)) => {
                debug!(run_id = %run.run_id, event = event.name(), reason = %msg, "transition superseded");
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        }

        *run = next;
        info!(
            run_id = %run.run_id,
            parameter = %run.parameter,
            event = event.name(),
            from = %from,
            to = %run.state,
            "run transitioned"
        );

        if run.is_terminal() {
            self.finish(run).await;
        }
        Ok(true)
    }

    /// Terminal bookkeeping: revoke any pending token.
    ///
    /// The entry itself stays as a tombstone until `sweep_timeouts` purges it.
    async fn finish(&self, run: &Run) {
        match run.outcome() {
            Some(outcome) => info!(
                run_id = %run.run_id,
                parameter = %run.parameter,
                outcome = ?outcome,
                records_written = ?run.records_written,
                "run finished"
            ),
            None => return,
        }

        if let Err(e) = self.metadata.abandon(run.run_id).await {
            warn!(run_id = %run.run_id, error = %e, "failed to abandon token of finished run");
        }
    }

    /// Run an in-process step under its effective budget.
    async fn bounded<T, Fut>(&self, run: &Run, step: Step, fut: Fut) -> Result<T, StepFailure>
    where
        Fut: Future<Output = Result<T, CollaboratorError>>,
    {
        let budget = self.budgets.effective(step, Utc::now(), run.deadline);
        if budget.is_zero() {
            return Err(StepFailure::TimedOut(step));
        }
        match tokio::time::timeout(budget, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(StepFailure::Collaborator(step, err)),
            Err(_) => Err(StepFailure::TimedOut(step)),
        }
    }

    fn failed(&self, err: RunError) -> RunEvent {
        match err.kind {
            RunErrorKind::StepTimedOut => warn!(run_id = %err.run_id, step = %err.step, "step timed out"),
            _ => error!(
                run_id = %err.run_id,
                step = %err.step,
                kind = %err.kind,
                error = %err.message,
                "step failed"
            ),
        }
        err.event()
    }
}

/// Why an in-process step did not produce a value.
#[derive(Debug)]
enum StepFailure {
    Collaborator(Step, CollaboratorError),
    TimedOut(Step),
}

impl StepFailure {
    fn into_run_error(self, run_id: RunId, kind: RunErrorKind) -> RunError {
        match self {
            StepFailure::Collaborator(step, err) => RunError::new(run_id, step, kind, err.to_string()),
            StepFailure::TimedOut(step) => RunError::timed_out(run_id, step),
        }
    }
}

/// Period between sweeps never exceeds the smallest step budget.
pub fn sweep_period(configured: Duration, budgets: &StepBudgets) -> Duration {
    let smallest = Step::ALL
        .iter()
        .map(|s| budgets.for_step(*s))
        .min()
        .unwrap_or(configured);
    configured.min(smallest).max(Duration::from_millis(10))
}

//! End-to-end orchestrator scenarios against in-memory stores and collaborators.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;

use batchflow_core::{ExpectedVersion, OutputRef, Parameter, RunId};
use batchflow_infra::collaborators::{InMemoryInferenceService, InMemoryRecordTable};
use batchflow_infra::{
    Collaborators, CompletionAck, CompletionListener, InMemoryMetadataStore, InMemoryRunStore,
    MetadataStore, Orchestrator, OrchestratorError, ResumeWorker, RunStore, StoreError,
    completion_from_report,
};
use batchflow_workflow::{
    CollaboratorError, Completion, FailureReason, JobOutcome, RetryPolicy, Run, RunEvent,
    RunOutcome, RunState, RunStatus, Step, StepBudgets,
};

struct Harness {
    orchestrator: Arc<Orchestrator>,
    runs: Arc<InMemoryRunStore>,
    metadata: Arc<InMemoryMetadataStore>,
    table: Arc<InMemoryRecordTable>,
    inference: Arc<InMemoryInferenceService>,
    listener: CompletionListener,
    queue: mpsc::Receiver<RunId>,
}

fn harness_with(budgets: StepBudgets) -> Harness {
    let runs = InMemoryRunStore::arc();
    let metadata = InMemoryMetadataStore::arc();
    let table = InMemoryRecordTable::arc();
    let inference = InMemoryInferenceService::arc();

    let orchestrator = Arc::new(Orchestrator::new(
        runs.clone(),
        metadata.clone(),
        Collaborators {
            records: table.clone(),
            inference: inference.clone(),
            writer: table.clone(),
        },
        budgets,
        RetryPolicy::exponential(3, Duration::from_millis(1), Duration::from_millis(5)),
    ));
    let (listener, queue) = CompletionListener::new(metadata.clone(), 64);

    Harness {
        orchestrator,
        runs,
        metadata,
        table,
        inference,
        listener,
        queue,
    }
}

fn harness() -> Harness {
    harness_with(StepBudgets::default())
}

fn pm25() -> Parameter {
    Parameter::new("pm25").unwrap()
}

impl Harness {
    /// Simulate the external job finishing successfully over the submitted batch.
    fn job_output(&self, run: &Run) -> OutputRef {
        self.table
            .predict(run.record_batch_ref.as_ref().expect("batch ref recorded"))
            .unwrap()
    }

    /// Drain the resume queue the way the resume worker would.
    async fn drain(&mut self) {
        while let Ok(run_id) = self.queue.try_recv() {
            self.orchestrator.resume(run_id).await.unwrap();
        }
    }
}

#[tokio::test]
async fn zero_records_ends_with_no_records_and_never_launches() {
    let h = harness();

    let run_id = h.orchestrator.start_run(pm25()).await.unwrap();
    let run = h.orchestrator.run(run_id).await.unwrap();

    assert_eq!(run.state, RunState::NoRecordsFound);
    assert_eq!(run.outcome(), Some(RunOutcome::NoRecords));
    assert_eq!(h.inference.attempts(), 0);
    assert!(h.metadata.is_empty());
}

#[tokio::test]
async fn ten_records_complete_and_are_labelled_once() {
    let mut h = harness();
    let ids = h.table.seed(&pm25(), 10);

    let run_id = h.orchestrator.start_run(pm25()).await.unwrap();
    let run = h.orchestrator.run(run_id).await.unwrap();
    assert_eq!(run.state, RunState::Active(Step::AwaitingCompletion));
    assert_eq!(run.record_count, Some(10));

    let job = h.metadata.get(run_id).await.unwrap().unwrap();
    assert_eq!(job.outcome, JobOutcome::Pending);

    let output = h.job_output(&run);
    let ack = h
        .listener
        .notify_completion(&job.job_id, Completion::Success { output_ref: output })
        .await
        .unwrap();
    assert_eq!(ack, CompletionAck::Accepted);
    h.drain().await;

    let run = h.orchestrator.run(run_id).await.unwrap();
    assert_eq!(run.state, RunState::Succeeded);
    assert_eq!(run.records_written, Some(10));
    assert_eq!(h.table.commit_calls(), 1);
    for id in &ids {
        assert_eq!(h.table.label_writes(id), 1);
    }
    assert!(h.table.records(&pm25()).iter().all(|r| r.predicted_label));

    // the settled entry is kept for redeliveries until the retention purge
    let settled = h.metadata.get(run_id).await.unwrap().unwrap();
    assert_eq!(settled.outcome, JobOutcome::Success);
}

#[tokio::test]
async fn rejected_submission_fails_without_storing_a_token() {
    let h = harness();
    h.table.seed(&pm25(), 3);
    h.inference
        .fail_next([CollaboratorError::validation("status 400: malformed batch")]);

    let run_id = h.orchestrator.start_run(pm25()).await.unwrap();
    let run = h.orchestrator.run(run_id).await.unwrap();

    assert_eq!(run.state.to_string(), "Failed(\"JobSubmissionFailed\")");
    assert_eq!(h.inference.attempts(), 1);
    assert!(h.metadata.is_empty());
    assert!(run.failure_message.unwrap().contains("malformed batch"));
}

#[tokio::test]
async fn transient_submission_failures_exhaust_the_retry_budget() {
    let h = harness();
    h.table.seed(&pm25(), 3);
    h.inference.fail_next((0..4).map(|_| CollaboratorError::transient("status 503")));

    let run_id = h.orchestrator.start_run(pm25()).await.unwrap();
    let run = h.orchestrator.run(run_id).await.unwrap();

    assert_eq!(run.state, RunState::Failed(FailureReason::JobSubmissionFailed));
    assert_eq!(h.inference.attempts(), 4);
}

#[tokio::test]
async fn transient_query_failures_are_retried() {
    let h = harness();
    h.table.seed(&pm25(), 2);
    h.table.fail_next_queries([
        CollaboratorError::transient("connection reset"),
        CollaboratorError::transient("status 429"),
    ]);

    let run_id = h.orchestrator.start_run(pm25()).await.unwrap();
    let run = h.orchestrator.run(run_id).await.unwrap();
    assert_eq!(run.state, RunState::Active(Step::AwaitingCompletion));
}

#[tokio::test]
async fn query_validation_failure_fails_the_run() {
    let h = harness();
    h.table
        .fail_next_queries([CollaboratorError::validation("unknown parameter")]);

    let run_id = h.orchestrator.start_run(pm25()).await.unwrap();
    let run = h.orchestrator.run(run_id).await.unwrap();
    assert_eq!(run.state, RunState::Failed(FailureReason::RecordQueryFailed));
}

#[tokio::test]
async fn duplicate_success_notification_writes_once() {
    let mut h = harness();
    h.table.seed(&pm25(), 4);

    let run_id = h.orchestrator.start_run(pm25()).await.unwrap();
    let run = h.orchestrator.run(run_id).await.unwrap();
    let job = h.metadata.get(run_id).await.unwrap().unwrap();
    let output = h.job_output(&run);

    let first = h
        .listener
        .notify_completion(&job.job_id, Completion::Success { output_ref: output.clone() })
        .await
        .unwrap();
    let second = h
        .listener
        .notify_completion(&job.job_id, Completion::Success { output_ref: output.clone() })
        .await
        .unwrap();
    assert_eq!(first, CompletionAck::Accepted);
    assert_eq!(second, CompletionAck::Duplicate);

    h.drain().await;
    assert_eq!(h.orchestrator.run(run_id).await.unwrap().state, RunState::Succeeded);

    // a redelivery after the run finished is still a harmless duplicate
    let late = h
        .listener
        .notify_completion(&job.job_id, Completion::Success { output_ref: output.clone() })
        .await
        .unwrap();
    assert_eq!(late, CompletionAck::Duplicate);
    h.drain().await;
    assert_eq!(h.table.commit_calls(), 1);

    // once past retention the entry is purged and the id is no longer known
    let report = h
        .orchestrator
        .sweep_timeouts(Utc::now() + chrono::Duration::days(8))
        .await
        .unwrap();
    assert_eq!(report.purged, 1);
    let purged = h
        .listener
        .notify_completion(&job.job_id, Completion::Success { output_ref: output })
        .await
        .unwrap();
    assert_eq!(purged, CompletionAck::Unknown);
    assert_eq!(h.table.commit_calls(), 1);
}

#[tokio::test]
async fn concurrent_resumes_invoke_the_writer_once() {
    let h = harness();
    h.table.seed(&pm25(), 5);
    h.table.set_commit_latency(Duration::from_millis(20));

    let run_id = h.orchestrator.start_run(pm25()).await.unwrap();
    let run = h.orchestrator.run(run_id).await.unwrap();
    let job = h.metadata.get(run_id).await.unwrap().unwrap();
    h.metadata
        .resolve(&job.suspension_token, &Completion::Success { output_ref: h.job_output(&run) })
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let orchestrator = h.orchestrator.clone();
        handles.push(tokio::spawn(async move { orchestrator.resume(run_id).await }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(h.table.commit_calls(), 1);
    assert_eq!(h.orchestrator.run(run_id).await.unwrap().state, RunState::Succeeded);
}

#[tokio::test]
async fn job_failure_fails_the_run_without_writing() {
    let mut h = harness();
    h.table.seed(&pm25(), 2);

    let run_id = h.orchestrator.start_run(pm25()).await.unwrap();
    let job = h.metadata.get(run_id).await.unwrap().unwrap();

    let completion = completion_from_report(false, None, Some("status 500: OOM".to_string()));
    h.listener.notify_completion(&job.job_id, completion).await.unwrap();
    h.drain().await;

    let run = h.orchestrator.run(run_id).await.unwrap();
    assert_eq!(run.state, RunState::Failed(FailureReason::JobExecutionFailed));
    assert_eq!(run.failure_message.as_deref(), Some("status 500: OOM"));
    assert_eq!(h.table.commit_calls(), 0);
    assert!(h.table.records(&pm25()).iter().all(|r| !r.predicted_label));
}

#[tokio::test]
async fn success_without_output_is_a_job_failure() {
    let mut h = harness();
    h.table.seed(&pm25(), 2);

    let run_id = h.orchestrator.start_run(pm25()).await.unwrap();
    let job = h.metadata.get(run_id).await.unwrap().unwrap();

    h.listener
        .notify_completion(&job.job_id, completion_from_report(true, None, None))
        .await
        .unwrap();
    h.drain().await;

    let run = h.orchestrator.run(run_id).await.unwrap();
    assert_eq!(run.state, RunState::Failed(FailureReason::JobExecutionFailed));
}

#[tokio::test]
async fn awaiting_completion_past_budget_times_out_and_revokes_the_token() {
    let h = harness();
    h.table.seed(&pm25(), 3);

    let run_id = h.orchestrator.start_run(pm25()).await.unwrap();
    let run = h.orchestrator.run(run_id).await.unwrap();
    let job = h.metadata.get(run_id).await.unwrap().unwrap();

    let report = h
        .orchestrator
        .sweep_timeouts(Utc::now() + chrono::Duration::minutes(61))
        .await
        .unwrap();
    assert_eq!(report.timed_out, vec![run_id]);

    let run_after = h.orchestrator.run(run_id).await.unwrap();
    assert_eq!(run_after.state.to_string(), "TimedOut(\"AwaitingCompletion\")");
    assert_eq!(run_after.status(), RunStatus::TimedOut);

    let output = h.job_output(&run);
    let err = h
        .metadata
        .resolve(&job.suspension_token, &Completion::Success { output_ref: output.clone() })
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::TokenNotFound));

    let ack = h
        .listener
        .notify_completion(&job.job_id, Completion::Success { output_ref: output })
        .await
        .unwrap();
    assert_ne!(ack, CompletionAck::Accepted);
    assert_eq!(h.table.commit_calls(), 0);
}

#[tokio::test]
async fn run_budget_expiry_times_out_an_awaiting_run() {
    let h = harness_with(StepBudgets {
        run: Duration::from_secs(1),
        awaiting_completion: Duration::from_secs(3600),
        ..StepBudgets::default()
    });
    h.table.seed(&pm25(), 3);

    let run_id = h.orchestrator.start_run(pm25()).await.unwrap();
    let run = h.orchestrator.run(run_id).await.unwrap();
    assert_eq!(run.state, RunState::Active(Step::AwaitingCompletion));
    let job = h.metadata.get(run_id).await.unwrap().unwrap();
    // the step alone would allow an hour; the run deadline caps it
    assert!(job.expires_at <= run.deadline);

    let report = h.orchestrator.sweep_timeouts(Utc::now()).await.unwrap();
    assert!(report.timed_out.is_empty());

    let report = h
        .orchestrator
        .sweep_timeouts(Utc::now() + chrono::Duration::seconds(2))
        .await
        .unwrap();
    assert_eq!(report.timed_out, vec![run_id]);
    assert_eq!(
        h.orchestrator.run(run_id).await.unwrap().state,
        RunState::TimedOut(Step::AwaitingCompletion)
    );

    let err = h
        .metadata
        .resolve(&job.suspension_token, &Completion::Success { output_ref: h.job_output(&run) })
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::TokenNotFound));
    assert_eq!(h.table.commit_calls(), 0);
}

/// Wait until the active run for `parameter` is submitting its job.
async fn launching_run(h: &Harness, parameter: &Parameter) -> RunId {
    for _ in 0..200 {
        if let Some(run) = h.orchestrator.active_for(parameter).await.unwrap() {
            if run.step() == Some(Step::LaunchingJob) {
                return run.run_id;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("run never reached LaunchingJob");
}

#[tokio::test]
async fn cancel_during_launch_revokes_the_late_token() {
    let h = harness();
    h.table.seed(&pm25(), 2);
    h.inference.set_latency(Duration::from_millis(200));

    let orchestrator = h.orchestrator.clone();
    let driving = tokio::spawn(async move { orchestrator.start_run(pm25()).await });

    let run_id = launching_run(&h, &pm25()).await;
    h.orchestrator.cancel(run_id).await.unwrap();
    assert_eq!(driving.await.unwrap().unwrap(), run_id);

    let run = h.orchestrator.run(run_id).await.unwrap();
    assert_eq!(run.state, RunState::Failed(FailureReason::Cancelled));

    // the job was submitted after the cancel landed, and its token is dead
    let submitted = h.inference.submissions();
    assert_eq!(submitted.len(), 1);
    let job = h.metadata.get(run_id).await.unwrap().unwrap();
    assert_eq!(job.job_id, submitted[0].job_id);
    assert_eq!(job.outcome, JobOutcome::Abandoned);

    let output = h.table.predict(&submitted[0].batch_ref).unwrap();
    let ack = h
        .listener
        .notify_completion(&job.job_id, Completion::Success { output_ref: output })
        .await
        .unwrap();
    assert_eq!(ack, CompletionAck::Rejected);
    assert_eq!(h.table.commit_calls(), 0);
    assert_eq!(h.orchestrator.run(run_id).await.unwrap().state, run.state);
}

#[tokio::test]
async fn sweep_during_launch_revokes_the_late_token() {
    let h = harness();
    h.table.seed(&pm25(), 2);
    h.inference.set_latency(Duration::from_millis(200));

    let orchestrator = h.orchestrator.clone();
    let driving = tokio::spawn(async move { orchestrator.start_run(pm25()).await });

    let run_id = launching_run(&h, &pm25()).await;
    let report = h
        .orchestrator
        .sweep_timeouts(Utc::now() + chrono::Duration::minutes(16))
        .await
        .unwrap();
    assert_eq!(report.timed_out, vec![run_id]);
    driving.await.unwrap().unwrap();

    assert_eq!(
        h.orchestrator.run(run_id).await.unwrap().state,
        RunState::TimedOut(Step::LaunchingJob)
    );
    let job = h.metadata.get(run_id).await.unwrap().unwrap();
    assert_eq!(job.outcome, JobOutcome::Abandoned);
    assert!(h.metadata.list_expired(Utc::now() + chrono::Duration::days(1)).await.unwrap().is_empty());
}

#[tokio::test]
async fn completion_that_beats_the_sweep_wins() {
    let h = harness();
    h.table.seed(&pm25(), 3);

    let run_id = h.orchestrator.start_run(pm25()).await.unwrap();
    let run = h.orchestrator.run(run_id).await.unwrap();
    let job = h.metadata.get(run_id).await.unwrap().unwrap();

    // resolved, but the resume was never delivered
    h.metadata
        .resolve(&job.suspension_token, &Completion::Success { output_ref: h.job_output(&run) })
        .await
        .unwrap();

    let report = h
        .orchestrator
        .sweep_timeouts(Utc::now() + chrono::Duration::minutes(61))
        .await
        .unwrap();

    assert!(report.timed_out.is_empty());
    assert_eq!(report.resumed, vec![run_id]);
    assert_eq!(h.orchestrator.run(run_id).await.unwrap().state, RunState::Succeeded);
}

#[tokio::test]
async fn stuck_launch_times_out_on_sweep() {
    let h = harness();
    let budgets = StepBudgets::default();

    // A run left in LaunchingJob by a crashed process.
    let mut run = Run::new(pm25(), &budgets, Utc::now());
    h.runs.insert(&run).await.unwrap();
    let now = Utc::now();
    run.apply(&RunEvent::Started, now).unwrap();
    run.apply(
        &RunEvent::RecordsFound {
            record_count: 1,
            batch_ref: batchflow_core::RecordBatchRef::new("retrieved/x.csv").unwrap(),
        },
        now,
    )
    .unwrap();
    h.runs.save(&run, ExpectedVersion::Exact(0)).await.unwrap();

    let report = h.orchestrator.sweep_timeouts(Utc::now()).await.unwrap();
    assert!(report.timed_out.is_empty());

    let report = h
        .orchestrator
        .sweep_timeouts(Utc::now() + chrono::Duration::minutes(16))
        .await
        .unwrap();
    assert_eq!(report.timed_out, vec![run.run_id]);
    assert_eq!(
        h.orchestrator.run(run.run_id).await.unwrap().state,
        RunState::TimedOut(Step::LaunchingJob)
    );
}

#[tokio::test]
async fn slow_launch_times_out_in_process() {
    let h = harness_with(StepBudgets {
        launching_job: Duration::from_millis(50),
        ..StepBudgets::default()
    });
    h.table.seed(&pm25(), 1);
    h.inference.set_latency(Duration::from_millis(500));

    let run_id = h.orchestrator.start_run(pm25()).await.unwrap();
    let run = h.orchestrator.run(run_id).await.unwrap();

    assert_eq!(run.state, RunState::TimedOut(Step::LaunchingJob));
    assert!(h.metadata.is_empty());
}

#[tokio::test]
async fn slow_commit_times_out_writing_results() {
    let mut h = harness_with(StepBudgets {
        writing_results: Duration::from_millis(50),
        ..StepBudgets::default()
    });
    h.table.seed(&pm25(), 1);
    h.table.set_commit_latency(Duration::from_millis(500));

    let run_id = h.orchestrator.start_run(pm25()).await.unwrap();
    let run = h.orchestrator.run(run_id).await.unwrap();
    let job = h.metadata.get(run_id).await.unwrap().unwrap();
    h.listener
        .notify_completion(&job.job_id, Completion::Success { output_ref: h.job_output(&run) })
        .await
        .unwrap();
    h.drain().await;

    assert_eq!(
        h.orchestrator.run(run_id).await.unwrap().state,
        RunState::TimedOut(Step::WritingResults)
    );
}

#[tokio::test]
async fn commit_failure_fails_the_run() {
    let mut h = harness();
    h.table.seed(&pm25(), 1);
    h.table
        .fail_next_commits([CollaboratorError::validation("schema mismatch")]);

    let run_id = h.orchestrator.start_run(pm25()).await.unwrap();
    let run = h.orchestrator.run(run_id).await.unwrap();
    let job = h.metadata.get(run_id).await.unwrap().unwrap();
    h.listener
        .notify_completion(&job.job_id, Completion::Success { output_ref: h.job_output(&run) })
        .await
        .unwrap();
    h.drain().await;

    let run = h.orchestrator.run(run_id).await.unwrap();
    assert_eq!(run.state, RunState::Failed(FailureReason::ResultCommitFailed));
}

#[tokio::test]
async fn cancel_revokes_the_token_and_is_final() {
    let h = harness();
    h.table.seed(&pm25(), 2);

    let run_id = h.orchestrator.start_run(pm25()).await.unwrap();
    let job = h.metadata.get(run_id).await.unwrap().unwrap();

    let run = h.orchestrator.cancel(run_id).await.unwrap();
    assert_eq!(run.state.to_string(), "Failed(\"Cancelled\")");

    let err = h
        .metadata
        .resolve(
            &job.suspension_token,
            &Completion::Failure {
                message: "late".to_string(),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::TokenNotFound));

    let again = h.orchestrator.cancel(run_id).await.unwrap_err();
    assert!(matches!(again, OrchestratorError::AlreadyTerminal { .. }));
}

#[tokio::test]
async fn one_active_run_per_parameter() {
    let h = harness();
    h.table.seed(&pm25(), 2);

    let first = h.orchestrator.start_run(pm25()).await.unwrap();
    let err = h.orchestrator.start_run(pm25()).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::RunAlreadyActive(_)));

    // a different parameter is independent
    let no2 = Parameter::new("no2").unwrap();
    let other = h.orchestrator.start_run(no2.clone()).await.unwrap();
    assert_ne!(first, other);
    assert_eq!(h.orchestrator.runs_for(Some(&pm25()), 10).await.unwrap().len(), 1);
    assert_eq!(h.orchestrator.runs_for(None, 10).await.unwrap().len(), 2);
}

#[tokio::test]
async fn next_run_skips_already_labelled_records() {
    let mut h = harness();
    h.table.seed(&pm25(), 3);

    let run_id = h.orchestrator.start_run(pm25()).await.unwrap();
    let run = h.orchestrator.run(run_id).await.unwrap();
    let job = h.metadata.get(run_id).await.unwrap().unwrap();
    h.listener
        .notify_completion(&job.job_id, Completion::Success { output_ref: h.job_output(&run) })
        .await
        .unwrap();
    h.drain().await;

    let second = h.orchestrator.start_run(pm25()).await.unwrap();
    assert_eq!(
        h.orchestrator.run(second).await.unwrap().state,
        RunState::NoRecordsFound
    );
    assert_eq!(h.inference.submissions().len(), 1);
}

#[tokio::test]
async fn recover_resumes_runs_resolved_while_down() {
    let h = harness();
    h.table.seed(&pm25(), 2);

    let run_id = h.orchestrator.start_run(pm25()).await.unwrap();
    let run = h.orchestrator.run(run_id).await.unwrap();
    let job = h.metadata.get(run_id).await.unwrap().unwrap();
    // resolved, queue lost with the process
    h.metadata
        .resolve(&job.suspension_token, &Completion::Success { output_ref: h.job_output(&run) })
        .await
        .unwrap();

    let report = h.orchestrator.recover().await.unwrap();
    assert_eq!(report.resumed, vec![run_id]);
    assert_eq!(h.orchestrator.run(run_id).await.unwrap().state, RunState::Succeeded);
    assert_eq!(h.table.commit_calls(), 1);
}

#[tokio::test]
async fn resume_worker_drives_runs_to_completion() {
    let h = harness();
    h.table.seed(&pm25(), 2);
    let Harness {
        orchestrator,
        metadata,
        table,
        listener,
        queue,
        ..
    } = h;

    let worker = ResumeWorker::spawn(orchestrator.clone(), queue);

    let run_id = orchestrator.start_run(pm25()).await.unwrap();
    let run = orchestrator.run(run_id).await.unwrap();
    let job = metadata.get(run_id).await.unwrap().unwrap();
    let output = table.predict(run.record_batch_ref.as_ref().unwrap()).unwrap();
    listener
        .notify_completion(&job.job_id, Completion::Success { output_ref: output })
        .await
        .unwrap();

    let mut state = RunState::default();
    for _ in 0..100 {
        state = orchestrator.run(run_id).await.unwrap().state;
        if state.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(state, RunState::Succeeded);

    worker.shutdown().await;
}

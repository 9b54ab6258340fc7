//! Completion Listener: bridges push-style job notifications into the
//! pull-style state machine.
//!
//! A notification resolves the job's suspension token (exactly once, whatever
//! the delivery count) and queues the run id. The `ResumeWorker` drains that
//! queue and calls `Orchestrator::resume`; nothing waits in between.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use batchflow_core::{ExternalJobId, OutputRef, RunId};
use batchflow_workflow::Completion;

use crate::error::StoreError;
use crate::metadata_store::{MetadataStore, Resolution};
use crate::orchestrator::Orchestrator;

/// What the listener did with a notification.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionAck {
    /// First delivery; the run was queued for resumption.
    Accepted,
    /// Already resolved; no side effects.
    Duplicate,
    /// Token was revoked (timeout/cancel); no side effects.
    Rejected,
    /// No job with this id is recorded.
    Unknown,
}

#[derive(Debug, Error)]
pub enum CompletionError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("resume queue is closed")]
    QueueClosed,
}

/// Build a completion from what the external job reported.
///
/// A success without an output reference is unusable and counts as a failure.
pub fn completion_from_report(
    succeeded: bool,
    output_ref: Option<OutputRef>,
    error: Option<String>,
) -> Completion {
    match (succeeded, output_ref) {
        (true, Some(output_ref)) => Completion::Success { output_ref },
        (true, None) => Completion::Failure {
            message: "job reported success without an output reference".to_string(),
        },
        (false, _) => Completion::Failure {
            message: error.unwrap_or_else(|| "inference job failed".to_string()),
        },
    }
}

#[derive(Clone)]
pub struct CompletionListener {
    metadata: Arc<dyn MetadataStore>,
    resume_tx: mpsc::Sender<RunId>,
}

impl CompletionListener {
    /// Create a listener and the receiving end of its resume queue.
    pub fn new(metadata: Arc<dyn MetadataStore>, capacity: usize) -> (Self, mpsc::Receiver<RunId>) {
        let (resume_tx, resume_rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                metadata,
                resume_tx,
            },
            resume_rx,
        )
    }

    /// Handle one (possibly duplicate) completion notification for `job_id`.
    pub async fn notify_completion(
        &self,
        job_id: &ExternalJobId,
        completion: Completion,
    ) -> Result<CompletionAck, CompletionError> {
        let Some(job) = self.metadata.find_by_job_id(job_id).await? else {
            warn!(job_id = %job_id, "completion for unknown job");
            return Ok(CompletionAck::Unknown);
        };

        match self.metadata.resolve(&job.suspension_token, &completion).await {
            Ok(Resolution::Resolved(job)) => {
                info!(
                    run_id = %job.run_id,
                    job_id = %job_id,
                    outcome = %job.outcome,
                    "job resolved"
                );
                self.resume_tx
                    .send(job.run_id)
                    .await
                    .map_err(|_| CompletionError::QueueClosed)?;
                Ok(CompletionAck::Accepted)
            }
            Ok(Resolution::AlreadyResolved(job)) => {
                debug!(run_id = %job.run_id, job_id = %job_id, "duplicate completion ignored");
                Ok(CompletionAck::Duplicate)
            }
            Err(StoreError::TokenNotFound) => {
                warn!(run_id = %job.run_id, job_id = %job_id, "late completion for revoked token");
                Ok(CompletionAck::Rejected)
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Handle to stop the resume worker.
#[derive(Debug)]
pub struct ResumeWorkerHandle {
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
}

impl ResumeWorkerHandle {
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }
}

/// Drains the resume queue into `Orchestrator::resume`.
pub struct ResumeWorker;

impl ResumeWorker {
    pub fn spawn(orchestrator: Arc<Orchestrator>, mut queue: mpsc::Receiver<RunId>) -> ResumeWorkerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let join = tokio::spawn(async move {
            info!("resume worker started");
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => break,
                    next = queue.recv() => {
                        let Some(run_id) = next else { break };
                        if let Err(e) = orchestrator.resume(run_id).await {
                            // The sweeper picks the run up again once its deadline passes.
                            error!(run_id = %run_id, error = %e, "resume failed");
                        }
                    }
                }
            }
            info!("resume worker stopped");
        });

        ResumeWorkerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchflow_core::{Parameter, RecordBatchRef, SuspensionToken};
    use batchflow_workflow::Job;
    use chrono::Utc;

    use crate::metadata_store::InMemoryMetadataStore;

    async fn setup() -> (CompletionListener, mpsc::Receiver<RunId>, Arc<InMemoryMetadataStore>, Job) {
        let metadata = InMemoryMetadataStore::arc();
        let (listener, rx) = CompletionListener::new(metadata.clone(), 8);
        let now = Utc::now();
        let job = Job::pending(
            RunId::new(),
            Parameter::new("pm25").unwrap(),
            ExternalJobId::new("batch-0001").unwrap(),
            SuspensionToken::generate(),
            RecordBatchRef::new("retrieved/b.csv").unwrap(),
            now,
            now + chrono::Duration::hours(1),
        );
        metadata.put(job.run_id, job.clone()).await.unwrap();
        (listener, rx, metadata, job)
    }

    fn success() -> Completion {
        completion_from_report(true, Some(OutputRef::new("predicted/b.csv").unwrap()), None)
    }

    #[tokio::test]
    async fn first_delivery_queues_the_run_once() {
        let (listener, mut rx, _, job) = setup().await;

        assert_eq!(
            listener.notify_completion(&job.job_id, success()).await.unwrap(),
            CompletionAck::Accepted
        );
        assert_eq!(
            listener.notify_completion(&job.job_id, success()).await.unwrap(),
            CompletionAck::Duplicate
        );

        assert_eq!(rx.try_recv().unwrap(), job.run_id);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unknown_and_revoked_jobs_have_no_side_effects() {
        let (listener, mut rx, metadata, job) = setup().await;

        let unknown = ExternalJobId::new("batch-9999").unwrap();
        assert_eq!(
            listener.notify_completion(&unknown, success()).await.unwrap(),
            CompletionAck::Unknown
        );

        metadata.abandon(job.run_id).await.unwrap();
        assert_eq!(
            listener.notify_completion(&job.job_id, success()).await.unwrap(),
            CompletionAck::Rejected
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn success_without_output_counts_as_failure() {
        assert!(matches!(
            completion_from_report(true, None, None),
            Completion::Failure { .. }
        ));
        assert!(matches!(
            completion_from_report(false, None, Some("OOM".to_string())),
            Completion::Failure { message } if message == "OOM"
        ));
    }
}

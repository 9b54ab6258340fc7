//! Job Launcher: submit a batch and record the suspension token.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::info;

use batchflow_core::{RecordBatchRef, SuspensionToken};
use batchflow_workflow::{CollaboratorError, Job, RetryPolicy, Run};

use crate::collaborators::InferenceService;
use crate::error::StoreError;
use crate::metadata_store::MetadataStore;
use crate::retrying::with_retry;

#[derive(Debug, Clone, Error)]
pub enum LaunchError {
    /// The inference service rejected the batch, or stayed unavailable past the retry budget.
    #[error("job submission failed: {0}")]
    Submission(#[from] CollaboratorError),

    #[error("could not record job: {0}")]
    Store(#[from] StoreError),
}

pub struct JobLauncher {
    inference: Arc<dyn InferenceService>,
    metadata: Arc<dyn MetadataStore>,
    retry: RetryPolicy,
}

impl JobLauncher {
    pub fn new(
        inference: Arc<dyn InferenceService>,
        metadata: Arc<dyn MetadataStore>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            inference,
            metadata,
            retry,
        }
    }

    /// Submit `batch_ref` for `run` and store the pending job.
    ///
    /// The token is only persisted after the service accepted the batch, so a
    /// failed submission never leaves a resolvable token behind.
    pub async fn launch(
        &self,
        run: &Run,
        batch_ref: &RecordBatchRef,
        expires_at: DateTime<Utc>,
    ) -> Result<Job, LaunchError> {
        let token = SuspensionToken::generate();

        let job_id = with_retry(&self.retry, "submit_job", run.run_id, || {
            self.inference.submit(&run.parameter, batch_ref)
        })
        .await?;

        let job = Job::pending(
            run.run_id,
            run.parameter.clone(),
            job_id,
            token,
            batch_ref.clone(),
            Utc::now(),
            expires_at,
        );
        self.metadata.put(run.run_id, job.clone()).await?;

        info!(
            run_id = %run.run_id,
            job_id = %job.job_id,
            expires_at = %job.expires_at,
            "job submitted; suspension token recorded"
        );
        Ok(job)
    }
}

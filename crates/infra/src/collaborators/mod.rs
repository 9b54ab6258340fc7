//! External collaborators, specified only at their interface.
//!
//! The orchestrator never touches record rows itself: it asks `RecordQuery`
//! for unprocessed ids, hands an opaque batch reference to
//! `InferenceService`, and later passes the job's output reference to
//! `ResultWriter`, which owns setting `predicted_label`.

mod http;
mod in_memory;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use batchflow_core::{ExternalJobId, OutputRef, Parameter, RecordBatchRef, RecordId};
use batchflow_workflow::CollaboratorError;

pub use http::{HttpInferenceService, HttpRecordQuery, HttpResultWriter, classify_status};
pub use in_memory::{InMemoryInferenceService, InMemoryRecordTable, Record, Submission};

/// Unprocessed records found for a parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordBatch {
    pub record_ids: Vec<RecordId>,
    /// Where the batch was staged for the inference job; absent when empty.
    pub batch_ref: Option<RecordBatchRef>,
}

impl RecordBatch {
    pub fn empty() -> Self {
        Self {
            record_ids: Vec::new(),
            batch_ref: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.record_ids.is_empty()
    }
}

/// Acknowledgement from the result writer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitAck {
    pub records_written: u64,
}

#[async_trait::async_trait]
pub trait RecordQuery: Send + Sync {
    /// Records with `predicted_label = false` for `parameter`. Empty is valid.
    async fn query_unprocessed(&self, parameter: &Parameter)
    -> Result<RecordBatch, CollaboratorError>;
}

#[async_trait::async_trait]
pub trait InferenceService: Send + Sync {
    /// Submit a batch to the long-running inference job.
    async fn submit(
        &self,
        parameter: &Parameter,
        batch_ref: &RecordBatchRef,
    ) -> Result<ExternalJobId, CollaboratorError>;
}

#[async_trait::async_trait]
pub trait ResultWriter: Send + Sync {
    /// Commit predictions; must be idempotent per `output_ref`.
    async fn commit(&self, output_ref: &OutputRef) -> Result<CommitAck, CollaboratorError>;
}

#[async_trait::async_trait]
impl<T: RecordQuery + ?Sized> RecordQuery for Arc<T> {
    async fn query_unprocessed(
        &self,
        parameter: &Parameter,
    ) -> Result<RecordBatch, CollaboratorError> {
        (**self).query_unprocessed(parameter).await
    }
}

#[async_trait::async_trait]
impl<T: InferenceService + ?Sized> InferenceService for Arc<T> {
    async fn submit(
        &self,
        parameter: &Parameter,
        batch_ref: &RecordBatchRef,
    ) -> Result<ExternalJobId, CollaboratorError> {
        (**self).submit(parameter, batch_ref).await
    }
}

#[async_trait::async_trait]
impl<T: ResultWriter + ?Sized> ResultWriter for Arc<T> {
    async fn commit(&self, output_ref: &OutputRef) -> Result<CommitAck, CollaboratorError> {
        (**self).commit(output_ref).await
    }
}

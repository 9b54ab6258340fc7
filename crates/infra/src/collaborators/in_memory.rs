//! In-memory collaborators for dev and tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;

use batchflow_core::{ExternalJobId, OutputRef, Parameter, RecordBatchRef, RecordId};
use batchflow_workflow::CollaboratorError;

use super::{CommitAck, InferenceService, RecordBatch, RecordQuery, ResultWriter};

/// One sensor measurement row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    pub record_id: RecordId,
    pub parameter: Parameter,
    pub value: f64,
    pub predicted_label: bool,
}

#[derive(Debug, Default)]
struct TableState {
    records: BTreeMap<RecordId, Record>,
    batches: HashMap<RecordBatchRef, Vec<RecordId>>,
    outputs: HashMap<OutputRef, Vec<RecordId>>,
    committed: HashMap<OutputRef, CommitAck>,
    label_writes: HashMap<RecordId, u32>,
    query_failures: VecDeque<CollaboratorError>,
    commit_failures: VecDeque<CollaboratorError>,
    commit_calls: u32,
    next_batch: u64,
}

/// Sensor record table acting as both the record query and the result writer.
///
/// `predict` stands in for the external inference job: it turns a staged
/// batch into an output reference covering the same records.
#[derive(Debug, Default)]
pub struct InMemoryRecordTable {
    state: Mutex<TableState>,
    commit_latency: Mutex<Option<Duration>>,
}

impl InMemoryRecordTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, TableState>, CollaboratorError> {
        self.state
            .lock()
            .map_err(|_| CollaboratorError::transient("record table lock poisoned"))
    }

    /// Seed `count` unlabelled records for `parameter`.
    pub fn seed(&self, parameter: &Parameter, count: usize) -> Vec<RecordId> {
        let Ok(mut state) = self.state.lock() else {
            return Vec::new();
        };
        let offset = state.records.len();
        (0..count)
            .filter_map(|i| {
                let record_id = RecordId::new(format!("{parameter}-{:06}", offset + i)).ok()?;
                state.records.insert(
                    record_id.clone(),
                    Record {
                        record_id: record_id.clone(),
                        parameter: parameter.clone(),
                        value: (offset + i) as f64 * 0.5,
                        predicted_label: false,
                    },
                );
                Some(record_id)
            })
            .collect()
    }

    /// Produce the output of an inference job over a staged batch.
    pub fn predict(&self, batch_ref: &RecordBatchRef) -> Result<OutputRef, CollaboratorError> {
        let mut state = self.lock()?;
        let ids = state
            .batches
            .get(batch_ref)
            .cloned()
            .ok_or_else(|| CollaboratorError::validation(format!("unknown batch {batch_ref}")))?;
        let location = batch_ref.location().replacen("retrieved/", "predicted/", 1);
        let output_ref = OutputRef::new(format!("{location}.out"))
            .map_err(|e| CollaboratorError::validation(e.to_string()))?;
        state.outputs.insert(output_ref.clone(), ids);
        Ok(output_ref)
    }

    /// Queue failures returned by the next `query_unprocessed` calls.
    pub fn fail_next_queries(&self, errors: impl IntoIterator<Item = CollaboratorError>) {
        if let Ok(mut state) = self.state.lock() {
            state.query_failures.extend(errors);
        }
    }

    /// Queue failures returned by the next `commit` calls.
    pub fn fail_next_commits(&self, errors: impl IntoIterator<Item = CollaboratorError>) {
        if let Ok(mut state) = self.state.lock() {
            state.commit_failures.extend(errors);
        }
    }

    pub fn set_commit_latency(&self, latency: Duration) {
        if let Ok(mut slot) = self.commit_latency.lock() {
            *slot = Some(latency);
        }
    }

    pub fn records(&self, parameter: &Parameter) -> Vec<Record> {
        self.state
            .lock()
            .map(|s| {
                s.records
                    .values()
                    .filter(|r| &r.parameter == parameter)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// How many times each record's label was flipped to true.
    pub fn label_writes(&self, record_id: &RecordId) -> u32 {
        self.state
            .lock()
            .map(|s| s.label_writes.get(record_id).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn commit_calls(&self) -> u32 {
        self.state.lock().map(|s| s.commit_calls).unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl RecordQuery for InMemoryRecordTable {
    async fn query_unprocessed(
        &self,
        parameter: &Parameter,
    ) -> Result<RecordBatch, CollaboratorError> {
        let mut state = self.lock()?;
        if let Some(err) = state.query_failures.pop_front() {
            return Err(err);
        }

        let ids: Vec<RecordId> = state
            .records
            .values()
            .filter(|r| &r.parameter == parameter && !r.predicted_label)
            .map(|r| r.record_id.clone())
            .collect();
        if ids.is_empty() {
            return Ok(RecordBatch::empty());
        }

        state.next_batch += 1;
        let batch_ref =
            RecordBatchRef::new(format!("retrieved/{parameter}/batch-{:04}.csv", state.next_batch))
                .map_err(|e| CollaboratorError::validation(e.to_string()))?;
        state.batches.insert(batch_ref.clone(), ids.clone());

        Ok(RecordBatch {
            record_ids: ids,
            batch_ref: Some(batch_ref),
        })
    }
}

#[async_trait::async_trait]
impl ResultWriter for InMemoryRecordTable {
    async fn commit(&self, output_ref: &OutputRef) -> Result<CommitAck, CollaboratorError> {
        let latency = self.commit_latency.lock().ok().and_then(|l| *l);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.lock()?;
        state.commit_calls += 1;
        if let Some(err) = state.commit_failures.pop_front() {
            return Err(err);
        }
        if let Some(ack) = state.committed.get(output_ref) {
            return Ok(*ack);
        }

        let ids = state
            .outputs
            .get(output_ref)
            .cloned()
            .ok_or_else(|| CollaboratorError::validation(format!("unknown output {output_ref}")))?;

        let mut written = 0u64;
        for id in &ids {
            let newly_labelled = match state.records.get_mut(id) {
                Some(record) if !record.predicted_label => {
                    record.predicted_label = true;
                    true
                }
                _ => false,
            };
            if newly_labelled {
                *state.label_writes.entry(id.clone()).or_default() += 1;
                written += 1;
            }
        }

        let ack = CommitAck {
            records_written: written,
        };
        state.committed.insert(output_ref.clone(), ack);
        Ok(ack)
    }
}

/// A batch handed to the inference service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub parameter: Parameter,
    pub batch_ref: RecordBatchRef,
    pub job_id: ExternalJobId,
}

#[derive(Debug, Default)]
struct InferenceState {
    submissions: Vec<Submission>,
    failures: VecDeque<CollaboratorError>,
    attempts: u32,
}

/// Inference service stand-in with scripted failures.
#[derive(Debug, Default)]
pub struct InMemoryInferenceService {
    state: Mutex<InferenceState>,
    latency: Mutex<Option<Duration>>,
}

impl InMemoryInferenceService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn fail_next(&self, errors: impl IntoIterator<Item = CollaboratorError>) {
        if let Ok(mut state) = self.state.lock() {
            state.failures.extend(errors);
        }
    }

    pub fn set_latency(&self, latency: Duration) {
        if let Ok(mut slot) = self.latency.lock() {
            *slot = Some(latency);
        }
    }

    /// Accepted submissions, in order.
    pub fn submissions(&self) -> Vec<Submission> {
        self.state
            .lock()
            .map(|s| s.submissions.clone())
            .unwrap_or_default()
    }

    /// Every call, including rejected ones.
    pub fn attempts(&self) -> u32 {
        self.state.lock().map(|s| s.attempts).unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl InferenceService for InMemoryInferenceService {
    async fn submit(
        &self,
        parameter: &Parameter,
        batch_ref: &RecordBatchRef,
    ) -> Result<ExternalJobId, CollaboratorError> {
        let latency = self.latency.lock().ok().and_then(|l| *l);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self
            .state
            .lock()
            .map_err(|_| CollaboratorError::transient("inference state lock poisoned"))?;
        state.attempts += 1;
        if let Some(err) = state.failures.pop_front() {
            return Err(err);
        }

        let job_id = ExternalJobId::new(format!("batch-{:04}", state.submissions.len() + 1))
            .map_err(|e| CollaboratorError::validation(e.to_string()))?;
        state.submissions.push(Submission {
            parameter: parameter.clone(),
            batch_ref: batch_ref.clone(),
            job_id: job_id.clone(),
        });
        Ok(job_id)
    }
}

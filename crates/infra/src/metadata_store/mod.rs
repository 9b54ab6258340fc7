//! Job Metadata Store: durable bookkeeping for the single suspension point.
//!
//! Entries are keyed by `run_id` and hold the job id, the suspension token and
//! the job outcome. Every write is a single-key compare-and-set:
//!
//! - `put` refuses to replace a `Pending` job (at most one per run)
//! - `resolve` flips `Pending` → `Success | Failure` exactly once per token
//! - `abandon` flips `Pending` → `Abandoned` (token permanently unresolvable)
//!
//! Settled entries stay behind as tombstones so late redeliveries still find
//! their job; `purge_settled` drops them once they are past retention.
//!
//! Concurrent duplicate `resolve` calls therefore yield exactly one
//! `Resolution::Resolved`; every other caller sees `AlreadyResolved`.

mod in_memory;
mod postgres;

use std::sync::Arc;

use chrono::{DateTime, Utc};

use batchflow_core::{ExternalJobId, RunId, SuspensionToken};
use batchflow_workflow::{Completion, Job};

use crate::error::StoreError;

pub use in_memory::InMemoryMetadataStore;
pub use postgres::PostgresMetadataStore;

/// Result of resolving a suspension token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// This call moved the job out of `Pending`.
    Resolved(Job),
    /// Someone else already resolved it; the stored job is unchanged.
    AlreadyResolved(Job),
}

impl Resolution {
    pub fn job(&self) -> &Job {
        match self {
            Resolution::Resolved(job) | Resolution::AlreadyResolved(job) => job,
        }
    }

    pub fn is_first(&self) -> bool {
        matches!(self, Resolution::Resolved(_))
    }
}

#[async_trait::async_trait]
pub trait MetadataStore: Send + Sync {
    /// Record a job for `run_id`. Fails with `Conflict` while a `Pending` job exists.
    async fn put(&self, run_id: RunId, job: Job) -> Result<(), StoreError>;

    async fn get(&self, run_id: RunId) -> Result<Option<Job>, StoreError>;

    async fn find_by_job_id(&self, job_id: &ExternalJobId) -> Result<Option<Job>, StoreError>;

    /// Resolve a token with a completion.
    ///
    /// `TokenNotFound` if the token is unknown, purged, or abandoned.
    async fn resolve(
        &self,
        token: &SuspensionToken,
        completion: &Completion,
    ) -> Result<Resolution, StoreError>;

    /// Revoke the pending token of `run_id`. `None` if no job was pending.
    async fn abandon(&self, run_id: RunId) -> Result<Option<Job>, StoreError>;

    /// Drop settled (non-`Pending`) entries resolved at or before `before`.
    ///
    /// Returns how many entries were removed.
    async fn purge_settled(&self, before: DateTime<Utc>) -> Result<usize, StoreError>;

    /// Pending jobs whose `expires_at` is at or before `now`.
    async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<Job>, StoreError>;
}

#[async_trait::async_trait]
impl<S> MetadataStore for Arc<S>
where
    S: MetadataStore + ?Sized,
{
    async fn put(&self, run_id: RunId, job: Job) -> Result<(), StoreError> {
        (**self).put(run_id, job).await
    }

    async fn get(&self, run_id: RunId) -> Result<Option<Job>, StoreError> {
        (**self).get(run_id).await
    }

    async fn find_by_job_id(&self, job_id: &ExternalJobId) -> Result<Option<Job>, StoreError> {
        (**self).find_by_job_id(job_id).await
    }

    async fn resolve(
        &self,
        token: &SuspensionToken,
        completion: &Completion,
    ) -> Result<Resolution, StoreError> {
        (**self).resolve(token, completion).await
    }

    async fn abandon(&self, run_id: RunId) -> Result<Option<Job>, StoreError> {
        (**self).abandon(run_id).await
    }

    async fn purge_settled(&self, before: DateTime<Utc>) -> Result<usize, StoreError> {
        (**self).purge_settled(before).await
    }

    async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        (**self).list_expired(now).await
    }
}

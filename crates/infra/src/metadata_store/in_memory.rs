use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use batchflow_core::{ExternalJobId, RunId, SuspensionToken};
use batchflow_workflow::{Completion, Job, JobResolution};

use super::{MetadataStore, Resolution};
use crate::error::StoreError;

/// In-memory metadata store for tests/dev.
///
/// One write lock covers each operation, which makes every call a
/// single-key compare-and-set.
#[derive(Debug, Default)]
pub struct InMemoryMetadataStore {
    jobs: RwLock<HashMap<RunId, Job>>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of stored entries (any outcome).
    pub fn len(&self) -> usize {
        self.jobs.read().map(|jobs| jobs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait::async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn put(&self, run_id: RunId, job: Job) -> Result<(), StoreError> {
        if job.run_id != run_id {
            return Err(StoreError::Conflict(format!(
                "job belongs to run {}, not {}",
                job.run_id, run_id
            )));
        }

        let mut jobs = self.jobs.write().map_err(|_| StoreError::poisoned())?;
        if let Some(existing) = jobs.get(&run_id) {
            if existing.outcome.is_pending() {
                return Err(StoreError::Conflict(format!(
                    "run {run_id} already has a pending job ({})",
                    existing.job_id
                )));
            }
        }
        if jobs
            .values()
            .any(|j| j.run_id != run_id && j.job_id == job.job_id)
        {
            return Err(StoreError::Conflict(format!(
                "job id {} already recorded for another run",
                job.job_id
            )));
        }

        jobs.insert(run_id, job);
        Ok(())
    }

    async fn get(&self, run_id: RunId) -> Result<Option<Job>, StoreError> {
        let jobs = self.jobs.read().map_err(|_| StoreError::poisoned())?;
        Ok(jobs.get(&run_id).cloned())
    }

    async fn find_by_job_id(&self, job_id: &ExternalJobId) -> Result<Option<Job>, StoreError> {
        let jobs = self.jobs.read().map_err(|_| StoreError::poisoned())?;
        Ok(jobs.values().find(|j| &j.job_id == job_id).cloned())
    }

    async fn resolve(
        &self,
        token: &SuspensionToken,
        completion: &Completion,
    ) -> Result<Resolution, StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::poisoned())?;
        let job = jobs
            .values_mut()
            .find(|j| &j.suspension_token == token)
            .ok_or(StoreError::TokenNotFound)?;

        match job.resolve(completion, Utc::now()) {
            JobResolution::Resolved => Ok(Resolution::Resolved(job.clone())),
            JobResolution::AlreadyResolved => Ok(Resolution::AlreadyResolved(job.clone())),
            JobResolution::Abandoned => Err(StoreError::TokenNotFound),
        }
    }

    async fn abandon(&self, run_id: RunId) -> Result<Option<Job>, StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::poisoned())?;
        match jobs.get_mut(&run_id) {
            Some(job) => Ok(job.abandon(Utc::now()).then(|| job.clone())),
            None => Ok(None),
        }
    }

    async fn purge_settled(&self, before: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::poisoned())?;
        let len = jobs.len();
        jobs.retain(|_, job| {
            job.outcome.is_pending() || job.resolved_at.is_none_or(|at| at > before)
        });
        Ok(len - jobs.len())
    }

    async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.read().map_err(|_| StoreError::poisoned())?;
        let mut expired: Vec<_> = jobs.values().filter(|j| j.is_expired(now)).cloned().collect();
        expired.sort_by_key(|j| j.expires_at);
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchflow_core::{OutputRef, Parameter, RecordBatchRef};
    use batchflow_workflow::JobOutcome;
    use proptest::prelude::*;

    fn pending(run_id: RunId, job_id: &str, ttl: chrono::Duration) -> Job {
        let now = Utc::now();
        Job::pending(
            run_id,
            Parameter::new("pm25").unwrap(),
            ExternalJobId::new(job_id).unwrap(),
            SuspensionToken::generate(),
            RecordBatchRef::new("retrieved/batch.csv").unwrap(),
            now,
            now + ttl,
        )
    }

    fn success() -> Completion {
        Completion::Success {
            output_ref: OutputRef::new("predicted/out.csv").unwrap(),
        }
    }

    #[tokio::test]
    async fn at_most_one_pending_job_per_run() {
        let store = InMemoryMetadataStore::new();
        let run_id = RunId::new();

        store.put(run_id, pending(run_id, "job-1", chrono::Duration::hours(1))).await.unwrap();
        let err = store
            .put(run_id, pending(run_id, "job-2", chrono::Duration::hours(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        store.abandon(run_id).await.unwrap();
        store.put(run_id, pending(run_id, "job-3", chrono::Duration::hours(1))).await.unwrap();
    }

    #[tokio::test]
    async fn resolve_is_idempotent_per_token() {
        let store = InMemoryMetadataStore::new();
        let run_id = RunId::new();
        let job = pending(run_id, "job-1", chrono::Duration::hours(1));
        let token = job.suspension_token.clone();
        store.put(run_id, job).await.unwrap();

        let first = store.resolve(&token, &success()).await.unwrap();
        assert!(first.is_first());
        assert_eq!(first.job().outcome, JobOutcome::Success);

        let failure = Completion::Failure {
            message: "late".to_string(),
        };
        let second = store.resolve(&token, &failure).await.unwrap();
        assert!(matches!(second, Resolution::AlreadyResolved(ref j) if j.outcome == JobOutcome::Success));
    }

    #[tokio::test]
    async fn unknown_and_abandoned_tokens_are_not_found() {
        let store = InMemoryMetadataStore::new();
        let err = store
            .resolve(&SuspensionToken::generate(), &success())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::TokenNotFound));

        let run_id = RunId::new();
        let job = pending(run_id, "job-1", chrono::Duration::hours(1));
        let token = job.suspension_token.clone();
        store.put(run_id, job).await.unwrap();

        let abandoned = store.abandon(run_id).await.unwrap();
        assert_eq!(abandoned.map(|j| j.outcome), Some(JobOutcome::Abandoned));
        assert!(store.abandon(run_id).await.unwrap().is_none());

        let err = store.resolve(&token, &success()).await.unwrap_err();
        assert!(matches!(err, StoreError::TokenNotFound));
    }

    #[tokio::test]
    async fn abandon_loses_to_an_earlier_resolution() {
        let store = InMemoryMetadataStore::new();
        let run_id = RunId::new();
        let job = pending(run_id, "job-1", chrono::Duration::hours(1));
        let token = job.suspension_token.clone();
        store.put(run_id, job).await.unwrap();

        store.resolve(&token, &success()).await.unwrap();
        assert!(store.abandon(run_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_expired_only_returns_pending_jobs() {
        let store = InMemoryMetadataStore::new();
        let (a, b) = (RunId::new(), RunId::new());
        store.put(a, pending(a, "job-a", chrono::Duration::seconds(-1))).await.unwrap();
        store.put(b, pending(b, "job-b", chrono::Duration::hours(1))).await.unwrap();

        let expired = store.list_expired(Utc::now()).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].run_id, a);

        store.abandon(a).await.unwrap();
        assert!(store.list_expired(Utc::now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn settled_entries_survive_until_purged() {
        let store = InMemoryMetadataStore::new();
        let (done, open) = (RunId::new(), RunId::new());
        let job = pending(done, "job-1", chrono::Duration::hours(1));
        let token = job.suspension_token.clone();
        store.put(done, job).await.unwrap();
        store.put(open, pending(open, "job-2", chrono::Duration::hours(1))).await.unwrap();
        store.resolve(&token, &success()).await.unwrap();

        // Still there as a tombstone: redeliveries see the earlier outcome.
        assert!(matches!(
            store.resolve(&token, &success()).await,
            Ok(Resolution::AlreadyResolved(_))
        ));
        assert_eq!(store.purge_settled(Utc::now() - chrono::Duration::hours(1)).await.unwrap(), 0);

        assert_eq!(store.purge_settled(Utc::now()).await.unwrap(), 1);
        assert!(store.get(done).await.unwrap().is_none());
        assert!(store.get(open).await.unwrap().is_some(), "pending jobs are never purged");
        assert!(matches!(
            store.resolve(&token, &success()).await,
            Err(StoreError::TokenNotFound)
        ));
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            ..ProptestConfig::default()
        })]

        /// Property: concurrent duplicate deliveries resolve a token exactly once.
        #[test]
        fn concurrent_duplicate_resolves_yield_one_winner(callers in 2usize..16) {
            let rt = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(4)
                .build()
                .unwrap();

            let firsts = rt.block_on(async move {
                let store = InMemoryMetadataStore::arc();
                let run_id = RunId::new();
                let job = pending(run_id, "job-1", chrono::Duration::hours(1));
                let token = job.suspension_token.clone();
                store.put(run_id, job).await.unwrap();

                let mut handles = Vec::new();
                for _ in 0..callers {
                    let store = store.clone();
                    let token = token.clone();
                    handles.push(tokio::spawn(async move {
                        store.resolve(&token, &success()).await.unwrap().is_first()
                    }));
                }

                let mut firsts = 0;
                for h in handles {
                    if h.await.unwrap() {
                        firsts += 1;
                    }
                }
                firsts
            });

            prop_assert_eq!(firsts, 1);
        }
    }
}

//! Postgres-backed metadata store.
//!
//! One row per run in `batchflow_jobs`. Compare-and-set transitions are single
//! `UPDATE ... WHERE outcome = 'pending'` statements, so two concurrent
//! resolvers cannot both observe `Pending`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use tracing::instrument;
use uuid::Uuid;

use batchflow_core::{
    ExternalJobId, OutputRef, Parameter, RecordBatchRef, RunId, SuspensionToken,
};
use batchflow_workflow::{Completion, Job, JobOutcome};

use super::{MetadataStore, Resolution};
use crate::error::{StoreError, map_sqlx_error};

const JOB_COLUMNS: &str = "run_id, parameter, job_id, suspension_token, record_batch_ref, \
     output_ref, outcome, submitted_at, expires_at, resolved_at, failure_message";

#[derive(Debug, Clone)]
pub struct PostgresMetadataStore {
    pool: Arc<PgPool>,
}

impl PostgresMetadataStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the jobs table and its indexes if missing.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS batchflow_jobs (
                run_id            UUID PRIMARY KEY,
                parameter         TEXT NOT NULL,
                job_id            TEXT NOT NULL UNIQUE,
                suspension_token  TEXT NOT NULL UNIQUE,
                record_batch_ref  TEXT NOT NULL,
                output_ref        TEXT NULL,
                outcome           TEXT NOT NULL,
                submitted_at      TIMESTAMPTZ NOT NULL,
                expires_at        TIMESTAMPTZ NOT NULL,
                resolved_at       TIMESTAMPTZ NULL,
                failure_message   TEXT NULL
            )
            "#,
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("ensure_schema", e))?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS batchflow_jobs_pending_expiry
                ON batchflow_jobs (expires_at)
                WHERE outcome = 'pending'
            "#,
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("ensure_schema", e))?;

        Ok(())
    }

    async fn fetch_by_token(&self, token: &SuspensionToken) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM batchflow_jobs WHERE suspension_token = $1"
        ))
        .bind(token.expose())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fetch_by_token", e))?;

        row.map(Job::try_from).transpose()
    }
}

#[async_trait::async_trait]
impl MetadataStore for PostgresMetadataStore {
    #[instrument(skip(self, job), fields(run_id = %run_id, job_id = %job.job_id), err)]
    async fn put(&self, run_id: RunId, job: Job) -> Result<(), StoreError> {
        if job.run_id != run_id {
            return Err(StoreError::Conflict(format!(
                "job belongs to run {}, not {}",
                job.run_id, run_id
            )));
        }

        // Upsert, but never over a pending job.
        let result = sqlx::query(
            r#"
            INSERT INTO batchflow_jobs (
                run_id, parameter, job_id, suspension_token, record_batch_ref,
                output_ref, outcome, submitted_at, expires_at, resolved_at, failure_message
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (run_id) DO UPDATE SET
                parameter = EXCLUDED.parameter,
                job_id = EXCLUDED.job_id,
                suspension_token = EXCLUDED.suspension_token,
                record_batch_ref = EXCLUDED.record_batch_ref,
                output_ref = EXCLUDED.output_ref,
                outcome = EXCLUDED.outcome,
                submitted_at = EXCLUDED.submitted_at,
                expires_at = EXCLUDED.expires_at,
                resolved_at = EXCLUDED.resolved_at,
                failure_message = EXCLUDED.failure_message
            WHERE batchflow_jobs.outcome <> 'pending'
            "#,
        )
        .bind(run_id.as_uuid())
        .bind(job.parameter.as_str())
        .bind(job.job_id.as_str())
        .bind(job.suspension_token.expose())
        .bind(job.record_batch_ref.location())
        .bind(job.output_ref.as_ref().map(|o| o.location()))
        .bind(job.outcome.as_str())
        .bind(job.submitted_at)
        .bind(job.expires_at)
        .bind(job.resolved_at)
        .bind(job.failure_message.as_deref())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("put_job", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!(
                "run {run_id} already has a pending job"
            )));
        }
        Ok(())
    }

    async fn get(&self, run_id: RunId) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM batchflow_jobs WHERE run_id = $1"
        ))
        .bind(run_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_job", e))?;

        row.map(Job::try_from).transpose()
    }

    async fn find_by_job_id(&self, job_id: &ExternalJobId) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM batchflow_jobs WHERE job_id = $1"
        ))
        .bind(job_id.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_by_job_id", e))?;

        row.map(Job::try_from).transpose()
    }

    #[instrument(skip(self, token, completion), err)]
    async fn resolve(
        &self,
        token: &SuspensionToken,
        completion: &Completion,
    ) -> Result<Resolution, StoreError> {
        let (output_ref, failure_message) = match completion {
            Completion::Success { output_ref } => (Some(output_ref.location()), None),
            Completion::Failure { message } => (None, Some(message.as_str())),
        };

        let updated = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            UPDATE batchflow_jobs
               SET outcome = $2, output_ref = $3, failure_message = $4, resolved_at = $5
             WHERE suspension_token = $1 AND outcome = 'pending'
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(token.expose())
        .bind(completion.outcome().as_str())
        .bind(output_ref)
        .bind(failure_message)
        .bind(Utc::now())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("resolve", e))?;

        if let Some(row) = updated {
            return Ok(Resolution::Resolved(Job::try_from(row)?));
        }

        // Lost the compare-and-set or the token is not resolvable at all.
        match self.fetch_by_token(token).await? {
            Some(job) if job.outcome == JobOutcome::Abandoned => Err(StoreError::TokenNotFound),
            Some(job) => Ok(Resolution::AlreadyResolved(job)),
            None => Err(StoreError::TokenNotFound),
        }
    }

    async fn abandon(&self, run_id: RunId) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            UPDATE batchflow_jobs
               SET outcome = 'abandoned', resolved_at = $2
             WHERE run_id = $1 AND outcome = 'pending'
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(run_id.as_uuid())
        .bind(Utc::now())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("abandon", e))?;

        row.map(Job::try_from).transpose()
    }

    async fn purge_settled(&self, before: DateTime<Utc>) -> Result<usize, StoreError> {
        let result = sqlx::query(
            "DELETE FROM batchflow_jobs WHERE outcome <> 'pending' AND resolved_at <= $1",
        )
        .bind(before)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("purge_settled", e))?;
        Ok(result.rows_affected() as usize)
    }

    async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM batchflow_jobs
             WHERE outcome = 'pending' AND expires_at <= $1
             ORDER BY expires_at ASC
            "#
        ))
        .bind(now)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_expired", e))?;

        rows.into_iter().map(Job::try_from).collect()
    }
}

#[derive(Debug, FromRow)]
struct JobRow {
    run_id: Uuid,
    parameter: String,
    job_id: String,
    suspension_token: String,
    record_batch_ref: String,
    output_ref: Option<String>,
    outcome: String,
    submitted_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    resolved_at: Option<DateTime<Utc>>,
    failure_message: Option<String>,
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let corrupt = |e: batchflow_core::DomainError| {
            StoreError::storage(format!("corrupt job row for run {}: {e}", row.run_id))
        };

        let outcome = JobOutcome::parse(&row.outcome).ok_or_else(|| {
            StoreError::storage(format!("unknown job outcome '{}'", row.outcome))
        })?;

        Ok(Job {
            run_id: RunId::from_uuid(row.run_id),
            parameter: Parameter::new(row.parameter.as_str()).map_err(corrupt)?,
            job_id: ExternalJobId::new(row.job_id.as_str()).map_err(corrupt)?,
            suspension_token: SuspensionToken::from_raw(row.suspension_token.as_str()),
            record_batch_ref: RecordBatchRef::new(row.record_batch_ref.as_str())
                .map_err(corrupt)?,
            output_ref: row
                .output_ref
                .as_deref()
                .map(OutputRef::new)
                .transpose()
                .map_err(corrupt)?,
            outcome,
            submitted_at: row.submitted_at,
            expires_at: row.expires_at,
            resolved_at: row.resolved_at,
            failure_message: row.failure_message.clone(),
        })
    }
}

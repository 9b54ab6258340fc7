//! Postgres-backed run store.
//!
//! Each run is one row in `batchflow_runs`: the full `Run` as JSONB plus the
//! columns needed for indexing. A partial unique index on `parameter` for
//! running rows enforces one active run per parameter at the database level.

use std::sync::Arc;

use sqlx::{FromRow, PgPool};
use tracing::instrument;
use uuid::Uuid;

use batchflow_core::{ExpectedVersion, Parameter, RunId};
use batchflow_workflow::{Run, RunStatus};

use super::RunStore;
use crate::error::{StoreError, map_sqlx_error};

const ONE_ACTIVE_INDEX: &str = "batchflow_runs_one_active";

#[derive(Debug, Clone)]
pub struct PostgresRunStore {
    pool: Arc<PgPool>,
}

impl PostgresRunStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS batchflow_runs (
                run_id      UUID PRIMARY KEY,
                parameter   TEXT NOT NULL,
                status      TEXT NOT NULL,
                started_at  TIMESTAMPTZ NOT NULL,
                updated_at  TIMESTAMPTZ NOT NULL,
                version     BIGINT NOT NULL,
                body        JSONB NOT NULL
            )
            "#,
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("ensure_schema", e))?;

        sqlx::query(&format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS {ONE_ACTIVE_INDEX} \
             ON batchflow_runs (parameter) WHERE status = 'Running'"
        ))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("ensure_schema", e))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS batchflow_runs_recent \
             ON batchflow_runs (parameter, started_at DESC)",
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("ensure_schema", e))?;

        Ok(())
    }
}

fn to_body(run: &Run) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(run).map_err(|e| StoreError::storage(format!("encode run: {e}")))
}

#[async_trait::async_trait]
impl RunStore for PostgresRunStore {
    #[instrument(skip(self, run), fields(run_id = %run.run_id, parameter = %run.parameter), err)]
    async fn insert(&self, run: &Run) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO batchflow_runs (run_id, parameter, status, started_at, updated_at, version, body)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(run.run_id.as_uuid())
        .bind(run.parameter.as_str())
        .bind(run.status().as_str())
        .bind(run.started_at)
        .bind(run.updated_at)
        .bind(run.version as i64)
        .bind(to_body(run)?)
        .execute(&*self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.constraint() == Some(ONE_ACTIVE_INDEX) => {
                Err(StoreError::RunAlreadyActive(run.parameter.clone()))
            }
            Err(e) => Err(map_sqlx_error("insert_run", e)),
        }
    }

    async fn get(&self, run_id: RunId) -> Result<Option<Run>, StoreError> {
        let row = sqlx::query_as::<_, RunRow>(
            "SELECT run_id, version, body FROM batchflow_runs WHERE run_id = $1",
        )
        .bind(run_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_run", e))?;

        row.map(Run::try_from).transpose()
    }

    #[instrument(skip(self, run), fields(run_id = %run.run_id, state = %run.state), err)]
    async fn save(&self, run: &Run, expected: ExpectedVersion) -> Result<(), StoreError> {
        let expected_version: Option<i64> = match expected {
            ExpectedVersion::Any => None,
            ExpectedVersion::Exact(v) => Some(v as i64),
        };

        let result = sqlx::query(
            r#"
            UPDATE batchflow_runs
               SET status = $2, updated_at = $3, version = $4, body = $5
             WHERE run_id = $1
               AND ($6::bigint IS NULL OR version = $6)
            "#,
        )
        .bind(run.run_id.as_uuid())
        .bind(run.status().as_str())
        .bind(run.updated_at)
        .bind(run.version as i64)
        .bind(to_body(run)?)
        .bind(expected_version)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("save_run", e))?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        match self.get(run.run_id).await? {
            Some(stored) => Err(StoreError::Conflict(format!(
                "optimistic concurrency check failed (expected: {expected:?}, actual: {})",
                stored.version
            ))),
            None => Err(StoreError::NotFound(format!("run {}", run.run_id))),
        }
    }

    async fn list_active(&self) -> Result<Vec<Run>, StoreError> {
        let rows = sqlx::query_as::<_, RunRow>(
            "SELECT run_id, version, body FROM batchflow_runs \
             WHERE status = $1 ORDER BY started_at ASC",
        )
        .bind(RunStatus::Running.as_str())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_active", e))?;

        rows.into_iter().map(Run::try_from).collect()
    }

    async fn active_for(&self, parameter: &Parameter) -> Result<Option<Run>, StoreError> {
        let row = sqlx::query_as::<_, RunRow>(
            "SELECT run_id, version, body FROM batchflow_runs \
             WHERE parameter = $1 AND status = $2",
        )
        .bind(parameter.as_str())
        .bind(RunStatus::Running.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("active_for", e))?;

        row.map(Run::try_from).transpose()
    }

    async fn list_recent(
        &self,
        parameter: Option<&Parameter>,
        limit: usize,
    ) -> Result<Vec<Run>, StoreError> {
        let rows = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT run_id, version, body FROM batchflow_runs
             WHERE ($1::text IS NULL OR parameter = $1)
             ORDER BY started_at DESC, run_id DESC
             LIMIT $2
            "#,
        )
        .bind(parameter.map(|p| p.as_str()))
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_recent", e))?;

        rows.into_iter().map(Run::try_from).collect()
    }
}

#[derive(Debug, FromRow)]
struct RunRow {
    run_id: Uuid,
    version: i64,
    body: serde_json::Value,
}

impl TryFrom<RunRow> for Run {
    type Error = StoreError;

    fn try_from(row: RunRow) -> Result<Self, Self::Error> {
        let mut run: Run = serde_json::from_value(row.body).map_err(|e| {
            StoreError::storage(format!("corrupt run row {}: {e}", row.run_id))
        })?;
        // The column is authoritative for compare-and-set.
        run.version = row.version as u64;
        Ok(run)
    }
}

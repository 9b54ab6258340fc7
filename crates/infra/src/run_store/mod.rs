//! Run persistence with optimistic concurrency.
//!
//! `save` is a compare-and-set on `Run::version`: the orchestrator applies an
//! event (which bumps the version) and saves with
//! `ExpectedVersion::Exact(previous)`. Two writers racing on one run cannot
//! both win, which is what keeps the result writer to a single call per run.

mod in_memory;
mod postgres;

use std::sync::Arc;

use batchflow_core::{ExpectedVersion, Parameter, RunId};
use batchflow_workflow::Run;

use crate::error::StoreError;

pub use in_memory::InMemoryRunStore;
pub use postgres::PostgresRunStore;

#[async_trait::async_trait]
pub trait RunStore: Send + Sync {
    /// Insert a new run. `RunAlreadyActive` if the parameter already has a non-terminal run.
    async fn insert(&self, run: &Run) -> Result<(), StoreError>;

    async fn get(&self, run_id: RunId) -> Result<Option<Run>, StoreError>;

    /// Compare-and-set on the stored version.
    async fn save(&self, run: &Run, expected: ExpectedVersion) -> Result<(), StoreError>;

    /// All non-terminal runs.
    async fn list_active(&self) -> Result<Vec<Run>, StoreError>;

    async fn active_for(&self, parameter: &Parameter) -> Result<Option<Run>, StoreError>;

    /// Most recent runs first, optionally filtered by parameter.
    async fn list_recent(
        &self,
        parameter: Option<&Parameter>,
        limit: usize,
    ) -> Result<Vec<Run>, StoreError>;
}

#[async_trait::async_trait]
impl<S> RunStore for Arc<S>
where
    S: RunStore + ?Sized,
{
    async fn insert(&self, run: &Run) -> Result<(), StoreError> {
        (**self).insert(run).await
    }

    async fn get(&self, run_id: RunId) -> Result<Option<Run>, StoreError> {
        (**self).get(run_id).await
    }

    async fn save(&self, run: &Run, expected: ExpectedVersion) -> Result<(), StoreError> {
        (**self).save(run, expected).await
    }

    async fn list_active(&self) -> Result<Vec<Run>, StoreError> {
        (**self).list_active().await
    }

    async fn active_for(&self, parameter: &Parameter) -> Result<Option<Run>, StoreError> {
        (**self).active_for(parameter).await
    }

    async fn list_recent(
        &self,
        parameter: Option<&Parameter>,
        limit: usize,
    ) -> Result<Vec<Run>, StoreError> {
        (**self).list_recent(parameter, limit).await
    }
}

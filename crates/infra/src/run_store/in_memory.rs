use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use batchflow_core::{ExpectedVersion, Parameter, RunId};
use batchflow_workflow::Run;

use super::RunStore;
use crate::error::StoreError;

/// In-memory run store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryRunStore {
    runs: RwLock<HashMap<RunId, Run>>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait::async_trait]
impl RunStore for InMemoryRunStore {
    async fn insert(&self, run: &Run) -> Result<(), StoreError> {
        let mut runs = self.runs.write().map_err(|_| StoreError::poisoned())?;
        if runs.contains_key(&run.run_id) {
            return Err(StoreError::Conflict(format!("run {} already exists", run.run_id)));
        }
        if !run.is_terminal()
            && runs
                .values()
                .any(|r| r.parameter == run.parameter && !r.is_terminal())
        {
            return Err(StoreError::RunAlreadyActive(run.parameter.clone()));
        }
        runs.insert(run.run_id, run.clone());
        Ok(())
    }

    async fn get(&self, run_id: RunId) -> Result<Option<Run>, StoreError> {
        let runs = self.runs.read().map_err(|_| StoreError::poisoned())?;
        Ok(runs.get(&run_id).cloned())
    }

    async fn save(&self, run: &Run, expected: ExpectedVersion) -> Result<(), StoreError> {
        let mut runs = self.runs.write().map_err(|_| StoreError::poisoned())?;
        let stored = runs
            .get_mut(&run.run_id)
            .ok_or_else(|| StoreError::NotFound(format!("run {}", run.run_id)))?;
        expected.check(stored.version)?;
        *stored = run.clone();
        Ok(())
    }

    async fn list_active(&self) -> Result<Vec<Run>, StoreError> {
        let runs = self.runs.read().map_err(|_| StoreError::poisoned())?;
        let mut active: Vec<_> = runs.values().filter(|r| !r.is_terminal()).cloned().collect();
        active.sort_by_key(|r| r.started_at);
        Ok(active)
    }

    async fn active_for(&self, parameter: &Parameter) -> Result<Option<Run>, StoreError> {
        let runs = self.runs.read().map_err(|_| StoreError::poisoned())?;
        Ok(runs
            .values()
            .find(|r| &r.parameter == parameter && !r.is_terminal())
            .cloned())
    }

    async fn list_recent(
        &self,
        parameter: Option<&Parameter>,
        limit: usize,
    ) -> Result<Vec<Run>, StoreError> {
        let runs = self.runs.read().map_err(|_| StoreError::poisoned())?;
        let mut result: Vec<_> = runs
            .values()
            .filter(|r| parameter.is_none_or(|p| &r.parameter == p))
            .cloned()
            .collect();
        result.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.run_id.cmp(&a.run_id)));
        result.truncate(limit);
        Ok(result)
    }
}

//! Workflow & Run Repositories
//!
//! Repository contracts for the persistence collaborator, plus the
//! in-memory implementations used in-process. Repositories accept and
//! return whole entities.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::model::{RunStatus, Workflow, WorkflowRun};
use crate::{Result, WorkflowError};

/// Filter for run listings.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub status: Option<RunStatus>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub page: usize,
    pub page_size: usize,
}

#[async_trait]
pub trait WorkflowRepository: Send + Sync {
    async fn insert(&self, workflow: Workflow) -> Result<()>;
    async fn update(&self, workflow: Workflow) -> Result<()>;
    async fn get(&self, tenant_id: &str, id: &str) -> Result<Option<Workflow>>;
    async fn delete(&self, tenant_id: &str, id: &str) -> Result<bool>;
    async fn list(&self, tenant_id: &str) -> Result<Vec<Workflow>>;
}

#[async_trait]
pub trait RunRepository: Send + Sync {
    async fn insert(&self, run: WorkflowRun) -> Result<()>;
    async fn update(&self, run: WorkflowRun) -> Result<()>;
    async fn get(&self, tenant_id: &str, id: &str) -> Result<Option<WorkflowRun>>;
    async fn list_for_workflow(
        &self,
        tenant_id: &str,
        workflow_id: &str,
        filter: &RunFilter,
    ) -> Result<Vec<WorkflowRun>>;
}

// ============================================================================
// In-memory implementations
// ============================================================================

pub struct InMemoryWorkflowRepository {
    workflows: DashMap<(String, String), Workflow>,
}

impl InMemoryWorkflowRepository {
    pub fn new() -> Self {
        Self {
            workflows: DashMap::new(),
        }
    }
}

impl Default for InMemoryWorkflowRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkflowRepository for InMemoryWorkflowRepository {
    async fn insert(&self, workflow: Workflow) -> Result<()> {
        let key = (workflow.tenant_id.clone(), workflow.id.clone());
        if self.workflows.contains_key(&key) {
            return Err(WorkflowError::Conflict(format!(
                "workflow '{}' already exists",
                workflow.id
            )));
        }
        self.workflows.insert(key, workflow);
        Ok(())
    }

    async fn update(&self, workflow: Workflow) -> Result<()> {
        let key = (workflow.tenant_id.clone(), workflow.id.clone());
        if !self.workflows.contains_key(&key) {
            return Err(WorkflowError::NotFound(workflow.id.clone()));
        }
        self.workflows.insert(key, workflow);
        Ok(())
    }

    async fn get(&self, tenant_id: &str, id: &str) -> Result<Option<Workflow>> {
        Ok(self
            .workflows
            .get(&(tenant_id.to_string(), id.to_string()))
            .map(|w| w.clone()))
    }

    async fn delete(&self, tenant_id: &str, id: &str) -> Result<bool> {
        Ok(self
            .workflows
            .remove(&(tenant_id.to_string(), id.to_string()))
            .is_some())
    }

    async fn list(&self, tenant_id: &str) -> Result<Vec<Workflow>> {
        let mut workflows: Vec<Workflow> = self
            .workflows
            .iter()
            .filter(|entry| entry.key().0 == tenant_id)
            .map(|entry| entry.value().clone())
            .collect();
        workflows.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(workflows)
    }
}

pub struct InMemoryRunRepository {
    runs: DashMap<(String, String), WorkflowRun>,
}

impl InMemoryRunRepository {
    pub fn new() -> Self {
        Self {
            runs: DashMap::new(),
        }
    }
}

impl Default for InMemoryRunRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RunRepository for InMemoryRunRepository {
    async fn insert(&self, run: WorkflowRun) -> Result<()> {
        let key = (run.tenant_id.clone(), run.id.clone());
        self.runs.insert(key, run);
        Ok(())
    }

    async fn update(&self, run: WorkflowRun) -> Result<()> {
        let key = (run.tenant_id.clone(), run.id.clone());
        // terminal states are immutable
        if let Some(existing) = self.runs.get(&key) {
            if existing.status.is_terminal() && existing.status != run.status {
                return Err(WorkflowError::Conflict(format!(
                    "run '{}' is terminal ({:?})",
                    run.id, existing.status
                )));
            }
        }
        self.runs.insert(key, run);
        Ok(())
    }

    async fn get(&self, tenant_id: &str, id: &str) -> Result<Option<WorkflowRun>> {
        Ok(self
            .runs
            .get(&(tenant_id.to_string(), id.to_string()))
            .map(|r| r.clone()))
    }

    async fn list_for_workflow(
        &self,
        tenant_id: &str,
        workflow_id: &str,
        filter: &RunFilter,
    ) -> Result<Vec<WorkflowRun>> {
        let mut runs: Vec<WorkflowRun> = self
            .runs
            .iter()
            .filter(|entry| {
                let run = entry.value();
                entry.key().0 == tenant_id
                    && run.workflow_id == workflow_id
                    && filter.status.map(|s| run.status == s).unwrap_or(true)
                    && filter.from.map(|f| run.start_time >= f).unwrap_or(true)
                    && filter.to.map(|t| run.start_time <= t).unwrap_or(true)
            })
            .map(|entry| entry.value().clone())
            .collect();
        runs.sort_by(|a, b| b.start_time.cmp(&a.start_time));

        let page_size = if filter.page_size == 0 { 50 } else { filter.page_size };
        let start = filter.page * page_size;
        Ok(runs.into_iter().skip(start).take(page_size).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RunMode;
    use std::collections::HashMap;

    fn workflow(id: &str) -> Workflow {
        Workflow {
            id: id.into(),
            tenant_id: "t1".into(),
            name: "wf".into(),
            version: 1,
            nodes: vec![],
            edges: vec![],
            triggers: vec![],
            globals: HashMap::new(),
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn workflow_crud_with_tenant_isolation() {
        let repo = InMemoryWorkflowRepository::new();
        repo.insert(workflow("w1")).await.unwrap();

        assert!(repo.insert(workflow("w1")).await.is_err());
        assert!(repo.get("t1", "w1").await.unwrap().is_some());
        assert!(repo.get("t2", "w1").await.unwrap().is_none());
        assert!(repo.delete("t1", "w1").await.unwrap());
        assert!(!repo.delete("t1", "w1").await.unwrap());
    }

    #[tokio::test]
    async fn terminal_runs_are_immutable() {
        let repo = InMemoryRunRepository::new();
        let mut run = WorkflowRun::new("w1", "t1", serde_json::json!({}), "tester", RunMode::Manual);
        run.status = RunStatus::Completed;
        repo.insert(run.clone()).await.unwrap();

        run.status = RunStatus::Failed;
        assert!(repo.update(run).await.is_err());
    }

    #[tokio::test]
    async fn run_filter_by_status_and_page() {
        let repo = InMemoryRunRepository::new();
        for i in 0..5 {
            let mut run =
                WorkflowRun::new("w1", "t1", serde_json::json!({}), "tester", RunMode::Manual);
            run.id = format!("r{}", i);
            if i % 2 == 0 {
                run.status = RunStatus::Completed;
            }
            repo.insert(run).await.unwrap();
        }

        let completed = repo
            .list_for_workflow(
                "t1",
                "w1",
                &RunFilter {
                    status: Some(RunStatus::Completed),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(completed.len(), 3);

        let paged = repo
            .list_for_workflow(
                "t1",
                "w1",
                &RunFilter {
                    page: 1,
                    page_size: 2,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(paged.len(), 2);
    }
}

//! In-memory `OrchestrationStore`, for tests and local development.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use crate::contracts::{
    Application, ErrorRecord, ResourceHint, ResourceInstance, ResourceOutput, ResourceState,
    StepExecutionStatus, WorkflowExecution, WorkflowExecutionStatus, WorkflowStepExecution,
};

use super::store::{OrchestrationStore, StoreError};

#[derive(Default)]
struct Inner {
    applications: HashMap<String, Application>,
    resources: HashMap<Uuid, ResourceInstance>,
    workflow_executions: HashMap<Uuid, WorkflowExecution>,
    step_executions: HashMap<Uuid, WorkflowStepExecution>,
}

/// Thread-safe in-memory store. Guarded by a single mutex; fine for tests
/// and single-process local runs, not a production backend.
#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OrchestrationStore for InMemoryStore {
    async fn ensure_application(&self, name: &str) -> Result<Application, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(app) = inner.applications.get(name) {
            return Ok(app.clone());
        }
        let app = Application {
            name: name.to_string(),
            created_at: Utc::now(),
        };
        inner.applications.insert(name.to_string(), app.clone());
        Ok(app)
    }

    async fn create_resource_instance(
        &self,
        instance: ResourceInstance,
    ) -> Result<ResourceInstance, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let duplicate = inner.resources.values().any(|r| {
            r.application_name == instance.application_name
                && r.resource_name == instance.resource_name
        });
        if duplicate {
            return Err(StoreError::DuplicateResource {
                application_name: instance.application_name,
                resource_name: instance.resource_name,
            });
        }
        inner.resources.insert(instance.id, instance.clone());
        Ok(instance)
    }

    async fn get_resource(&self, id: Uuid) -> Result<ResourceInstance, StoreError> {
        let inner = self.inner.lock().unwrap();
        inner
            .resources
            .get(&id)
            .cloned()
            .ok_or(StoreError::ResourceNotFound(id))
    }

    async fn get_by_application(
        &self,
        application_name: &str,
    ) -> Result<Vec<ResourceInstance>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut out: Vec<_> = inner
            .resources
            .values()
            .filter(|r| r.application_name == application_name)
            .cloned()
            .collect();
        out.sort_by_key(|r| r.created_at);
        Ok(out)
    }

    async fn get_pending(&self) -> Result<Vec<ResourceInstance>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut out: Vec<_> = inner
            .resources
            .values()
            .filter(|r| {
                r.state == ResourceState::Requested && r.workflow_execution_id.is_none()
            })
            .cloned()
            .collect();
        out.sort_by_key(|r| r.created_at);
        Ok(out)
    }

    async fn transition_state(
        &self,
        id: Uuid,
        expected_state: ResourceState,
        expected_version: i32,
        to: ResourceState,
        error: Option<ErrorRecord>,
        workflow_execution_id: Option<Uuid>,
    ) -> Result<ResourceInstance, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let resource = inner
            .resources
            .get_mut(&id)
            .ok_or(StoreError::ResourceNotFound(id))?;
        if resource.state != expected_state || resource.version != expected_version {
            // `from` no longer matches reality. If the row already landed on
            // exactly the state this call was trying to reach, treat the
            // re-run as a no-op rather than a conflict (spec §8).
            if resource.state == to
                && workflow_execution_id.map_or(true, |w| resource.workflow_execution_id == Some(w))
                && resource.last_error == error
            {
                return Ok(resource.clone());
            }
            return Err(StoreError::ConcurrencyConflict {
                id,
                expected: expected_version,
                actual: resource.version,
            });
        }
        resource.state = to;
        resource.version += 1;
        resource.updated_at = Utc::now();
        resource.last_error = error;
        if workflow_execution_id.is_some() {
            resource.workflow_execution_id = workflow_execution_id;
        }
        Ok(resource.clone())
    }

    async fn set_outputs(
        &self,
        id: Uuid,
        outputs: Vec<ResourceOutput>,
    ) -> Result<ResourceInstance, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let resource = inner
            .resources
            .get_mut(&id)
            .ok_or(StoreError::ResourceNotFound(id))?;
        for output in outputs {
            if let Some(existing) = resource.outputs.iter_mut().find(|o| o.key == output.key) {
                existing.value = output.value;
            } else {
                resource.outputs.push(output);
            }
        }
        resource.updated_at = Utc::now();
        Ok(resource.clone())
    }

    async fn append_hints(
        &self,
        id: Uuid,
        hints: Vec<ResourceHint>,
    ) -> Result<ResourceInstance, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let resource = inner
            .resources
            .get_mut(&id)
            .ok_or(StoreError::ResourceNotFound(id))?;
        resource.hints.extend(hints);
        resource.updated_at = Utc::now();
        Ok(resource.clone())
    }

    async fn get_resources_by_workflow_execution(
        &self,
        workflow_execution_id: Uuid,
    ) -> Result<Vec<ResourceInstance>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .resources
            .values()
            .filter(|r| r.workflow_execution_id == Some(workflow_execution_id))
            .cloned()
            .collect())
    }

    async fn delete_resource(&self, id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let resource = inner
            .resources
            .get(&id)
            .ok_or(StoreError::ResourceNotFound(id))?;
        if !matches!(resource.state, ResourceState::Terminated | ResourceState::Failed) {
            return Err(StoreError::ConcurrencyConflict {
                id,
                expected: resource.version,
                actual: resource.version,
            });
        }
        inner.resources.remove(&id);
        Ok(())
    }

    async fn create_workflow_execution(
        &self,
        execution: WorkflowExecution,
    ) -> Result<WorkflowExecution, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .workflow_executions
            .insert(execution.id, execution.clone());
        Ok(execution)
    }

    async fn get_workflow_execution(&self, id: Uuid) -> Result<WorkflowExecution, StoreError> {
        let inner = self.inner.lock().unwrap();
        inner
            .workflow_executions
            .get(&id)
            .cloned()
            .ok_or(StoreError::WorkflowExecutionNotFound(id))
    }

    async fn list_workflow_executions(&self) -> Result<Vec<WorkflowExecution>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.workflow_executions.values().cloned().collect())
    }

    async fn update_workflow_execution_status(
        &self,
        id: Uuid,
        status: WorkflowExecutionStatus,
        error: Option<ErrorRecord>,
    ) -> Result<WorkflowExecution, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let execution = inner
            .workflow_executions
            .get_mut(&id)
            .ok_or(StoreError::WorkflowExecutionNotFound(id))?;
        let now = Utc::now();
        if execution.started_at.is_none() && status == WorkflowExecutionStatus::Running {
            execution.started_at = Some(now);
        }
        if matches!(
            status,
            WorkflowExecutionStatus::Completed
                | WorkflowExecutionStatus::Failed
                | WorkflowExecutionStatus::Canceled
        ) {
            execution.completed_at = Some(now);
        }
        execution.status = status;
        execution.error = error;
        Ok(execution.clone())
    }

    async fn create_step_execution(
        &self,
        step: WorkflowStepExecution,
    ) -> Result<WorkflowStepExecution, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.step_executions.insert(step.id, step.clone());
        Ok(step)
    }

    async fn get_step_executions(
        &self,
        workflow_execution_id: Uuid,
    ) -> Result<Vec<WorkflowStepExecution>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .step_executions
            .values()
            .filter(|s| s.workflow_execution_id == workflow_execution_id)
            .cloned()
            .collect())
    }

    async fn update_step_execution(
        &self,
        id: Uuid,
        status: StepExecutionStatus,
        logs: String,
        outputs: Value,
        error: Option<ErrorRecord>,
    ) -> Result<WorkflowStepExecution, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let step = inner
            .step_executions
            .get_mut(&id)
            .ok_or(StoreError::StepExecutionNotFound(id))?;
        let now = Utc::now();
        if step.started_at.is_none() && status == StepExecutionStatus::Running {
            step.started_at = Some(now);
        }
        if matches!(
            status,
            StepExecutionStatus::Completed | StepExecutionStatus::Failed | StepExecutionStatus::Skipped
        ) {
            step.completed_at = Some(now);
        }
        step.status = status;
        step.logs = logs;
        step.outputs = outputs;
        step.error = error;
        Ok(step.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::ResourceInstance;

    #[tokio::test]
    async fn duplicate_resource_is_rejected() {
        let store = InMemoryStore::new();
        let instance = ResourceInstance::new("demo", "db", "postgres", serde_json::json!({}));
        store.create_resource_instance(instance.clone()).await.unwrap();

        let dup = ResourceInstance::new("demo", "db", "postgres", serde_json::json!({}));
        let err = store.create_resource_instance(dup).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateResource { .. }));
    }

    #[tokio::test]
    async fn transition_state_enforces_version_guard() {
        let store = InMemoryStore::new();
        let instance = ResourceInstance::new("demo", "db", "postgres", serde_json::json!({}));
        let id = instance.id;
        store.create_resource_instance(instance).await.unwrap();

        let ok = store
            .transition_state(
                id,
                ResourceState::Requested,
                1,
                ResourceState::Provisioning,
                None,
                Some(Uuid::now_v7()),
            )
            .await
            .unwrap();
        assert_eq!(ok.state, ResourceState::Provisioning);
        assert_eq!(ok.version, 2);

        let conflict = store
            .transition_state(
                id,
                ResourceState::Requested,
                1,
                ResourceState::Provisioning,
                None,
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(conflict, StoreError::ConcurrencyConflict { .. }));
    }

    #[tokio::test]
    async fn rerunning_a_successful_transition_returns_the_current_row() {
        let store = InMemoryStore::new();
        let instance = ResourceInstance::new("demo", "db", "postgres", serde_json::json!({}));
        let id = instance.id;
        store.create_resource_instance(instance).await.unwrap();

        let wf_id = Uuid::now_v7();
        let moved = store
            .transition_state(
                id,
                ResourceState::Requested,
                1,
                ResourceState::Provisioning,
                None,
                Some(wf_id),
            )
            .await
            .unwrap();

        let replayed = store
            .transition_state(
                id,
                ResourceState::Requested,
                1,
                ResourceState::Provisioning,
                None,
                Some(wf_id),
            )
            .await
            .unwrap();
        assert_eq!(replayed.version, moved.version);
        assert_eq!(replayed.state, ResourceState::Provisioning);
    }

    #[tokio::test]
    async fn get_pending_only_returns_unbound_requested_resources() {
        let store = InMemoryStore::new();
        let pending = ResourceInstance::new("demo", "a", "postgres", serde_json::json!({}));
        let mut bound = ResourceInstance::new("demo", "b", "postgres", serde_json::json!({}));
        bound.workflow_execution_id = Some(Uuid::now_v7());

        store.create_resource_instance(pending.clone()).await.unwrap();
        store.create_resource_instance(bound).await.unwrap();

        let results = store.get_pending().await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, pending.id);
    }
}

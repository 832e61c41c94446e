//! `OrchestrationStore` trait definition.
//!
//! One trait covers applications, resource instances, workflow executions,
//! and step executions — mirroring the teacher's single `WorkflowEventStore`
//! trait rather than splitting persistence into many narrow traits.
//! Implementations must be thread-safe and support concurrent access.

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::contracts::{
    Application, ErrorRecord, ResourceHint, ResourceInstance, ResourceOutput, ResourceState,
    StepExecutionStatus, WorkflowExecution, WorkflowExecutionStatus, WorkflowStepExecution,
};

/// Error type for store operations. Never leaks a raw `sqlx::Error` or
/// `serde_json::Error` past this boundary.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("resource not found: {0}")]
    ResourceNotFound(Uuid),

    #[error("workflow execution not found: {0}")]
    WorkflowExecutionNotFound(Uuid),

    #[error("step execution not found: {0}")]
    StepExecutionNotFound(Uuid),

    #[error("resource '{resource_name}' already exists in application '{application_name}'")]
    DuplicateResource {
        application_name: String,
        resource_name: String,
    },

    #[error("concurrency conflict on resource {id}: expected version {expected}, got {actual}")]
    ConcurrencyConflict {
        id: Uuid,
        expected: i32,
        actual: i32,
    },

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Store for applications, resource instances, and workflow/step
/// executions. Implementations: [`crate::persistence::memory::InMemoryStore`]
/// (tests, local dev) and [`crate::persistence::postgres::PostgresStore`]
/// (production).
#[async_trait]
pub trait OrchestrationStore: Send + Sync + 'static {
    // =========================================================================
    // Application operations
    // =========================================================================

    async fn ensure_application(&self, name: &str) -> Result<Application, StoreError>;

    // =========================================================================
    // Resource instance operations (spec §4.2)
    // =========================================================================

    /// Insert a new resource instance at state=requested, version=1. Fails
    /// with `DuplicateResource` if (application_name, resource_name) exists.
    async fn create_resource_instance(
        &self,
        instance: ResourceInstance,
    ) -> Result<ResourceInstance, StoreError>;

    async fn get_resource(&self, id: Uuid) -> Result<ResourceInstance, StoreError>;

    async fn get_by_application(
        &self,
        application_name: &str,
    ) -> Result<Vec<ResourceInstance>, StoreError>;

    /// Resources in `requested` with no bound workflow execution, ordered by
    /// `created_at`. Over-selection under concurrency is expected; the
    /// guarded `transition_state` call is the true admission gate.
    async fn get_pending(&self) -> Result<Vec<ResourceInstance>, StoreError>;

    /// Guarded update: `WHERE id = ? AND state = ? AND version = ?`.
    /// Returns `ConcurrencyConflict` if the guard doesn't match.
    #[allow(clippy::too_many_arguments)]
    async fn transition_state(
        &self,
        id: Uuid,
        expected_state: ResourceState,
        expected_version: i32,
        to: ResourceState,
        error: Option<ErrorRecord>,
        workflow_execution_id: Option<Uuid>,
    ) -> Result<ResourceInstance, StoreError>;

    async fn set_outputs(
        &self,
        id: Uuid,
        outputs: Vec<ResourceOutput>,
    ) -> Result<ResourceInstance, StoreError>;

    async fn append_hints(
        &self,
        id: Uuid,
        hints: Vec<ResourceHint>,
    ) -> Result<ResourceInstance, StoreError>;

    async fn get_resources_by_workflow_execution(
        &self,
        workflow_execution_id: Uuid,
    ) -> Result<Vec<ResourceInstance>, StoreError>;

    /// Only permitted from `terminated` or `failed`.
    async fn delete_resource(&self, id: Uuid) -> Result<(), StoreError>;

    // =========================================================================
    // Workflow execution operations
    // =========================================================================

    async fn create_workflow_execution(
        &self,
        execution: WorkflowExecution,
    ) -> Result<WorkflowExecution, StoreError>;

    async fn get_workflow_execution(&self, id: Uuid) -> Result<WorkflowExecution, StoreError>;

    async fn list_workflow_executions(&self) -> Result<Vec<WorkflowExecution>, StoreError>;

    async fn update_workflow_execution_status(
        &self,
        id: Uuid,
        status: WorkflowExecutionStatus,
        error: Option<ErrorRecord>,
    ) -> Result<WorkflowExecution, StoreError>;

    // =========================================================================
    // Step execution operations
    // =========================================================================

    async fn create_step_execution(
        &self,
        step: WorkflowStepExecution,
    ) -> Result<WorkflowStepExecution, StoreError>;

    async fn get_step_executions(
        &self,
        workflow_execution_id: Uuid,
    ) -> Result<Vec<WorkflowStepExecution>, StoreError>;

    async fn update_step_execution(
        &self,
        id: Uuid,
        status: StepExecutionStatus,
        logs: String,
        outputs: Value,
        error: Option<ErrorRecord>,
    ) -> Result<WorkflowStepExecution, StoreError>;
}

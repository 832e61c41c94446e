//! Resource lifecycle manager (spec §4.2).
//!
//! Single source of truth for resource-instance persistence and state
//! transitions. Wraps an [`OrchestrationStore`] and enforces the transition
//! table from spec §4.2 before ever issuing a guarded write, so an invalid
//! transition never reaches the store layer.

use serde_json::Value;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::contracts::{
    ErrorRecord, ResourceHint, ResourceInstance, ResourceOutput, ResourceState,
};
use crate::persistence::{OrchestrationStore, StoreError};

/// Errors raised by the resource lifecycle manager (spec §7).
pub use crate::contracts::error::ResourceError;

/// Wraps an [`OrchestrationStore`] and enforces the resource state machine
/// (spec §3/§4.2) before any guarded write.
pub struct ResourceManager<S: OrchestrationStore> {
    store: std::sync::Arc<S>,
}

impl<S: OrchestrationStore> ResourceManager<S> {
    pub fn new(store: std::sync::Arc<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &std::sync::Arc<S> {
        &self.store
    }

    /// Create a resource instance at state=requested, version=1. Idempotent
    /// on (app, name, type) with identical configuration — spec §8 requires
    /// a repeat call with the same configuration to return the existing
    /// row rather than erroring; differing configuration still fails with
    /// `DuplicateResource`.
    #[instrument(skip(self, configuration))]
    pub async fn create_resource_instance(
        &self,
        application_name: &str,
        resource_name: &str,
        resource_type: &str,
        configuration: Value,
    ) -> Result<ResourceInstance, ResourceError> {
        self.store.ensure_application(application_name).await?;

        let existing = self.store.get_by_application(application_name).await?;
        if let Some(found) = existing
            .iter()
            .find(|r| r.resource_name == resource_name)
        {
            if found.resource_type == resource_type && found.configuration == configuration {
                return Ok(found.clone());
            }
            return Err(ResourceError::DuplicateResource {
                application_name: application_name.to_string(),
                resource_name: resource_name.to_string(),
            });
        }

        let instance =
            ResourceInstance::new(application_name, resource_name, resource_type, configuration);
        let created = self.store.create_resource_instance(instance).await?;
        info!(
            application = application_name,
            resource = resource_name,
            resource_type,
            id = %created.id,
            "created resource instance"
        );
        Ok(created)
    }

    pub async fn get_by_application(
        &self,
        application_name: &str,
    ) -> Result<Vec<ResourceInstance>, ResourceError> {
        Ok(self.store.get_by_application(application_name).await?)
    }

    pub async fn get(&self, id: Uuid) -> Result<ResourceInstance, ResourceError> {
        Ok(self.store.get_resource(id).await?)
    }

    /// Resources in `requested` with no bound workflow execution, ordered
    /// by `created_at` (spec §4.2). The engine's poller relies on this
    /// over-selecting safely: `transition_state`'s guard is the real
    /// admission gate.
    pub async fn get_pending(&self) -> Result<Vec<ResourceInstance>, ResourceError> {
        Ok(self.store.get_pending().await?)
    }

    /// Conditional `from -> to` transition, rejected up front if `from ->
    /// to` isn't in the table (spec §4.2), then issued as a guarded
    /// `(state, version)` update. Returns `ConcurrentModification` if
    /// another writer already advanced the row.
    #[instrument(skip(self, error))]
    pub async fn transition_state(
        &self,
        id: Uuid,
        from: ResourceState,
        to: ResourceState,
        expected_version: i32,
        error: Option<ErrorRecord>,
        workflow_execution_id: Option<Uuid>,
    ) -> Result<ResourceInstance, ResourceError> {
        if !from.can_transition_to(to) {
            return Err(ResourceError::InvalidTransition {
                id,
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        match self
            .store
            .transition_state(id, from, expected_version, to, error, workflow_execution_id)
            .await
        {
            Ok(instance) => {
                info!(%id, %from, %to, version = instance.version, "transitioned resource state");
                Ok(instance)
            }
            Err(StoreError::ConcurrencyConflict { id, expected, actual }) => {
                warn!(%id, expected, actual, "concurrent modification, abandoning");
                Err(ResourceError::ConcurrentModification { id, expected, actual })
            }
            Err(other) => Err(other.into()),
        }
    }

    pub async fn set_outputs(
        &self,
        id: Uuid,
        outputs: Vec<ResourceOutput>,
    ) -> Result<ResourceInstance, ResourceError> {
        Ok(self.store.set_outputs(id, outputs).await?)
    }

    pub async fn append_hints(
        &self,
        id: Uuid,
        hints: Vec<ResourceHint>,
    ) -> Result<ResourceInstance, ResourceError> {
        Ok(self.store.append_hints(id, hints).await?)
    }

    pub async fn get_resources_by_workflow_execution(
        &self,
        workflow_execution_id: Uuid,
    ) -> Result<Vec<ResourceInstance>, ResourceError> {
        Ok(self
            .store
            .get_resources_by_workflow_execution(workflow_execution_id)
            .await?)
    }

    /// Only permitted from `terminated` or `failed` (spec §4.2).
    pub async fn delete(&self, id: Uuid) -> Result<(), ResourceError> {
        let resource = self.store.get_resource(id).await?;
        if !matches!(resource.state, ResourceState::Terminated | ResourceState::Failed) {
            return Err(ResourceError::InvalidTransition {
                id,
                from: resource.state.to_string(),
                to: "deleted".to_string(),
            });
        }
        self.store.delete_resource(id).await?;
        Ok(())
    }
}

//! Application and resource-instance entities, and the resource state
//! machine from spec §3/§4.2.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// An application: a named owner of zero or more resource instances.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Application {
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// The resource instance lifecycle state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceState {
    Requested,
    Provisioning,
    Active,
    Updating,
    Degraded,
    Terminating,
    Terminated,
    Failed,
}

impl std::fmt::Display for ResourceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Requested => "requested",
            Self::Provisioning => "provisioning",
            Self::Active => "active",
            Self::Updating => "updating",
            Self::Degraded => "degraded",
            Self::Terminating => "terminating",
            Self::Terminated => "terminated",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl ResourceState {
    /// The transition table from spec §4.2. Returns whether `self -> to` is
    /// a valid edge.
    pub fn can_transition_to(&self, to: ResourceState) -> bool {
        use ResourceState::*;
        matches!(
            (self, to),
            (Requested, Provisioning)
                | (Requested, Failed)
                | (Provisioning, Active)
                | (Provisioning, Failed)
                | (Active, Updating)
                | (Active, Terminating)
                | (Active, Degraded)
                | (Updating, Active)
                | (Updating, Failed)
                | (Degraded, Active)
                | (Degraded, Terminating)
                | (Degraded, Failed)
                | (Terminating, Terminated)
                | (Terminating, Failed)
                | (Failed, Terminating)
                | (Failed, Terminated)
        )
    }
}

/// A key-value output produced by a workflow run (e.g. a connection string).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceOutput {
    pub key: String,
    pub value: Value,
}

/// An informational or warning hint attached to a resource by a workflow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceHint {
    pub kind: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// A single named, typed infrastructure object owned by one application.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceInstance {
    pub id: Uuid,
    pub application_name: String,
    pub resource_name: String,
    pub resource_type: String,
    pub configuration: Value,
    pub state: ResourceState,
    pub health_status: Option<String>,
    pub provider_id: Option<String>,
    pub workflow_execution_id: Option<Uuid>,
    pub outputs: Vec<ResourceOutput>,
    pub hints: Vec<ResourceHint>,
    pub last_error: Option<crate::contracts::error::ErrorRecord>,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ResourceInstance {
    /// Construct a freshly-requested resource instance: state=requested,
    /// version=1 (spec §4.2 `CreateResourceInstance`).
    pub fn new(
        application_name: impl Into<String>,
        resource_name: impl Into<String>,
        resource_type: impl Into<String>,
        configuration: Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            application_name: application_name.into(),
            resource_name: resource_name.into(),
            resource_type: resource_type.into(),
            configuration,
            state: ResourceState::Requested,
            health_status: None,
            provider_id: None,
            workflow_execution_id: None,
            outputs: Vec::new(),
            hints: Vec::new(),
            last_error: None,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }
}

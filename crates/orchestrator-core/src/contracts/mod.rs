//! Shared types: the data model from spec §3 plus the crate-wide error
//! taxonomy from spec §7.

pub mod error;
pub mod provider;
pub mod resource;
pub mod workflow;

pub use error::{EngineError, ErrorRecord, ExecutorError, ResolverError, ResourceError};
pub use provider::{
    Operation, Provider, ProviderCapabilities, ProviderManifest, ProviderOperation,
    ResourceTypeCapability,
};
pub use resource::{Application, ResourceHint, ResourceInstance, ResourceOutput, ResourceState};
pub use workflow::{
    StepDefinition, StepExecutionStatus, WorkflowCategory, WorkflowDefinition, WorkflowExecution,
    WorkflowExecutionStatus, WorkflowStepExecution, NO_OUTPUT_SENTINEL,
};

//! Crate-wide error taxonomy, one `thiserror` enum per subsystem.
//!
//! Library code here never panics or unwraps on a reachable path; every
//! failure mode named in spec §7 has a variant below and a defined surface
//! behavior implemented where it's raised.

use thiserror::Error;

/// Errors raised by the provider resolver.
#[derive(Debug, Error)]
pub enum ResolverError {
    #[error("no provider claims resource type '{0}'")]
    UnknownResourceType(String),

    #[error("provider '{provider}' claims resource type '{resource_type}' but not operation '{operation}'")]
    NoOperation {
        provider: String,
        resource_type: String,
        operation: String,
    },

    #[error("multiple providers match resource type '{resource_type}' with tags {tags:?}")]
    AmbiguousTags {
        resource_type: String,
        tags: Vec<String>,
    },

    #[error("no provider declares a golden-path workflow named '{0}'")]
    UnknownWorkflow(String),
}

/// Errors raised by the resource lifecycle manager.
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("invalid transition from {from} to {to} for resource {id}")]
    InvalidTransition {
        id: uuid::Uuid,
        from: String,
        to: String,
    },

    #[error("concurrent modification on resource {id}: expected version {expected}, found {actual}")]
    ConcurrentModification {
        id: uuid::Uuid,
        expected: i32,
        actual: i32,
    },

    #[error("resource '{resource_name}' already exists in application '{application_name}'")]
    DuplicateResource {
        application_name: String,
        resource_name: String,
    },

    #[error("resource {0} not found")]
    NotFound(uuid::Uuid),

    #[error(transparent)]
    Store(#[from] crate::persistence::StoreError),
}

/// Errors raised by the workflow executor.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("unknown step type '{0}'")]
    UnknownStepType(String),

    #[error("step '{step}' timed out after {elapsed_ms} ms")]
    StepTimeout { step: String, elapsed_ms: u64 },

    #[error("step '{step}' failed: {message}")]
    StepExecutionFailure { step: String, message: String },

    #[error("workflow execution {0} was canceled")]
    Canceled(uuid::Uuid),

    #[error(transparent)]
    Store(#[from] crate::persistence::StoreError),
}

/// Errors raised by the orchestration engine's poll loop.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Resolver(#[from] ResolverError),

    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error(transparent)]
    Store(#[from] crate::persistence::StoreError),
}

/// A structured, non-panicking failure record attached to a resource or
/// step row. Never an exception across the workflow boundary (spec §7).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct ErrorRecord {
    pub kind: String,
    pub message: String,
    pub cause: Option<String>,
    pub retryable: bool,
}

impl ErrorRecord {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            cause: None,
            retryable: false,
        }
    }

    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    pub fn retryable(mut self) -> Self {
        self.retryable = true;
        self
    }
}

impl From<&ResolverError> for ErrorRecord {
    fn from(err: &ResolverError) -> Self {
        let kind = match err {
            ResolverError::UnknownResourceType(_) => "UnknownResourceType",
            ResolverError::NoOperation { .. } => "NoOperation",
            ResolverError::AmbiguousTags { .. } => "AmbiguousTags",
            ResolverError::UnknownWorkflow(_) => "UnknownWorkflow",
        };
        ErrorRecord::new(kind, err.to_string())
    }
}

impl From<&ExecutorError> for ErrorRecord {
    fn from(err: &ExecutorError) -> Self {
        let kind = match err {
            ExecutorError::UnknownStepType(_) => "UnknownStepType",
            ExecutorError::StepTimeout { .. } => "StepTimeout",
            ExecutorError::StepExecutionFailure { .. } => "StepExecutionFailure",
            ExecutorError::Canceled(_) => "Canceled",
            ExecutorError::Store(_) => "StoreError",
        };
        ErrorRecord::new(kind, err.to_string())
    }
}
